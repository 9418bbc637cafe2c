use arbor_economics::EconomicsError;
use arbor_storage::StorageError;
use arbor_treasury::TreasuryError;
use arbor_types::SettlementDay;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Economics(#[from] EconomicsError),

    #[error(transparent)]
    Treasury(#[from] TreasuryError),

    /// Another run owns the day and its heartbeat is still fresh, or it took
    /// the day over from this run.
    #[error("settlement for {day} is being run by {owner}")]
    SettlementInProgress { day: SettlementDay, owner: Uuid },

    #[error("invalid settlement day {0}")]
    InvalidDay(String),
}

impl SettlementError {
    pub fn code(&self) -> &'static str {
        match self {
            SettlementError::Storage(_) => "storage_error",
            SettlementError::Economics(err) => err.code(),
            SettlementError::Treasury(err) => err.code(),
            SettlementError::SettlementInProgress { .. } => "settlement_in_progress",
            SettlementError::InvalidDay(_) => "invalid_day",
        }
    }
}

pub type Result<T> = std::result::Result<T, SettlementError>;
