use arbor_storage::StorageError;
use arbor_types::Address;
use thiserror::Error;

/// Errors raised by configuration, hierarchy and performance services.
#[derive(Debug, Error)]
pub enum EconomicsError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("invalid reward configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown user {0}")]
    UnknownUser(Address),

    #[error("user {0} is already registered")]
    UserExists(Address),

    #[error("unknown superior {0}")]
    UnknownSuperior(Address),

    #[error("superior {0} has not been placed in the tree yet")]
    SuperiorNotPlaced(Address),

    #[error("corrupt tree path {0:?}")]
    CorruptPath(String),

    #[error("performance of {address} still being computed after {attempts} polls")]
    PerformanceComputeTimeout { address: Address, attempts: u32 },
}

impl EconomicsError {
    pub fn code(&self) -> &'static str {
        match self {
            EconomicsError::Storage(_) => "storage_error",
            EconomicsError::InvalidConfig(_) => "invalid_config",
            EconomicsError::UnknownUser(_) => "unknown_user",
            EconomicsError::UserExists(_) => "user_exists",
            EconomicsError::UnknownSuperior(_) => "unknown_superior",
            EconomicsError::SuperiorNotPlaced(_) => "superior_not_placed",
            EconomicsError::CorruptPath(_) => "corrupt_path",
            EconomicsError::PerformanceComputeTimeout { .. } => "performance_compute_timeout",
        }
    }
}

pub type Result<T> = std::result::Result<T, EconomicsError>;
