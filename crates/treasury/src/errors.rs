use crate::gateway::GatewayError;
use arbor_economics::EconomicsError;
use arbor_storage::{Guard, StorageError};
use arbor_types::{Address, Amount, BalanceError, BalanceField, TokenType, TxId, TxStatus};
use thiserror::Error;

/// Treasury failures. [`code`](TreasuryError::code) is the stable identifier
/// surfaced to API clients.
#[derive(Debug, Error)]
pub enum TreasuryError {
    #[error(transparent)]
    Storage(StorageError),

    #[error(transparent)]
    Economics(#[from] EconomicsError),

    #[error("insufficient {field} for {address}: requested {requested}, available {available}")]
    InsufficientBalance {
        address: Address,
        field: BalanceField,
        requested: Amount,
        available: Amount,
    },

    #[error("reward cap exhausted for {0}")]
    InsufficientRewardCap(Address),

    #[error("a {token} withdrawal for {address} is still being processed")]
    FrequentOperation { address: Address, token: TokenType },

    #[error("destination address is required")]
    MissingDestinationAddress,

    #[error("transaction {0} has already been processed")]
    TransactionAlreadyProcessed(String),

    #[error("transfer for transaction {id} failed: {reason}")]
    ExternalTransferFailure { id: TxId, reason: String },

    #[error("transaction {0} not found")]
    TransactionNotFound(TxId),

    #[error("transaction {id} is {status:?}: {reason}")]
    InvalidTransactionState {
        id: TxId,
        status: TxStatus,
        reason: &'static str,
    },

    #[error("invalid amount {0}")]
    InvalidAmount(Amount),

    #[error("invalid address {0:?}")]
    InvalidAddress(String),

    #[error("flow is missing its {0}")]
    MalformedFlow(&'static str),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl From<StorageError> for TreasuryError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Balance(BalanceError::Insufficient {
                address,
                field,
                requested,
                available,
            }) => TreasuryError::InsufficientBalance {
                address,
                field,
                requested,
                available,
            },
            StorageError::Balance(BalanceError::CapExhausted { address }) => {
                TreasuryError::InsufficientRewardCap(address)
            }
            StorageError::GuardFailed(Guard::NoOutboundInFlight(address, token)) => {
                TreasuryError::FrequentOperation { address, token }
            }
            StorageError::GuardFailed(Guard::UnusedTxHash(hash)) => {
                TreasuryError::TransactionAlreadyProcessed(hash)
            }
            other => TreasuryError::Storage(other),
        }
    }
}

impl TreasuryError {
    pub fn code(&self) -> &'static str {
        match self {
            TreasuryError::Storage(_) => "storage_error",
            TreasuryError::Economics(err) => err.code(),
            TreasuryError::InsufficientBalance { .. } => "insufficient_balance",
            TreasuryError::InsufficientRewardCap(_) => "insufficient_reward_cap",
            TreasuryError::FrequentOperation { .. } => "frequent_operation",
            TreasuryError::MissingDestinationAddress => "missing_destination_address",
            TreasuryError::TransactionAlreadyProcessed(_) => "transaction_already_processed",
            TreasuryError::ExternalTransferFailure { .. } => "external_transfer_failure",
            TreasuryError::TransactionNotFound(_) => "transaction_not_found",
            TreasuryError::InvalidTransactionState { .. } => "invalid_transaction_state",
            TreasuryError::InvalidAmount(_) => "invalid_amount",
            TreasuryError::InvalidAddress(_) => "invalid_address",
            TreasuryError::MalformedFlow(_) => "malformed_flow",
            TreasuryError::Gateway(_) => "gateway_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, TreasuryError>;
