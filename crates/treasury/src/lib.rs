//! Arbor Treasury
//!
//! Everything that moves value: the reward cap every reward draws against,
//! the daily reward calculators, and the user-facing ledger operations
//! (claims, audited withdrawals, verified deposits, staking and internal
//! movements).

pub mod cap;
pub mod errors;
pub mod gateway;
pub mod posting;
pub mod processor;
pub mod rewards;

pub use cap::{CapBatchDraw, CapDraw, CapEnforcer};
pub use errors::{Result, TreasuryError};
pub use gateway::{
    GatewayError, OfflineGateway, ScriptedGateway, TransferSender, TransferVerifier,
    VerifiedTransfer,
};
pub use posting::{net_effect, postings};
pub use processor::{ClaimReport, Processor, Reconciliation, StakeReceipt, VerifiedPayment};
pub use rewards::{
    DividendPlan, DividendRewards, DividendStart, DynamicOutcome, DynamicRewards, StaticOutcome,
    StaticRewards, TokenPool,
};
