//! Reward/transaction flow log and on-chain transfer records.

use crate::address::Address;
use crate::amount::{Amount, TokenType};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Primary key of a [`RewardFlow`]. Zero marks a row not yet stored.
pub type FlowId = u64;

/// Primary key of an [`OnChainTransaction`]. Zero marks a row not yet stored.
pub type TxId = u64;

/// What a flow row records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowKind {
    Stake,
    Out,
    Transfer,
    In,
    NodeReward,
    NodeDiffReward,
    StakeStaticReward,
    StakeStaticDirectReward,
    StakeDynamicReward,
    StakeDynamicIncubationReward,
    FeeDividend,
    FeeDividendToken,
    FlashSwap,
    Airdrop,
    Assemble,
}

impl FlowKind {
    /// Reward kinds a `claim` for `token` realises.
    pub fn claimable_for(token: TokenType) -> &'static [FlowKind] {
        match token {
            TokenType::Token => &[
                FlowKind::StakeStaticReward,
                FlowKind::StakeStaticDirectReward,
                FlowKind::StakeDynamicReward,
                FlowKind::StakeDynamicIncubationReward,
                FlowKind::FeeDividendToken,
                FlowKind::Airdrop,
            ],
            TokenType::Usdt => &[
                FlowKind::NodeReward,
                FlowKind::NodeDiffReward,
                FlowKind::FeeDividend,
            ],
        }
    }
}

impl FlowKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FlowKind::Stake => "STAKE",
            FlowKind::Out => "OUT",
            FlowKind::Transfer => "TRANSFER",
            FlowKind::In => "IN",
            FlowKind::NodeReward => "NODE_REWARD",
            FlowKind::NodeDiffReward => "NODE_DIFF_REWARD",
            FlowKind::StakeStaticReward => "STAKE_STATIC_REWARD",
            FlowKind::StakeStaticDirectReward => "STAKE_STATIC_DIRECT_REWARD",
            FlowKind::StakeDynamicReward => "STAKE_DYNAMIC_REWARD",
            FlowKind::StakeDynamicIncubationReward => "STAKE_DYNAMIC_INCUBATION_REWARD",
            FlowKind::FeeDividend => "FEE_DIVIDEND",
            FlowKind::FeeDividendToken => "FEE_DIVIDEND_TOKEN",
            FlowKind::FlashSwap => "FLASH_SWAP",
            FlowKind::Airdrop => "AIRDROP",
            FlowKind::Assemble => "ASSEMBLE",
        }
    }
}

impl fmt::Display for FlowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FlowStatus {
    Pending,
    Confirmed,
    Failed,
    Refused,
    Auditing,
}

impl FlowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FlowStatus::Confirmed | FlowStatus::Failed | FlowStatus::Refused
        )
    }
}

/// One row of the append-only flow log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardFlow {
    pub id: FlowId,
    pub user_address: Address,
    pub to_address: Option<Address>,
    pub kind: FlowKind,
    pub token_type: TokenType,
    pub amount: Amount,
    /// Second leg of conversions (USDT spent by a flash swap or assemble).
    pub counter_amount: Option<Amount>,
    pub status: FlowStatus,
    pub created_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    /// UTC day a settlement calculator accrued this row for.
    pub settlement_day: Option<NaiveDate>,
    pub tx_hash: Option<String>,
    pub description: Option<String>,
}

impl RewardFlow {
    fn new(
        user_address: Address,
        kind: FlowKind,
        token_type: TokenType,
        amount: Amount,
        status: FlowStatus,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            user_address,
            to_address: None,
            kind,
            token_type,
            amount,
            counter_amount: None,
            status,
            created_at: now,
            executed_at: None,
            settlement_day: None,
            tx_hash: None,
            description: None,
        }
    }

    /// A reward accrued but not yet realised into the balance.
    pub fn pending(
        user_address: Address,
        kind: FlowKind,
        token_type: TokenType,
        amount: Amount,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(user_address, kind, token_type, amount, FlowStatus::Pending, now)
    }

    /// A movement whose balance effect is applied in the same commit.
    pub fn confirmed(
        user_address: Address,
        kind: FlowKind,
        token_type: TokenType,
        amount: Amount,
        now: DateTime<Utc>,
    ) -> Self {
        let mut flow = Self::new(user_address, kind, token_type, amount, FlowStatus::Confirmed, now);
        flow.executed_at = Some(now);
        flow
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_settlement_day(mut self, day: NaiveDate) -> Self {
        self.settlement_day = Some(day);
        self
    }

    pub fn with_to_address(mut self, to: Address) -> Self {
        self.to_address = Some(to);
        self
    }

    pub fn with_tx_hash(mut self, hash: impl Into<String>) -> Self {
        self.tx_hash = Some(hash.into());
        self
    }

    pub fn with_counter_amount(mut self, amount: Amount) -> Self {
        self.counter_amount = Some(amount);
        self
    }

    /// Copy of this row flipped to CONFIRMED at `now`.
    pub fn confirm(&self, now: DateTime<Utc>) -> Self {
        let mut flow = self.clone();
        flow.status = FlowStatus::Confirmed;
        flow.executed_at = Some(now);
        flow
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TxDirection {
    In,
    Out,
}

/// Lifecycle of an external transfer: AUDITING → PENDING → CONFIRMED | FAILED,
/// or AUDITING → REFUSED when an operator rejects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TxStatus {
    Auditing,
    Pending,
    Confirmed,
    Failed,
    Refused,
}

impl TxStatus {
    /// States that block a new outbound request for the same address and token.
    pub fn is_in_flight(self) -> bool {
        matches!(self, TxStatus::Auditing | TxStatus::Pending)
    }
}

/// External transfer backing a deposit or withdrawal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnChainTransaction {
    pub id: TxId,
    pub tx_hash: Option<String>,
    pub direction: TxDirection,
    pub token_type: TokenType,
    /// Platform user the transfer belongs to.
    pub user_address: Address,
    pub from_address: Address,
    pub to_address: Address,
    /// Net amount moved on chain.
    pub amount: Amount,
    pub fee: Amount,
    pub status: TxStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OnChainTransaction {
    /// Gross amount debited from the user (net + fee).
    pub fn gross_amount(&self) -> Amount {
        self.amount + self.fee
    }
}
