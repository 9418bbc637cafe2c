//! Per-user balance row and the checked operations that mutate it.

use crate::address::Address;
use crate::amount::{Amount, TokenType};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Column of a [`Balance`] row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceField {
    UsdtPoints,
    /// Withdrawable reward token.
    TokenPoints,
    /// Locked stake.
    TokenStakedPoints,
    /// Remaining lifetime payout budget.
    StakeRewardCap,
}

impl BalanceField {
    /// Spendable column holding `token`.
    pub fn for_token(token: TokenType) -> Self {
        match token {
            TokenType::Usdt => BalanceField::UsdtPoints,
            TokenType::Token => BalanceField::TokenPoints,
        }
    }
}

impl fmt::Display for BalanceField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BalanceField::UsdtPoints => "usdt_points",
            BalanceField::TokenPoints => "token_points",
            BalanceField::TokenStakedPoints => "token_staked_points",
            BalanceField::StakeRewardCap => "stake_reward_cap",
        };
        f.write_str(s)
    }
}

/// Reasons a balance operation is rejected. Rejection leaves the row untouched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BalanceError {
    #[error("insufficient {field} for {address}: requested {requested}, available {available}")]
    Insufficient {
        address: Address,
        field: BalanceField,
        requested: Amount,
        available: Amount,
    },
    #[error("reward cap exhausted for {address}")]
    CapExhausted { address: Address },
    #[error("amount must not be negative, got {0}")]
    NegativeAmount(Amount),
}

/// A single checked mutation of one balance column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BalanceOp {
    Credit { field: BalanceField, amount: Amount },
    /// Fails without touching the row when the column holds less than `amount`.
    Debit { field: BalanceField, amount: Amount },
    /// Takes `min(amount, column)`; fails only when the column is already ≤ 0.
    DrawUpTo { field: BalanceField, amount: Amount },
}

impl BalanceOp {
    pub fn credit(field: BalanceField, amount: Amount) -> Self {
        BalanceOp::Credit { field, amount }
    }

    pub fn debit(field: BalanceField, amount: Amount) -> Self {
        BalanceOp::Debit { field, amount }
    }

    pub fn field(&self) -> BalanceField {
        match self {
            BalanceOp::Credit { field, .. }
            | BalanceOp::Debit { field, .. }
            | BalanceOp::DrawUpTo { field, .. } => *field,
        }
    }
}

/// Balance row, 1:1 with a user. Every column stays ≥ 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub address: Address,
    pub usdt_points: Amount,
    pub token_points: Amount,
    pub token_staked_points: Amount,
    pub stake_reward_cap: Amount,
}

impl Balance {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            usdt_points: Decimal::ZERO,
            token_points: Decimal::ZERO,
            token_staked_points: Decimal::ZERO,
            stake_reward_cap: Decimal::ZERO,
        }
    }

    pub fn get(&self, field: BalanceField) -> Amount {
        match field {
            BalanceField::UsdtPoints => self.usdt_points,
            BalanceField::TokenPoints => self.token_points,
            BalanceField::TokenStakedPoints => self.token_staked_points,
            BalanceField::StakeRewardCap => self.stake_reward_cap,
        }
    }

    fn slot(&mut self, field: BalanceField) -> &mut Amount {
        match field {
            BalanceField::UsdtPoints => &mut self.usdt_points,
            BalanceField::TokenPoints => &mut self.token_points,
            BalanceField::TokenStakedPoints => &mut self.token_staked_points,
            BalanceField::StakeRewardCap => &mut self.stake_reward_cap,
        }
    }

    /// A user is active while their reward cap is still positive.
    pub fn is_active(&self) -> bool {
        self.stake_reward_cap > Decimal::ZERO
    }

    /// Apply `op`, returning the amount actually moved.
    pub fn apply(&mut self, op: &BalanceOp) -> Result<Amount, BalanceError> {
        let address = self.address;
        match *op {
            BalanceOp::Credit { field, amount } => {
                ensure_non_negative(amount)?;
                let slot = self.slot(field);
                *slot += amount;
                Ok(amount)
            }
            BalanceOp::Debit { field, amount } => {
                ensure_non_negative(amount)?;
                let slot = self.slot(field);
                if *slot < amount {
                    return Err(BalanceError::Insufficient {
                        address,
                        field,
                        requested: amount,
                        available: *slot,
                    });
                }
                *slot -= amount;
                Ok(amount)
            }
            BalanceOp::DrawUpTo { field, amount } => {
                ensure_non_negative(amount)?;
                let slot = self.slot(field);
                if *slot <= Decimal::ZERO {
                    return Err(BalanceError::CapExhausted { address });
                }
                let taken = amount.min(*slot);
                *slot -= taken;
                Ok(taken)
            }
        }
    }

    /// Apply a sequence of ops all-or-nothing.
    pub fn apply_all(&mut self, ops: &[BalanceOp]) -> Result<Vec<Amount>, BalanceError> {
        let mut scratch = self.clone();
        let applied = ops
            .iter()
            .map(|op| scratch.apply(op))
            .collect::<Result<Vec<_>, _>>()?;
        *self = scratch;
        Ok(applied)
    }
}

fn ensure_non_negative(amount: Amount) -> Result<(), BalanceError> {
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(BalanceError::NegativeAmount(amount));
    }
    Ok(())
}
