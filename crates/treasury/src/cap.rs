//! Reward cap enforcement.
//!
//! Every staker carries one lifetime payout budget, `stake_reward_cap`. A
//! draw takes `min(requested, cap)` and fails only when the cap is already
//! exhausted, so a truncated reward is recorded at the amount actually paid
//! rather than dropped. The debit and the flows it funds are committed
//! together; a concurrent draw that wins the race makes ours retry against
//! the fresh cap.

use crate::errors::{Result, TreasuryError};
use arbor_economics::LevelResolver;
use arbor_storage::{LedgerBatch, LedgerStore, StorageError};
use arbor_types::{Address, Amount, BalanceError, BalanceField, BalanceOp, FlowId, RewardFlow};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of one cap draw.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapDraw {
    pub requested: Amount,
    pub actual: Amount,
    pub remaining_cap: Amount,
    pub flow_ids: Vec<FlowId>,
}

impl CapDraw {
    pub fn is_partial(&self) -> bool {
        self.actual < self.requested
    }
}

/// Outcome of a dynamic + incubation draw from the same cap.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapBatchDraw {
    pub dynamic: Amount,
    pub incubation: Amount,
    pub requested: Amount,
    pub remaining_cap: Amount,
    pub flow_ids: Vec<FlowId>,
}

pub struct CapEnforcer {
    store: Arc<dyn LedgerStore>,
    levels: Arc<LevelResolver>,
}

impl CapEnforcer {
    pub fn new(store: Arc<dyn LedgerStore>, levels: Arc<LevelResolver>) -> Self {
        Self { store, levels }
    }

    fn current_cap(&self, address: &Address) -> Result<Amount> {
        Ok(self
            .store
            .get_balance(address)?
            .map(|b| b.stake_reward_cap)
            .unwrap_or_default())
    }

    /// Draw up to `amount` from the cap of `address`. `flows` builds the rows
    /// recording the amount actually drawn; they are written in the same
    /// commit as the debit.
    pub fn draw_cap<F>(&self, address: &Address, amount: Amount, flows: F) -> Result<CapDraw>
    where
        F: Fn(Amount) -> Vec<RewardFlow>,
    {
        if amount.is_sign_negative() {
            return Err(TreasuryError::InvalidAmount(amount));
        }
        if amount.is_zero() {
            return Ok(CapDraw::default());
        }

        loop {
            let cap = self.current_cap(address)?;
            if cap <= Decimal::ZERO {
                return Err(TreasuryError::InsufficientRewardCap(*address));
            }
            let actual = amount.min(cap);
            let batch = flows(actual).into_iter().fold(
                LedgerBatch::new().op(*address, BalanceOp::debit(BalanceField::StakeRewardCap, actual)),
                LedgerBatch::flow,
            );
            match self.store.commit(&batch) {
                Ok(commit) => {
                    let remaining_cap = commit
                        .balance_of(address)
                        .map(|b| b.stake_reward_cap)
                        .unwrap_or_default();
                    let draw = CapDraw {
                        requested: amount,
                        actual,
                        remaining_cap,
                        flow_ids: commit.flow_ids,
                    };
                    self.after_draw(address, draw.requested, draw.actual, remaining_cap)?;
                    return Ok(draw);
                }
                Err(StorageError::Balance(BalanceError::Insufficient { .. })) => {
                    debug!(target: "treasury", %address, "Cap changed under draw, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Draw `dynamic` then `incubation` from the same cap, each partially
    /// filled from what the previous one left.
    pub fn draw_cap_batch<F>(
        &self,
        address: &Address,
        dynamic: Amount,
        incubation: Amount,
        flows: F,
    ) -> Result<CapBatchDraw>
    where
        F: Fn(Amount, Amount) -> Vec<RewardFlow>,
    {
        if dynamic.is_sign_negative() {
            return Err(TreasuryError::InvalidAmount(dynamic));
        }
        if incubation.is_sign_negative() {
            return Err(TreasuryError::InvalidAmount(incubation));
        }
        let requested = dynamic + incubation;
        if requested.is_zero() {
            return Ok(CapBatchDraw::default());
        }

        loop {
            let cap = self.current_cap(address)?;
            if cap <= Decimal::ZERO {
                return Err(TreasuryError::InsufficientRewardCap(*address));
            }
            let dynamic_actual = dynamic.min(cap);
            let incubation_actual = incubation.min(cap - dynamic_actual);
            let total = dynamic_actual + incubation_actual;
            let batch = flows(dynamic_actual, incubation_actual).into_iter().fold(
                LedgerBatch::new().op(*address, BalanceOp::debit(BalanceField::StakeRewardCap, total)),
                LedgerBatch::flow,
            );
            match self.store.commit(&batch) {
                Ok(commit) => {
                    let remaining_cap = commit
                        .balance_of(address)
                        .map(|b| b.stake_reward_cap)
                        .unwrap_or_default();
                    self.after_draw(address, requested, total, remaining_cap)?;
                    return Ok(CapBatchDraw {
                        dynamic: dynamic_actual,
                        incubation: incubation_actual,
                        requested,
                        remaining_cap,
                        flow_ids: commit.flow_ids,
                    });
                }
                Err(StorageError::Balance(BalanceError::Insufficient { .. })) => {
                    debug!(target: "treasury", %address, "Cap changed under draw, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn after_draw(
        &self,
        address: &Address,
        requested: Amount,
        actual: Amount,
        remaining: Amount,
    ) -> Result<()> {
        if actual < requested {
            warn!(
                target: "treasury",
                %address,
                %requested,
                %actual,
                "Reward truncated to remaining cap"
            );
            metrics::counter!("arbor_cap_partial_fills_total").increment(1);
        }
        if remaining <= Decimal::ZERO {
            // The user just went inactive; ancestors must stop counting their stake.
            self.levels.invalidate(address)?;
        }
        Ok(())
    }
}
