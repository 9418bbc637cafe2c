use super::count_rewards;
use crate::errors::Result;
use arbor_economics::ConfigStore;
use arbor_storage::{KvStore, KvStoreExt, LedgerBatch, LedgerStore};
use arbor_types::{
    day_key, day_start, div_round_down, mul_round_down, Amount, FlowKind, RewardFlow, SettlementDay,
    TokenType, TxDirection, TxStatus, User, UserType,
};
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

const RUNNING: &str = "running";
const DONE: &str = "done";

fn flag_key(day: SettlementDay) -> String {
    format!("dividend:{}", day_key(day))
}

fn plan_key(day: SettlementDay) -> String {
    format!("dividend:plan:{}", day_key(day))
}

/// Split of one token's fee pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPool {
    pub token: TokenType,
    pub fees: Amount,
    pub group_holders: u64,
    pub group_share: Amount,
    pub galaxy_holders: u64,
    pub galaxy_share: Amount,
    /// Rounding dust and pools without holders, kept as platform revenue.
    pub unallocated: Amount,
}

/// Per-holder shares fixed when a day's dividend run starts, so a resumed
/// run pays the same amounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DividendPlan {
    pub day: SettlementDay,
    pub pools: Vec<TokenPool>,
}

impl DividendPlan {
    pub fn unallocated(&self) -> Amount {
        self.pools.iter().map(|p| p.unallocated).sum()
    }

    fn has_payouts(&self) -> bool {
        self.pools
            .iter()
            .any(|p| p.group_share > Decimal::ZERO || p.galaxy_share > Decimal::ZERO)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DividendStart {
    Fresh(DividendPlan),
    /// A previous run set the started flag but never finished.
    Resume(DividendPlan),
    AlreadyDone,
}

fn is_group_holder(user: &User) -> bool {
    user.user_type.shares_group_dividend()
}

fn is_galaxy_holder(user: &User) -> bool {
    user.user_type == UserType::Galaxy && user.interest_active
}

fn dividend_kind(token: TokenType) -> FlowKind {
    match token {
        TokenType::Usdt => FlowKind::FeeDividend,
        TokenType::Token => FlowKind::FeeDividendToken,
    }
}

/// Splits the previous day's withdrawal fees between GROUP/COMMUNITY holders
/// and active GALAXY holders. Dividends do not draw on the reward cap.
pub struct DividendRewards {
    store: Arc<dyn LedgerStore>,
    kv: Arc<dyn KvStore>,
    config: Arc<ConfigStore>,
}

impl DividendRewards {
    pub fn new(store: Arc<dyn LedgerStore>, kv: Arc<dyn KvStore>, config: Arc<ConfigStore>) -> Self {
        Self { store, kv, config }
    }

    /// Set the day's started flag (before any work) and fix the plan.
    pub fn begin(&self, day: SettlementDay) -> Result<DividendStart> {
        let flag = flag_key(day);
        if !self.kv.set_if_absent(&flag, RUNNING, None)? {
            if self.kv.get(&flag)?.as_deref() == Some(DONE) {
                return Ok(DividendStart::AlreadyDone);
            }
            let plan = match self.kv.get_json::<DividendPlan>(&plan_key(day))? {
                Some(plan) => plan,
                None => self.store_plan(day)?,
            };
            return Ok(DividendStart::Resume(plan));
        }
        Ok(DividendStart::Fresh(self.store_plan(day)?))
    }

    pub fn finish(&self, day: SettlementDay) -> Result<()> {
        self.kv.set(&flag_key(day), DONE, None)?;
        Ok(())
    }

    fn store_plan(&self, day: SettlementDay) -> Result<DividendPlan> {
        let plan = self.plan(day)?;
        let ttl = self.config.current()?.checkpoint_ttl;
        self.kv.set_json(&plan_key(day), &plan, Some(ttl))?;
        info!(
            target: "treasury",
            %day,
            unallocated = %plan.unallocated(),
            pools = ?plan.pools,
            "Dividend plan fixed"
        );
        Ok(plan)
    }

    /// Compute the shares for `day` from the fees of the previous UTC day.
    pub fn plan(&self, day: SettlementDay) -> Result<DividendPlan> {
        let config = self.config.current()?;
        let end = day_start(day);
        let start = end - Duration::days(1);
        let transfers = self.store.transactions_updated_between(start, end)?;

        let (mut group_holders, mut galaxy_holders) = (0u64, 0u64);
        let mut after = 0;
        loop {
            let page = self.store.users_page(after, config.settlement_page_size)?;
            for user in &page {
                after = user.id;
                group_holders += u64::from(is_group_holder(user));
                galaxy_holders += u64::from(is_galaxy_holder(user));
            }
            if page.len() < config.settlement_page_size {
                break;
            }
        }

        let pools = TokenType::ALL
            .iter()
            .map(|&token| {
                let fees: Amount = transfers
                    .iter()
                    .filter(|tx| {
                        tx.direction == TxDirection::Out
                            && tx.status == TxStatus::Confirmed
                            && tx.token_type == token
                    })
                    .map(|tx| tx.fee)
                    .sum();
                let group_pool = mul_round_down(fees, config.dividend_group_ratio);
                let galaxy_pool = mul_round_down(fees, config.dividend_galaxy_ratio);
                let group_share = div_round_down(group_pool, Decimal::from(group_holders));
                let galaxy_share = div_round_down(galaxy_pool, Decimal::from(galaxy_holders));
                let paid = group_share * Decimal::from(group_holders)
                    + galaxy_share * Decimal::from(galaxy_holders);
                TokenPool {
                    token,
                    fees,
                    group_holders,
                    group_share,
                    galaxy_holders,
                    galaxy_share,
                    unallocated: group_pool + galaxy_pool - paid,
                }
            })
            .collect();
        Ok(DividendPlan { day, pools })
    }

    /// Write the PENDING dividend rows `user` is due under `plan`.
    pub fn pay_holder(&self, user: &User, plan: &DividendPlan) -> Result<usize> {
        if !plan.has_payouts() {
            return Ok(0);
        }
        let share_of = |pool: &TokenPool| {
            if is_group_holder(user) {
                pool.group_share
            } else if is_galaxy_holder(user) {
                pool.galaxy_share
            } else {
                Decimal::ZERO
            }
        };

        let now = Utc::now();
        let mut batch = LedgerBatch::new();
        for pool in &plan.pools {
            let share = share_of(pool);
            if share > Decimal::ZERO {
                batch = batch.flow(
                    RewardFlow::pending(user.address, dividend_kind(pool.token), pool.token, share, now)
                        .with_settlement_day(plan.day)
                        .with_description(format!("{} fee dividend", user.user_type)),
                );
            }
        }
        if batch.flows.is_empty() {
            return Ok(0);
        }
        let written = self.store.commit(&batch)?.flow_ids.len();
        for flow in &batch.flows {
            count_rewards(flow.kind, 1);
        }
        Ok(written)
    }
}
