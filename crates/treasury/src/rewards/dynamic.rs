use super::{count_rewards, token_reward};
use crate::cap::CapEnforcer;
use crate::errors::{Result, TreasuryError};
use arbor_economics::{ConfigStore, LevelResolver};
use arbor_types::{round_down, Amount, FlowKind, PerformanceHistory, SettlementDay, User};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicOutcome {
    /// Pre-cap differential amount, recorded as the day's dynamic base.
    pub dynamic_base: Amount,
    pub incubation_base: Amount,
    pub flows_written: usize,
    pub drawn: Amount,
    pub skipped: bool,
}

/// Differential (rate-gap) reward plus the incubation bonus on equal-or-higher
/// ranked children. Users must be settled deepest depth first: the incubation
/// bonus reads each child's dynamic base for the same day.
pub struct DynamicRewards {
    levels: Arc<LevelResolver>,
    caps: Arc<CapEnforcer>,
    config: Arc<ConfigStore>,
}

impl DynamicRewards {
    pub fn new(levels: Arc<LevelResolver>, caps: Arc<CapEnforcer>, config: Arc<ConfigStore>) -> Self {
        Self {
            levels,
            caps,
            config,
        }
    }

    pub fn settle_user(&self, user: &User, day: SettlementDay) -> Result<DynamicOutcome> {
        let performance = self.levels.performance();
        let hierarchy = performance.hierarchy();
        let store = hierarchy.store();
        let config = self.config.current()?;
        let address = user.address;

        let children: Vec<User> = hierarchy
            .children(&address)?
            .into_iter()
            .filter(User::is_placed)
            .collect();
        if children.is_empty() {
            return Ok(DynamicOutcome {
                skipped: true,
                ..DynamicOutcome::default()
            });
        }

        let rate = config.stake_reward_rate;
        let own_ratio = config.level_reward_ratio(user.level);
        let mut dynamic = Decimal::ZERO;
        let mut incubation = Decimal::ZERO;
        for child in &children {
            let gap = (own_ratio - config.level_reward_ratio(child.level)).max(Decimal::ZERO);
            let non_mining = performance.non_mining_performance(&child.address)?;
            let child_stake = performance.own_active_stake(&child.address)?;
            dynamic += non_mining * rate * gap + child_stake * rate * own_ratio;

            if user.level > 0 && child.level >= user.level {
                let child_base = store
                    .get_history(&child.address, day)?
                    .map(|h| h.dynamic_reward)
                    .unwrap_or_default();
                incubation += child_base * config.equal_reward_rate;
            }
        }
        let dynamic = round_down(dynamic);
        let incubation = round_down(incubation);

        // Record the base before drawing so a rerun of this user sees the same figure.
        let mut history = store
            .get_history(&address, day)?
            .unwrap_or_else(|| PerformanceHistory::new(address, day));
        history.dynamic_reward = dynamic;
        store.put_history(&history)?;

        let mut outcome = DynamicOutcome {
            dynamic_base: dynamic,
            incubation_base: incubation,
            ..DynamicOutcome::default()
        };
        if dynamic + incubation <= Decimal::ZERO {
            return Ok(outcome);
        }

        let price = config.token_price;
        let drawn = self.caps.draw_cap_batch(&address, dynamic, incubation, |dyn_actual, inc_actual| {
            let mut flows = Vec::with_capacity(2);
            if dyn_actual > Decimal::ZERO {
                flows.push(token_reward(address, FlowKind::StakeDynamicReward, dyn_actual, price, day));
            }
            if inc_actual > Decimal::ZERO {
                flows.push(token_reward(
                    address,
                    FlowKind::StakeDynamicIncubationReward,
                    inc_actual,
                    price,
                    day,
                ));
            }
            flows
        });
        match drawn {
            Ok(draw) => {
                outcome.flows_written = draw.flow_ids.len();
                outcome.drawn = draw.dynamic + draw.incubation;
                count_rewards(FlowKind::StakeDynamicReward, usize::from(draw.dynamic > Decimal::ZERO));
                count_rewards(
                    FlowKind::StakeDynamicIncubationReward,
                    usize::from(draw.incubation > Decimal::ZERO),
                );
            }
            Err(TreasuryError::InsufficientRewardCap(_)) => {
                debug!(target: "treasury", %address, "Cap exhausted, dynamic reward skipped");
                outcome.skipped = true;
            }
            Err(err) => return Err(err),
        }
        Ok(outcome)
    }
}
