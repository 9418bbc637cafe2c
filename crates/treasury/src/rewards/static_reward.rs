use super::{count_rewards, token_reward};
use crate::cap::CapEnforcer;
use crate::errors::{Result, TreasuryError};
use arbor_economics::{ConfigStore, LevelResolver};
use arbor_types::{mul_round_down, Amount, FlowKind, SettlementDay, User};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticOutcome {
    pub flows_written: usize,
    /// USDT value drawn from the cap.
    pub drawn: Amount,
    pub skipped: bool,
}

/// Self reward on own stake plus the direct-line reward on active
/// descendants `direct_reward_depth_offset` levels down.
pub struct StaticRewards {
    levels: Arc<LevelResolver>,
    caps: Arc<CapEnforcer>,
    config: Arc<ConfigStore>,
}

impl StaticRewards {
    pub fn new(levels: Arc<LevelResolver>, caps: Arc<CapEnforcer>, config: Arc<ConfigStore>) -> Self {
        Self {
            levels,
            caps,
            config,
        }
    }

    pub fn settle_user(&self, user: &User, day: SettlementDay) -> Result<StaticOutcome> {
        let performance = self.levels.performance();
        let hierarchy = performance.hierarchy();
        let config = self.config.current()?;
        let address = user.address;

        let balance = hierarchy.store().get_balance(&address)?;
        let staked = match balance {
            Some(b) if b.is_active() && b.token_staked_points > Decimal::ZERO => b.token_staked_points,
            _ => {
                debug!(target: "treasury", %address, "No active stake, static reward skipped");
                return Ok(StaticOutcome {
                    skipped: true,
                    ..StaticOutcome::default()
                });
            }
        };

        let price = config.token_price;
        let rate = config.stake_reward_rate;
        let self_base = mul_round_down(staked, rate);

        let mut line_stake = Decimal::ZERO;
        for member in hierarchy.descendants_at_depth(user, user.depth + config.direct_reward_depth_offset)? {
            line_stake += performance.own_active_stake(&member.address)?;
        }
        let child_count = hierarchy
            .children(&address)?
            .iter()
            .filter(|c| c.is_placed())
            .count();
        let direct_base = mul_round_down(
            mul_round_down(line_stake, rate),
            config.direct_reward_rate(child_count),
        );

        let mut outcome = StaticOutcome::default();
        for (kind, base) in [
            (FlowKind::StakeStaticReward, self_base),
            (FlowKind::StakeStaticDirectReward, direct_base),
        ] {
            if base <= Decimal::ZERO {
                continue;
            }
            match self
                .caps
                .draw_cap(&address, base, |actual| vec![token_reward(address, kind, actual, price, day)])
            {
                Ok(draw) => {
                    outcome.flows_written += draw.flow_ids.len();
                    outcome.drawn += draw.actual;
                    count_rewards(kind, draw.flow_ids.len());
                }
                Err(TreasuryError::InsufficientRewardCap(_)) => {
                    debug!(target: "treasury", %address, ?kind, "Cap exhausted, static reward skipped");
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(outcome)
    }
}
