//! Daily reward calculators.
//!
//! Each calculator settles one user (or one dividend holder) at a time; the
//! settlement scheduler owns the paging, ordering and checkpoints around them.
//! Static and dynamic rewards are computed in USDT and stored in reward-token
//! units at the day's price; both draw on the reward cap.

mod dividend;
mod dynamic;
mod static_reward;

pub use dividend::{DividendPlan, DividendRewards, DividendStart, TokenPool};
pub use dynamic::{DynamicOutcome, DynamicRewards};
pub use static_reward::{StaticOutcome, StaticRewards};

use arbor_types::{
    div_round_down, Address, Amount, FlowKind, RewardFlow, SettlementDay, TokenType,
};
use chrono::Utc;
use rust_decimal::Decimal;

/// PENDING token reward worth `usdt` at `price`.
pub(crate) fn token_reward(
    address: Address,
    kind: FlowKind,
    usdt: Amount,
    price: Decimal,
    day: SettlementDay,
) -> RewardFlow {
    RewardFlow::pending(address, kind, TokenType::Token, div_round_down(usdt, price), Utc::now())
        .with_settlement_day(day)
        .with_description(format!("{usdt} USDT @ {price}"))
}

/// Metric bump for every reward row written.
pub(crate) fn count_rewards(kind: FlowKind, n: usize) {
    if n > 0 {
        metrics::counter!("arbor_rewards_written_total", "kind" => kind.as_str()).increment(n as u64);
    }
}
