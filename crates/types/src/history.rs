//! Daily performance snapshots and settlement-day helpers.

use crate::address::Address;
use crate::amount::Amount;
use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// UTC calendar day a settlement run covers.
pub type SettlementDay = NaiveDate;

/// Current UTC day.
pub fn utc_today() -> SettlementDay {
    Utc::now().date_naive()
}

/// UTC day containing `at`.
pub fn day_of(at: DateTime<Utc>) -> SettlementDay {
    at.date_naive()
}

/// Midnight UTC opening `day`.
pub fn day_start(day: SettlementDay) -> DateTime<Utc> {
    day.and_time(NaiveTime::MIN).and_utc()
}

/// Sortable `YYYYMMDD` key for a day.
pub fn day_key(day: SettlementDay) -> String {
    format!("{:04}{:02}{:02}", day.year(), day.month(), day.day())
}

/// Point-in-time figures for one user on one settlement day.
///
/// Keyed by (address, year, month, day). Written by the re-rank step; only
/// `dynamic_reward` is filled in later, by the dynamic pass of the same day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceHistory {
    pub address: Address,
    pub day: SettlementDay,
    pub performance: Amount,
    pub partial_performance: Amount,
    pub staked: Amount,
    pub dynamic_reward: Amount,
    pub subordinate_count: u64,
    pub level: u8,
}

impl PerformanceHistory {
    pub fn new(address: Address, day: SettlementDay) -> Self {
        Self {
            address,
            day,
            performance: Decimal::ZERO,
            partial_performance: Decimal::ZERO,
            staked: Decimal::ZERO,
            dynamic_reward: Decimal::ZERO,
            subordinate_count: 0,
            level: 0,
        }
    }

    pub fn year(&self) -> i32 {
        self.day.year()
    }

    pub fn month(&self) -> u32 {
        self.day.month()
    }

    pub fn day_of_month(&self) -> u32 {
        self.day.day()
    }
}
