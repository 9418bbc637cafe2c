use arbor_types::SettlementDay;
use chrono::Duration;

/// Retention policy for daily performance history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryRetention {
    /// Rows more than this many days older than the settlement day are purged.
    /// Zero disables pruning.
    pub retain_days: u32,
}

impl Default for HistoryRetention {
    fn default() -> Self {
        Self { retain_days: 7 }
    }
}

impl HistoryRetention {
    pub fn new(retain_days: u32) -> Self {
        Self { retain_days }
    }

    /// Oldest day still kept when settling `today`; rows before it may be purged.
    pub fn cutoff(&self, today: SettlementDay) -> Option<SettlementDay> {
        if self.is_disabled() {
            return None;
        }
        today.checked_sub_signed(Duration::days(i64::from(self.retain_days)))
    }

    /// Whether a row dated `day` falls outside the window ending at `today`.
    pub fn should_prune(&self, day: SettlementDay, today: SettlementDay) -> bool {
        self.cutoff(today).map_or(false, |cutoff| day < cutoff)
    }

    pub fn is_disabled(&self) -> bool {
        self.retain_days == 0
    }
}

/// Outcome of one retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub cutoff: Option<SettlementDay>,
    pub pruned_entries: u64,
}

impl PruneReport {
    pub fn new(cutoff: Option<SettlementDay>) -> Self {
        Self {
            cutoff,
            pruned_entries: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn day(d: u32) -> SettlementDay {
        NaiveDate::from_ymd_opt(2026, 10, d).unwrap()
    }

    #[test]
    fn keeps_rows_up_to_a_week_old() {
        let policy = HistoryRetention::default();
        assert_eq!(policy.cutoff(day(10)), Some(day(3)));
        // Exactly seven days old stays; eight goes.
        assert!(!policy.should_prune(day(3), day(10)));
        assert!(policy.should_prune(day(2), day(10)));
        assert!(!policy.should_prune(day(10), day(10)));
    }

    #[test]
    fn zero_days_disables_pruning() {
        let policy = HistoryRetention::new(0);
        assert!(policy.is_disabled());
        assert!(!policy.should_prune(day(1), day(30)));
    }
}
