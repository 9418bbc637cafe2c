//! Daily settlement trigger.
//!
//! Fires once per UTC day at the configured hour. On startup, yesterday is
//! resumed if a crashed run left it RUNNING, and today is settled at once
//! when its hour has already passed.

use anyhow::{anyhow, Result};
use arbor_settlement::{DayState, Settlement, SettlementOutcome};
use arbor_types::{day_of, SettlementDay};
use chrono::{DateTime, Duration, NaiveTime, Timelike, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};

/// First instant at or after `now` falling on `hour`:00 UTC.
pub fn next_run_at(now: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    let at = NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or(NaiveTime::MIN);
    let today = now.date_naive().and_time(at).and_utc();
    if today >= now {
        today
    } else {
        today + Duration::days(1)
    }
}

/// Whether today's trigger time has already passed at `now`.
pub fn due_today(now: DateTime<Utc>, hour: u32) -> bool {
    now.hour() >= hour
}

/// Run `day` on the blocking pool and log what happened.
pub async fn settle(settlement: Arc<Settlement>, day: SettlementDay) -> Result<SettlementOutcome> {
    let outcome = tokio::task::spawn_blocking(move || settlement.run(day))
        .await
        .map_err(|err| anyhow!("settlement task failed: {err}"))??;
    match &outcome {
        SettlementOutcome::Completed(report) => info!(
            target: "settlement",
            %day,
            flows = report.flows_written(),
            resumed = report.resumed,
            "Daily settlement finished"
        ),
        SettlementOutcome::AlreadyCompleted(_) => {
            info!(target: "settlement", %day, "Day already settled")
        }
        SettlementOutcome::InProgress { owner, heartbeat_at } => warn!(
            target: "settlement",
            %day,
            %owner,
            %heartbeat_at,
            "Day is being settled elsewhere"
        ),
    }
    Ok(outcome)
}

/// Loop forever, settling each day at `hour`:00 UTC.
pub async fn run_daily(settlement: Arc<Settlement>, hour: u32) {
    let now = Utc::now();
    let yesterday = day_of(now) - Duration::days(1);
    match settlement.leases().status(yesterday) {
        Ok(Some(lease)) if lease.state == DayState::Running => {
            warn!(target: "settlement", day = %yesterday, owner = %lease.owner, "Resuming unfinished day");
            if let Err(err) = settle(settlement.clone(), yesterday).await {
                error!(target: "settlement", day = %yesterday, error = %err, "Resume failed");
            }
        }
        Ok(_) => {}
        Err(err) => error!(target: "settlement", error = %err, "Failed to read settlement lease"),
    }

    if due_today(now, hour) {
        if let Err(err) = settle(settlement.clone(), day_of(now)).await {
            error!(target: "settlement", error = %err, "Catch-up settlement failed");
        }
    }

    loop {
        let now = Utc::now();
        let at = next_run_at(now, hour);
        let wait = (at - now).to_std().unwrap_or_default();
        info!(target: "settlement", next = %at, "Next settlement scheduled");
        tokio::time::sleep(wait).await;

        if let Err(err) = settle(settlement.clone(), day_of(at)).await {
            // The day stays RUNNING; the next start-up resumes it.
            error!(target: "settlement", day = %day_of(at), error = %err, "Settlement failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, h, m, 0).unwrap()
    }

    #[test]
    fn next_run_rolls_to_tomorrow_once_passed() {
        assert_eq!(next_run_at(at(1, 30), 2), at(2, 0));
        assert_eq!(next_run_at(at(2, 0), 2), at(2, 0));
        assert_eq!(
            next_run_at(at(2, 1), 2),
            Utc.with_ymd_and_hms(2026, 10, 20, 2, 0, 0).unwrap()
        );
    }

    #[test]
    fn catch_up_only_after_the_hour() {
        assert!(!due_today(at(1, 59), 2));
        assert!(due_today(at(2, 30), 2));
        assert!(due_today(at(23, 0), 0));
    }
}
