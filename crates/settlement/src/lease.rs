//! Per-day settlement lease.
//!
//! The lease record lives in the shared KV store under `settlement:{day}`.
//! It is created with a conditional set, so exactly one run can start a day,
//! and every later change is a compare-and-swap against the exact record the
//! writer last saw. A RUNNING record whose heartbeat is older than the lease
//! timeout may be taken over by a new owner, which resumes from the
//! checkpoints the previous owner left.

use crate::errors::{Result, SettlementError};
use crate::report::Step;
use arbor_storage::{KvStore, StorageError};
use arbor_types::{day_key, SettlementDay};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

pub(crate) fn lease_key(day: SettlementDay) -> String {
    format!("settlement:{}", day_key(day))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DayState {
    Running,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayLease {
    pub day: SettlementDay,
    pub state: DayState,
    pub owner: Uuid,
    pub started_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    pub completed_steps: Vec<Step>,
}

impl DayLease {
    fn is_stale(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        let timeout =
            chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::days(36_500));
        now.signed_duration_since(self.heartbeat_at) >= timeout
    }
}

/// A lease this process currently owns, together with the stored form it
/// will compare against on the next write.
#[derive(Debug, Clone)]
pub struct LeaseHandle {
    record: DayLease,
    raw: String,
}

impl LeaseHandle {
    pub fn record(&self) -> &DayLease {
        &self.record
    }

    pub fn is_done(&self, step: Step) -> bool {
        self.record.completed_steps.contains(&step)
    }
}

#[derive(Debug)]
pub enum Acquired {
    /// Nobody had touched the day.
    Fresh(LeaseHandle),
    /// The day was RUNNING under this owner, or under a stale one now replaced.
    Resumed(LeaseHandle),
    Completed(DayLease),
    Held(DayLease),
}

fn encode(record: &DayLease) -> Result<String> {
    serde_json::to_string(record).map_err(|e| StorageError::from(e).into())
}

fn decode(raw: &str) -> Result<DayLease> {
    serde_json::from_str(raw).map_err(|e| StorageError::from(e).into())
}

pub struct DayLeases {
    kv: Arc<dyn KvStore>,
}

impl DayLeases {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub fn status(&self, day: SettlementDay) -> Result<Option<DayLease>> {
        self.kv.get(&lease_key(day))?.as_deref().map(decode).transpose()
    }

    pub fn acquire(
        &self,
        day: SettlementDay,
        owner: Uuid,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<Acquired> {
        let key = lease_key(day);
        loop {
            let Some(raw) = self.kv.get(&key)? else {
                let record = DayLease {
                    day,
                    state: DayState::Running,
                    owner,
                    started_at: now,
                    heartbeat_at: now,
                    completed_steps: Vec::new(),
                };
                let raw = encode(&record)?;
                if self.kv.set_if_absent(&key, &raw, None)? {
                    info!(target: "settlement", %day, %owner, "Settlement lease acquired");
                    return Ok(Acquired::Fresh(LeaseHandle { record, raw }));
                }
                continue;
            };

            let current = decode(&raw)?;
            match current.state {
                DayState::Completed => return Ok(Acquired::Completed(current)),
                DayState::Running if current.owner == owner => {
                    return Ok(Acquired::Resumed(LeaseHandle { record: current, raw }));
                }
                DayState::Running if current.is_stale(timeout, now) => {
                    let record = DayLease {
                        owner,
                        heartbeat_at: now,
                        ..current.clone()
                    };
                    let next = encode(&record)?;
                    if self.kv.compare_and_swap(&key, Some(&raw), &next, None)? {
                        warn!(
                            target: "settlement",
                            %day,
                            previous = %current.owner,
                            last_heartbeat = %current.heartbeat_at,
                            %owner,
                            "Took over stale settlement lease"
                        );
                        return Ok(Acquired::Resumed(LeaseHandle { record, raw: next }));
                    }
                }
                DayState::Running => return Ok(Acquired::Held(current)),
            }
        }
    }

    fn swap(&self, handle: &mut LeaseHandle, record: DayLease) -> Result<()> {
        let key = lease_key(record.day);
        let next = encode(&record)?;
        if self
            .kv
            .compare_and_swap(&key, Some(&handle.raw), &next, None)?
        {
            handle.record = record;
            handle.raw = next;
            return Ok(());
        }
        let owner = self
            .status(record.day)?
            .map_or(Uuid::nil(), |current| current.owner);
        Err(SettlementError::SettlementInProgress {
            day: record.day,
            owner,
        })
    }

    /// Refresh the heartbeat. Fails if the lease was taken over.
    pub fn heartbeat(&self, handle: &mut LeaseHandle, now: DateTime<Utc>) -> Result<()> {
        let record = DayLease {
            heartbeat_at: now,
            ..handle.record.clone()
        };
        self.swap(handle, record)
    }

    pub fn mark_done(&self, handle: &mut LeaseHandle, step: Step, now: DateTime<Utc>) -> Result<()> {
        let mut record = handle.record.clone();
        if !record.completed_steps.contains(&step) {
            record.completed_steps.push(step);
        }
        record.heartbeat_at = now;
        self.swap(handle, record)
    }

    pub fn complete(&self, handle: &mut LeaseHandle, now: DateTime<Utc>) -> Result<()> {
        let record = DayLease {
            state: DayState::Completed,
            heartbeat_at: now,
            ..handle.record.clone()
        };
        self.swap(handle, record)
    }

    /// Operator override: drop the day's lease whatever its state. Checkpoints
    /// are kept, so the next run resumes where the last one stopped.
    pub fn force_release(&self, day: SettlementDay) -> Result<Option<DayLease>> {
        let previous = self.status(day)?;
        self.kv.delete(&lease_key(day))?;
        if let Some(lease) = &previous {
            warn!(
                target: "settlement",
                %day,
                owner = %lease.owner,
                state = ?lease.state,
                "Settlement lease force-released"
            );
        }
        Ok(previous)
    }
}
