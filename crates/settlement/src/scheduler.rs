//! Daily settlement pipeline.
//!
//! One run per UTC day, strictly sequential:
//! 1. fee dividends (paged by user id, checkpoint per page)
//! 2. level re-rank and history snapshot, top-down by depth (idempotent upsert, no checkpoint)
//! 3. static rewards (paged by user id, checkpoint per page)
//! 4. dynamic rewards, deepest depth first (checkpoint per user: depth and last id)
//! 5. history retention
//!
//! The day lease is refreshed at every checkpoint. A failed run leaves the
//! day RUNNING; the same scheduler, or a new one once the lease has gone
//! stale, resumes after the last completed step and from the saved cursors.

use crate::checkpoint::{Checkpoints, Cursor, DepthCursor};
use crate::errors::{Result, SettlementError};
use crate::lease::{Acquired, DayLeases, LeaseHandle};
use crate::report::{SettlementOutcome, SettlementReport, Step, StepReport};
use arbor_economics::{ConfigStore, LevelResolver, RewardConfig};
use arbor_storage::{HistoryRetention, KvStore, KvStoreExt, LedgerStore, PruneReport};
use arbor_treasury::{CapEnforcer, DividendRewards, DividendStart, DynamicRewards, StaticRewards};
use arbor_types::{day_key, utc_today, Amount, PerformanceHistory, SettlementDay, User};
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};
use uuid::Uuid;

fn report_key(day: SettlementDay) -> String {
    format!("settlement:{}:report", day_key(day))
}

/// Resolve an optional `(year, month, day)` request; all absent means today.
pub fn settlement_day(
    year: Option<i32>,
    month: Option<u32>,
    day: Option<u32>,
) -> Result<SettlementDay> {
    match (year, month, day) {
        (None, None, None) => Ok(utc_today()),
        (Some(y), Some(m), Some(d)) => NaiveDate::from_ymd_opt(y, m, d)
            .ok_or_else(|| SettlementError::InvalidDay(format!("{y:04}-{m:02}-{d:02}"))),
        _ => Err(SettlementError::InvalidDay(
            "year, month and day must be given together".into(),
        )),
    }
}

/// Figures collected across steps for the final report.
#[derive(Default)]
struct RunTotals {
    dividend_unallocated: Amount,
    prune: PruneReport,
}

pub struct Settlement {
    store: Arc<dyn LedgerStore>,
    kv: Arc<dyn KvStore>,
    config: Arc<ConfigStore>,
    levels: Arc<LevelResolver>,
    statics: StaticRewards,
    dynamics: DynamicRewards,
    dividends: DividendRewards,
    leases: DayLeases,
    checkpoints: Checkpoints,
    owner: Uuid,
}

impl Settlement {
    pub fn new(levels: Arc<LevelResolver>, kv: Arc<dyn KvStore>, config: Arc<ConfigStore>) -> Self {
        let store = levels.performance().hierarchy().store().clone();
        let caps = Arc::new(CapEnforcer::new(store.clone(), levels.clone()));
        Self {
            statics: StaticRewards::new(levels.clone(), caps.clone(), config.clone()),
            dynamics: DynamicRewards::new(levels.clone(), caps, config.clone()),
            dividends: DividendRewards::new(store.clone(), kv.clone(), config.clone()),
            leases: DayLeases::new(kv.clone()),
            checkpoints: Checkpoints::new(kv.clone()),
            owner: Uuid::new_v4(),
            store,
            kv,
            config,
            levels,
        }
    }

    /// Identity this scheduler writes into day leases.
    pub fn owner(&self) -> Uuid {
        self.owner
    }

    pub fn leases(&self) -> &DayLeases {
        &self.leases
    }

    /// Report stored by the run that completed `day`.
    pub fn report(&self, day: SettlementDay) -> Result<Option<SettlementReport>> {
        Ok(self.kv.get_json(&report_key(day))?)
    }

    /// Settle `day`, or resume it. A day that is completed, or held by a live
    /// run elsewhere, is left alone.
    pub fn run(&self, day: SettlementDay) -> Result<SettlementOutcome> {
        let config = self.config.current()?;
        let acquired = self
            .leases
            .acquire(day, self.owner, config.settlement_lease, Utc::now())?;
        let (mut lease, resumed) = match acquired {
            Acquired::Fresh(lease) => (lease, false),
            Acquired::Resumed(lease) => (lease, true),
            Acquired::Completed(_) => {
                info!(target: "settlement", %day, "Day already settled");
                return Ok(SettlementOutcome::AlreadyCompleted(self.report(day)?));
            }
            Acquired::Held(lease) => {
                info!(
                    target: "settlement",
                    %day,
                    owner = %lease.owner,
                    heartbeat_at = %lease.heartbeat_at,
                    "Day is being settled elsewhere"
                );
                return Ok(SettlementOutcome::InProgress {
                    owner: lease.owner,
                    heartbeat_at: lease.heartbeat_at,
                });
            }
        };

        info!(target: "settlement", %day, owner = %self.owner, resumed, "Settlement started");
        let mut totals = RunTotals::default();
        let mut steps = Vec::with_capacity(Step::ALL.len());
        for step in Step::ALL {
            if lease.is_done(step) {
                debug!(target: "settlement", %day, %step, "Step already completed");
                continue;
            }
            let started = Instant::now();
            let outcome = match step {
                Step::Dividend => self.dividend_step(day, &config, &mut lease, &mut totals),
                Step::Rerank => self.rerank_step(day, &config, &mut lease),
                Step::Static => self.static_step(day, &config, &mut lease),
                Step::Dynamic => self.dynamic_step(day, &config, &mut lease),
                Step::Retention => self.retention_step(day, &config, &mut totals),
            };
            let mut report = match outcome {
                Ok(report) => report,
                Err(err) => {
                    error!(
                        target: "settlement",
                        %day,
                        %step,
                        error = %err,
                        "Settlement step failed, day left running"
                    );
                    return Err(err);
                }
            };
            report.seconds = started.elapsed().as_secs_f64();
            metrics::histogram!("arbor_settlement_step_seconds", "step" => step.as_str())
                .record(report.seconds);
            info!(
                target: "settlement",
                %day,
                %step,
                processed = report.processed,
                flows = report.flows_written,
                seconds = report.seconds,
                "Settlement step finished"
            );
            self.leases.mark_done(&mut lease, step, Utc::now())?;
            steps.push((step, report));
        }

        self.checkpoints.clear(day)?;
        let report = SettlementReport {
            day,
            owner: self.owner,
            resumed,
            steps,
            dividend_unallocated: totals.dividend_unallocated,
            history_cutoff: totals.prune.cutoff,
            history_purged: totals.prune.pruned_entries,
            completed_at: Utc::now(),
        };
        self.kv.set_json(&report_key(day), &report, None)?;
        self.leases.complete(&mut lease, Utc::now())?;
        info!(
            target: "settlement",
            %day,
            flows = report.flows_written(),
            unallocated = %report.dividend_unallocated,
            "Settlement completed"
        );
        Ok(SettlementOutcome::Completed(report))
    }

    /// Run for an explicit `(year, month, day)`, or today when all are absent.
    pub fn run_for(
        &self,
        year: Option<i32>,
        month: Option<u32>,
        day: Option<u32>,
    ) -> Result<SettlementOutcome> {
        self.run(settlement_day(year, month, day)?)
    }

    fn checkpoint<T: Serialize>(
        &self,
        day: SettlementDay,
        step: Step,
        cursor: &T,
        config: &RewardConfig,
        lease: &mut LeaseHandle,
    ) -> Result<()> {
        self.checkpoints.save(day, step, cursor, config.checkpoint_ttl)?;
        self.leases.heartbeat(lease, Utc::now())
    }

    /// Visit every user in id order from the step's saved cursor, saving the
    /// cursor after each page.
    fn paged_users<F>(
        &self,
        day: SettlementDay,
        step: Step,
        config: &RewardConfig,
        lease: &mut LeaseHandle,
        mut visit: F,
    ) -> Result<StepReport>
    where
        F: FnMut(&User) -> Result<u64>,
    {
        let page_size = config.settlement_page_size.max(1);
        let mut cursor: Cursor = self.checkpoints.load(day, step)?.unwrap_or_default();
        let mut report = StepReport::default();
        loop {
            let page = self.store.users_page(cursor.last_id, page_size)?;
            for user in &page {
                report.flows_written += visit(user)?;
                report.processed += 1;
                cursor.last_id = user.id;
            }
            if !page.is_empty() {
                self.checkpoint(day, step, &cursor, config, lease)?;
            }
            if page.len() < page_size {
                return Ok(report);
            }
        }
    }

    fn dividend_step(
        &self,
        day: SettlementDay,
        config: &RewardConfig,
        lease: &mut LeaseHandle,
        totals: &mut RunTotals,
    ) -> Result<StepReport> {
        let plan = match self.dividends.begin(day)? {
            DividendStart::AlreadyDone => return Ok(StepReport::default()),
            DividendStart::Fresh(plan) | DividendStart::Resume(plan) => plan,
        };
        totals.dividend_unallocated = plan.unallocated();
        if totals.dividend_unallocated > Decimal::ZERO {
            info!(
                target: "settlement",
                %day,
                unallocated = %totals.dividend_unallocated,
                "Dividend remainder kept as platform revenue"
            );
        }
        let report = self.paged_users(day, Step::Dividend, config, lease, |user| {
            Ok(self.dividends.pay_holder(user, &plan)? as u64)
        })?;
        self.dividends.finish(day)?;
        Ok(report)
    }

    fn rerank_step(
        &self,
        day: SettlementDay,
        config: &RewardConfig,
        lease: &mut LeaseHandle,
    ) -> Result<StepReport> {
        let mut report = StepReport::default();
        let Some(max_depth) = self.store.max_depth()? else {
            return Ok(report);
        };
        let page_size = config.settlement_page_size.max(1);
        for depth in 0..=max_depth {
            let mut after = 0;
            loop {
                let page = self.store.users_at_depth(depth, after, page_size)?;
                for user in &page {
                    after = user.id;
                    self.snapshot(user, day)?;
                    report.processed += 1;
                }
                if page.len() < page_size {
                    break;
                }
            }
            self.leases.heartbeat(lease, Utc::now())?;
        }
        Ok(report)
    }

    /// Re-rank `user` and upsert its history row for `day`. A dynamic base
    /// already recorded for the day is kept.
    fn snapshot(&self, user: &User, day: SettlementDay) -> Result<()> {
        let (user, standing) = self.levels.rerank(&user.address)?;
        let hierarchy = self.levels.performance().hierarchy();
        let mut row = self
            .store
            .get_history(&user.address, day)?
            .unwrap_or_else(|| PerformanceHistory::new(user.address, day));
        row.performance = standing.total_performance;
        row.partial_performance = standing.partial_performance;
        row.staked = self
            .store
            .get_balance(&user.address)?
            .map(|b| b.token_staked_points)
            .unwrap_or_default();
        row.subordinate_count = hierarchy.descendant_count(&user.address)?;
        row.level = standing.level;
        self.store.put_history(&row)?;
        Ok(())
    }

    fn static_step(
        &self,
        day: SettlementDay,
        config: &RewardConfig,
        lease: &mut LeaseHandle,
    ) -> Result<StepReport> {
        self.paged_users(day, Step::Static, config, lease, |user| {
            if !user.is_placed() {
                return Ok(0);
            }
            Ok(self.statics.settle_user(user, day)?.flows_written as u64)
        })
    }

    fn dynamic_step(
        &self,
        day: SettlementDay,
        config: &RewardConfig,
        lease: &mut LeaseHandle,
    ) -> Result<StepReport> {
        let mut report = StepReport::default();
        let Some(max_depth) = self.store.max_depth()? else {
            return Ok(report);
        };
        let page_size = config.settlement_page_size.max(1);
        let mut cursor = self
            .checkpoints
            .load::<DepthCursor>(day, Step::Dynamic)?
            .unwrap_or(DepthCursor {
                depth: max_depth,
                last_id: 0,
            });
        if cursor != (DepthCursor { depth: max_depth, last_id: 0 }) {
            info!(
                target: "settlement",
                %day,
                depth = cursor.depth,
                last_id = cursor.last_id,
                "Resuming dynamic pass"
            );
        }

        loop {
            let page = self
                .store
                .users_at_depth(cursor.depth, cursor.last_id, page_size)?;
            for user in &page {
                let outcome = self.dynamics.settle_user(user, day)?;
                report.flows_written += outcome.flows_written as u64;
                report.processed += 1;
                cursor.last_id = user.id;
                self.checkpoint(day, Step::Dynamic, &cursor, config, lease)?;
            }
            if page.len() < page_size {
                if cursor.depth == 0 {
                    return Ok(report);
                }
                cursor = DepthCursor {
                    depth: cursor.depth - 1,
                    last_id: 0,
                };
                self.checkpoint(day, Step::Dynamic, &cursor, config, lease)?;
            }
        }
    }

    fn retention_step(
        &self,
        day: SettlementDay,
        config: &RewardConfig,
        totals: &mut RunTotals,
    ) -> Result<StepReport> {
        let retention = HistoryRetention::new(config.history_retention_days);
        let mut prune = PruneReport::new(retention.cutoff(day));
        if let Some(cutoff) = prune.cutoff {
            prune.pruned_entries = self.store.purge_history_before(cutoff)?;
            info!(
                target: "settlement",
                %cutoff,
                purged = prune.pruned_entries,
                "Performance history pruned"
            );
        }
        totals.prune = prune;
        Ok(StepReport {
            processed: prune.pruned_entries,
            ..StepReport::default()
        })
    }
}
