//! Pipeline steps and the record a completed day leaves behind.

use arbor_types::{Amount, SettlementDay};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Settlement steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Dividend,
    Rerank,
    Static,
    Dynamic,
    Retention,
}

impl Step {
    pub const ALL: [Step; 5] = [
        Step::Dividend,
        Step::Rerank,
        Step::Static,
        Step::Dynamic,
        Step::Retention,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Step::Dividend => "dividend",
            Step::Rerank => "rerank",
            Step::Static => "static",
            Step::Dynamic => "dynamic",
            Step::Retention => "retention",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    /// Users visited by this invocation (a resumed step counts only the remainder).
    pub processed: u64,
    pub flows_written: u64,
    pub seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementReport {
    pub day: SettlementDay,
    pub owner: Uuid,
    /// Whether this run picked the day up from an earlier, unfinished one.
    pub resumed: bool,
    pub steps: Vec<(Step, StepReport)>,
    pub dividend_unallocated: Amount,
    pub history_cutoff: Option<SettlementDay>,
    pub history_purged: u64,
    pub completed_at: DateTime<Utc>,
}

impl SettlementReport {
    pub fn step(&self, step: Step) -> Option<&StepReport> {
        self.steps.iter().find(|(s, _)| *s == step).map(|(_, r)| r)
    }

    pub fn flows_written(&self) -> u64 {
        self.steps.iter().map(|(_, r)| r.flows_written).sum()
    }
}

/// What a settlement request ended up doing.
#[derive(Debug, Clone, PartialEq)]
pub enum SettlementOutcome {
    Completed(SettlementReport),
    /// The day was already settled; carries the stored report when available.
    AlreadyCompleted(Option<SettlementReport>),
    /// Another owner holds a fresh lease on the day.
    InProgress {
        owner: Uuid,
        heartbeat_at: DateTime<Utc>,
    },
}
