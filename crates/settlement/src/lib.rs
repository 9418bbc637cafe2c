//! Arbor Settlement
//!
//! The daily batch that turns the day's tree state into reward rows:
//! dividends, level re-rank with history snapshot, static and dynamic
//! rewards, then history retention. Guarded by a per-day lease in the shared
//! KV store and resumable from checkpoints after a crash.

pub mod checkpoint;
pub mod errors;
pub mod lease;
pub mod report;
pub mod scheduler;

pub use checkpoint::{Checkpoints, Cursor, DepthCursor};
pub use errors::{Result, SettlementError};
pub use lease::{Acquired, DayLease, DayLeases, DayState, LeaseHandle};
pub use report::{SettlementOutcome, SettlementReport, Step, StepReport};
pub use scheduler::{settlement_day, Settlement};
