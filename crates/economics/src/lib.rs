//! Arbor economics
//!
//! The read side of the reward engine:
//! - [`params`]: typed reward parameters, their providers and the cached [`ConfigStore`]
//! - [`hierarchy`]: sponsor tree registration, write-once placement and tree queries
//! - [`performance`]: memoised subtree stake aggregation with computing locks
//! - [`levels`]: partial-performance level resolution and ancestor-chain invalidation

pub mod errors;
pub mod hierarchy;
pub mod levels;
pub mod params;
pub mod performance;

pub use errors::{EconomicsError, Result};
pub use hierarchy::Hierarchy;
pub use levels::{level_for, LevelResolver, Standing};
pub use params::{
    keys, ConfigProvider, ConfigStore, LayeredConfigProvider, MapConfigProvider, RewardConfig,
};
pub use performance::{backoff_delay, PerformanceCache};
