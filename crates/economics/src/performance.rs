//! Memoised subtree performance.
//!
//! `total_performance(x)` = Σ over direct children c of
//! (c's own stake if c is active) + total_performance(c).
//!
//! Results live in the shared KV store with a TTL. A per-address computing
//! lock (short TTL, conditional set) lets exactly one caller recompute a cold
//! entry; everyone else polls with exponential backoff until the value lands.

use crate::errors::{EconomicsError, Result};
use crate::hierarchy::Hierarchy;
use crate::params::{ConfigStore, RewardConfig};
use arbor_storage::{KvStore, LedgerStore};
use arbor_types::{Address, Amount, User};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

pub(crate) fn performance_key(address: &Address) -> String {
    format!("perf:{address}")
}

fn lock_key(address: &Address) -> String {
    format!("perf:lock:{address}")
}

/// Delay before poll `attempt` (0-based): base × 2^attempt, clamped to the max.
pub fn backoff_delay(config: &RewardConfig, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    config
        .backoff_base
        .saturating_mul(factor)
        .min(config.backoff_max)
}

pub struct PerformanceCache {
    hierarchy: Hierarchy,
    kv: Arc<dyn KvStore>,
    config: Arc<ConfigStore>,
    recomputations: AtomicU64,
}

impl PerformanceCache {
    pub fn new(hierarchy: Hierarchy, kv: Arc<dyn KvStore>, config: Arc<ConfigStore>) -> Self {
        Self {
            hierarchy,
            kv,
            config,
            recomputations: AtomicU64::new(0),
        }
    }

    pub fn hierarchy(&self) -> &Hierarchy {
        &self.hierarchy
    }

    fn store(&self) -> &Arc<dyn LedgerStore> {
        self.hierarchy.store()
    }

    /// Number of subtree recomputations performed by this instance.
    pub fn recomputations(&self) -> u64 {
        self.recomputations.load(Ordering::SeqCst)
    }

    /// Aggregated active stake of every descendant of `address`.
    pub fn total_performance(&self, address: &Address) -> Result<Amount> {
        if let Some(cached) = self.cached(address)? {
            return Ok(cached);
        }

        let config = self.config.current()?;
        let lock = lock_key(address);
        let mut attempt = 0;
        loop {
            if self
                .kv
                .set_if_absent(&lock, "computing", Some(config.computing_lock_ttl))?
            {
                // The previous holder may have finished between our last poll and now.
                let computed = match self.cached(address) {
                    Ok(Some(cached)) => Ok(cached),
                    _ => self.recompute(address, &config),
                };
                self.kv.delete(&lock)?;
                return computed;
            }

            if attempt >= config.backoff_max_attempts {
                return Err(EconomicsError::PerformanceComputeTimeout {
                    address: *address,
                    attempts: attempt,
                });
            }
            let delay = backoff_delay(&config, attempt);
            trace!(target: "economics", %address, attempt, ?delay, "Waiting for performance");
            std::thread::sleep(delay);
            attempt += 1;

            if let Some(cached) = self.cached(address)? {
                return Ok(cached);
            }
        }
    }

    /// Identical to [`total_performance`](Self::total_performance): descendant
    /// stake only, the user's own stake excluded.
    pub fn non_mining_performance(&self, address: &Address) -> Result<Amount> {
        self.total_performance(address)
    }

    /// What `child` adds to its superior's performance.
    pub fn contribution(&self, child: &User) -> Result<Amount> {
        Ok(self.own_active_stake(&child.address)? + self.total_performance(&child.address)?)
    }

    /// Own staked amount while the reward cap is positive, zero otherwise.
    pub fn own_active_stake(&self, address: &Address) -> Result<Amount> {
        Ok(match self.store().get_balance(address)? {
            Some(balance) if balance.is_active() => balance.token_staked_points,
            _ => Decimal::ZERO,
        })
    }

    /// Drop the memoised figure for `address`.
    pub fn clear(&self, address: &Address) -> Result<()> {
        self.kv.delete(&performance_key(address))?;
        Ok(())
    }

    fn cached(&self, address: &Address) -> Result<Option<Amount>> {
        Ok(self
            .kv
            .get(&performance_key(address))?
            .and_then(|raw| Decimal::from_str(&raw).ok()))
    }

    fn recompute(&self, address: &Address, config: &RewardConfig) -> Result<Amount> {
        let mut total = Decimal::ZERO;
        for child in self.hierarchy.children(address)? {
            total += self.contribution(&child)?;
        }
        self.kv.set(
            &performance_key(address),
            &total.to_string(),
            Some(config.performance_cache_ttl),
        )?;
        self.recomputations.fetch_add(1, Ordering::SeqCst);
        metrics::counter!("arbor_performance_recomputations_total").increment(1);
        debug!(target: "economics", %address, %total, "Recomputed performance");
        Ok(total)
    }
}
