//! Level resolution.
//!
//! A user's level is the number of ascending thresholds their *partial*
//! performance reaches, where partial performance is the sum of all direct
//! children's contributions minus the single largest one. The result is
//! floor-clamped to the externally assigned `min_level`.

use crate::errors::Result;
use crate::params::ConfigStore;
use crate::performance::{performance_key, PerformanceCache};
use arbor_storage::KvStore;
use arbor_types::{Address, Amount, User};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

fn level_key(address: &Address) -> String {
    format!("level:{address}")
}

/// Inputs and outcome of one level computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Standing {
    pub total_performance: Amount,
    pub partial_performance: Amount,
    pub level: u8,
}

/// Number of thresholds `partial` reaches.
pub fn level_for(partial: Amount, thresholds: &[Amount]) -> u8 {
    thresholds.iter().filter(|t| partial >= **t).count().min(u8::MAX as usize) as u8
}

pub struct LevelResolver {
    performance: Arc<PerformanceCache>,
    kv: Arc<dyn KvStore>,
    config: Arc<ConfigStore>,
}

impl LevelResolver {
    pub fn new(
        performance: Arc<PerformanceCache>,
        kv: Arc<dyn KvStore>,
        config: Arc<ConfigStore>,
    ) -> Self {
        Self {
            performance,
            kv,
            config,
        }
    }

    pub fn performance(&self) -> &Arc<PerformanceCache> {
        &self.performance
    }

    /// Total and partial performance plus the level they resolve to.
    pub fn standing(&self, user: &User) -> Result<Standing> {
        let config = self.config.current()?;
        let mut total = Decimal::ZERO;
        let mut largest = Decimal::ZERO;
        for child in self.performance.hierarchy().children(&user.address)? {
            let contribution = self.performance.contribution(&child)?;
            total += contribution;
            largest = largest.max(contribution);
        }
        let partial = total - largest;
        let level = level_for(partial, &config.level_thresholds).max(user.min_level);
        Ok(Standing {
            total_performance: total,
            partial_performance: partial,
            level,
        })
    }

    /// Cached level of `address`.
    pub fn level(&self, address: &Address) -> Result<u8> {
        if let Some(level) = self
            .kv
            .get(&level_key(address))?
            .and_then(|raw| raw.parse::<u8>().ok())
        {
            return Ok(level);
        }
        let user = self.performance.hierarchy().user(address)?;
        let standing = self.standing(&user)?;
        self.remember(address, standing.level)?;
        Ok(standing.level)
    }

    /// Recompute the level and persist it on the user row when it changed.
    pub fn rerank(&self, address: &Address) -> Result<(User, Standing)> {
        let hierarchy = self.performance.hierarchy();
        let mut user = hierarchy.user(address)?;
        let standing = self.standing(&user)?;
        self.remember(address, standing.level)?;
        if user.level != standing.level {
            info!(
                target: "economics",
                %address,
                from = user.level,
                to = standing.level,
                partial = %standing.partial_performance,
                "Level changed"
            );
            user.level = standing.level;
            hierarchy.store().put_user(&user)?;
        }
        Ok((user, standing))
    }

    /// Clear `address`, then walk its ancestors nearest first, clearing and
    /// re-ranking each. Called whenever a user's stake or active state changes.
    pub fn invalidate(&self, address: &Address) -> Result<()> {
        let user = self.performance.hierarchy().user(address)?;
        self.clear(address)?;
        let ancestors = self.performance.hierarchy().ancestors(&user)?;
        for ancestor in &ancestors {
            self.clear(&ancestor.address)?;
            self.rerank(&ancestor.address)?;
        }
        debug!(
            target: "economics",
            %address,
            ancestors = ancestors.len(),
            "Invalidated performance chain"
        );
        Ok(())
    }

    fn clear(&self, address: &Address) -> Result<()> {
        self.kv.delete(&performance_key(address))?;
        self.kv.delete(&level_key(address))?;
        Ok(())
    }

    fn remember(&self, address: &Address, level: u8) -> Result<()> {
        let ttl = self.config.current()?.performance_cache_ttl;
        self.kv.set(&level_key(address), &level.to_string(), Some(ttl))?;
        Ok(())
    }
}
