//! Reward parameters.
//!
//! Every rate, threshold and tuning knob is read from a [`ConfigProvider`] as
//! a key→string pair, parsed once into a typed [`RewardConfig`] and cached by
//! the [`ConfigStore`] until it is explicitly invalidated.

use crate::errors::{EconomicsError, Result};
use arbor_types::{Amount, TokenType};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Configuration keys understood by [`RewardConfig::from_provider`].
pub mod keys {
    pub const STAKE_REWARD_RATE: &str = "stake_reward_rate";
    pub const DIRECT_REWARD_RATES: &str = "direct_reward_rates";
    pub const DIRECT_REWARD_DEPTH_OFFSET: &str = "direct_reward_depth_offset";
    pub const LEVEL_THRESHOLDS: &str = "level_thresholds";
    pub const LEVEL_REWARD_RATIOS: &str = "level_reward_ratios";
    pub const EQUAL_REWARD_RATE: &str = "equal_reward_rate";
    pub const STAKE_CAP_MULTIPLIERS: &str = "stake_cap_multipliers";
    pub const DIVIDEND_GROUP_RATIO: &str = "dividend_group_ratio";
    pub const DIVIDEND_GALAXY_RATIO: &str = "dividend_galaxy_ratio";
    pub const WITHDRAW_FEE_RATIO_USDT: &str = "withdraw_fee_ratio_usdt";
    pub const WITHDRAW_FEE_RATIO_TOKEN: &str = "withdraw_fee_ratio_token";
    pub const FLASH_SWAP_FEE_RATIO: &str = "flash_swap_fee_ratio";
    pub const TOKEN_PRICE: &str = "token_price";
    pub const PERFORMANCE_CACHE_TTL_SECS: &str = "performance_cache_ttl_secs";
    pub const COMPUTING_LOCK_TTL_SECS: &str = "computing_lock_ttl_secs";
    pub const BACKOFF_BASE_MS: &str = "backoff_base_ms";
    pub const BACKOFF_MAX_MS: &str = "backoff_max_ms";
    pub const BACKOFF_MAX_ATTEMPTS: &str = "backoff_max_attempts";
    pub const SETTLEMENT_PAGE_SIZE: &str = "settlement_page_size";
    pub const CHECKPOINT_TTL_SECS: &str = "checkpoint_ttl_secs";
    pub const SETTLEMENT_LEASE_SECS: &str = "settlement_lease_secs";
    pub const HISTORY_RETENTION_DAYS: &str = "history_retention_days";
    pub const CLAIM_PAGE_SIZE: &str = "claim_page_size";
}

/// Source of raw configuration values.
pub trait ConfigProvider: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// Mutable in-memory provider, used by tests and embedded setups.
#[derive(Debug, Default)]
pub struct MapConfigProvider {
    values: RwLock<HashMap<String, String>>,
}

impl MapConfigProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let provider = Self::new();
        for (key, value) in pairs {
            provider.set(key, value);
        }
        provider
    }

    pub fn set(&self, key: &str, value: &str) {
        self.values.write().insert(key.to_string(), value.to_string());
    }
}

impl ConfigProvider for MapConfigProvider {
    fn get(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }
}

/// Optional TOML file overlaid by `<PREFIX>_*` environment variables.
pub struct LayeredConfigProvider {
    config: config::Config,
}

impl LayeredConfigProvider {
    pub fn load(path: Option<&Path>, env_prefix: &str) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder = builder.add_source(config::Environment::with_prefix(env_prefix));
        let config = builder
            .build()
            .map_err(|e| EconomicsError::InvalidConfig(e.to_string()))?;
        Ok(Self { config })
    }
}

impl ConfigProvider for LayeredConfigProvider {
    fn get(&self, key: &str) -> Option<String> {
        self.config.get_string(key).ok()
    }
}

/// Typed reward parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardConfig {
    /// Daily rate applied to staked amounts.
    pub stake_reward_rate: Decimal,
    /// Direct-line rate indexed by direct-child count, clamped to the last entry.
    pub direct_reward_rates: Vec<Decimal>,
    /// Depth below the staker whose descendants feed the direct-line reward.
    pub direct_reward_depth_offset: u32,
    /// Ascending partial-performance thresholds; level = number passed.
    pub level_thresholds: Vec<Amount>,
    /// Differential ratio per level, indexed by level.
    pub level_reward_ratios: Vec<Decimal>,
    pub equal_reward_rate: Decimal,
    /// Cap multiplier per staking level, clamped to the last entry.
    pub stake_cap_multipliers: Vec<Decimal>,
    pub dividend_group_ratio: Decimal,
    pub dividend_galaxy_ratio: Decimal,
    pub withdraw_fee_ratio_usdt: Decimal,
    pub withdraw_fee_ratio_token: Decimal,
    pub flash_swap_fee_ratio: Decimal,
    /// USDT per reward token for the current day.
    pub token_price: Decimal,
    pub performance_cache_ttl: Duration,
    pub computing_lock_ttl: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub backoff_max_attempts: u32,
    pub settlement_page_size: usize,
    pub checkpoint_ttl: Duration,
    pub settlement_lease: Duration,
    pub history_retention_days: u32,
    pub claim_page_size: usize,
}

fn dec(value: &str) -> Decimal {
    Decimal::from_str(value).unwrap_or_default()
}

fn decs(values: &[&str]) -> Vec<Decimal> {
    values.iter().map(|v| dec(v)).collect()
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            stake_reward_rate: dec("0.005"),
            direct_reward_rates: decs(&["0", "0.1", "0.2", "0.3"]),
            direct_reward_depth_offset: 1,
            level_thresholds: decs(&[
                "10000",
                "30000",
                "100000",
                "300000",
                "1000000",
                "3000000",
                "10000000",
                "30000000",
                "100000000",
            ]),
            level_reward_ratios: decs(&[
                "0", "0.05", "0.1", "0.15", "0.2", "0.25", "0.3", "0.35", "0.4", "0.45",
            ]),
            equal_reward_rate: dec("0.1"),
            stake_cap_multipliers: decs(&["2", "2.5", "3"]),
            dividend_group_ratio: dec("0.3"),
            dividend_galaxy_ratio: dec("0.2"),
            withdraw_fee_ratio_usdt: dec("0.01"),
            withdraw_fee_ratio_token: dec("0.05"),
            flash_swap_fee_ratio: Decimal::ZERO,
            token_price: Decimal::ONE,
            performance_cache_ttl: Duration::from_secs(600),
            computing_lock_ttl: Duration::from_secs(30),
            backoff_base: Duration::from_millis(50),
            backoff_max: Duration::from_millis(2000),
            backoff_max_attempts: 20,
            settlement_page_size: 100,
            checkpoint_ttl: Duration::from_secs(172_800),
            settlement_lease: Duration::from_secs(1800),
            history_retention_days: 7,
            claim_page_size: 100,
        }
    }
}

struct Reader<'a> {
    provider: &'a dyn ConfigProvider,
}

impl Reader<'_> {
    fn raw(&self, key: &str) -> Option<String> {
        self.provider
            .get(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn invalid(key: &str, raw: &str) -> EconomicsError {
        EconomicsError::InvalidConfig(format!("{key} = {raw:?}"))
    }

    fn decimal(&self, key: &str, default: Decimal) -> Result<Decimal> {
        match self.raw(key) {
            Some(raw) => Decimal::from_str(&raw).map_err(|_| Self::invalid(key, &raw)),
            None => Ok(default),
        }
    }

    fn decimals(&self, key: &str, default: &[Decimal]) -> Result<Vec<Decimal>> {
        match self.raw(key) {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(|v| Decimal::from_str(v).map_err(|_| Self::invalid(key, &raw)))
                .collect(),
            None => Ok(default.to_vec()),
        }
    }

    fn number<T: FromStr>(&self, key: &str, default: T) -> Result<T> {
        match self.raw(key) {
            Some(raw) => raw.parse().map_err(|_| Self::invalid(key, &raw)),
            None => Ok(default),
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration> {
        self.number(key, default.as_secs()).map(Duration::from_secs)
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration> {
        self.number(key, default.as_millis() as u64)
            .map(Duration::from_millis)
    }
}

impl RewardConfig {
    /// Parse every known key, falling back to defaults for missing ones.
    pub fn from_provider(provider: &dyn ConfigProvider) -> Result<Self> {
        let d = Self::default();
        let r = Reader { provider };
        let config = Self {
            stake_reward_rate: r.decimal(keys::STAKE_REWARD_RATE, d.stake_reward_rate)?,
            direct_reward_rates: r.decimals(keys::DIRECT_REWARD_RATES, &d.direct_reward_rates)?,
            direct_reward_depth_offset: r
                .number(keys::DIRECT_REWARD_DEPTH_OFFSET, d.direct_reward_depth_offset)?,
            level_thresholds: r.decimals(keys::LEVEL_THRESHOLDS, &d.level_thresholds)?,
            level_reward_ratios: r.decimals(keys::LEVEL_REWARD_RATIOS, &d.level_reward_ratios)?,
            equal_reward_rate: r.decimal(keys::EQUAL_REWARD_RATE, d.equal_reward_rate)?,
            stake_cap_multipliers: r
                .decimals(keys::STAKE_CAP_MULTIPLIERS, &d.stake_cap_multipliers)?,
            dividend_group_ratio: r.decimal(keys::DIVIDEND_GROUP_RATIO, d.dividend_group_ratio)?,
            dividend_galaxy_ratio: r
                .decimal(keys::DIVIDEND_GALAXY_RATIO, d.dividend_galaxy_ratio)?,
            withdraw_fee_ratio_usdt: r
                .decimal(keys::WITHDRAW_FEE_RATIO_USDT, d.withdraw_fee_ratio_usdt)?,
            withdraw_fee_ratio_token: r
                .decimal(keys::WITHDRAW_FEE_RATIO_TOKEN, d.withdraw_fee_ratio_token)?,
            flash_swap_fee_ratio: r.decimal(keys::FLASH_SWAP_FEE_RATIO, d.flash_swap_fee_ratio)?,
            token_price: r.decimal(keys::TOKEN_PRICE, d.token_price)?,
            performance_cache_ttl: r
                .secs(keys::PERFORMANCE_CACHE_TTL_SECS, d.performance_cache_ttl)?,
            computing_lock_ttl: r.secs(keys::COMPUTING_LOCK_TTL_SECS, d.computing_lock_ttl)?,
            backoff_base: r.millis(keys::BACKOFF_BASE_MS, d.backoff_base)?,
            backoff_max: r.millis(keys::BACKOFF_MAX_MS, d.backoff_max)?,
            backoff_max_attempts: r.number(keys::BACKOFF_MAX_ATTEMPTS, d.backoff_max_attempts)?,
            settlement_page_size: r.number(keys::SETTLEMENT_PAGE_SIZE, d.settlement_page_size)?,
            checkpoint_ttl: r.secs(keys::CHECKPOINT_TTL_SECS, d.checkpoint_ttl)?,
            settlement_lease: r.secs(keys::SETTLEMENT_LEASE_SECS, d.settlement_lease)?,
            history_retention_days: r
                .number(keys::HISTORY_RETENTION_DAYS, d.history_retention_days)?,
            claim_page_size: r.number(keys::CLAIM_PAGE_SIZE, d.claim_page_size)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(EconomicsError::InvalidConfig(msg));

        if self
            .level_thresholds
            .windows(2)
            .any(|pair| pair[0] >= pair[1])
        {
            return fail("level_thresholds must be strictly ascending".into());
        }
        if self.level_reward_ratios.is_empty() {
            return fail("level_reward_ratios must not be empty".into());
        }
        if self.stake_cap_multipliers.is_empty() {
            return fail("stake_cap_multipliers must not be empty".into());
        }
        if self.stake_cap_multipliers.iter().any(|m| m.is_sign_negative()) {
            return fail("stake_cap_multipliers must not be negative".into());
        }

        let unit = |v: &Decimal| *v >= Decimal::ZERO && *v <= Decimal::ONE;
        let ratios = [
            (keys::STAKE_REWARD_RATE, self.stake_reward_rate),
            (keys::EQUAL_REWARD_RATE, self.equal_reward_rate),
            (keys::DIVIDEND_GROUP_RATIO, self.dividend_group_ratio),
            (keys::DIVIDEND_GALAXY_RATIO, self.dividend_galaxy_ratio),
            (keys::WITHDRAW_FEE_RATIO_USDT, self.withdraw_fee_ratio_usdt),
            (keys::WITHDRAW_FEE_RATIO_TOKEN, self.withdraw_fee_ratio_token),
            (keys::FLASH_SWAP_FEE_RATIO, self.flash_swap_fee_ratio),
        ];
        if let Some((key, value)) = ratios.iter().find(|(_, v)| !unit(v)) {
            return fail(format!("{key} = {value} is outside [0, 1]"));
        }
        if let Some(v) = self
            .direct_reward_rates
            .iter()
            .chain(&self.level_reward_ratios)
            .find(|v| !unit(*v))
        {
            return fail(format!("rate table entry {v} is outside [0, 1]"));
        }
        if self.dividend_group_ratio + self.dividend_galaxy_ratio > Decimal::ONE {
            return fail("dividend ratios add up to more than 1".into());
        }
        if self.token_price <= Decimal::ZERO {
            return fail(format!("token_price must be positive, got {}", self.token_price));
        }
        if self.settlement_page_size == 0 || self.claim_page_size == 0 {
            return fail("page sizes must be positive".into());
        }
        Ok(())
    }

    /// Direct-line rate for a staker with `child_count` direct children.
    pub fn direct_reward_rate(&self, child_count: usize) -> Decimal {
        clamped(&self.direct_reward_rates, child_count)
    }

    pub fn level_reward_ratio(&self, level: u8) -> Decimal {
        clamped(&self.level_reward_ratios, usize::from(level))
    }

    pub fn cap_multiplier(&self, level: u8) -> Decimal {
        clamped(&self.stake_cap_multipliers, usize::from(level))
    }

    pub fn withdraw_fee_ratio(&self, token: TokenType) -> Decimal {
        match token {
            TokenType::Usdt => self.withdraw_fee_ratio_usdt,
            TokenType::Token => self.withdraw_fee_ratio_token,
        }
    }

    /// Highest level the threshold table can produce.
    pub fn max_level(&self) -> u8 {
        self.level_thresholds.len().min(u8::MAX as usize) as u8
    }
}

fn clamped(table: &[Decimal], index: usize) -> Decimal {
    table
        .get(index)
        .or_else(|| table.last())
        .copied()
        .unwrap_or_default()
}

/// Caches the parsed [`RewardConfig`] for the current generation.
pub struct ConfigStore {
    provider: Arc<dyn ConfigProvider>,
    cached: RwLock<Option<Arc<RewardConfig>>>,
    generation: AtomicU64,
}

impl ConfigStore {
    pub fn new(provider: Arc<dyn ConfigProvider>) -> Self {
        Self {
            provider,
            cached: RwLock::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Store backed by an empty provider, i.e. every default.
    pub fn with_defaults() -> Self {
        Self::new(Arc::new(MapConfigProvider::new()))
    }

    /// Parsed config, loading it on first use after construction or invalidation.
    pub fn current(&self) -> Result<Arc<RewardConfig>> {
        if let Some(config) = self.cached.read().as_ref() {
            return Ok(config.clone());
        }
        let mut slot = self.cached.write();
        if let Some(config) = slot.as_ref() {
            return Ok(config.clone());
        }
        let config = Arc::new(RewardConfig::from_provider(self.provider.as_ref())?);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(target: "economics", generation, "Loaded reward configuration");
        *slot = Some(config.clone());
        Ok(config)
    }

    /// Drop the cached config; the next [`current`](Self::current) reloads it.
    pub fn invalidate(&self) {
        self.cached.write().take();
    }

    /// Number of times the config has been loaded.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn defaults_validate() {
        let config = RewardConfig::default();
        config.validate().unwrap();
        assert_eq!(config.level_thresholds.len(), 9);
        assert_eq!(config.max_level(), 9);
        assert_eq!(config.stake_reward_rate, dec!(0.005));
    }

    #[test]
    fn tables_clamp_to_last_entry() {
        let config = RewardConfig::default();
        assert_eq!(config.direct_reward_rate(0), dec!(0));
        assert_eq!(config.direct_reward_rate(2), dec!(0.2));
        assert_eq!(config.direct_reward_rate(50), dec!(0.3));
        assert_eq!(config.cap_multiplier(7), dec!(3));
        assert_eq!(config.level_reward_ratio(9), dec!(0.45));
    }

    #[test]
    fn provider_values_override_defaults() {
        let provider = MapConfigProvider::from_pairs([
            (keys::LEVEL_THRESHOLDS, "100, 500"),
            (keys::TOKEN_PRICE, "0.25"),
            (keys::BACKOFF_BASE_MS, "5"),
        ]);
        let config = RewardConfig::from_provider(&provider).unwrap();
        assert_eq!(config.level_thresholds, vec![dec!(100), dec!(500)]);
        assert_eq!(config.token_price, dec!(0.25));
        assert_eq!(config.backoff_base, Duration::from_millis(5));
        assert_eq!(config.claim_page_size, 100);
    }

    #[test]
    fn rejects_bad_values() {
        for (key, value) in [
            (keys::LEVEL_THRESHOLDS, "500,100"),
            (keys::TOKEN_PRICE, "0"),
            (keys::STAKE_REWARD_RATE, "abc"),
            (keys::DIVIDEND_GROUP_RATIO, "0.9"),
        ] {
            let provider = MapConfigProvider::from_pairs([(key, value)]);
            assert!(
                matches!(
                    RewardConfig::from_provider(&provider),
                    Err(EconomicsError::InvalidConfig(_))
                ),
                "{key} = {value} should be rejected"
            );
        }
    }

    #[test]
    fn store_reloads_after_invalidate() {
        let provider = Arc::new(MapConfigProvider::new());
        let store = ConfigStore::new(provider.clone());
        assert_eq!(store.current().unwrap().token_price, dec!(1));

        provider.set(keys::TOKEN_PRICE, "2");
        assert_eq!(store.current().unwrap().token_price, dec!(1));
        assert_eq!(store.generation(), 1);

        store.invalidate();
        assert_eq!(store.current().unwrap().token_price, dec!(2));
        assert_eq!(store.generation(), 2);
    }
}
