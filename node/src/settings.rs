//! Process settings.
//!
//! Loaded from an optional TOML file overlaid with `ARBOR_`-prefixed
//! environment variables, then patched by command-line flags. Reward
//! parameters live in the same file and environment but are read by the
//! engine's own [`arbor_economics::ConfigStore`].

use anyhow::{anyhow, bail, Context, Result};
use arbor_types::Address;
use config::{Config, Environment, File as ConfigFile};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const ENV_PREFIX: &str = "ARBOR";
const DEFAULT_CONFIG_PATH: &str = "config/arbor.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sled,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "sled" => Ok(StorageBackend::Sled),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(anyhow!("unknown storage backend {other:?} (expected sled or memory)")),
        }
    }
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StorageBackend::Sled => "sled",
            StorageBackend::Memory => "memory",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
    pub node_id: String,

    // Storage
    pub data_dir: PathBuf,
    pub storage_backend: StorageBackend,

    // RPC
    pub rpc_host: String,
    pub rpc_port: u16,

    // Settlement
    /// UTC hour at which the daily settlement fires.
    pub settlement_hour: u32,

    // Chain gateway
    pub gateway_url: Option<String>,
    pub gateway_timeout_secs: u64,
    pub treasury_address: Option<Address>,

    // Observability
    pub prometheus_enabled: bool,
    pub log_level: String,
    pub log_format: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            config_path: None,
            node_id: "arbor-node".to_string(),
            data_dir: default_data_dir(),
            storage_backend: StorageBackend::Sled,
            rpc_host: "127.0.0.1".to_string(),
            rpc_port: 8_080,
            settlement_hour: 0,
            gateway_url: None,
            gateway_timeout_secs: 30,
            treasury_address: None,
            prometheus_enabled: true,
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("arbor"))
        .unwrap_or_else(|| PathBuf::from("./data"))
}

impl NodeConfig {
    /// Layer the config file (explicit path, or `config/arbor.toml` when it
    /// exists) and the environment over the defaults.
    pub fn load(config_path_override: Option<&str>) -> Result<Self> {
        let resolved_path = match config_path_override {
            Some(path) => {
                let path = PathBuf::from(path);
                if !path.exists() {
                    bail!(
                        "Configuration file {} not found (specified via --config)",
                        path.display()
                    );
                }
                Some(path)
            }
            None => Some(PathBuf::from(DEFAULT_CONFIG_PATH)).filter(|path| path.exists()),
        };

        let mut builder = Config::builder();
        if let Some(path) = &resolved_path {
            builder = builder.add_source(ConfigFile::from(path.as_path()));
        }
        builder = builder.add_source(Environment::with_prefix(ENV_PREFIX));
        let source = builder.build().context("failed to read configuration")?;

        let defaults = NodeConfig::default();
        let config = NodeConfig {
            config_path: resolved_path,
            node_id: get_string_value(&source, &["node_id"]).unwrap_or(defaults.node_id),
            data_dir: get_string_value(&source, &["data_dir"])
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            storage_backend: get_string_value(&source, &["storage_backend"])
                .map(|raw| raw.parse())
                .transpose()?
                .unwrap_or(defaults.storage_backend),
            rpc_host: get_string_value(&source, &["rpc_host"]).unwrap_or(defaults.rpc_host),
            rpc_port: get_parsed_value(&source, "rpc_port")?.unwrap_or(defaults.rpc_port),
            settlement_hour: get_parsed_value(&source, "settlement_hour")?
                .unwrap_or(defaults.settlement_hour),
            gateway_url: get_string_value(&source, &["gateway_url"]),
            gateway_timeout_secs: get_parsed_value(&source, "gateway_timeout_secs")?
                .unwrap_or(defaults.gateway_timeout_secs),
            treasury_address: get_string_value(&source, &["treasury_address"])
                .map(|raw| {
                    raw.parse::<Address>()
                        .map_err(|err| anyhow!("invalid treasury_address {raw:?}: {err}"))
                })
                .transpose()?,
            prometheus_enabled: get_bool_value(
                &source,
                &["prometheus_enabled"],
                defaults.prometheus_enabled,
            ),
            log_level: get_string_value(&source, &["log_level"]).unwrap_or(defaults.log_level),
            log_format: get_string_value(&source, &["log_format"]).unwrap_or(defaults.log_format),
        };
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.settlement_hour > 23 {
            bail!("settlement_hour must be within 0..=23, got {}", self.settlement_hour);
        }
        if self.rpc_port == 0 {
            bail!("rpc_port must be non-zero");
        }
        if !matches!(self.log_format.as_str(), "pretty" | "json") {
            bail!("log_format must be pretty or json, got {:?}", self.log_format);
        }
        if self.gateway_url.is_some() && self.treasury_address.is_none() {
            bail!("treasury_address is required when gateway_url is set");
        }
        if self.gateway_timeout_secs == 0 {
            bail!("gateway_timeout_secs must be positive");
        }
        Ok(())
    }

    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.rpc_host, self.rpc_port)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("db")
    }

    /// Wallet deposits land in; the zero address when no gateway is configured.
    pub fn treasury(&self) -> Address {
        self.treasury_address.unwrap_or(Address([0; 20]))
    }

    /// The resolved settings as TOML, for `arbor-node config`.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to render configuration")
    }

    pub fn config_file(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }
}

fn get_string_value(config: &Config, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        config
            .get_string(key)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

fn get_parsed_value<T>(config: &Config, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    get_string_value(config, &[key])
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|err| anyhow!("invalid value {raw:?} for {key}: {err}"))
        })
        .transpose()
}

fn get_bool_value(config: &Config, keys: &[&str], default: bool) -> bool {
    for key in keys {
        if let Ok(value) = config.get_bool(key) {
            return value;
        }
        if let Ok(raw) = config.get_string(key) {
            if let Ok(parsed) = raw.parse::<bool>() {
                return parsed;
            }
        }
    }
    default
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn file_values_override_defaults() {
        let file = write_config(
            r#"
node_id = "arbor-test"
data_dir = "/tmp/arbor-test"
storage_backend = "memory"
rpc_port = 9100
settlement_hour = 3
prometheus_enabled = false
log_format = "json"
stake_reward_rate = "0.01"
"#,
        );
        let config = NodeConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.node_id, "arbor-test");
        assert_eq!(config.storage_backend, StorageBackend::Memory);
        assert_eq!(config.rpc_port, 9100);
        assert_eq!(config.settlement_hour, 3);
        assert!(!config.prometheus_enabled);
        assert_eq!(config.db_path(), PathBuf::from("/tmp/arbor-test/db"));
        assert_eq!(config.rpc_host, "127.0.0.1");
        config.validate().unwrap();
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        assert!(NodeConfig::load(Some("/nonexistent/arbor.toml")).is_err());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let file = write_config("storage_backend = \"postgres\"\n");
        assert!(NodeConfig::load(file.path().to_str()).is_err());

        let file = write_config("rpc_port = \"eighty\"\n");
        assert!(NodeConfig::load(file.path().to_str()).is_err());

        let config = NodeConfig {
            settlement_hour: 24,
            ..NodeConfig::default()
        };
        assert!(config.validate().is_err());

        let config = NodeConfig {
            gateway_url: Some("http://127.0.0.1:9000".into()),
            ..NodeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn renders_as_toml() {
        let config = NodeConfig {
            treasury_address: Some(Address([0xEE; 20])),
            ..NodeConfig::default()
        };
        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("storage_backend = \"sled\""));
        assert!(rendered.contains(&Address([0xEE; 20]).to_string()));
    }
}
