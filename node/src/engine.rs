//! Wiring of stores, reward parameters, gateway and services.

use crate::settings::{NodeConfig, StorageBackend, ENV_PREFIX};
use crate::gateway::HttpGateway;
use anyhow::{anyhow, Context, Result};
use arbor_economics::{ConfigStore, Hierarchy, LayeredConfigProvider, LevelResolver, PerformanceCache};
use arbor_settlement::Settlement;
use arbor_storage::{KvStore, LedgerStore, MemoryKv, MemoryLedgerStore, SledKv, SledLedgerStore};
use arbor_treasury::{OfflineGateway, Processor, TransferSender, TransferVerifier};
use chrono::Utc;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct Engine {
    pub levels: Arc<LevelResolver>,
    pub processor: Arc<Processor>,
    pub settlement: Arc<Settlement>,
    db: Option<sled::Db>,
    _lock: Option<DataDirLock>,
}

impl Engine {
    pub fn open(config: &NodeConfig) -> Result<Self> {
        let (store, kv, db, lock): (Arc<dyn LedgerStore>, Arc<dyn KvStore>, _, _) =
            match config.storage_backend {
                StorageBackend::Sled => {
                    let lock = DataDirLock::acquire(&config.data_dir, "node")?;
                    let db = sled::open(config.db_path()).with_context(|| {
                        format!("failed to open database at {}", config.db_path().display())
                    })?;
                    let store = SledLedgerStore::from_db(db.clone())?;
                    let kv = SledKv::new(&db)?;
                    (Arc::new(store), Arc::new(kv), Some(db), Some(lock))
                }
                StorageBackend::Memory => {
                    warn!("Using in-memory storage; all state is lost on exit");
                    (
                        Arc::new(MemoryLedgerStore::new()),
                        Arc::new(MemoryKv::new()),
                        None,
                        None,
                    )
                }
            };

        let provider = LayeredConfigProvider::load(config.config_file(), ENV_PREFIX)?;
        let rewards = Arc::new(ConfigStore::new(Arc::new(provider)));
        // Fail at start-up rather than on the first request.
        rewards
            .current()
            .map_err(|err| anyhow!("invalid reward parameters: {err}"))?;

        let (verifier, sender): (Arc<dyn TransferVerifier>, Arc<dyn TransferSender>) =
            match &config.gateway_url {
                Some(url) => {
                    let gateway = Arc::new(HttpGateway::new(
                        url,
                        Duration::from_secs(config.gateway_timeout_secs),
                    )?);
                    info!(%url, "Using HTTP transfer gateway");
                    (gateway.clone(), gateway)
                }
                None => {
                    warn!("No transfer gateway configured; deposits and withdrawals will fail");
                    (Arc::new(OfflineGateway), Arc::new(OfflineGateway))
                }
            };

        let performance = Arc::new(PerformanceCache::new(
            Hierarchy::new(store.clone()),
            kv.clone(),
            rewards.clone(),
        ));
        let levels = Arc::new(LevelResolver::new(performance, kv.clone(), rewards.clone()));
        let processor = Arc::new(Processor::new(
            levels.clone(),
            rewards.clone(),
            verifier,
            sender,
            config.treasury(),
        ));
        let settlement = Arc::new(Settlement::new(levels.clone(), kv.clone(), rewards.clone()));
        info!(
            backend = %config.storage_backend,
            owner = %settlement.owner(),
            "Engine ready"
        );

        Ok(Self {
            levels,
            processor,
            settlement,
            db,
            _lock: lock,
        })
    }

    pub fn flush(&self) -> Result<()> {
        if let Some(db) = &self.db {
            db.flush().context("failed to flush database")?;
        }
        Ok(())
    }
}

/// Exclusive advisory lock on the data directory, released on drop.
pub struct DataDirLock {
    path: PathBuf,
    file: File,
}

impl DataDirLock {
    pub fn acquire<P: AsRef<Path>>(data_dir: P, purpose: &str) -> Result<Self> {
        let dir = data_dir.as_ref();
        fs::create_dir_all(dir)?;
        let lock_path = dir.join(".arbor.lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&lock_path)?;

        if let Err(err) = file.try_lock_exclusive() {
            return Err(anyhow!(
                "Data directory {} is locked by another process ({}). \
                 Stop the running node or remove {} if you are sure it is stale.",
                dir.display(),
                err,
                lock_path.display()
            ));
        }

        file.set_len(0)?;
        writeln!(
            &file,
            "pid={};purpose={};started={}",
            std::process::id(),
            purpose,
            Utc::now().to_rfc3339()
        )?;

        Ok(Self {
            path: lock_path,
            file,
        })
    }
}

impl Drop for DataDirLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_types::Address;

    fn sled_config(dir: &Path) -> NodeConfig {
        NodeConfig {
            data_dir: dir.to_path_buf(),
            storage_backend: StorageBackend::Sled,
            ..NodeConfig::default()
        }
    }

    #[test]
    fn sled_engine_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = sled_config(dir.path());
        {
            let engine = Engine::open(&config).unwrap();
            engine
                .levels
                .performance()
                .hierarchy()
                .register(Address([1; 20]), None, Utc::now())
                .unwrap();
            engine.flush().unwrap();
        }
        let engine = Engine::open(&config).unwrap();
        assert!(engine.processor.balance(&Address([1; 20])).is_ok());
    }

    #[test]
    fn data_dir_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let _engine = Engine::open(&sled_config(dir.path())).unwrap();
        assert!(DataDirLock::acquire(dir.path(), "second").is_err());
    }

    #[test]
    fn memory_engine_starts_empty() {
        let config = NodeConfig {
            storage_backend: StorageBackend::Memory,
            ..NodeConfig::default()
        };
        let engine = Engine::open(&config).unwrap();
        let store = engine.levels.performance().hierarchy().store();
        assert_eq!(store.max_depth().unwrap(), None);
    }
}
