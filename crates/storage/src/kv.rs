//! Shared key/value store with expiring entries.
//!
//! Backs every piece of cross-process coordination: memoised performance and
//! level figures (TTL), per-address computing locks (short TTL), settlement
//! day leases and checkpoints (long TTL). Expired entries read as absent.

use crate::{Result, StorageError};
use chrono::Utc;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sled::{CompareAndSwapError, Tree};
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;
    /// Store `value` only if `key` is absent or expired. Returns whether it was stored.
    fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool>;
    /// Replace the current value with `value` only if it equals `expected`
    /// (`None` meaning absent or expired). Returns whether it was replaced.
    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool>;
    fn delete(&self, key: &str) -> Result<()>;
}

/// JSON helpers over any [`KvStore`].
pub trait KvStoreExt: KvStore {
    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.get(key)?
            .map(|raw| serde_json::from_str(&raw).map_err(StorageError::from))
            .transpose()
    }

    fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()> {
        self.set(key, &serde_json::to_string(value)?, ttl)
    }
}

impl<K: KvStore + ?Sized> KvStoreExt for K {}

// -----------------------------------------------------------------------------
// In-memory implementation
// -----------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(value: &str, ttl: Option<Duration>) -> MemoryEntry {
        MemoryEntry {
            value: value.to_string(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.entries
            .lock()
            .insert(key.to_string(), Self::entry(value, ttl));
        Ok(())
    }

    fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        self.compare_and_swap(key, None, value, ttl)
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let current = entries
            .get(key)
            .filter(|e| e.live(now))
            .map(|e| e.value.as_str());
        if current != expected {
            return Ok(false);
        }
        entries.insert(key.to_string(), Self::entry(value, ttl));
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Sled implementation
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct SledEntry {
    value: String,
    /// Unix milliseconds; wall clock so entries survive restarts.
    expires_at_ms: Option<i64>,
}

impl SledEntry {
    fn new(value: &str, ttl: Option<Duration>) -> Self {
        Self {
            value: value.to_string(),
            expires_at_ms: ttl.map(|ttl| Utc::now().timestamp_millis() + ttl.as_millis() as i64),
        }
    }

    fn live(&self) -> bool {
        self.expires_at_ms
            .map_or(true, |at| at > Utc::now().timestamp_millis())
    }
}

/// KV store persisted in a sled tree, shared by every process opening the same database.
pub struct SledKv {
    tree: Tree,
}

impl SledKv {
    pub fn new(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            tree: db.open_tree("kv")?,
        })
    }

    fn read(&self, key: &str) -> Result<(Option<sled::IVec>, Option<SledEntry>)> {
        match self.tree.get(key.as_bytes())? {
            Some(raw) => {
                let entry: SledEntry = serde_json::from_slice(&raw)?;
                let live = entry.live().then_some(entry);
                Ok((Some(raw), live))
            }
            None => Ok((None, None)),
        }
    }
}

impl KvStore for SledKv {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read(key)?.1.map(|e| e.value))
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let data = serde_json::to_vec(&SledEntry::new(value, ttl))?;
        self.tree.insert(key.as_bytes(), data)?;
        Ok(())
    }

    fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        self.compare_and_swap(key, None, value, ttl)
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let data = serde_json::to_vec(&SledEntry::new(value, ttl))?;
        loop {
            let (raw, live) = self.read(key)?;
            if live.as_ref().map(|e| e.value.as_str()) != expected {
                return Ok(false);
            }
            // Swap against the raw bytes so an expired entry can be replaced too.
            match self
                .tree
                .compare_and_swap(key.as_bytes(), raw, Some(data.as_slice()))?
            {
                Ok(()) => return Ok(true),
                Err(CompareAndSwapError { .. }) => continue,
            }
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.tree.remove(key.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(kv: &dyn KvStore) {
        assert!(kv.set_if_absent("lock", "a", None).unwrap());
        assert!(!kv.set_if_absent("lock", "b", None).unwrap());
        assert_eq!(kv.get("lock").unwrap().as_deref(), Some("a"));

        assert!(!kv.compare_and_swap("lock", Some("x"), "c", None).unwrap());
        assert!(kv.compare_and_swap("lock", Some("a"), "c", None).unwrap());
        assert_eq!(kv.get("lock").unwrap().as_deref(), Some("c"));

        kv.delete("lock").unwrap();
        assert!(kv.get("lock").unwrap().is_none());
    }

    #[test]
    fn memory_kv_conditional_writes() {
        exercise(&MemoryKv::new());
    }

    #[test]
    fn sled_kv_conditional_writes() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        exercise(&SledKv::new(&db).unwrap());
    }

    #[test]
    fn expired_entries_read_as_absent() {
        let kv = MemoryKv::new();
        kv.set("short", "1", Some(Duration::from_millis(1))).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(kv.get("short").unwrap().is_none());
        assert!(kv.set_if_absent("short", "2", None).unwrap());
    }

    #[test]
    fn json_helpers_roundtrip() {
        let kv = MemoryKv::new();
        kv.set_json("cursor", &(3u32, 17u64), None).unwrap();
        let cursor: Option<(u32, u64)> = kv.get_json("cursor").unwrap();
        assert_eq!(cursor, Some((3, 17)));
    }
}
