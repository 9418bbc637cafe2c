//! Resume points for the paged settlement passes.
//!
//! Stored in the shared KV store with the long checkpoint TTL, keyed by day
//! and step. A cursor is the id of the last user fully processed; the
//! dynamic pass also records the depth it is draining.

use crate::errors::Result;
use crate::report::Step;
use arbor_storage::{KvStore, KvStoreExt};
use arbor_types::{day_key, SettlementDay, UserId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub last_id: UserId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthCursor {
    pub depth: u32,
    pub last_id: UserId,
}

pub struct Checkpoints {
    kv: Arc<dyn KvStore>,
}

impl Checkpoints {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn key(day: SettlementDay, step: Step) -> String {
        format!("settlement:{}:cursor:{}", day_key(day), step)
    }

    pub fn load<T>(&self, day: SettlementDay, step: Step) -> Result<Option<T>>
    where
        T: for<'de> Deserialize<'de>,
    {
        Ok(self.kv.get_json(&Self::key(day, step))?)
    }

    pub fn save<T: Serialize>(
        &self,
        day: SettlementDay,
        step: Step,
        cursor: &T,
        ttl: Duration,
    ) -> Result<()> {
        self.kv.set_json(&Self::key(day, step), cursor, Some(ttl))?;
        Ok(())
    }

    pub fn clear(&self, day: SettlementDay) -> Result<()> {
        for step in Step::ALL {
            self.kv.delete(&Self::key(day, step))?;
        }
        Ok(())
    }
}
