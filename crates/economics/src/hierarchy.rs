//! Sponsor tree.
//!
//! Users register with an optional superior and are placed in the tree on
//! their first qualifying purchase. Placement writes the materialized path
//! (`superior.path + "." + id`) and depth once; nothing rewrites them, so the
//! tree only ever grows at the leaves and cannot contain a cycle.

use crate::errors::{EconomicsError, Result};
use arbor_storage::{LedgerBatch, LedgerStore};
use arbor_types::{
    child_path, Address, BalanceField, BalanceOp, User, UserType, MAX_LEVEL,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Clone)]
pub struct Hierarchy {
    store: Arc<dyn LedgerStore>,
}

impl Hierarchy {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Create the user row (no path yet) and a zeroed balance row.
    pub fn register(
        &self,
        address: Address,
        superior: Option<Address>,
        now: DateTime<Utc>,
    ) -> Result<User> {
        if self.store.get_user(&address)?.is_some() {
            return Err(EconomicsError::UserExists(address));
        }
        if let Some(superior) = superior {
            if self.store.get_user(&superior)?.is_none() {
                return Err(EconomicsError::UnknownSuperior(superior));
            }
        }

        let user = User::new(self.store.next_user_id()?, address, superior, now);
        if !self.store.insert_user(&user)? {
            return Err(EconomicsError::UserExists(address));
        }
        self.store.commit(
            &LedgerBatch::new().op(address, BalanceOp::credit(BalanceField::UsdtPoints, Decimal::ZERO)),
        )?;
        info!(target: "economics", %address, id = user.id, superior = ?superior, "Registered user");
        Ok(user)
    }

    /// Place `address` under its superior. Write-once: an already placed user
    /// is returned unchanged.
    pub fn place(&self, address: &Address) -> Result<User> {
        let mut user = self.user(address)?;
        if user.is_placed() {
            return Ok(user);
        }

        match user.superior {
            Some(superior_address) => {
                let superior = self
                    .store
                    .get_user(&superior_address)?
                    .ok_or(EconomicsError::UnknownSuperior(superior_address))?;
                let Some(parent_path) = superior.path.as_deref() else {
                    return Err(EconomicsError::SuperiorNotPlaced(superior_address));
                };
                user.path = Some(child_path(Some(parent_path), user.id));
                user.depth = superior.depth + 1;
                user.leader = if superior.user_type == UserType::Galaxy {
                    Some(superior.address)
                } else {
                    superior.leader
                };
            }
            None => {
                user.path = Some(child_path(None, user.id));
                user.depth = 0;
            }
        }

        self.store.put_user(&user)?;
        debug!(
            target: "economics",
            %address,
            path = user.path.as_deref().unwrap_or_default(),
            depth = user.depth,
            "Placed user"
        );
        Ok(user)
    }

    /// Existing leaders are not rewritten; they were resolved at placement.
    pub fn set_user_type(&self, address: &Address, user_type: UserType) -> Result<User> {
        let mut user = self.user(address)?;
        user.user_type = user_type;
        self.store.put_user(&user)?;
        Ok(user)
    }

    pub fn set_min_level(&self, address: &Address, min_level: u8) -> Result<User> {
        let mut user = self.user(address)?;
        user.min_level = min_level.min(MAX_LEVEL);
        user.level = user.level.max(user.min_level);
        self.store.put_user(&user)?;
        Ok(user)
    }

    pub fn user(&self, address: &Address) -> Result<User> {
        self.store
            .get_user(address)?
            .ok_or(EconomicsError::UnknownUser(*address))
    }

    /// Direct children, ordered by id.
    pub fn children(&self, address: &Address) -> Result<Vec<User>> {
        Ok(self.store.children_of(address)?)
    }

    /// Placed descendants of `user` sitting at the absolute `depth`.
    pub fn descendants_at_depth(&self, user: &User, depth: u32) -> Result<Vec<User>> {
        match user.descendant_prefix() {
            Some(prefix) if depth > user.depth => Ok(self.store.descendants(&prefix, Some(depth))?),
            _ => Ok(Vec::new()),
        }
    }

    /// Ancestors of `user`, nearest first.
    pub fn ancestors(&self, user: &User) -> Result<Vec<User>> {
        let ids = user
            .ancestor_ids()
            .map_err(|_| EconomicsError::CorruptPath(user.path.clone().unwrap_or_default()))?;
        let mut chain = Vec::with_capacity(ids.len());
        for id in ids {
            let ancestor = self
                .store
                .get_user_by_id(id)?
                .ok_or_else(|| EconomicsError::CorruptPath(user.path.clone().unwrap_or_default()))?;
            chain.push(ancestor);
        }
        Ok(chain)
    }

    /// Number of placed descendants at any depth.
    pub fn descendant_count(&self, address: &Address) -> Result<u64> {
        let user = self.user(address)?;
        match user.descendant_prefix() {
            Some(prefix) => Ok(self.store.descendants(&prefix, None)?.len() as u64),
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_storage::MemoryLedgerStore;

    fn addr(n: u8) -> Address {
        Address([n; 20])
    }

    fn hierarchy() -> Hierarchy {
        Hierarchy::new(Arc::new(MemoryLedgerStore::new()))
    }

    #[test]
    fn placement_builds_paths_from_the_superior() {
        let h = hierarchy();
        let now = Utc::now();
        let root = h.register(addr(1), None, now).unwrap();
        let child = h.register(addr(2), Some(root.address), now).unwrap();
        let grandchild = h.register(addr(3), Some(child.address), now).unwrap();

        let root = h.place(&root.address).unwrap();
        let child = h.place(&child.address).unwrap();
        let grandchild = h.place(&grandchild.address).unwrap();

        assert_eq!(root.path.as_deref(), Some("1"));
        assert_eq!(child.path, Some(format!("1.{}", child.id)));
        assert_eq!(grandchild.depth, 2);

        let chain: Vec<_> = h
            .ancestors(&grandchild)
            .unwrap()
            .into_iter()
            .map(|u| u.address)
            .collect();
        assert_eq!(chain, vec![addr(2), addr(1)]);
        assert_eq!(h.descendant_count(&addr(1)).unwrap(), 2);
        assert_eq!(h.descendants_at_depth(&root, 2).unwrap().len(), 1);
        assert!(h.store().get_balance(&addr(3)).unwrap().is_some());
    }

    #[test]
    fn placement_is_write_once() {
        let h = hierarchy();
        let now = Utc::now();
        h.register(addr(1), None, now).unwrap();
        h.register(addr(2), None, now).unwrap();
        let first = h.place(&addr(2)).unwrap();
        assert_eq!(h.place(&addr(2)).unwrap(), first);
    }

    #[test]
    fn registration_and_placement_errors() {
        let h = hierarchy();
        let now = Utc::now();
        assert!(matches!(
            h.register(addr(2), Some(addr(1)), now),
            Err(EconomicsError::UnknownSuperior(_))
        ));
        h.register(addr(1), None, now).unwrap();
        assert!(matches!(
            h.register(addr(1), None, now),
            Err(EconomicsError::UserExists(_))
        ));
        h.register(addr(2), Some(addr(1)), now).unwrap();
        assert!(matches!(
            h.place(&addr(2)),
            Err(EconomicsError::SuperiorNotPlaced(_))
        ));
    }

    #[test]
    fn leader_is_nearest_galaxy_ancestor() {
        let h = hierarchy();
        let now = Utc::now();
        h.register(addr(1), None, now).unwrap();
        h.register(addr(2), Some(addr(1)), now).unwrap();
        h.register(addr(3), Some(addr(2)), now).unwrap();
        h.place(&addr(1)).unwrap();
        h.set_user_type(&addr(1), UserType::Galaxy).unwrap();
        h.place(&addr(2)).unwrap();
        let grandchild = h.place(&addr(3)).unwrap();
        assert_eq!(grandchild.leader, Some(addr(1)));
    }
}
