//! In-memory ledger backend for tests and single-process runs.

use crate::{FlowFilter, Guard, LedgerBatch, LedgerCommit, LedgerStore, Result, StorageError};
use arbor_types::{
    day_key, Address, Balance, FlowId, OnChainTransaction, PerformanceHistory, RewardFlow,
    SettlementDay, TxDirection, TxId, User, UserId,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Default)]
struct MemoryState {
    users: HashMap<Address, User>,
    user_ids: BTreeMap<UserId, Address>,
    balances: HashMap<Address, Balance>,
    flows: BTreeMap<FlowId, RewardFlow>,
    txs: BTreeMap<TxId, OnChainTransaction>,
    tx_hashes: HashMap<String, TxId>,
    history: BTreeMap<(String, Address), PerformanceHistory>,
    last_user_id: UserId,
    last_flow_id: FlowId,
    last_tx_id: TxId,
}

impl MemoryState {
    fn check_guard(&self, guard: &Guard) -> Result<()> {
        let ok = match guard {
            Guard::FlowStatus(id, status) => {
                self.flows.get(id).map(|f| f.status) == Some(*status)
            }
            Guard::TxStatus(id, allowed) => self
                .txs
                .get(id)
                .map_or(false, |tx| allowed.contains(&tx.status)),
            Guard::UnusedTxHash(hash) => !self.tx_hashes.contains_key(hash),
            Guard::NoOutboundInFlight(address, token) => !self.txs.values().any(|tx| {
                tx.direction == TxDirection::Out
                    && tx.user_address == *address
                    && tx.token_type == *token
                    && tx.status.is_in_flight()
            }),
        };
        if ok {
            Ok(())
        } else {
            Err(StorageError::GuardFailed(guard.clone()))
        }
    }

    fn user_at(&self, id: &UserId) -> Option<User> {
        self.user_ids
            .get(id)
            .and_then(|address| self.users.get(address))
            .cloned()
    }
}

/// In-memory testing backend
#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    state: RwLock<MemoryState>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn next_user_id(&self) -> Result<UserId> {
        let mut state = self.state.write();
        state.last_user_id += 1;
        Ok(state.last_user_id)
    }

    fn put_user(&self, user: &User) -> Result<()> {
        let mut state = self.state.write();
        state.user_ids.insert(user.id, user.address);
        state.users.insert(user.address, user.clone());
        Ok(())
    }

    fn insert_user(&self, user: &User) -> Result<bool> {
        let mut state = self.state.write();
        if state.users.contains_key(&user.address) {
            return Ok(false);
        }
        state.user_ids.insert(user.id, user.address);
        state.users.insert(user.address, user.clone());
        Ok(true)
    }

    fn get_user(&self, address: &Address) -> Result<Option<User>> {
        Ok(self.state.read().users.get(address).cloned())
    }

    fn get_user_by_id(&self, id: UserId) -> Result<Option<User>> {
        Ok(self.state.read().user_at(&id))
    }

    fn children_of(&self, superior: &Address) -> Result<Vec<User>> {
        let state = self.state.read();
        Ok(state
            .user_ids
            .keys()
            .filter_map(|id| state.user_at(id))
            .filter(|u| u.superior.as_ref() == Some(superior))
            .collect())
    }

    fn users_page(&self, after: UserId, limit: usize) -> Result<Vec<User>> {
        let state = self.state.read();
        Ok(state
            .user_ids
            .range(after.saturating_add(1)..)
            .filter_map(|(id, _)| state.user_at(id))
            .take(limit)
            .collect())
    }

    fn users_at_depth(&self, depth: u32, after: UserId, limit: usize) -> Result<Vec<User>> {
        let state = self.state.read();
        Ok(state
            .user_ids
            .range(after.saturating_add(1)..)
            .filter_map(|(id, _)| state.user_at(id))
            .filter(|u| u.is_placed() && u.depth == depth)
            .take(limit)
            .collect())
    }

    fn descendants(&self, path_prefix: &str, depth: Option<u32>) -> Result<Vec<User>> {
        let state = self.state.read();
        Ok(state
            .user_ids
            .keys()
            .filter_map(|id| state.user_at(id))
            .filter(|u| {
                u.path
                    .as_deref()
                    .map_or(false, |p| p.starts_with(path_prefix))
                    && depth.map_or(true, |d| u.depth == d)
            })
            .collect())
    }

    fn max_depth(&self) -> Result<Option<u32>> {
        Ok(self
            .state
            .read()
            .users
            .values()
            .filter(|u| u.is_placed())
            .map(|u| u.depth)
            .max())
    }

    fn get_balance(&self, address: &Address) -> Result<Option<Balance>> {
        Ok(self.state.read().balances.get(address).cloned())
    }

    fn commit(&self, batch: &LedgerBatch) -> Result<LedgerCommit> {
        let mut state = self.state.write();
        for guard in &batch.guards {
            state.check_guard(guard)?;
        }

        // Validate every op on working copies before touching state.
        let mut touched: Vec<Balance> = Vec::new();
        let mut applied = Vec::with_capacity(batch.ops.len());
        for (address, op) in &batch.ops {
            let index = match touched.iter().position(|b| &b.address == address) {
                Some(index) => index,
                None => {
                    let row = state
                        .balances
                        .get(address)
                        .cloned()
                        .unwrap_or_else(|| Balance::new(*address));
                    touched.push(row);
                    touched.len() - 1
                }
            };
            applied.push(touched[index].apply(op)?);
        }

        for balance in &touched {
            state.balances.insert(balance.address, balance.clone());
        }

        let mut flow_ids = Vec::with_capacity(batch.flows.len());
        for flow in &batch.flows {
            let mut flow = flow.clone();
            if flow.id == 0 {
                state.last_flow_id += 1;
                flow.id = state.last_flow_id;
            }
            flow_ids.push(flow.id);
            state.flows.insert(flow.id, flow);
        }

        let mut tx_ids = Vec::with_capacity(batch.transactions.len());
        for tx in &batch.transactions {
            let mut tx = tx.clone();
            if tx.id == 0 {
                state.last_tx_id += 1;
                tx.id = state.last_tx_id;
            }
            if let Some(hash) = &tx.tx_hash {
                state.tx_hashes.insert(hash.clone(), tx.id);
            }
            tx_ids.push(tx.id);
            state.txs.insert(tx.id, tx);
        }

        Ok(LedgerCommit {
            applied,
            balances: touched,
            flow_ids,
            tx_ids,
        })
    }

    fn get_flow(&self, id: FlowId) -> Result<Option<RewardFlow>> {
        Ok(self.state.read().flows.get(&id).cloned())
    }

    fn flows_for(
        &self,
        address: &Address,
        filter: &FlowFilter,
        after: FlowId,
        limit: usize,
    ) -> Result<Vec<RewardFlow>> {
        Ok(self
            .state
            .read()
            .flows
            .range(after.saturating_add(1)..)
            .map(|(_, f)| f)
            .filter(|f| &f.user_address == address && filter.matches(f))
            .take(limit)
            .cloned()
            .collect())
    }

    fn flows_page(&self, after: FlowId, limit: usize) -> Result<Vec<RewardFlow>> {
        Ok(self
            .state
            .read()
            .flows
            .range(after.saturating_add(1)..)
            .take(limit)
            .map(|(_, f)| f.clone())
            .collect())
    }

    fn get_transaction(&self, id: TxId) -> Result<Option<OnChainTransaction>> {
        Ok(self.state.read().txs.get(&id).cloned())
    }

    fn find_transaction_by_hash(&self, hash: &str) -> Result<Option<OnChainTransaction>> {
        let state = self.state.read();
        Ok(state
            .tx_hashes
            .get(hash)
            .and_then(|id| state.txs.get(id))
            .cloned())
    }

    fn transactions_for(&self, address: &Address) -> Result<Vec<OnChainTransaction>> {
        Ok(self
            .state
            .read()
            .txs
            .values()
            .filter(|tx| &tx.user_address == address)
            .cloned()
            .collect())
    }

    fn transactions_updated_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<OnChainTransaction>> {
        Ok(self
            .state
            .read()
            .txs
            .values()
            .filter(|tx| tx.updated_at >= from && tx.updated_at < to)
            .cloned()
            .collect())
    }

    fn put_history(&self, row: &PerformanceHistory) -> Result<()> {
        self.state
            .write()
            .history
            .insert((day_key(row.day), row.address), row.clone());
        Ok(())
    }

    fn get_history(
        &self,
        address: &Address,
        day: SettlementDay,
    ) -> Result<Option<PerformanceHistory>> {
        Ok(self
            .state
            .read()
            .history
            .get(&(day_key(day), *address))
            .cloned())
    }

    fn purge_history_before(&self, day: SettlementDay) -> Result<u64> {
        let cutoff = day_key(day);
        let mut state = self.state.write();
        let before = state.history.len();
        state.history.retain(|(key, _), _| *key >= cutoff);
        Ok((before - state.history.len()) as u64)
    }
}
