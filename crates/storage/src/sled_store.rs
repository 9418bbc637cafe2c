//! Sled-backed ledger storage.
//!
//! Each record class lives in its own tree; secondary indexes are plain
//! trees whose keys are the index columns followed by the big-endian id, so
//! prefix and range scans return rows in primary-key order.

use crate::{FlowFilter, Guard, LedgerBatch, LedgerCommit, LedgerStore, Result, StorageError};
use arbor_types::{
    day_key, Address, Balance, FlowId, OnChainTransaction, PerformanceHistory, RewardFlow,
    SettlementDay, TokenType, TxDirection, TxId, User, UserId, ADDRESS_BYTES,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use sled::{Db, IVec, Transactional, Tree};
use std::path::Path;
use tracing::info;

type TxResult<T> = std::result::Result<T, ConflictableTransactionError<StorageError>>;

fn abort(err: impl Into<StorageError>) -> ConflictableTransactionError<StorageError> {
    ConflictableTransactionError::Abort(err.into())
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

fn address_from(bytes: &[u8]) -> Result<Address> {
    let raw: [u8; ADDRESS_BYTES] = bytes
        .try_into()
        .map_err(|_| StorageError::Corrupt(format!("address of {} bytes", bytes.len())))?;
    Ok(Address(raw))
}

fn id_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

fn composite(prefix: &[u8], id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 8);
    key.extend_from_slice(prefix);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

/// Key of the set of in-flight outbound transaction ids for one address and token.
fn inflight_key(address: &Address, token: TokenType) -> Vec<u8> {
    let mut key = address.0.to_vec();
    key.push(match token {
        TokenType::Usdt => 0,
        TokenType::Token => 1,
    });
    key
}

fn history_key(day: SettlementDay, address: &Address) -> Vec<u8> {
    let mut key = day_key(day).into_bytes();
    key.extend_from_slice(&address.0);
    key
}

/// Sled-backed implementation
pub struct SledLedgerStore {
    db: Db,
    users: Tree,
    user_ids: Tree,
    children: Tree,
    depth_index: Tree,
    paths: Tree,
    balances: Tree,
    flows: Tree,
    flows_by_user: Tree,
    txs: Tree,
    tx_hashes: Tree,
    outbound_inflight: Tree,
    history: Tree,
}

impl SledLedgerStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Share an already opened database (e.g. with a [`crate::SledKv`]).
    pub fn from_db(db: Db) -> Result<Self> {
        let store = Self {
            users: db.open_tree("users")?,
            user_ids: db.open_tree("user_ids")?,
            children: db.open_tree("children")?,
            depth_index: db.open_tree("depth_index")?,
            paths: db.open_tree("paths")?,
            balances: db.open_tree("balances")?,
            flows: db.open_tree("flows")?,
            flows_by_user: db.open_tree("flows_by_user")?,
            txs: db.open_tree("transactions")?,
            tx_hashes: db.open_tree("tx_hashes")?,
            outbound_inflight: db.open_tree("outbound_inflight")?,
            history: db.open_tree("performance_history")?,
            db,
        };
        info!(target: "storage", users = store.users.len(), "Opened sled ledger store");
        Ok(store)
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn fresh_id(&self) -> Result<u64> {
        Ok(self.db.generate_id()? + 1)
    }

    fn load_users(&self, addresses: impl Iterator<Item = Result<IVec>>) -> Result<Vec<User>> {
        let mut users = Vec::new();
        for address in addresses {
            let address = address?;
            if let Some(raw) = self.users.get(&address)? {
                users.push(decode(&raw)?);
            }
        }
        Ok(users)
    }

    fn write_user(&self, user: &User, only_if_absent: bool) -> Result<bool> {
        let data = serde_json::to_vec(user)?;
        (
            &self.users,
            &self.user_ids,
            &self.children,
            &self.depth_index,
            &self.paths,
        )
            .transaction(|(users, user_ids, children, depth_index, paths)| {
                let address = &user.address.0[..];
                if only_if_absent && users.get(address)?.is_some() {
                    return Ok(false);
                }
                users.insert(address, data.as_slice())?;
                user_ids.insert(&id_key(user.id)[..], address)?;
                if let Some(superior) = &user.superior {
                    children.insert(composite(&superior.0, user.id), address)?;
                }
                // Path and depth are write-once, so these entries never go stale.
                if let Some(path) = &user.path {
                    depth_index.insert(composite(&user.depth.to_be_bytes(), user.id), address)?;
                    paths.insert(path.as_bytes(), address)?;
                }
                Ok(true)
            })
            .map_err(|e: TransactionError<StorageError>| match e {
                TransactionError::Abort(e) => e,
                TransactionError::Storage(e) => StorageError::Database(e),
            })
    }

    fn check_guard(
        guard: &Guard,
        flows: &TransactionalTree,
        txs: &TransactionalTree,
        tx_hashes: &TransactionalTree,
        inflight: &TransactionalTree,
    ) -> TxResult<()> {
        let ok = match guard {
            Guard::FlowStatus(id, status) => match flows.get(id_key(*id))? {
                Some(raw) => decode::<RewardFlow>(&raw).map_err(abort)?.status == *status,
                None => false,
            },
            Guard::TxStatus(id, allowed) => match txs.get(id_key(*id))? {
                Some(raw) => {
                    let tx: OnChainTransaction = decode(&raw).map_err(abort)?;
                    allowed.contains(&tx.status)
                }
                None => false,
            },
            Guard::UnusedTxHash(hash) => tx_hashes.get(hash.as_bytes())?.is_none(),
            Guard::NoOutboundInFlight(address, token) => {
                inflight.get(inflight_key(address, *token))?.is_none()
            }
        };
        if ok {
            Ok(())
        } else {
            Err(abort(StorageError::GuardFailed(guard.clone())))
        }
    }
}

impl LedgerStore for SledLedgerStore {
    fn next_user_id(&self) -> Result<UserId> {
        self.fresh_id()
    }

    fn put_user(&self, user: &User) -> Result<()> {
        self.write_user(user, false).map(|_| ())
    }

    fn insert_user(&self, user: &User) -> Result<bool> {
        self.write_user(user, true)
    }

    fn get_user(&self, address: &Address) -> Result<Option<User>> {
        self.users
            .get(&address.0[..])?
            .map(|v| decode(&v))
            .transpose()
    }

    fn get_user_by_id(&self, id: UserId) -> Result<Option<User>> {
        match self.user_ids.get(id_key(id))? {
            Some(address) => self.get_user(&address_from(&address)?),
            None => Ok(None),
        }
    }

    fn children_of(&self, superior: &Address) -> Result<Vec<User>> {
        self.load_users(
            self.children
                .scan_prefix(&superior.0[..])
                .map(|r| r.map(|(_, v)| v).map_err(Into::into)),
        )
    }

    fn users_page(&self, after: UserId, limit: usize) -> Result<Vec<User>> {
        self.load_users(
            self.user_ids
                .range(id_key(after.saturating_add(1))..)
                .take(limit)
                .map(|r| r.map(|(_, v)| v).map_err(Into::into)),
        )
    }

    fn users_at_depth(&self, depth: u32, after: UserId, limit: usize) -> Result<Vec<User>> {
        let prefix = depth.to_be_bytes();
        self.load_users(
            self.depth_index
                .range(composite(&prefix, after.saturating_add(1))..)
                .take_while(|r| r.as_ref().map_or(true, |(k, _)| k.starts_with(&prefix)))
                .take(limit)
                .map(|r| r.map(|(_, v)| v).map_err(Into::into)),
        )
    }

    fn descendants(&self, path_prefix: &str, depth: Option<u32>) -> Result<Vec<User>> {
        let mut users = self.load_users(
            self.paths
                .scan_prefix(path_prefix.as_bytes())
                .map(|r| r.map(|(_, v)| v).map_err(Into::into)),
        )?;
        if let Some(depth) = depth {
            users.retain(|u| u.depth == depth);
        }
        users.sort_by_key(|u| u.id);
        Ok(users)
    }

    fn max_depth(&self) -> Result<Option<u32>> {
        match self.depth_index.last()? {
            Some((key, _)) => {
                let raw: [u8; 4] = key[..4]
                    .try_into()
                    .map_err(|_| StorageError::Corrupt("depth index key".into()))?;
                Ok(Some(u32::from_be_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    fn get_balance(&self, address: &Address) -> Result<Option<Balance>> {
        self.balances
            .get(&address.0[..])?
            .map(|v| decode(&v))
            .transpose()
    }

    fn commit(&self, batch: &LedgerBatch) -> Result<LedgerCommit> {
        // Ids are allocated up front so a retried transaction reuses them.
        let flow_ids = batch
            .flows
            .iter()
            .map(|f| if f.id == 0 { self.fresh_id() } else { Ok(f.id) })
            .collect::<Result<Vec<FlowId>>>()?;
        let tx_ids = batch
            .transactions
            .iter()
            .map(|t| if t.id == 0 { self.fresh_id() } else { Ok(t.id) })
            .collect::<Result<Vec<TxId>>>()?;

        (
            &self.balances,
            &self.flows,
            &self.flows_by_user,
            &self.txs,
            &self.tx_hashes,
            &self.outbound_inflight,
        )
            .transaction(|(balances, flows, flows_by_user, txs, tx_hashes, inflight)| {
                for guard in &batch.guards {
                    Self::check_guard(guard, flows, txs, tx_hashes, inflight)?;
                }

                let mut touched: Vec<Balance> = Vec::new();
                let mut applied = Vec::with_capacity(batch.ops.len());
                for (address, op) in &batch.ops {
                    let index = match touched.iter().position(|b| &b.address == address) {
                        Some(index) => index,
                        None => {
                            let row = match balances.get(&address.0[..])? {
                                Some(raw) => decode(&raw).map_err(abort)?,
                                None => Balance::new(*address),
                            };
                            touched.push(row);
                            touched.len() - 1
                        }
                    };
                    applied.push(touched[index].apply(op).map_err(abort)?);
                }
                for balance in &touched {
                    let data = serde_json::to_vec(balance).map_err(abort)?;
                    balances.insert(&balance.address.0[..], data)?;
                }

                for (flow, id) in batch.flows.iter().zip(&flow_ids) {
                    let mut flow = flow.clone();
                    flow.id = *id;
                    let data = serde_json::to_vec(&flow).map_err(abort)?;
                    flows.insert(&id_key(*id)[..], data)?;
                    flows_by_user.insert(composite(&flow.user_address.0, *id), &b""[..])?;
                }

                for (tx, id) in batch.transactions.iter().zip(&tx_ids) {
                    let mut tx = tx.clone();
                    tx.id = *id;
                    let data = serde_json::to_vec(&tx).map_err(abort)?;
                    txs.insert(&id_key(*id)[..], data)?;
                    if let Some(hash) = &tx.tx_hash {
                        tx_hashes.insert(hash.as_bytes(), &id_key(*id)[..])?;
                    }
                    if tx.direction == TxDirection::Out {
                        let key = inflight_key(&tx.user_address, tx.token_type);
                        let mut ids: Vec<TxId> = match inflight.get(&key)? {
                            Some(raw) => decode(&raw).map_err(abort)?,
                            None => Vec::new(),
                        };
                        ids.retain(|other| other != id);
                        if tx.status.is_in_flight() {
                            ids.push(*id);
                        }
                        if ids.is_empty() {
                            inflight.remove(key)?;
                        } else {
                            inflight.insert(key, serde_json::to_vec(&ids).map_err(abort)?)?;
                        }
                    }
                }

                Ok(LedgerCommit {
                    applied,
                    balances: touched,
                    flow_ids: flow_ids.clone(),
                    tx_ids: tx_ids.clone(),
                })
            })
            .map_err(|e: TransactionError<StorageError>| match e {
                TransactionError::Abort(e) => e,
                TransactionError::Storage(e) => StorageError::Database(e),
            })
    }

    fn get_flow(&self, id: FlowId) -> Result<Option<RewardFlow>> {
        self.flows.get(id_key(id))?.map(|v| decode(&v)).transpose()
    }

    fn flows_for(
        &self,
        address: &Address,
        filter: &FlowFilter,
        after: FlowId,
        limit: usize,
    ) -> Result<Vec<RewardFlow>> {
        let prefix = &address.0[..];
        let mut out = Vec::new();
        for entry in self
            .flows_by_user
            .range(composite(prefix, after.saturating_add(1))..)
        {
            let (key, _) = entry?;
            if !key.starts_with(prefix) || out.len() >= limit {
                break;
            }
            if let Some(raw) = self.flows.get(&key[prefix.len()..])? {
                let flow: RewardFlow = decode(&raw)?;
                if filter.matches(&flow) {
                    out.push(flow);
                }
            }
        }
        Ok(out)
    }

    fn flows_page(&self, after: FlowId, limit: usize) -> Result<Vec<RewardFlow>> {
        self.flows
            .range(id_key(after.saturating_add(1))..)
            .take(limit)
            .map(|r| {
                let (_, v) = r?;
                decode(&v)
            })
            .collect()
    }

    fn get_transaction(&self, id: TxId) -> Result<Option<OnChainTransaction>> {
        self.txs.get(id_key(id))?.map(|v| decode(&v)).transpose()
    }

    fn find_transaction_by_hash(&self, hash: &str) -> Result<Option<OnChainTransaction>> {
        match self.tx_hashes.get(hash.as_bytes())? {
            Some(raw) => {
                let id: [u8; 8] = raw
                    .as_ref()
                    .try_into()
                    .map_err(|_| StorageError::Corrupt("tx hash index".into()))?;
                self.get_transaction(u64::from_be_bytes(id))
            }
            None => Ok(None),
        }
    }

    fn transactions_for(&self, address: &Address) -> Result<Vec<OnChainTransaction>> {
        let mut out = Vec::new();
        for entry in self.txs.iter() {
            let (_, v) = entry?;
            let tx: OnChainTransaction = decode(&v)?;
            if &tx.user_address == address {
                out.push(tx);
            }
        }
        Ok(out)
    }

    fn transactions_updated_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<OnChainTransaction>> {
        let mut out = Vec::new();
        for entry in self.txs.iter() {
            let (_, v) = entry?;
            let tx: OnChainTransaction = decode(&v)?;
            if tx.updated_at >= from && tx.updated_at < to {
                out.push(tx);
            }
        }
        Ok(out)
    }

    fn put_history(&self, row: &PerformanceHistory) -> Result<()> {
        self.history
            .insert(history_key(row.day, &row.address), serde_json::to_vec(row)?)?;
        Ok(())
    }

    fn get_history(
        &self,
        address: &Address,
        day: SettlementDay,
    ) -> Result<Option<PerformanceHistory>> {
        self.history
            .get(history_key(day, address))?
            .map(|v| decode(&v))
            .transpose()
    }

    fn purge_history_before(&self, day: SettlementDay) -> Result<u64> {
        let cutoff = day_key(day).into_bytes();
        let mut removed = 0;
        for entry in self.history.range(..cutoff) {
            let (key, _) = entry?;
            self.history.remove(key)?;
            removed += 1;
        }
        Ok(removed)
    }
}
