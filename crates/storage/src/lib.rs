//! Arbor persistence
//!
//! Two storage abstractions, each with a sled-backed and an in-memory
//! implementation:
//! - [`LedgerStore`]: users and their tree indexes, balance rows, the flow
//!   log, on-chain transactions and performance history. Balance changes go
//!   through [`LedgerStore::commit`], one atomic read-modify-write per batch.
//! - [`KvStore`]: the shared cache (TTL entries, conditional set and
//!   compare-and-swap) backing memoisation, locks, flags and checkpoints.

use arbor_types::{
    Address, Amount, Balance, BalanceError, BalanceOp, FlowId, FlowKind, FlowStatus,
    OnChainTransaction, PerformanceHistory, RewardFlow, SettlementDay, TokenType, TxId, TxStatus,
    User, UserId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod kv;
pub mod memory;
pub mod retention;
pub mod sled_store;

pub use kv::{KvStore, KvStoreExt, MemoryKv, SledKv};
pub use memory::MemoryLedgerStore;
pub use retention::{HistoryRetention, PruneReport};
pub use sled_store::SledLedgerStore;

/// Storage errors
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Balance rejected: {0}")]
    Balance(#[from] BalanceError),
    #[error("Commit guard failed: {0:?}")]
    GuardFailed(Guard),
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Precondition checked inside the same transaction as a [`LedgerBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guard {
    /// The flow row must currently have this status.
    FlowStatus(FlowId, FlowStatus),
    /// The transaction row must currently have one of these statuses.
    TxStatus(TxId, Vec<TxStatus>),
    /// No transaction has been recorded with this chain hash.
    UnusedTxHash(String),
    /// No outbound transaction for this address and token is AUDITING/PENDING.
    NoOutboundInFlight(Address, TokenType),
}

/// Everything written by one atomic ledger change.
///
/// Ops are applied in order against the current balance rows (missing rows
/// start at zero). Flows and transactions with id 0 are inserted and get a
/// fresh id; others overwrite the stored row.
#[derive(Debug, Clone, Default)]
pub struct LedgerBatch {
    pub guards: Vec<Guard>,
    pub ops: Vec<(Address, BalanceOp)>,
    pub flows: Vec<RewardFlow>,
    pub transactions: Vec<OnChainTransaction>,
}

impl LedgerBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guard(mut self, guard: Guard) -> Self {
        self.guards.push(guard);
        self
    }

    pub fn op(mut self, address: Address, op: BalanceOp) -> Self {
        self.ops.push((address, op));
        self
    }

    pub fn flow(mut self, flow: RewardFlow) -> Self {
        self.flows.push(flow);
        self
    }

    pub fn transaction(mut self, tx: OnChainTransaction) -> Self {
        self.transactions.push(tx);
        self
    }
}

/// Outcome of a committed [`LedgerBatch`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerCommit {
    /// Amount moved by each op, in batch order.
    pub applied: Vec<Amount>,
    /// Balance rows after the commit, one per touched address.
    pub balances: Vec<Balance>,
    /// Ids of the batch's flows, in batch order.
    pub flow_ids: Vec<FlowId>,
    /// Ids of the batch's transactions, in batch order.
    pub tx_ids: Vec<TxId>,
}

impl LedgerCommit {
    pub fn balance_of(&self, address: &Address) -> Option<&Balance> {
        self.balances.iter().find(|b| &b.address == address)
    }
}

/// Selects rows of one user's flow log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowFilter {
    pub status: Option<FlowStatus>,
    /// Empty means any kind.
    pub kinds: Vec<FlowKind>,
    pub token_type: Option<TokenType>,
}

impl FlowFilter {
    pub fn matches(&self, flow: &RewardFlow) -> bool {
        self.status.map_or(true, |s| s == flow.status)
            && (self.kinds.is_empty() || self.kinds.contains(&flow.kind))
            && self.token_type.map_or(true, |t| t == flow.token_type)
    }
}

/// Abstract ledger storage
pub trait LedgerStore: Send + Sync {
    // Users and tree indexes
    fn next_user_id(&self) -> Result<UserId>;
    /// Insert or update a user, maintaining the id, superior, depth and path indexes.
    fn put_user(&self, user: &User) -> Result<()>;
    /// Like [`put_user`](Self::put_user) but only when the address is not
    /// registered yet, checked in the same transaction. Returns `false` and
    /// writes nothing otherwise.
    fn insert_user(&self, user: &User) -> Result<bool>;
    fn get_user(&self, address: &Address) -> Result<Option<User>>;
    fn get_user_by_id(&self, id: UserId) -> Result<Option<User>>;
    /// Direct children by superior, ordered by id.
    fn children_of(&self, superior: &Address) -> Result<Vec<User>>;
    /// Users with `id > after`, ordered by id.
    fn users_page(&self, after: UserId, limit: usize) -> Result<Vec<User>>;
    /// Placed users at `depth` with `id > after`, ordered by id.
    fn users_at_depth(&self, depth: u32, after: UserId, limit: usize) -> Result<Vec<User>>;
    /// Placed users whose path starts with `path_prefix`, optionally at one exact depth.
    fn descendants(&self, path_prefix: &str, depth: Option<u32>) -> Result<Vec<User>>;
    /// Deepest depth of any placed user.
    fn max_depth(&self) -> Result<Option<u32>>;

    // Balances
    fn get_balance(&self, address: &Address) -> Result<Option<Balance>>;
    fn commit(&self, batch: &LedgerBatch) -> Result<LedgerCommit>;

    // Flow log
    fn get_flow(&self, id: FlowId) -> Result<Option<RewardFlow>>;
    /// Flows of one user matching `filter` with `id > after`, oldest first.
    fn flows_for(
        &self,
        address: &Address,
        filter: &FlowFilter,
        after: FlowId,
        limit: usize,
    ) -> Result<Vec<RewardFlow>>;
    /// All flows with `id > after`, oldest first.
    fn flows_page(&self, after: FlowId, limit: usize) -> Result<Vec<RewardFlow>>;

    // On-chain transactions
    fn get_transaction(&self, id: TxId) -> Result<Option<OnChainTransaction>>;
    fn find_transaction_by_hash(&self, hash: &str) -> Result<Option<OnChainTransaction>>;
    fn transactions_for(&self, address: &Address) -> Result<Vec<OnChainTransaction>>;
    /// Transactions last updated within `[from, to)`.
    fn transactions_updated_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<OnChainTransaction>>;

    // Performance history
    fn put_history(&self, row: &PerformanceHistory) -> Result<()>;
    fn get_history(&self, address: &Address, day: SettlementDay)
        -> Result<Option<PerformanceHistory>>;
    /// Delete every row dated strictly before `day`; returns the number removed.
    fn purge_history_before(&self, day: SettlementDay) -> Result<u64>;
}
