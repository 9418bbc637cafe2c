//! Performance aggregation, level resolution and cache behaviour over a
//! real ledger store.

use arbor_economics::{
    keys, ConfigStore, EconomicsError, Hierarchy, LevelResolver, MapConfigProvider,
    PerformanceCache,
};
use arbor_storage::{
    FlowFilter, KvStore, LedgerBatch, LedgerCommit, LedgerStore, MemoryKv, MemoryLedgerStore,
    StorageError,
};
use arbor_types::{
    Address, Balance, BalanceField, BalanceOp, FlowId, OnChainTransaction, PerformanceHistory,
    RewardFlow, SettlementDay, TxId, User, UserId,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

type StoreResult<T> = std::result::Result<T, StorageError>;

fn addr(n: u8) -> Address {
    Address([n; 20])
}

struct Fixture {
    hierarchy: Hierarchy,
    kv: Arc<MemoryKv>,
    levels: LevelResolver,
}

impl Fixture {
    fn new(pairs: &[(&str, &str)]) -> Self {
        Self::with_store(Arc::new(MemoryLedgerStore::new()), pairs)
    }

    fn with_store(store: Arc<dyn LedgerStore>, pairs: &[(&str, &str)]) -> Self {
        let provider = Arc::new(MapConfigProvider::from_pairs(pairs.iter().copied()));
        let config = Arc::new(ConfigStore::new(provider));
        let hierarchy = Hierarchy::new(store);
        let kv = Arc::new(MemoryKv::new());
        let performance = Arc::new(PerformanceCache::new(
            hierarchy.clone(),
            kv.clone(),
            config.clone(),
        ));
        let levels = LevelResolver::new(performance, kv.clone(), config);
        Self {
            hierarchy,
            kv,
            levels,
        }
    }

    fn performance(&self) -> &PerformanceCache {
        self.levels.performance()
    }

    /// Register and place `n` under `parent` with an active stake.
    fn join(&self, n: u8, parent: Option<u8>, stake: Decimal) -> Address {
        let address = addr(n);
        self.hierarchy
            .register(address, parent.map(addr), Utc::now())
            .unwrap();
        self.hierarchy.place(&address).unwrap();
        if stake > Decimal::ZERO {
            self.hierarchy
                .store()
                .commit(
                    &LedgerBatch::new()
                        .op(address, BalanceOp::credit(BalanceField::TokenStakedPoints, stake))
                        .op(address, BalanceOp::credit(BalanceField::StakeRewardCap, stake * dec!(2))),
                )
                .unwrap();
        }
        address
    }

    fn exhaust_cap(&self, address: Address) {
        let cap = self
            .hierarchy
            .store()
            .get_balance(&address)
            .unwrap()
            .unwrap()
            .stake_reward_cap;
        self.hierarchy
            .store()
            .commit(&LedgerBatch::new().op(address, BalanceOp::debit(BalanceField::StakeRewardCap, cap)))
            .unwrap();
    }
}

#[test]
fn aggregates_active_descendant_stake() {
    let f = Fixture::new(&[]);
    let r = f.join(1, None, dec!(1000));
    let a = f.join(2, Some(1), dec!(10));
    let b = f.join(3, Some(1), dec!(20));
    let c = f.join(4, Some(3), dec!(5));

    assert_eq!(f.performance().total_performance(&r).unwrap(), dec!(35));
    assert_eq!(f.performance().total_performance(&b).unwrap(), dec!(5));
    assert_eq!(f.performance().total_performance(&a).unwrap(), dec!(0));
    assert_eq!(f.performance().non_mining_performance(&c).unwrap(), dec!(0));
}

#[test]
fn exhausted_users_stop_counting_after_invalidation() {
    let f = Fixture::new(&[]);
    let r = f.join(1, None, dec!(0));
    f.join(2, Some(1), dec!(10));
    let b = f.join(3, Some(1), dec!(20));
    assert_eq!(f.performance().total_performance(&r).unwrap(), dec!(30));

    f.exhaust_cap(b);
    // Still served from cache until the chain is invalidated.
    assert_eq!(f.performance().total_performance(&r).unwrap(), dec!(30));
    f.levels.invalidate(&b).unwrap();
    assert_eq!(f.performance().total_performance(&r).unwrap(), dec!(10));
}

#[test]
fn partial_performance_excludes_the_largest_leg() {
    let f = Fixture::new(&[(keys::LEVEL_THRESHOLDS, "100,500")]);
    let r = f.join(1, None, dec!(0));
    f.join(2, Some(1), dec!(1000));
    f.join(3, Some(1), dec!(60));
    f.join(4, Some(1), dec!(40));

    let user = f.hierarchy.user(&r).unwrap();
    let standing = f.levels.standing(&user).unwrap();
    assert_eq!(standing.total_performance, dec!(1100));
    assert_eq!(standing.partial_performance, dec!(100));
    assert_eq!(standing.level, 1);

    let (user, _) = f.levels.rerank(&r).unwrap();
    assert_eq!(user.level, 1);
    assert_eq!(f.hierarchy.user(&r).unwrap().level, 1);
}

#[test]
fn min_level_is_a_floor() {
    let f = Fixture::new(&[(keys::LEVEL_THRESHOLDS, "100,500")]);
    let r = f.join(1, None, dec!(0));
    f.hierarchy.set_min_level(&r, 2).unwrap();
    assert_eq!(f.levels.level(&r).unwrap(), 2);
}

#[test]
fn invalidation_reranks_every_ancestor() {
    let f = Fixture::new(&[(keys::LEVEL_THRESHOLDS, "10")]);
    let r = f.join(1, None, dec!(0));
    let a = f.join(2, Some(1), dec!(0));
    f.join(3, Some(2), dec!(0));
    f.join(4, Some(2), dec!(0));
    f.join(5, Some(1), dec!(50));
    assert_eq!(f.levels.level(&r).unwrap(), 0);

    // Stake arrives deep in the tree.
    f.hierarchy
        .store()
        .commit(
            &LedgerBatch::new()
                .op(addr(3), BalanceOp::credit(BalanceField::TokenStakedPoints, dec!(20)))
                .op(addr(3), BalanceOp::credit(BalanceField::StakeRewardCap, dec!(40)))
                .op(addr(4), BalanceOp::credit(BalanceField::TokenStakedPoints, dec!(20)))
                .op(addr(4), BalanceOp::credit(BalanceField::StakeRewardCap, dec!(40))),
        )
        .unwrap();
    f.levels.invalidate(&addr(3)).unwrap();

    assert_eq!(f.hierarchy.user(&a).unwrap().level, 1);
    assert_eq!(f.hierarchy.user(&r).unwrap().level, 1);
    assert_eq!(f.performance().total_performance(&r).unwrap(), dec!(90));
}

#[test]
fn held_lock_times_out_with_an_error() {
    let f = Fixture::new(&[
        (keys::BACKOFF_BASE_MS, "1"),
        (keys::BACKOFF_MAX_MS, "2"),
        (keys::BACKOFF_MAX_ATTEMPTS, "3"),
    ]);
    let r = f.join(1, None, dec!(0));
    f.kv
        .set(&format!("perf:lock:{r}"), "computing", None)
        .unwrap();
    let err = f.performance().total_performance(&r).unwrap_err();
    assert!(matches!(
        err,
        EconomicsError::PerformanceComputeTimeout { attempts: 3, .. }
    ));
}

/// Ledger store whose child lookups are slow, widening the race window.
struct SlowStore {
    inner: MemoryLedgerStore,
    delay: Duration,
}

impl LedgerStore for SlowStore {
    fn next_user_id(&self) -> StoreResult<UserId> {
        self.inner.next_user_id()
    }
    fn put_user(&self, user: &User) -> StoreResult<()> {
        self.inner.put_user(user)
    }
    fn insert_user(&self, user: &User) -> StoreResult<bool> {
        self.inner.insert_user(user)
    }
    fn get_user(&self, address: &Address) -> StoreResult<Option<User>> {
        self.inner.get_user(address)
    }
    fn get_user_by_id(&self, id: UserId) -> StoreResult<Option<User>> {
        self.inner.get_user_by_id(id)
    }
    fn children_of(&self, superior: &Address) -> StoreResult<Vec<User>> {
        thread::sleep(self.delay);
        self.inner.children_of(superior)
    }
    fn users_page(&self, after: UserId, limit: usize) -> StoreResult<Vec<User>> {
        self.inner.users_page(after, limit)
    }
    fn users_at_depth(&self, depth: u32, after: UserId, limit: usize) -> StoreResult<Vec<User>> {
        self.inner.users_at_depth(depth, after, limit)
    }
    fn descendants(&self, path_prefix: &str, depth: Option<u32>) -> StoreResult<Vec<User>> {
        self.inner.descendants(path_prefix, depth)
    }
    fn max_depth(&self) -> StoreResult<Option<u32>> {
        self.inner.max_depth()
    }
    fn get_balance(&self, address: &Address) -> StoreResult<Option<Balance>> {
        self.inner.get_balance(address)
    }
    fn commit(&self, batch: &LedgerBatch) -> StoreResult<LedgerCommit> {
        self.inner.commit(batch)
    }
    fn get_flow(&self, id: FlowId) -> StoreResult<Option<RewardFlow>> {
        self.inner.get_flow(id)
    }
    fn flows_for(
        &self,
        address: &Address,
        filter: &FlowFilter,
        after: FlowId,
        limit: usize,
    ) -> StoreResult<Vec<RewardFlow>> {
        self.inner.flows_for(address, filter, after, limit)
    }
    fn flows_page(&self, after: FlowId, limit: usize) -> StoreResult<Vec<RewardFlow>> {
        self.inner.flows_page(after, limit)
    }
    fn get_transaction(&self, id: TxId) -> StoreResult<Option<OnChainTransaction>> {
        self.inner.get_transaction(id)
    }
    fn find_transaction_by_hash(&self, hash: &str) -> StoreResult<Option<OnChainTransaction>> {
        self.inner.find_transaction_by_hash(hash)
    }
    fn transactions_for(&self, address: &Address) -> StoreResult<Vec<OnChainTransaction>> {
        self.inner.transactions_for(address)
    }
    fn transactions_updated_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<OnChainTransaction>> {
        self.inner.transactions_updated_between(from, to)
    }
    fn put_history(&self, row: &PerformanceHistory) -> StoreResult<()> {
        self.inner.put_history(row)
    }
    fn get_history(
        &self,
        address: &Address,
        day: SettlementDay,
    ) -> StoreResult<Option<PerformanceHistory>> {
        self.inner.get_history(address, day)
    }
    fn purge_history_before(&self, day: SettlementDay) -> StoreResult<u64> {
        self.inner.purge_history_before(day)
    }
}

#[test]
fn concurrent_cold_reads_compute_once() {
    let store = Arc::new(SlowStore {
        inner: MemoryLedgerStore::new(),
        delay: Duration::from_millis(30),
    });
    let f = Arc::new(Fixture::with_store(
        store,
        &[(keys::BACKOFF_BASE_MS, "5"), (keys::BACKOFF_MAX_MS, "20")],
    ));
    let x = f.join(1, None, dec!(0));
    f.join(2, Some(1), dec!(7));
    f.join(3, Some(1), dec!(8));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let f = f.clone();
            thread::spawn(move || f.performance().total_performance(&x).unwrap())
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), dec!(15));
    }
    // One pass over X and its two leaves; the second caller only polled.
    assert_eq!(f.performance().recomputations(), 3);
}
