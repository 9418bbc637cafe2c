//! Settlement pipeline end to end: ordering, resumability after an injected
//! storage fault, lease behaviour and history retention.

use arbor_economics::{keys, ConfigStore, Hierarchy, LevelResolver, MapConfigProvider, PerformanceCache};
use arbor_settlement::{DayState, Settlement, SettlementError, SettlementOutcome, Step};
use arbor_storage::{
    FlowFilter, KvStore, LedgerBatch, LedgerCommit, LedgerStore, MemoryKv, MemoryLedgerStore,
    StorageError,
};
use arbor_treasury::{OfflineGateway, Processor};
use arbor_types::{
    utc_today, Address, Balance, FlowId, FlowKind, FlowStatus, OnChainTransaction,
    PerformanceHistory, RewardFlow, SettlementDay, TxId, User, UserId,
};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

type StoreResult<T> = std::result::Result<T, StorageError>;

fn addr(n: u8) -> Address {
    Address([n; 20])
}

// =============================================================================
// FAULT-INJECTING STORE
// =============================================================================

/// Memory store that fails the n-th commit carrying a flow of a given kind.
#[derive(Default)]
struct FaultyStore {
    inner: MemoryLedgerStore,
    fault: Mutex<Option<(FlowKind, usize)>>,
}

impl FaultyStore {
    fn fail_nth(&self, kind: FlowKind, n: usize) {
        *self.fault.lock() = Some((kind, n));
    }
}

impl LedgerStore for FaultyStore {
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
        {
            let mut fault = self.fault.lock();
            if let Some((kind, remaining)) = fault.as_mut() {
                if batch.flows.iter().any(|f| f.kind == *kind) {
                    if *remaining <= 1 {
                        *fault = None;
                        return Err(StorageError::Corrupt("injected fault".into()));
                    }
                    *remaining -= 1;
                }
            }
        }
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

// =============================================================================
// HARNESS
// =============================================================================

struct Node {
    store: Arc<FaultyStore>,
    kv: Arc<MemoryKv>,
    provider: Arc<MapConfigProvider>,
    config: Arc<ConfigStore>,
    hierarchy: Hierarchy,
    levels: Arc<LevelResolver>,
    processor: Processor,
}

impl Node {
    fn new() -> Self {
        let store = Arc::new(FaultyStore::default());
        let kv = Arc::new(MemoryKv::new());
        let provider = Arc::new(MapConfigProvider::from_pairs([
            (keys::LEVEL_REWARD_RATIOS, "0,0.1,0.2"),
            (keys::SETTLEMENT_PAGE_SIZE, "2"),
        ]));
        let config = Arc::new(ConfigStore::new(provider.clone()));
        let hierarchy = Hierarchy::new(store.clone());
        let performance = Arc::new(PerformanceCache::new(
            hierarchy.clone(),
            kv.clone(),
            config.clone(),
        ));
        let levels = Arc::new(LevelResolver::new(performance, kv.clone(), config.clone()));
        let gateway = Arc::new(OfflineGateway);
        let processor = Processor::new(
            levels.clone(),
            config.clone(),
            gateway.clone(),
            gateway,
            addr(0xEE),
        );
        Self {
            store,
            kv,
            provider,
            config,
            hierarchy,
            levels,
            processor,
        }
    }

    fn settlement(&self) -> Settlement {
        Settlement::new(self.levels.clone(), self.kv.clone(), self.config.clone())
    }

    fn join(&self, n: u8, superior: Option<u8>, stake: Decimal, min_level: u8) {
        self.hierarchy
            .register(addr(n), superior.map(addr), Utc::now())
            .unwrap();
        self.processor.stake(&addr(n), stake, 0).unwrap();
        if min_level > 0 {
            self.hierarchy.set_min_level(&addr(n), min_level).unwrap();
        }
    }

    /// Root 1 with level-1 children 2 and 3, each with two level-0 leaves.
    fn tree(self) -> Self {
        self.join(1, None, dec!(1000), 1);
        self.join(2, Some(1), dec!(500), 1);
        self.join(3, Some(1), dec!(500), 1);
        self.join(4, Some(2), dec!(1000), 0);
        self.join(5, Some(2), dec!(1000), 0);
        self.join(6, Some(3), dec!(1000), 0);
        self.join(7, Some(3), dec!(1000), 0);
        self
    }

    /// Every PENDING row as (user byte, kind, amount), sorted.
    fn pending(&self) -> Vec<(u8, &'static str, Decimal)> {
        let mut rows: Vec<_> = self
            .store
            .flows_page(0, 1000)
            .unwrap()
            .into_iter()
            .filter(|f| f.status == FlowStatus::Pending)
            .map(|f| (f.user_address.0[0], f.kind.as_str(), f.amount))
            .collect();
        rows.sort();
        rows
    }

    fn pending_sum(&self, n: u8, kind: FlowKind) -> Decimal {
        self.pending()
            .into_iter()
            .filter(|(user, k, _)| *user == n && *k == kind.as_str())
            .map(|(_, _, amount)| amount)
            .sum()
    }
}

fn completed(outcome: SettlementOutcome) -> arbor_settlement::SettlementReport {
    match outcome {
        SettlementOutcome::Completed(report) => report,
        other => panic!("expected a completed run, got {other:?}"),
    }
}

// =============================================================================
// PIPELINE
// =============================================================================

#[test]
fn full_run_writes_every_reward_kind_in_order() {
    let node = Node::new().tree();
    let day = utc_today();
    let report = completed(node.settlement().run(day).unwrap());

    let order: Vec<Step> = report.steps.iter().map(|(s, _)| *s).collect();
    assert_eq!(order, Step::ALL.to_vec());
    assert!(!report.resumed);

    // Static self reward: stake × 0.005 at price 1.
    assert_eq!(node.pending_sum(4, FlowKind::StakeStaticReward), dec!(5));
    // Dynamic: level-1 parents of level-0 leaves earn 1000 × 0.005 × 0.1 per leaf.
    assert_eq!(node.pending_sum(2, FlowKind::StakeDynamicReward), dec!(1));
    assert_eq!(node.pending_sum(3, FlowKind::StakeDynamicReward), dec!(1));
    // Root: no gap to its equal-ranked children, own ratio on their stake,
    // plus incubation on their same-day dynamic base.
    assert_eq!(node.pending_sum(1, FlowKind::StakeDynamicReward), dec!(0.5));
    assert_eq!(
        node.pending_sum(1, FlowKind::StakeDynamicIncubationReward),
        dec!(0.2)
    );
    assert_eq!(report.step(Step::Dynamic).unwrap().processed, 7);
}

#[test]
fn snapshot_records_the_days_standing() {
    let node = Node::new().tree();
    let day = utc_today();
    completed(node.settlement().run(day).unwrap());

    let root = node.store.get_history(&addr(1), day).unwrap().unwrap();
    assert_eq!(root.level, 1);
    assert_eq!(root.subordinate_count, 6);
    assert_eq!(root.performance, dec!(5000));
    assert_eq!(root.partial_performance, dec!(2500));
    assert_eq!(root.staked, dec!(1000));
    assert_eq!(root.dynamic_reward, dec!(0.5));

    let leaf = node.store.get_history(&addr(7), day).unwrap().unwrap();
    assert_eq!(leaf.subordinate_count, 0);
    assert_eq!(leaf.dynamic_reward, Decimal::ZERO);
}

#[test]
fn crash_mid_depth_resumes_with_identical_totals() {
    let day = utc_today();
    let clean = Node::new().tree();
    completed(clean.settlement().run(day).unwrap());

    let node = Node::new().tree();
    let settlement = node.settlement();
    // Second dynamic commit: user 3, after user 2 at the same depth succeeded.
    node.store.fail_nth(FlowKind::StakeDynamicReward, 2);
    let err = settlement.run(day).unwrap_err();
    assert!(matches!(err, SettlementError::Treasury(_)));

    let lease = settlement.leases().status(day).unwrap().unwrap();
    assert_eq!(lease.state, DayState::Running);
    assert!(lease.completed_steps.contains(&Step::Static));
    assert!(!lease.completed_steps.contains(&Step::Dynamic));
    assert_eq!(node.pending_sum(2, FlowKind::StakeDynamicReward), dec!(1));
    assert_eq!(node.pending_sum(3, FlowKind::StakeDynamicReward), Decimal::ZERO);

    let report = completed(settlement.run(day).unwrap());
    assert!(report.resumed);
    let resumed_steps: Vec<Step> = report.steps.iter().map(|(s, _)| *s).collect();
    assert_eq!(resumed_steps, vec![Step::Dynamic, Step::Retention]);
    // Only user 3 and the root were left.
    assert_eq!(report.step(Step::Dynamic).unwrap().processed, 2);

    assert_eq!(node.pending(), clean.pending());
}

#[test]
fn second_invocation_is_a_no_op() {
    let node = Node::new().tree();
    let day = utc_today();
    let first = completed(node.settlement().run(day).unwrap());
    let rows = node.pending().len();

    match node.settlement().run(day).unwrap() {
        SettlementOutcome::AlreadyCompleted(Some(report)) => assert_eq!(report, first),
        other => panic!("expected a no-op, got {other:?}"),
    }
    assert_eq!(node.pending().len(), rows);
}

#[test]
fn live_lease_blocks_and_stale_lease_is_taken_over() {
    let node = Node::new().tree();
    let day = utc_today();
    let holder = node.settlement();
    holder
        .leases()
        .acquire(day, holder.owner(), std::time::Duration::from_secs(1800), Utc::now())
        .unwrap();

    let other = node.settlement();
    match other.run(day).unwrap() {
        SettlementOutcome::InProgress { owner, .. } => assert_eq!(owner, holder.owner()),
        outcome => panic!("expected the day to be held, got {outcome:?}"),
    }
    assert!(node.pending().is_empty());

    node.provider.set(keys::SETTLEMENT_LEASE_SECS, "0");
    node.config.invalidate();
    let report = completed(other.run(day).unwrap());
    assert!(report.resumed);
    assert_eq!(report.owner, other.owner());
    assert!(!node.pending().is_empty());
}

#[test]
fn retention_purges_rows_older_than_a_week() {
    let node = Node::new().tree();
    let day = utc_today();
    for age in [10, 7, 6] {
        node.store
            .put_history(&PerformanceHistory::new(addr(1), day - Duration::days(age)))
            .unwrap();
    }

    let report = completed(node.settlement().run(day).unwrap());
    assert_eq!(report.history_cutoff, Some(day - Duration::days(7)));
    assert_eq!(report.history_purged, 1);
    for age in [7, 6] {
        assert!(node
            .store
            .get_history(&addr(1), day - Duration::days(age))
            .unwrap()
            .is_some());
    }
    assert!(node
        .store
        .get_history(&addr(1), day - Duration::days(10))
        .unwrap()
        .is_none());
    assert!(node.store.get_history(&addr(1), day).unwrap().is_some());
}

#[test]
fn explicit_day_request_is_validated() {
    let node = Node::new();
    assert!(matches!(
        node.settlement().run_for(Some(2026), Some(13), Some(1)),
        Err(SettlementError::InvalidDay(_))
    ));
    // Empty tree: every step runs and nothing is written.
    let report = completed(node.settlement().run_for(Some(2026), Some(10), Some(1)).unwrap());
    assert_eq!(report.flows_written(), 0);
    assert!(node.kv.get("settlement:20261001").unwrap().is_some());
}
