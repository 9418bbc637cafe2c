//! Shared wiring for the treasury integration tests.

#![allow(dead_code)]

use arbor_economics::{ConfigStore, Hierarchy, LevelResolver, MapConfigProvider, PerformanceCache};
use arbor_storage::{LedgerBatch, LedgerStore, MemoryKv, MemoryLedgerStore};
use arbor_treasury::{
    CapEnforcer, DividendRewards, DynamicRewards, Processor, ScriptedGateway, StaticRewards,
    VerifiedTransfer,
};
use arbor_types::{Address, Amount, Balance, BalanceField, BalanceOp, TokenType};
use chrono::Utc;
use std::sync::Arc;

pub fn addr(n: u8) -> Address {
    Address([n; 20])
}

pub const TREASURY: Address = Address([0xEE; 20]);

pub struct Harness {
    pub store: Arc<MemoryLedgerStore>,
    pub kv: Arc<MemoryKv>,
    pub config: Arc<ConfigStore>,
    pub hierarchy: Hierarchy,
    pub levels: Arc<LevelResolver>,
    pub caps: Arc<CapEnforcer>,
    pub gateway: Arc<ScriptedGateway>,
    pub processor: Processor,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(&[])
    }

    pub fn with_config(pairs: &[(&str, &str)]) -> Self {
        let store = Arc::new(MemoryLedgerStore::new());
        let kv = Arc::new(MemoryKv::new());
        let provider = Arc::new(MapConfigProvider::from_pairs(pairs.iter().copied()));
        let config = Arc::new(ConfigStore::new(provider));
        let hierarchy = Hierarchy::new(store.clone());
        let performance = Arc::new(PerformanceCache::new(
            hierarchy.clone(),
            kv.clone(),
            config.clone(),
        ));
        let levels = Arc::new(LevelResolver::new(performance, kv.clone(), config.clone()));
        let caps = Arc::new(CapEnforcer::new(store.clone(), levels.clone()));
        let gateway = Arc::new(ScriptedGateway::new());
        let processor = Processor::new(
            levels.clone(),
            config.clone(),
            gateway.clone(),
            gateway.clone(),
            TREASURY,
        );
        Self {
            store,
            kv,
            config,
            hierarchy,
            levels,
            caps,
            gateway,
            processor,
        }
    }

    pub fn static_rewards(&self) -> StaticRewards {
        StaticRewards::new(self.levels.clone(), self.caps.clone(), self.config.clone())
    }

    pub fn dynamic_rewards(&self) -> DynamicRewards {
        DynamicRewards::new(self.levels.clone(), self.caps.clone(), self.config.clone())
    }

    pub fn dividends(&self) -> DividendRewards {
        DividendRewards::new(self.store.clone(), self.kv.clone(), self.config.clone())
    }

    pub fn register(&self, n: u8, superior: Option<u8>) -> Address {
        self.hierarchy
            .register(addr(n), superior.map(addr), Utc::now())
            .unwrap()
            .address
    }

    /// Register, place and stake at level 0 (cap = 2 × stake).
    pub fn staker(&self, n: u8, superior: Option<u8>, stake: Amount) -> Address {
        let address = self.register(n, superior);
        self.processor.stake(&address, stake, 0).unwrap();
        address
    }

    /// Deposit `amount` of `token` through a scripted chain transfer.
    pub async fn fund(&self, address: Address, token: TokenType, amount: Amount, hash: &str) {
        self.gateway.add_transfer(
            hash,
            token,
            VerifiedTransfer {
                from_address: address,
                confirmed_amount: amount,
                destination_address: TREASURY,
            },
        );
        self.processor.deposit(hash, token).await.unwrap();
    }

    /// Credit a balance field directly, bypassing the flow log.
    pub fn credit(&self, address: Address, field: BalanceField, amount: Amount) {
        self.store
            .commit(&LedgerBatch::new().op(address, BalanceOp::credit(field, amount)))
            .unwrap();
    }

    pub fn balance(&self, address: &Address) -> Balance {
        self.store.get_balance(address).unwrap().unwrap()
    }
}
