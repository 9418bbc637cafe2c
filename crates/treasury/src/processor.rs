//! User-facing ledger operations.
//!
//! Each operation is one [`LedgerBatch`]: the checked balance ops, the flow
//! rows recording them and any on-chain transaction row commit together or
//! not at all. Preconditions that depend on other rows (single-flight
//! withdrawals, unused transaction hashes, a flow still PENDING) travel with
//! the batch as guards.

use crate::errors::{Result, TreasuryError};
use crate::gateway::{TransferSender, TransferVerifier, VerifiedTransfer};
use crate::posting::{net_effect, postings};
use arbor_economics::{ConfigStore, Hierarchy, LevelResolver};
use arbor_storage::{FlowFilter, Guard, LedgerBatch, LedgerStore, StorageError};
use arbor_types::{
    div_round_down, mul_round_down, Address, Amount, Balance, BalanceField, BalanceOp, FlowId,
    FlowKind, FlowStatus, OnChainTransaction, RewardFlow, TokenType, TxDirection, TxId, TxStatus,
    User,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimReport {
    pub token: Option<TokenType>,
    pub claimed: usize,
    pub amount: Amount,
    pub flow_ids: Vec<FlowId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeReceipt {
    pub user: User,
    pub balance: Balance,
    pub cap_added: Amount,
}

/// An inbound transfer confirmed by the verifier, not yet credited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedPayment {
    pub tx_hash: String,
    pub token: TokenType,
    pub transfer: VerifiedTransfer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub address: Address,
    /// Σ CONFIRMED credits − Σ CONFIRMED debits to `token_points`.
    pub ledger_total: Amount,
    pub stored: Amount,
}

impl Reconciliation {
    pub fn is_balanced(&self) -> bool {
        self.ledger_total == self.stored
    }
}

fn ensure_positive(amount: Amount) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(TreasuryError::InvalidAmount(amount));
    }
    Ok(())
}

fn with_postings(mut batch: LedgerBatch, flow: RewardFlow) -> Result<LedgerBatch> {
    for (address, op) in postings(&flow)? {
        batch = batch.op(address, op);
    }
    Ok(batch.flow(flow))
}

pub struct Processor {
    store: Arc<dyn LedgerStore>,
    levels: Arc<LevelResolver>,
    config: Arc<ConfigStore>,
    verifier: Arc<dyn TransferVerifier>,
    sender: Arc<dyn TransferSender>,
    /// Platform wallet deposits are paid into and withdrawals are paid from.
    treasury_address: Address,
}

impl Processor {
    pub fn new(
        levels: Arc<LevelResolver>,
        config: Arc<ConfigStore>,
        verifier: Arc<dyn TransferVerifier>,
        sender: Arc<dyn TransferSender>,
        treasury_address: Address,
    ) -> Self {
        Self {
            store: levels.performance().hierarchy().store().clone(),
            levels,
            config,
            verifier,
            sender,
            treasury_address,
        }
    }

    fn hierarchy(&self) -> &Hierarchy {
        self.levels.performance().hierarchy()
    }

    pub fn treasury_address(&self) -> Address {
        self.treasury_address
    }

    pub fn balance(&self, address: &Address) -> Result<Balance> {
        self.hierarchy().user(address)?;
        Ok(self
            .store
            .get_balance(address)?
            .unwrap_or_else(|| Balance::new(*address)))
    }

    // -------------------------------------------------------------------------
    // Claims
    // -------------------------------------------------------------------------

    /// Realise every PENDING reward of `token`'s allow-list, oldest first, one
    /// commit per row.
    pub fn claim(&self, address: &Address, token: TokenType) -> Result<ClaimReport> {
        self.hierarchy().user(address)?;
        let page_size = self.config.current()?.claim_page_size;
        let filter = FlowFilter {
            status: Some(FlowStatus::Pending),
            kinds: FlowKind::claimable_for(token).to_vec(),
            token_type: Some(token),
        };

        let mut report = ClaimReport {
            token: Some(token),
            ..ClaimReport::default()
        };
        let mut after = 0;
        loop {
            let page = self.store.flows_for(address, &filter, after, page_size)?;
            for flow in &page {
                after = flow.id;
                let batch = with_postings(
                    LedgerBatch::new().guard(Guard::FlowStatus(flow.id, FlowStatus::Pending)),
                    flow.confirm(Utc::now()),
                )?;
                match self.store.commit(&batch) {
                    Ok(_) => {
                        report.claimed += 1;
                        report.amount += flow.amount;
                        report.flow_ids.push(flow.id);
                    }
                    Err(StorageError::GuardFailed(_)) => {
                        debug!(target: "treasury", flow = flow.id, "Flow already realised");
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            if page.len() < page_size {
                break;
            }
        }

        if report.claimed > 0 {
            info!(
                target: "treasury",
                %address,
                %token,
                claimed = report.claimed,
                amount = %report.amount,
                "Claimed rewards"
            );
        }
        Ok(report)
    }

    // -------------------------------------------------------------------------
    // Withdrawals and their audit
    // -------------------------------------------------------------------------

    /// Debit `amount` now and open an AUDITING outbound transaction for
    /// `amount − fee`.
    pub fn withdraw(
        &self,
        address: &Address,
        amount: Amount,
        token: TokenType,
        to_address: Option<Address>,
    ) -> Result<OnChainTransaction> {
        ensure_positive(amount)?;
        let to_address = to_address.ok_or(TreasuryError::MissingDestinationAddress)?;
        self.hierarchy().user(address)?;

        let config = self.config.current()?;
        let fee = mul_round_down(amount, config.withdraw_fee_ratio(token));
        let now = Utc::now();
        let mut tx = OnChainTransaction {
            id: 0,
            tx_hash: None,
            direction: TxDirection::Out,
            token_type: token,
            user_address: *address,
            from_address: self.treasury_address,
            to_address,
            amount: amount - fee,
            fee,
            status: TxStatus::Auditing,
            error: None,
            created_at: now,
            updated_at: now,
        };
        let flow = RewardFlow::confirmed(*address, FlowKind::Out, token, amount, now)
            .with_to_address(to_address)
            .with_description(format!("withdrawal fee {fee}"));
        let batch = with_postings(
            LedgerBatch::new().guard(Guard::NoOutboundInFlight(*address, token)),
            flow,
        )?
        .transaction(tx.clone());

        let commit = self.store.commit(&batch)?;
        tx.id = commit.tx_ids[0];
        info!(
            target: "treasury",
            %address,
            %token,
            id = tx.id,
            net = %tx.amount,
            %fee,
            "Withdrawal awaiting audit"
        );
        Ok(tx)
    }

    fn outbound(&self, id: TxId) -> Result<OnChainTransaction> {
        let tx = self
            .store
            .get_transaction(id)?
            .ok_or(TreasuryError::TransactionNotFound(id))?;
        if tx.direction != TxDirection::Out {
            return Err(TreasuryError::InvalidTransactionState {
                id,
                status: tx.status,
                reason: "not a withdrawal",
            });
        }
        Ok(tx)
    }

    fn transition(
        &self,
        tx: &OnChainTransaction,
        from: &[TxStatus],
        update: impl FnOnce(&mut OnChainTransaction),
    ) -> Result<OnChainTransaction> {
        self.transition_guarded(tx, from, None, update)
    }

    fn transition_guarded(
        &self,
        tx: &OnChainTransaction,
        from: &[TxStatus],
        extra: Option<Guard>,
        update: impl FnOnce(&mut OnChainTransaction),
    ) -> Result<OnChainTransaction> {
        let mut next = tx.clone();
        update(&mut next);
        next.updated_at = Utc::now();
        let mut batch = LedgerBatch::new().guard(Guard::TxStatus(tx.id, from.to_vec()));
        if let Some(guard) = extra {
            batch = batch.guard(guard);
        }
        let batch = batch.transaction(next.clone());
        match self.store.commit(&batch) {
            Ok(_) => Ok(next),
            Err(StorageError::GuardFailed(Guard::NoOutboundInFlight(address, token))) => {
                Err(TreasuryError::FrequentOperation { address, token })
            }
            Err(StorageError::GuardFailed(_)) => Err(TreasuryError::InvalidTransactionState {
                id: tx.id,
                status: self
                    .store
                    .get_transaction(tx.id)?
                    .map_or(tx.status, |t| t.status),
                reason: "changed concurrently",
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// AUDITING (or FAILED, to retry) → PENDING → send → CONFIRMED | FAILED.
    ///
    /// A FAILED withdrawal is no longer in flight, so retrying it is subject
    /// to the same single-flight rule as a new withdrawal.
    ///
    /// A process that dies between the PENDING commit and the sender's reply
    /// leaves the row PENDING without a hash. Such a row is not re-approved
    /// here because the transfer may already be on chain; it has to be
    /// checked against the chain and settled by hand.
    pub async fn approve_withdrawal(&self, id: TxId) -> Result<OnChainTransaction> {
        let tx = self.outbound(id)?;
        let single_flight = match tx.status {
            TxStatus::Auditing => None,
            TxStatus::Failed => Some(Guard::NoOutboundInFlight(tx.user_address, tx.token_type)),
            status => {
                return Err(TreasuryError::InvalidTransactionState {
                    id,
                    status,
                    reason: "only auditing or failed withdrawals can be approved",
                })
            }
        };
        let pending = self.transition_guarded(&tx, &[tx.status], single_flight, |t| {
            t.status = TxStatus::Pending;
            t.error = None;
        })?;

        match self.sender.send(&pending).await {
            Ok(hash) => {
                let confirmed = self.transition(&pending, &[TxStatus::Pending], |t| {
                    t.status = TxStatus::Confirmed;
                    t.tx_hash = Some(hash);
                })?;
                info!(target: "treasury", id, hash = ?confirmed.tx_hash, "Withdrawal sent");
                Ok(confirmed)
            }
            Err(err) => {
                let reason = err.to_string();
                warn!(target: "treasury", id, %reason, "Withdrawal transfer failed");
                self.transition(&pending, &[TxStatus::Pending], |t| {
                    t.status = TxStatus::Failed;
                    t.error = Some(reason.clone());
                })?;
                Err(TreasuryError::ExternalTransferFailure { id, reason })
            }
        }
    }

    /// AUDITING → REFUSED, refunding the gross amount.
    pub fn refuse_withdrawal(&self, id: TxId, reason: Option<&str>) -> Result<OnChainTransaction> {
        let tx = self.outbound(id)?;
        if tx.status != TxStatus::Auditing {
            return Err(TreasuryError::InvalidTransactionState {
                id,
                status: tx.status,
                reason: "only auditing withdrawals can be refused",
            });
        }
        let now = Utc::now();
        let mut refused = tx.clone();
        refused.status = TxStatus::Refused;
        refused.error = reason.map(str::to_string);
        refused.updated_at = now;

        let refund = RewardFlow::confirmed(tx.user_address, FlowKind::In, tx.token_type, tx.gross_amount(), now)
            .with_description(format!("refund of withdrawal {id}"));
        let batch = with_postings(
            LedgerBatch::new().guard(Guard::TxStatus(id, vec![TxStatus::Auditing])),
            refund,
        )?
        .transaction(refused.clone());
        self.store.commit(&batch)?;
        info!(target: "treasury", id, address = %tx.user_address, "Withdrawal refused and refunded");
        Ok(refused)
    }

    // -------------------------------------------------------------------------
    // Inbound transfers
    // -------------------------------------------------------------------------

    /// Check an inbound payment with the verifier. The result is committed
    /// by [`deposit_paid`](Self::deposit_paid) or
    /// [`stake_paid`](Self::stake_paid), which are synchronous and may wait
    /// on the performance cache, so async callers run them on a blocking
    /// thread.
    pub async fn verify_payment(&self, tx_hash: &str, token: TokenType) -> Result<VerifiedPayment> {
        let transfer = self.verified_inbound(tx_hash, token).await?;
        Ok(VerifiedPayment {
            tx_hash: tx_hash.to_string(),
            token,
            transfer,
        })
    }

    async fn verified_inbound(&self, tx_hash: &str, token: TokenType) -> Result<VerifiedTransfer> {
        if self.store.find_transaction_by_hash(tx_hash)?.is_some() {
            return Err(TreasuryError::TransactionAlreadyProcessed(tx_hash.to_string()));
        }
        let transfer = self.verifier.verify(tx_hash, token).await?;
        if transfer.confirmed_amount <= Decimal::ZERO {
            return Err(TreasuryError::InvalidAmount(transfer.confirmed_amount));
        }
        if transfer.destination_address != self.treasury_address {
            return Err(TreasuryError::InvalidAddress(format!(
                "{tx_hash} paid {} instead of the treasury",
                transfer.destination_address
            )));
        }
        self.hierarchy().user(&transfer.from_address)?;
        Ok(transfer)
    }

    fn inbound_tx(
        &self,
        tx_hash: &str,
        token: TokenType,
        transfer: &VerifiedTransfer,
        now: DateTime<Utc>,
    ) -> OnChainTransaction {
        OnChainTransaction {
            id: 0,
            tx_hash: Some(tx_hash.to_string()),
            direction: TxDirection::In,
            token_type: token,
            user_address: transfer.from_address,
            from_address: transfer.from_address,
            to_address: transfer.destination_address,
            amount: transfer.confirmed_amount,
            fee: Decimal::ZERO,
            status: TxStatus::Confirmed,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Credit a verified on-chain payment to its sender.
    pub async fn deposit(&self, tx_hash: &str, token: TokenType) -> Result<OnChainTransaction> {
        let payment = self.verify_payment(tx_hash, token).await?;
        self.deposit_paid(&payment)
    }

    pub fn deposit_paid(&self, payment: &VerifiedPayment) -> Result<OnChainTransaction> {
        let VerifiedPayment {
            tx_hash,
            token,
            transfer,
        } = payment;
        let (tx_hash, token) = (tx_hash.as_str(), *token);
        let now = Utc::now();
        let tx = self.inbound_tx(tx_hash, token, transfer, now);
        let flow = RewardFlow::confirmed(transfer.from_address, FlowKind::In, token, transfer.confirmed_amount, now)
            .with_tx_hash(tx_hash);
        let batch = with_postings(
            LedgerBatch::new().guard(Guard::UnusedTxHash(tx_hash.to_string())),
            flow,
        )?
        .transaction(tx.clone());
        let commit = self.store.commit(&batch)?;
        info!(
            target: "treasury",
            address = %transfer.from_address,
            %token,
            amount = %transfer.confirmed_amount,
            "Deposit credited"
        );
        Ok(OnChainTransaction {
            id: commit.tx_ids[0],
            ..tx
        })
    }

    // -------------------------------------------------------------------------
    // Staking
    // -------------------------------------------------------------------------

    /// Lock `amount` as stake and raise the reward cap by `amount × multiplier[level]`.
    /// The first stake places the user in the tree.
    pub fn stake(&self, address: &Address, amount: Amount, level: u8) -> Result<StakeReceipt> {
        self.stake_inner(address, amount, level, None)
    }

    /// Stake the amount of a verified USDT payment.
    pub async fn stake_with_transfer(&self, tx_hash: &str, level: u8) -> Result<StakeReceipt> {
        let payment = self.verify_payment(tx_hash, TokenType::Usdt).await?;
        self.stake_paid(&payment, level)
    }

    pub fn stake_paid(&self, payment: &VerifiedPayment, level: u8) -> Result<StakeReceipt> {
        if payment.token != TokenType::Usdt {
            return Err(TreasuryError::InvalidAmount(payment.transfer.confirmed_amount));
        }
        let transfer = &payment.transfer;
        let tx = self.inbound_tx(&payment.tx_hash, TokenType::Usdt, transfer, Utc::now());
        self.stake_inner(&transfer.from_address, transfer.confirmed_amount, level, Some(tx))
    }

    fn stake_inner(
        &self,
        address: &Address,
        amount: Amount,
        level: u8,
        payment: Option<OnChainTransaction>,
    ) -> Result<StakeReceipt> {
        ensure_positive(amount)?;
        let mut user = self.hierarchy().place(address)?;
        let config = self.config.current()?;
        let cap_added = mul_round_down(amount, config.cap_multiplier(level));
        let now = Utc::now();

        let mut flow = RewardFlow::confirmed(*address, FlowKind::Stake, TokenType::Usdt, amount, now)
            .with_description(format!("stake level {level}, cap +{cap_added}"));
        let mut batch = LedgerBatch::new();
        if let Some(tx) = payment {
            if let Some(hash) = &tx.tx_hash {
                flow = flow.with_tx_hash(hash.clone());
                batch = batch.guard(Guard::UnusedTxHash(hash.clone()));
            }
            batch = batch.transaction(tx);
        }
        let batch = with_postings(batch, flow)?
            .op(*address, BalanceOp::credit(BalanceField::StakeRewardCap, cap_added));
        let commit = self.store.commit(&batch)?;

        user.buy_at = Some(now);
        user.interest_active = true;
        self.store.put_user(&user)?;
        self.levels.invalidate(address)?;

        let balance = commit
            .balance_of(address)
            .cloned()
            .unwrap_or_else(|| Balance::new(*address));
        info!(target: "treasury", %address, %amount, level, %cap_added, "Stake recorded");
        Ok(StakeReceipt {
            user,
            balance,
            cap_added,
        })
    }

    // -------------------------------------------------------------------------
    // Internal movements
    // -------------------------------------------------------------------------

    pub fn transfer(
        &self,
        from: &Address,
        to: &Address,
        amount: Amount,
        token: TokenType,
    ) -> Result<FlowId> {
        ensure_positive(amount)?;
        if from == to {
            return Err(TreasuryError::InvalidAddress(to.to_string()));
        }
        self.hierarchy().user(from)?;
        self.hierarchy().user(to)?;
        let flow = RewardFlow::confirmed(*from, FlowKind::Transfer, token, amount, Utc::now())
            .with_to_address(*to);
        let commit = self.store.commit(&with_postings(LedgerBatch::new(), flow)?)?;
        Ok(commit.flow_ids[0])
    }

    /// Convert `usdt_amount` of `usdt_points` into tokens at the configured
    /// price, less the swap fee.
    pub fn flash_swap(&self, address: &Address, usdt_amount: Amount) -> Result<RewardFlow> {
        ensure_positive(usdt_amount)?;
        let config = self.config.current()?;
        let fee = mul_round_down(usdt_amount, config.flash_swap_fee_ratio);
        let tokens = div_round_down(usdt_amount - fee, config.token_price);
        self.convert(address, FlowKind::FlashSwap, usdt_amount, tokens, config.token_price)
    }

    /// Consolidate the whole `usdt_points` balance into tokens at the configured price.
    pub fn assemble(&self, address: &Address) -> Result<RewardFlow> {
        let usdt = self.balance(address)?.usdt_points;
        ensure_positive(usdt)?;
        let price = self.config.current()?.token_price;
        self.convert(address, FlowKind::Assemble, usdt, div_round_down(usdt, price), price)
    }

    fn convert(
        &self,
        address: &Address,
        kind: FlowKind,
        usdt: Amount,
        tokens: Amount,
        price: Decimal,
    ) -> Result<RewardFlow> {
        self.hierarchy().user(address)?;
        let mut flow = RewardFlow::confirmed(*address, kind, TokenType::Token, tokens, Utc::now())
            .with_counter_amount(usdt)
            .with_description(format!("price {price}"));
        let commit = self.store.commit(&with_postings(LedgerBatch::new(), flow.clone())?)?;
        flow.id = commit.flow_ids[0];
        Ok(flow)
    }

    /// Grant `amount` tokens as a PENDING airdrop, realised by a TOKEN claim.
    pub fn airdrop(&self, address: &Address, amount: Amount, note: Option<&str>) -> Result<FlowId> {
        ensure_positive(amount)?;
        self.hierarchy().user(address)?;
        let mut flow = RewardFlow::pending(*address, FlowKind::Airdrop, TokenType::Token, amount, Utc::now());
        if let Some(note) = note {
            flow = flow.with_description(note);
        }
        Ok(self.store.commit(&LedgerBatch::new().flow(flow))?.flow_ids[0])
    }

    // -------------------------------------------------------------------------
    // Audit
    // -------------------------------------------------------------------------

    /// Replay every CONFIRMED flow touching `address` against `token_points`.
    pub fn reconcile(&self, address: &Address) -> Result<Reconciliation> {
        let stored = self.balance(address)?.token_points;
        let mut ledger_total = Decimal::ZERO;
        let mut after = 0;
        const PAGE: usize = 500;
        loop {
            let page = self.store.flows_page(after, PAGE)?;
            for flow in &page {
                after = flow.id;
                let involved =
                    flow.user_address == *address || flow.to_address.as_ref() == Some(address);
                if flow.status != FlowStatus::Confirmed || !involved {
                    continue;
                }
                ledger_total += net_effect(&postings(flow)?, address, BalanceField::TokenPoints);
            }
            if page.len() < PAGE {
                break;
            }
        }
        Ok(Reconciliation {
            address: *address,
            ledger_total,
            stored,
        })
    }
}
