//! External transfer collaborators.
//!
//! The chain side is a trusted black box: a verifier reports what an inbound
//! transaction moved, a sender pushes an approved withdrawal and returns its
//! hash.

use arbor_types::{Address, Amount, OnChainTransaction, TokenType};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("transfer rejected: {0}")]
    Rejected(String),
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
}

/// What a confirmed inbound transfer moved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifiedTransfer {
    pub from_address: Address,
    pub confirmed_amount: Amount,
    pub destination_address: Address,
}

#[async_trait]
pub trait TransferVerifier: Send + Sync {
    async fn verify(&self, tx_hash: &str, token: TokenType)
        -> Result<VerifiedTransfer, GatewayError>;
}

#[async_trait]
pub trait TransferSender: Send + Sync {
    /// Send the net amount of `tx` to its destination; returns the chain hash.
    async fn send(&self, tx: &OnChainTransaction) -> Result<String, GatewayError>;
}

/// Gateway used when no chain endpoint is configured: nothing verifies,
/// nothing sends.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineGateway;

#[async_trait]
impl TransferVerifier for OfflineGateway {
    async fn verify(&self, tx_hash: &str, _token: TokenType) -> Result<VerifiedTransfer, GatewayError> {
        Err(GatewayError::Unavailable(format!(
            "no transfer gateway configured to verify {tx_hash}"
        )))
    }
}

#[async_trait]
impl TransferSender for OfflineGateway {
    async fn send(&self, tx: &OnChainTransaction) -> Result<String, GatewayError> {
        Err(GatewayError::Unavailable(format!(
            "no transfer gateway configured to send transaction {}",
            tx.id
        )))
    }
}

/// In-process gateway with a scripted set of known transfers and a send
/// outcome that can be switched between success and failure.
#[derive(Debug, Default)]
pub struct ScriptedGateway {
    transfers: Mutex<HashMap<String, (TokenType, VerifiedTransfer)>>,
    send_failure: Mutex<Option<String>>,
    sent: Mutex<Vec<OnChainTransaction>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_transfer(&self, tx_hash: &str, token: TokenType, transfer: VerifiedTransfer) {
        self.transfers
            .lock()
            .insert(tx_hash.to_string(), (token, transfer));
    }

    /// Make every following send fail with `reason`, or succeed again with `None`.
    pub fn fail_sends(&self, reason: Option<&str>) {
        *self.send_failure.lock() = reason.map(str::to_string);
    }

    pub fn sent(&self) -> Vec<OnChainTransaction> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl TransferVerifier for ScriptedGateway {
    async fn verify(&self, tx_hash: &str, token: TokenType) -> Result<VerifiedTransfer, GatewayError> {
        match self.transfers.lock().get(tx_hash) {
            Some((known, transfer)) if *known == token => Ok(transfer.clone()),
            Some((known, _)) => Err(GatewayError::Rejected(format!(
                "{tx_hash} moved {known}, not {token}"
            ))),
            None => Err(GatewayError::Rejected(format!("unknown transaction {tx_hash}"))),
        }
    }
}

#[async_trait]
impl TransferSender for ScriptedGateway {
    async fn send(&self, tx: &OnChainTransaction) -> Result<String, GatewayError> {
        if let Some(reason) = self.send_failure.lock().clone() {
            return Err(GatewayError::Rejected(reason));
        }
        let mut sent = self.sent.lock();
        sent.push(tx.clone());
        Ok(format!("0x{:064x}", sent.len()))
    }
}
