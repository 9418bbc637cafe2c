//! HTTP client for the chain transfer gateway.
//!
//! `GET  {base}/transfers/{hash}?token=USDT` → [`VerifiedTransfer`]
//! `POST {base}/transfers` with [`SendRequest`] → [`SendResponse`]

use arbor_treasury::{GatewayError, TransferSender, TransferVerifier, VerifiedTransfer};
use arbor_types::{Address, Amount, OnChainTransaction, TokenType, TxId};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub withdrawal_id: TxId,
    pub token: TokenType,
    pub from_address: Address,
    pub to_address: Address,
    pub amount: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResponse {
    pub tx_hash: String,
}

pub struct HttpGateway {
    client: Client,
    base_url: String,
}

impl HttpGateway {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| GatewayError::Unavailable(format!("failed to build client: {err}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn unavailable(err: reqwest::Error) -> GatewayError {
        GatewayError::Unavailable(err.to_string())
    }

    async fn rejected(response: reqwest::Response) -> GatewayError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            GatewayError::Unavailable(format!("{status}: {body}"))
        } else {
            GatewayError::Rejected(format!("{status}: {body}"))
        }
    }
}

#[async_trait]
impl TransferVerifier for HttpGateway {
    async fn verify(
        &self,
        tx_hash: &str,
        token: TokenType,
    ) -> Result<VerifiedTransfer, GatewayError> {
        let url = format!("{}/transfers/{tx_hash}", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("token", token.symbol())])
            .send()
            .await
            .map_err(Self::unavailable)?;
        match response.status() {
            StatusCode::OK => {
                let transfer = response
                    .json::<VerifiedTransfer>()
                    .await
                    .map_err(|err| GatewayError::Rejected(format!("malformed transfer: {err}")))?;
                debug!(target: "gateway", %tx_hash, amount = %transfer.confirmed_amount, "Transfer verified");
                Ok(transfer)
            }
            StatusCode::NOT_FOUND => Err(GatewayError::Rejected(format!(
                "unknown transaction {tx_hash}"
            ))),
            _ => Err(Self::rejected(response).await),
        }
    }
}

#[async_trait]
impl TransferSender for HttpGateway {
    async fn send(&self, tx: &OnChainTransaction) -> Result<String, GatewayError> {
        let request = SendRequest {
            withdrawal_id: tx.id,
            token: tx.token_type,
            from_address: tx.from_address,
            to_address: tx.to_address,
            amount: tx.amount,
        };
        let response = self
            .client
            .post(format!("{}/transfers", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(Self::unavailable)?;
        if !response.status().is_success() {
            let err = Self::rejected(response).await;
            warn!(target: "gateway", id = tx.id, error = %err, "Transfer send rejected");
            return Err(err);
        }
        let sent = response
            .json::<SendResponse>()
            .await
            .map_err(|err| GatewayError::Rejected(format!("malformed send response: {err}")))?;
        Ok(sent.tx_hash)
    }
}
