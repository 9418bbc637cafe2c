use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use arbor_economics::{EconomicsError, LevelResolver};
use arbor_settlement::{Settlement, SettlementError, SettlementOutcome, SettlementReport};
use arbor_treasury::{ClaimReport, Processor, StakeReceipt, TreasuryError};
use arbor_types::{Address, Amount, Balance, OnChainTransaction, TokenType, TxId, User};
use axum::extract::{Path as AxumPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub processor: Arc<Processor>,
    pub levels: Arc<LevelResolver>,
    pub settlement: Arc<Settlement>,
    pub node_id: String,
    pub start_time: Instant,
    pub req_count: Arc<AtomicUsize>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(
        processor: Arc<Processor>,
        levels: Arc<LevelResolver>,
        settlement: Arc<Settlement>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            processor,
            levels,
            settlement,
            node_id: node_id.into(),
            start_time: Instant::now(),
            req_count: Arc::new(AtomicUsize::new(0)),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    fn record_request(&self) -> u64 {
        self.req_count.fetch_add(1, Ordering::Relaxed) as u64 + 1
    }

    fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

pub type SharedState = Arc<AppState>;

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new<S: Into<String>>(status: StatusCode, code: &'static str, message: S) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn bad_request<S: Into<String>>(code: &'static str, message: S) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    fn not_found<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    fn internal<S: Into<String>>(message: S) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }

    /// Status for an engine error code.
    fn from_code(code: &'static str, message: String) -> Self {
        let status = match code {
            "unknown_user" | "transaction_not_found" => StatusCode::NOT_FOUND,
            "user_exists"
            | "frequent_operation"
            | "transaction_already_processed"
            | "invalid_transaction_state"
            | "settlement_in_progress" => StatusCode::CONFLICT,
            "insufficient_balance"
            | "insufficient_reward_cap"
            | "missing_destination_address"
            | "invalid_amount"
            | "invalid_address"
            | "unknown_superior"
            | "superior_not_placed"
            | "invalid_day" => StatusCode::BAD_REQUEST,
            "external_transfer_failure" | "gateway_error" => StatusCode::BAD_GATEWAY,
            "performance_compute_timeout" => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(target: "rpc", code, %message, "Request failed");
        }
        Self::new(status, code, message)
    }
}

impl From<TreasuryError> for ApiError {
    fn from(err: TreasuryError) -> Self {
        Self::from_code(err.code(), err.to_string())
    }
}

impl From<EconomicsError> for ApiError {
    fn from(err: EconomicsError) -> Self {
        Self::from_code(err.code(), err.to_string())
    }
}

impl From<SettlementError> for ApiError {
    fn from(err: SettlementError) -> Self {
        Self::from_code(err.code(), err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let payload = Json(ErrorResponse {
            code: self.code.to_string(),
            message: self.message,
        });
        (self.status, payload).into_response()
    }
}

fn parse_address(raw: &str) -> Result<Address, ApiError> {
    raw.parse()
        .map_err(|err| ApiError::bad_request("invalid_address", format!("{raw}: {err}")))
}

/// Run a synchronous engine call on the blocking pool.
async fn blocking<T, F>(work: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| ApiError::internal(format!("worker task failed: {err}")))?
}

// =============================================================================
// SERVER
// =============================================================================

pub async fn start_server(state: AppState, addr: &str) -> Result<()> {
    let shared = Arc::new(state);
    let app = build_router(shared);
    let listener = bind_listener(addr).await?;
    info!(target: "rpc", %addr, "RPC server listening");
    axum::serve(listener, app)
        .await
        .context("RPC server terminated unexpectedly")
}

async fn bind_listener(addr: &str) -> Result<tokio::net::TcpListener> {
    if let Ok(socket_addr) = addr.parse::<SocketAddr>() {
        tokio::net::TcpListener::bind(socket_addr)
            .await
            .with_context(|| format!("failed to bind RPC listener on {socket_addr}"))
    } else {
        tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind RPC listener on {addr}"))
    }
}

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .route("/users", post(handle_register))
        .route("/users/:address", get(handle_get_user))
        .route("/users/:address/balance", get(handle_get_balance))
        .route("/users/:address/performance", get(handle_get_performance))
        .route("/stake", post(handle_stake))
        .route("/deposit", post(handle_deposit))
        .route("/claim", post(handle_claim))
        .route("/withdraw", post(handle_withdraw))
        .route("/withdrawals/:id/approve", post(handle_approve_withdrawal))
        .route("/withdrawals/:id/refuse", post(handle_refuse_withdrawal))
        .route("/settlement", post(handle_settlement))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =============================================================================
// HEALTH
// =============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    node_id: String,
    version: &'static str,
    commit: &'static str,
    uptime_secs: u64,
    req_total: u64,
}

async fn handle_health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let req_total = state.record_request();
    Json(HealthResponse {
        status: "ok",
        node_id: state.node_id.clone(),
        version: env!("CARGO_PKG_VERSION"),
        commit: option_env!("GIT_COMMIT_HASH").unwrap_or("unknown"),
        uptime_secs: state.uptime_seconds(),
        req_total,
    })
}

async fn handle_metrics(State(state): State<SharedState>) -> Result<Response, ApiError> {
    state.record_request();
    let handle = state
        .metrics
        .as_ref()
        .ok_or_else(|| ApiError::not_found("metrics exporter is disabled"))?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    )
        .into_response())
}

// =============================================================================
// USERS
// =============================================================================

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    address: Address,
    #[serde(default)]
    superior: Option<Address>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PerformanceResponse {
    pub address: Address,
    pub level: u8,
    pub total_performance: Amount,
    pub partial_performance: Amount,
    pub descendant_count: u64,
}

async fn handle_register(
    State(state): State<SharedState>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<User>), ApiError> {
    state.record_request();
    let levels = state.levels.clone();
    let user = blocking(move || {
        Ok(levels
            .performance()
            .hierarchy()
            .register(request.address, request.superior, Utc::now())?)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(user)))
}

async fn handle_get_user(
    State(state): State<SharedState>,
    AxumPath(address): AxumPath<String>,
) -> Result<Json<User>, ApiError> {
    state.record_request();
    let address = parse_address(&address)?;
    let levels = state.levels.clone();
    let user = blocking(move || Ok(levels.performance().hierarchy().user(&address)?)).await?;
    Ok(Json(user))
}

async fn handle_get_balance(
    State(state): State<SharedState>,
    AxumPath(address): AxumPath<String>,
) -> Result<Json<Balance>, ApiError> {
    state.record_request();
    let address = parse_address(&address)?;
    let processor = state.processor.clone();
    let balance = blocking(move || Ok(processor.balance(&address)?)).await?;
    Ok(Json(balance))
}

async fn handle_get_performance(
    State(state): State<SharedState>,
    AxumPath(address): AxumPath<String>,
) -> Result<Json<PerformanceResponse>, ApiError> {
    state.record_request();
    let address = parse_address(&address)?;
    let levels = state.levels.clone();
    let response = blocking(move || {
        let hierarchy = levels.performance().hierarchy();
        let user = hierarchy.user(&address)?;
        let standing = levels.standing(&user)?;
        Ok(PerformanceResponse {
            address,
            level: standing.level,
            total_performance: standing.total_performance,
            partial_performance: standing.partial_performance,
            descendant_count: hierarchy.descendant_count(&address)?,
        })
    })
    .await?;
    Ok(Json(response))
}

// =============================================================================
// LEDGER OPERATIONS
// =============================================================================

/// Either a direct stake (`address` + `amount`) or one paid by a verified
/// chain transfer (`tx_hash`).
#[derive(Debug, Deserialize)]
struct StakeRequest {
    #[serde(default)]
    address: Option<Address>,
    #[serde(default)]
    amount: Option<Amount>,
    #[serde(default)]
    tx_hash: Option<String>,
    level: u8,
}

#[derive(Debug, Deserialize)]
struct DepositRequest {
    tx_hash: String,
    token: TokenType,
}

#[derive(Debug, Deserialize)]
struct ClaimRequest {
    address: Address,
    token: TokenType,
}

#[derive(Debug, Deserialize)]
struct WithdrawRequest {
    address: Address,
    amount: Amount,
    token: TokenType,
    #[serde(default)]
    to_address: Option<Address>,
}

#[derive(Debug, Default, Deserialize)]
struct RefuseRequest {
    #[serde(default)]
    reason: Option<String>,
}

async fn handle_stake(
    State(state): State<SharedState>,
    Json(request): Json<StakeRequest>,
) -> Result<Json<StakeReceipt>, ApiError> {
    state.record_request();
    let receipt = match request {
        StakeRequest {
            tx_hash: Some(tx_hash),
            level,
            ..
        } => {
            let payment = state.processor.verify_payment(&tx_hash, TokenType::Usdt).await?;
            let processor = state.processor.clone();
            blocking(move || Ok(processor.stake_paid(&payment, level)?)).await?
        }
        StakeRequest {
            address: Some(address),
            amount: Some(amount),
            level,
            ..
        } => {
            let processor = state.processor.clone();
            blocking(move || Ok(processor.stake(&address, amount, level)?)).await?
        }
        _ => {
            return Err(ApiError::bad_request(
                "invalid_request",
                "either tx_hash, or address and amount, are required",
            ))
        }
    };
    info!(
        target: "rpc",
        address = %receipt.user.address,
        cap_added = %receipt.cap_added,
        "Stake accepted"
    );
    Ok(Json(receipt))
}

async fn handle_deposit(
    State(state): State<SharedState>,
    Json(request): Json<DepositRequest>,
) -> Result<Json<OnChainTransaction>, ApiError> {
    state.record_request();
    let payment = state
        .processor
        .verify_payment(&request.tx_hash, request.token)
        .await?;
    let processor = state.processor.clone();
    let tx = blocking(move || Ok(processor.deposit_paid(&payment)?)).await?;
    Ok(Json(tx))
}

async fn handle_claim(
    State(state): State<SharedState>,
    Json(request): Json<ClaimRequest>,
) -> Result<Json<ClaimReport>, ApiError> {
    state.record_request();
    let processor = state.processor.clone();
    let report =
        blocking(move || Ok(processor.claim(&request.address, request.token)?)).await?;
    Ok(Json(report))
}

async fn handle_withdraw(
    State(state): State<SharedState>,
    Json(request): Json<WithdrawRequest>,
) -> Result<(StatusCode, Json<OnChainTransaction>), ApiError> {
    state.record_request();
    let processor = state.processor.clone();
    let tx = blocking(move || {
        Ok(processor.withdraw(
            &request.address,
            request.amount,
            request.token,
            request.to_address,
        )?)
    })
    .await?;
    Ok((StatusCode::ACCEPTED, Json(tx)))
}

async fn handle_approve_withdrawal(
    State(state): State<SharedState>,
    AxumPath(id): AxumPath<TxId>,
) -> Result<Json<OnChainTransaction>, ApiError> {
    state.record_request();
    match state.processor.approve_withdrawal(id).await {
        Ok(tx) => Ok(Json(tx)),
        Err(err) => {
            warn!(target: "rpc", id, error = %err, "Withdrawal approval failed");
            Err(err.into())
        }
    }
}

async fn handle_refuse_withdrawal(
    State(state): State<SharedState>,
    AxumPath(id): AxumPath<TxId>,
    body: Option<Json<RefuseRequest>>,
) -> Result<Json<OnChainTransaction>, ApiError> {
    state.record_request();
    let RefuseRequest { reason } = body.map(|Json(body)| body).unwrap_or_default();
    let processor = state.processor.clone();
    let tx = blocking(move || Ok(processor.refuse_withdrawal(id, reason.as_deref())?)).await?;
    Ok(Json(tx))
}

// =============================================================================
// SETTLEMENT
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct SettlementRequest {
    #[serde(default)]
    year: Option<i32>,
    #[serde(default)]
    month: Option<u32>,
    #[serde(default)]
    day: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SettlementResponse {
    Completed {
        report: SettlementReport,
    },
    AlreadyCompleted {
        report: Option<SettlementReport>,
    },
    InProgress {
        owner: Uuid,
        heartbeat_at: DateTime<Utc>,
    },
}

impl From<SettlementOutcome> for SettlementResponse {
    fn from(outcome: SettlementOutcome) -> Self {
        match outcome {
            SettlementOutcome::Completed(report) => SettlementResponse::Completed { report },
            SettlementOutcome::AlreadyCompleted(report) => {
                SettlementResponse::AlreadyCompleted { report }
            }
            SettlementOutcome::InProgress {
                owner,
                heartbeat_at,
            } => SettlementResponse::InProgress {
                owner,
                heartbeat_at,
            },
        }
    }
}

async fn handle_settlement(
    State(state): State<SharedState>,
    body: Option<Json<SettlementRequest>>,
) -> Result<Json<SettlementResponse>, ApiError> {
    state.record_request();
    let request = body.map(|Json(body)| body).unwrap_or_default();
    let settlement = state.settlement.clone();
    let outcome = blocking(move || {
        Ok(settlement.run_for(request.year, request.month, request.day)?)
    })
    .await?;
    Ok(Json(outcome.into()))
}
