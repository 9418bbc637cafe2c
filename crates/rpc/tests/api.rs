//! HTTP surface driven through the router with `oneshot`.

use arbor_economics::{ConfigStore, Hierarchy, LevelResolver, MapConfigProvider, PerformanceCache};
use arbor_rpc::{build_router, AppState};
use arbor_settlement::Settlement;
use arbor_storage::{MemoryKv, MemoryLedgerStore};
use arbor_treasury::{Processor, ScriptedGateway, VerifiedTransfer};
use arbor_types::{Address, TokenType};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const TREASURY: Address = Address([0xEE; 20]);

fn addr(n: u8) -> String {
    Address([n; 20]).to_string()
}

struct Api {
    router: Router,
    gateway: Arc<ScriptedGateway>,
}

impl Api {
    fn new() -> Self {
        let store = Arc::new(MemoryLedgerStore::new());
        let kv = Arc::new(MemoryKv::new());
        let config = Arc::new(ConfigStore::new(Arc::new(MapConfigProvider::new())));
        let performance = Arc::new(PerformanceCache::new(
            Hierarchy::new(store),
            kv.clone(),
            config.clone(),
        ));
        let levels = Arc::new(LevelResolver::new(performance, kv.clone(), config.clone()));
        let gateway = Arc::new(ScriptedGateway::new());
        let processor = Arc::new(Processor::new(
            levels.clone(),
            config.clone(),
            gateway.clone(),
            gateway.clone(),
            TREASURY,
        ));
        let settlement = Arc::new(Settlement::new(levels.clone(), kv, config));
        let state = AppState::new(processor, levels, settlement, "test-node");
        Self {
            router: build_router(Arc::new(state)),
            gateway,
        }
    }

    async fn call(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(body) => {
                request = request.header("content-type", "application/json");
                Body::from(body.to_string())
            }
            None => Body::empty(),
        };
        let response = self
            .router
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    async fn register(&self, n: u8, superior: Option<u8>) {
        let (status, _) = self
            .call(
                "POST",
                "/users",
                Some(json!({ "address": addr(n), "superior": superior.map(addr) })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    async fn deposit(&self, n: u8, amount: Decimal, hash: &str) {
        self.gateway.add_transfer(
            hash,
            TokenType::Usdt,
            VerifiedTransfer {
                from_address: Address([n; 20]),
                confirmed_amount: amount,
                destination_address: TREASURY,
            },
        );
        let (status, _) = self
            .call(
                "POST",
                "/deposit",
                Some(json!({ "tx_hash": hash, "token": "USDT" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
    }
}

fn amount(value: &Value) -> Decimal {
    value
        .as_str()
        .map(|raw| raw.parse().unwrap())
        .or_else(|| value.as_f64().map(|f| Decimal::try_from(f).unwrap()))
        .unwrap()
}

// =============================================================================
// HEALTH
// =============================================================================

#[tokio::test]
async fn health_reports_ok() {
    let api = Api::new();
    let (status, body) = api.call("GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["node_id"], "test-node");
    assert_eq!(body["req_total"], 1);
}

#[tokio::test]
async fn metrics_endpoint_is_absent_without_exporter() {
    let api = Api::new();
    let (status, body) = api.call("GET", "/metrics", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
}

// =============================================================================
// USERS
// =============================================================================

#[tokio::test]
async fn registration_errors_are_coded() {
    let api = Api::new();
    api.register(1, None).await;

    let (status, body) = api
        .call("POST", "/users", Some(json!({ "address": addr(1) })))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "user_exists");

    let (status, body) = api
        .call(
            "POST",
            "/users",
            Some(json!({ "address": addr(2), "superior": addr(9) })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "unknown_superior");

    let (status, body) = api.call("GET", &format!("/users/{}", addr(1)), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["address"], addr(1));

    let (status, body) = api.call("GET", &format!("/users/{}", addr(3)), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "unknown_user");

    let (status, body) = api.call("GET", "/users/not-an-address", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_address");
}

#[tokio::test]
async fn stake_raises_cap_and_ancestor_performance() {
    let api = Api::new();
    api.register(1, None).await;
    api.register(2, Some(1)).await;

    let (status, _) = api
        .call(
            "POST",
            "/stake",
            Some(json!({ "address": addr(1), "amount": "10", "level": 0 })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, receipt) = api
        .call(
            "POST",
            "/stake",
            Some(json!({ "address": addr(2), "amount": "100", "level": 0 })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(amount(&receipt["cap_added"]), dec!(200));

    let (_, balance) = api
        .call("GET", &format!("/users/{}/balance", addr(2)), None)
        .await;
    assert_eq!(amount(&balance["token_staked_points"]), dec!(100));
    assert_eq!(amount(&balance["stake_reward_cap"]), dec!(200));

    let (status, perf) = api
        .call("GET", &format!("/users/{}/performance", addr(1)), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(amount(&perf["total_performance"]), dec!(100));
    assert_eq!(amount(&perf["partial_performance"]), dec!(0));
    assert_eq!(perf["descendant_count"], 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn paid_stake_is_committed_once() {
    let api = Api::new();
    api.register(1, None).await;
    api.register(2, Some(1)).await;
    let (status, _) = api
        .call(
            "POST",
            "/stake",
            Some(json!({ "address": addr(1), "amount": "10", "level": 0 })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    api.gateway.add_transfer(
        "0xpaid",
        TokenType::Usdt,
        VerifiedTransfer {
            from_address: Address([2; 20]),
            confirmed_amount: dec!(50),
            destination_address: TREASURY,
        },
    );
    let (status, receipt) = api
        .call("POST", "/stake", Some(json!({ "tx_hash": "0xpaid", "level": 0 })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(amount(&receipt["cap_added"]), dec!(100));

    let (status, body) = api
        .call("POST", "/stake", Some(json!({ "tx_hash": "0xpaid", "level": 0 })))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "transaction_already_processed");

    let (_, perf) = api
        .call("GET", &format!("/users/{}/performance", addr(1)), None)
        .await;
    assert_eq!(amount(&perf["total_performance"]), dec!(50));
}

#[tokio::test]
async fn stake_without_payer_is_rejected() {
    let api = Api::new();
    let (status, body) = api
        .call("POST", "/stake", Some(json!({ "level": 0 })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_request");
}

// =============================================================================
// WITHDRAWALS
// =============================================================================

#[tokio::test]
async fn withdrawal_audit_over_http() {
    let api = Api::new();
    api.register(1, None).await;
    api.deposit(1, dec!(100), "0xdep").await;

    let (status, body) = api
        .call("POST", "/deposit", Some(json!({ "tx_hash": "0xdep", "token": "USDT" })))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "transaction_already_processed");

    let (status, body) = api
        .call(
            "POST",
            "/withdraw",
            Some(json!({ "address": addr(1), "amount": "50", "token": "USDT" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "missing_destination_address");

    let withdraw = json!({
        "address": addr(1),
        "amount": "50",
        "token": "USDT",
        "to_address": addr(7),
    });
    let (status, tx) = api.call("POST", "/withdraw", Some(withdraw.clone())).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(tx["status"], "AUDITING");
    assert_eq!(amount(&tx["fee"]), dec!(0.5));
    let id = tx["id"].as_u64().unwrap();

    let (status, body) = api.call("POST", "/withdraw", Some(withdraw)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "frequent_operation");

    let (status, tx) = api
        .call(
            "POST",
            &format!("/withdrawals/{id}/refuse"),
            Some(json!({ "reason": "kyc" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(tx["status"], "REFUSED");

    let (_, balance) = api
        .call("GET", &format!("/users/{}/balance", addr(1)), None)
        .await;
    assert_eq!(amount(&balance["usdt_points"]), dec!(100));

    let (status, body) = api
        .call("POST", &format!("/withdrawals/{id}/approve"), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "invalid_transaction_state");
}

#[tokio::test]
async fn failed_send_surfaces_as_bad_gateway() {
    let api = Api::new();
    api.register(1, None).await;
    api.deposit(1, dec!(100), "0xdep").await;
    let (_, tx) = api
        .call(
            "POST",
            "/withdraw",
            Some(json!({
                "address": addr(1),
                "amount": "10",
                "token": "USDT",
                "to_address": addr(7),
            })),
        )
        .await;
    let id = tx["id"].as_u64().unwrap();

    api.gateway.fail_sends(Some("node offline"));
    let (status, body) = api
        .call("POST", &format!("/withdrawals/{id}/approve"), None)
        .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["code"], "external_transfer_failure");

    api.gateway.fail_sends(None);
    let (status, tx) = api
        .call("POST", &format!("/withdrawals/{id}/approve"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(tx["status"], "CONFIRMED");
    assert_eq!(api.gateway.sent().len(), 1);
}

#[tokio::test]
async fn claim_with_nothing_pending_is_empty() {
    let api = Api::new();
    api.register(1, None).await;
    let (status, report) = api
        .call(
            "POST",
            "/claim",
            Some(json!({ "address": addr(1), "token": "TOKEN" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["claimed"], 0);
}

// =============================================================================
// SETTLEMENT
// =============================================================================

#[tokio::test]
async fn settlement_runs_once_per_day() {
    let api = Api::new();
    api.register(1, None).await;

    let body = json!({ "year": 2026, "month": 3, "day": 14 });
    let (status, first) = api.call("POST", "/settlement", Some(body.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["status"], "completed");

    let (status, second) = api.call("POST", "/settlement", Some(body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["status"], "already_completed");
    assert_eq!(second["report"]["day"], first["report"]["day"]);
}

#[tokio::test]
async fn partial_settlement_day_is_rejected() {
    let api = Api::new();
    let (status, body) = api
        .call("POST", "/settlement", Some(json!({ "year": 2026 })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_day");
}
