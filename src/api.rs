// HTTP API - thin axum surface over the engine services
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::balance;
use crate::config::Network;
use crate::error::{EngineError, Result};
use crate::execution::ChainClient;
use crate::history;
use crate::leaderboards::{
    build_leaderboard, get_user_position, LeaderboardMetric, LeaderboardPeriod,
};
use crate::ledger::LedgerStore;
use crate::portfolio::portfolio_view;
use crate::price::{track_coin, PriceProvider};
use crate::quote::QuoteService;
use crate::trade::{TradeRequest, TradeService};
use crate::wallet::{provision_wallet, KeyVault};

// ==================== SHARED STATE ====================
#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<dyn LedgerStore>,
    pub chain: Arc<dyn ChainClient>,
    pub prices: Arc<dyn PriceProvider>,
    pub vault: Arc<dyn KeyVault>,
    pub quotes: QuoteService,
    pub trades: TradeService,
    pub network: Network,
}

// ==================== REQUESTS ====================
#[derive(Debug, Deserialize)]
pub struct QuoteRequest {
    pub from_coin: String,
    pub to_coin: String,
    pub amount: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct WalletRequest {
    pub user_id: i64,
    pub private_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AirdropRequest {
    pub user_id: i64,
    pub amount: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct TrackCoinRequest {
    pub mint: String,
    pub decimals: u8,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct LeaderboardQuery {
    pub period: Option<String>,
    pub metric: Option<String>,
    pub limit: Option<usize>,
    /// Also report where this user stands, even outside the top `limit`.
    pub user_id: Option<i64>,
}

fn ok<T: Serialize>(data: T) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "success": true, "data": data }))
}

// ==================== HANDLERS ====================
async fn health_check() -> &'static str {
    "Swap engine healthy ✅"
}

async fn get_quote(
    State(state): State<AppState>,
    Json(request): Json<QuoteRequest>,
) -> Result<impl IntoResponse> {
    let quote = state
        .quotes
        .get_quote(&request.from_coin, &request.to_coin, request.amount)
        .await?;
    Ok(ok(quote))
}

async fn submit_trade(
    State(state): State<AppState>,
    Json(request): Json<TradeRequest>,
) -> Result<impl IntoResponse> {
    let submitted = state.trades.submit_trade(request).await?;
    Ok((StatusCode::ACCEPTED, ok(submitted)))
}

async fn get_trade(State(state): State<AppState>, Path(trade_id): Path<Uuid>) -> Result<impl IntoResponse> {
    let trade = state
        .ledger
        .trade(trade_id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("trade {}", trade_id)))?;
    Ok(ok(trade))
}

async fn get_portfolio(State(state): State<AppState>, Path(user_id): Path<i64>) -> Result<impl IntoResponse> {
    let summary = portfolio_view(state.ledger.as_ref(), state.quotes.base_mint(), user_id).await?;
    Ok(ok(summary))
}

async fn get_history(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse> {
    let limit = query.limit.unwrap_or(50).min(500);
    let history = history::user_history(state.ledger.as_ref(), user_id, limit).await?;
    Ok(ok(history))
}

async fn get_leaderboard(
    State(state): State<AppState>,
    Query(query): Query<LeaderboardQuery>,
) -> Result<impl IntoResponse> {
    let period: LeaderboardPeriod = query.period.as_deref().unwrap_or("alltime").parse()?;
    let metric: LeaderboardMetric = query.metric.as_deref().unwrap_or("pnl").parse()?;
    let limit = query.limit.unwrap_or(100).min(1000);

    let trades = state.ledger.completed_trades().await?;
    let now = Utc::now();
    let position = query.user_id.and_then(|user_id| {
        let full = build_leaderboard(&trades, period, metric, usize::MAX, now);
        get_user_position(user_id, &full).cloned()
    });
    let board = build_leaderboard(&trades, period, metric, limit, now);
    Ok(Json(serde_json::json!({ "success": true, "data": board, "position": position })))
}

async fn create_wallet(
    State(state): State<AppState>,
    Json(request): Json<WalletRequest>,
) -> Result<impl IntoResponse> {
    let wallet = provision_wallet(
        state.ledger.as_ref(),
        state.vault.as_ref(),
        request.user_id,
        request.private_key.as_deref(),
    )
    .await?;
    Ok((StatusCode::CREATED, ok(wallet)))
}

async fn airdrop(
    State(state): State<AppState>,
    Json(request): Json<AirdropRequest>,
) -> Result<impl IntoResponse> {
    let receipt = balance::fund_testnet_wallet(
        state.ledger.as_ref(),
        state.chain.as_ref(),
        state.network,
        request.user_id,
        request.amount,
    )
    .await?;
    Ok(ok(receipt))
}

async fn get_wallet_balance(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> Result<impl IntoResponse> {
    let report =
        balance::wallet_balance_report(state.ledger.as_ref(), state.chain.as_ref(), user_id).await?;
    Ok(ok(report))
}

async fn add_coin(
    State(state): State<AppState>,
    Json(request): Json<TrackCoinRequest>,
) -> Result<impl IntoResponse> {
    let coin = track_coin(
        state.ledger.as_ref(),
        state.prices.as_ref(),
        &request.mint,
        request.decimals,
    )
    .await?;
    Ok((StatusCode::CREATED, ok(coin)))
}

async fn list_coins(State(state): State<AppState>) -> Result<impl IntoResponse> {
    Ok(ok(state.ledger.list_coins().await?))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/coins", get(list_coins).post(add_coin))
        .route("/api/quote", post(get_quote))
        .route("/api/trades", post(submit_trade))
        .route("/api/trades/:trade_id", get(get_trade))
        .route("/api/portfolio/:user_id", get(get_portfolio))
        .route("/api/history/:user_id", get(get_history))
        .route("/api/leaderboard", get(get_leaderboard))
        .route("/api/wallet", post(create_wallet))
        .route("/api/wallet/airdrop", post(airdrop))
        .route("/api/wallet/balance/:user_id", get(get_wallet_balance))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{fee_rate_from_bps, PollPolicy};
    use crate::execution::ChainStatus;
    use crate::ledger::MemoryLedger;
    use crate::models::TradeSide;
    use crate::testing::{
        base_trade, seeded_ledger, test_vault, FakePrices, ScriptedChain, BONK, SOL, USER,
    };
    use axum::body::Body;
    use axum::http::Request;
    use rust_decimal_macros::dec;
    use serde_json::Value;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn app_with(ledger: Arc<MemoryLedger>, chain: ScriptedChain) -> Router {
        let chain = Arc::new(chain);
        let prices = Arc::new(FakePrices::seeded());
        let vault = Arc::new(test_vault());
        let quotes = QuoteService::new(ledger.clone(), prices.clone(), SOL, fee_rate_from_bps(10));
        let poll = PollPolicy {
            initial_delay: Duration::from_millis(1),
            multiplier: 1.0,
            max_delay: Duration::from_millis(1),
            max_attempts: 5,
        };
        let trades = TradeService::new(
            ledger.clone(),
            chain.clone(),
            vault.clone(),
            quotes.clone(),
            poll,
            50,
        );
        router(AppState {
            ledger,
            chain,
            prices,
            vault,
            quotes,
            trades,
            network: Network::Devnet,
        })
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let body = match body {
            Some(json) => Body::from(json.to_string()),
            None => Body::empty(),
        };
        let response = app.clone().oneshot(request.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn quote_amounts_are_decimal_strings() {
        let app = app_with(Arc::new(seeded_ledger(dec!(100)).await), ScriptedChain::new()).await;
        let (status, body) = call(
            &app,
            "POST",
            "/api/quote",
            Some(serde_json::json!({ "from_coin": SOL, "to_coin": BONK, "amount": "10" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let output: Decimal = body["data"]["estimated_output"].as_str().unwrap().parse().unwrap();
        assert_eq!(output, dec!(100));
        assert_eq!(body["data"]["side"], "buy");
    }

    #[tokio::test]
    async fn trade_is_accepted_then_readable() {
        let ledger = Arc::new(seeded_ledger(dec!(100)).await);
        let chain = ScriptedChain::new()
            .with_out_amount(10_000_000)
            .with_statuses(vec![ChainStatus::Processed { confirmations: 0 }]);
        let app = app_with(ledger, chain).await;

        let (status, body) = call(
            &app,
            "POST",
            "/api/trades",
            Some(serde_json::json!({
                "user_id": USER,
                "from_coin": SOL,
                "to_coin": BONK,
                "amount": "10",
                "slippage_bps": 100
            })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["data"]["status"], "pending");

        let id = body["data"]["trade_id"].as_str().unwrap().to_string();
        let (status, body) = call(&app, "GET", &format!("/api/trades/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["slippage_bps"], 100);
    }

    #[tokio::test]
    async fn errors_map_to_status_codes() {
        let app = app_with(Arc::new(seeded_ledger(dec!(1)).await), ScriptedChain::new()).await;

        let (status, body) = call(
            &app,
            "POST",
            "/api/trades",
            Some(serde_json::json!({
                "user_id": USER, "from_coin": SOL, "to_coin": BONK, "amount": "50"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["success"], false);

        let (status, _) = call(&app, "GET", &format!("/api/trades/{}", Uuid::new_v4()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&app, "GET", "/api/leaderboard?period=yearly", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn wallet_never_exposes_sealed_key() {
        let app = app_with(Arc::new(MemoryLedger::new()), ScriptedChain::new()).await;
        let (status, body) = call(
            &app,
            "POST",
            "/api/wallet",
            Some(serde_json::json!({ "user_id": 42 })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(body["data"]["public_key"].is_string());
        assert!(body["data"].get("encrypted_private_key").is_none());

        let (status, _) = call(
            &app,
            "POST",
            "/api/wallet",
            Some(serde_json::json!({ "user_id": 42 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_and_empty_leaderboard() {
        let app = app_with(Arc::new(MemoryLedger::new()), ScriptedChain::new()).await;
        let (status, _) = call(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(&app, "GET", "/api/leaderboard?period=weekly&metric=volume", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["total_participants"], 0);
    }

    #[tokio::test]
    async fn leaderboard_reports_position_beyond_limit() {
        let ledger = Arc::new(seeded_ledger(dec!(100)).await);
        for trade in [
            base_trade(TradeSide::Buy, dec!(100), dec!(0.1), dec!(0)),
            base_trade(TradeSide::Sell, dec!(100), dec!(0.2), dec!(0)),
        ] {
            ledger.open_trade(&trade).await.unwrap();
            ledger.settle_trade(trade.id).await.unwrap();
        }
        let app = app_with(ledger, ScriptedChain::new()).await;

        let (status, body) = call(&app, "GET", "/api/leaderboard?limit=0&user_id=1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["entries"].as_array().unwrap().len(), 0);
        assert_eq!(body["data"]["total_participants"], 1);
        assert_eq!(body["position"]["rank"], 1);
        assert_eq!(body["position"]["user_id"], USER);

        let (_, body) = call(&app, "GET", "/api/leaderboard?user_id=99", None).await;
        assert!(body["position"].is_null());
    }
}
