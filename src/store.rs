// Postgres Ledger - sqlx-backed LedgerStore
//
// open_trade and settle_trade run inside one transaction each and take the
// user's wallet row FOR UPDATE first, so writers for the same user queue up
// behind each other.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::ledger::{
    check_funds, ensure_pending, plan_settlement, Fill, LedgerStore, Reservation, Settlement,
};
use crate::models::{Coin, PortfolioAsset, PricePoint, Trade, TradeRow, TradeStatus, Wallet};

const UNIQUE_VIOLATION: &str = "23505";

pub async fn connect(config: &EngineConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await?;
    tracing::info!("✅ Connected to Postgres ({} max connections)", config.database_max_connections);
    Ok(pool)
}

#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn into_trades(rows: Vec<TradeRow>) -> Result<Vec<Trade>> {
    rows.into_iter().map(Trade::try_from).collect()
}

async fn lock_wallet(tx: &mut Transaction<'_, Postgres>, user_id: i64) -> Result<Wallet> {
    sqlx::query_as::<_, Wallet>("SELECT * FROM wallets WHERE user_id = $1 FOR UPDATE")
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("wallet for user {}", user_id)))
}

async fn locked_holding(
    tx: &mut Transaction<'_, Postgres>,
    user_id: i64,
    coin_id: &str,
) -> Result<Option<PortfolioAsset>> {
    let holding = sqlx::query_as::<_, PortfolioAsset>(
        "SELECT user_id, coin_id, amount, average_buy_price FROM portfolios
         WHERE user_id = $1 AND coin_id = $2 FOR UPDATE",
    )
    .bind(user_id)
    .bind(coin_id)
    .fetch_optional(&mut *tx)
    .await?;
    Ok(holding)
}

async fn write_holding(tx: &mut Transaction<'_, Postgres>, asset: &PortfolioAsset) -> Result<()> {
    sqlx::query(
        "INSERT INTO portfolios (user_id, coin_id, amount, average_buy_price)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (user_id, coin_id) DO UPDATE SET
             amount = EXCLUDED.amount,
             average_buy_price = EXCLUDED.average_buy_price",
    )
    .bind(asset.user_id)
    .bind(&asset.coin_id)
    .bind(asset.amount)
    .bind(asset.average_buy_price)
    .execute(&mut *tx)
    .await?;
    Ok(())
}

async fn fetch_trade(tx: &mut Transaction<'_, Postgres>, trade_id: Uuid) -> Result<Trade> {
    let row = sqlx::query_as::<_, TradeRow>("SELECT * FROM trades WHERE id = $1 FOR UPDATE")
        .bind(trade_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("trade {}", trade_id)))?;
    Trade::try_from(row)
}

#[async_trait]
impl LedgerStore for PgLedger {
    // ==================== COINS ====================
    async fn find_coin(&self, mint: &str) -> Result<Option<Coin>> {
        let coin = sqlx::query_as::<_, Coin>("SELECT * FROM meme_coins WHERE mint = $1")
            .bind(mint)
            .fetch_optional(&self.pool)
            .await?;
        Ok(coin)
    }

    async fn list_coins(&self) -> Result<Vec<Coin>> {
        let coins = sqlx::query_as::<_, Coin>("SELECT * FROM meme_coins ORDER BY mint")
            .fetch_all(&self.pool)
            .await?;
        Ok(coins)
    }

    async fn upsert_coin(&self, coin: &Coin) -> Result<()> {
        sqlx::query(
            "INSERT INTO meme_coins
                (mint, symbol, name, decimals, current_price_usd, market_cap_usd, volume_24h_usd, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (mint) DO UPDATE SET
                symbol = EXCLUDED.symbol,
                name = EXCLUDED.name,
                decimals = EXCLUDED.decimals,
                current_price_usd = EXCLUDED.current_price_usd,
                market_cap_usd = EXCLUDED.market_cap_usd,
                volume_24h_usd = EXCLUDED.volume_24h_usd,
                updated_at = EXCLUDED.updated_at",
        )
        .bind(&coin.mint)
        .bind(&coin.symbol)
        .bind(&coin.name)
        .bind(coin.decimals)
        .bind(coin.current_price_usd)
        .bind(coin.market_cap_usd)
        .bind(coin.volume_24h_usd)
        .bind(coin.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_price(&self, point: &PricePoint) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE meme_coins SET current_price_usd = $2, updated_at = $3 WHERE mint = $1",
        )
        .bind(&point.coin_id)
        .bind(point.price_usd)
        .bind(point.recorded_at)
        .execute(&mut tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(EngineError::NotFound(format!("coin {}", point.coin_id)));
        }
        sqlx::query("INSERT INTO price_history (coin_id, price_usd, recorded_at) VALUES ($1, $2, $3)")
            .bind(&point.coin_id)
            .bind(point.price_usd)
            .bind(point.recorded_at)
            .execute(&mut tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    // ==================== WALLETS ====================
    async fn create_wallet(&self, wallet: &Wallet) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO wallets (id, user_id, public_key, encrypted_private_key, balance, last_updated)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(wallet.id)
        .bind(wallet.user_id)
        .bind(&wallet.public_key)
        .bind(&wallet.encrypted_private_key)
        .bind(wallet.balance)
        .bind(wallet.last_updated)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
                Err(EngineError::Validation(format!(
                    "user {} already has a wallet",
                    wallet.user_id
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn wallet_for_user(&self, user_id: i64) -> Result<Option<Wallet>> {
        let wallet = sqlx::query_as::<_, Wallet>("SELECT * FROM wallets WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(wallet)
    }

    async fn credit_wallet(&self, user_id: i64, amount: Decimal) -> Result<Wallet> {
        sqlx::query_as::<_, Wallet>(
            "UPDATE wallets SET balance = balance + $2, last_updated = NOW()
             WHERE user_id = $1 RETURNING *",
        )
        .bind(user_id)
        .bind(amount)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("wallet for user {}", user_id)))
    }

    // ==================== HOLDINGS ====================
    async fn holding(&self, user_id: i64, coin_id: &str) -> Result<Option<PortfolioAsset>> {
        let holding = sqlx::query_as::<_, PortfolioAsset>(
            "SELECT user_id, coin_id, amount, average_buy_price FROM portfolios
             WHERE user_id = $1 AND coin_id = $2",
        )
        .bind(user_id)
        .bind(coin_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(holding)
    }

    async fn portfolio(&self, user_id: i64) -> Result<Vec<PortfolioAsset>> {
        let assets = sqlx::query_as::<_, PortfolioAsset>(
            "SELECT user_id, coin_id, amount, average_buy_price FROM portfolios
             WHERE user_id = $1 ORDER BY coin_id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(assets)
    }

    // ==================== TRADES ====================
    async fn open_trade(&self, trade: &Trade) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let wallet = lock_wallet(&mut tx, trade.user_id).await?;

        let pending: Vec<TradeRow> =
            sqlx::query_as("SELECT * FROM trades WHERE user_id = $1 AND status = 'pending'")
                .bind(trade.user_id)
                .fetch_all(&mut tx)
                .await?;
        let pending = into_trades(pending)?;
        let reserved = Reservation::from_pending(&pending);

        let holding = match trade.holding_requirement() {
            Some((coin, _)) => locked_holding(&mut tx, trade.user_id, coin).await?,
            None => None,
        };
        check_funds(trade, &wallet, holding.as_ref(), &reserved)?;

        sqlx::query(
            "INSERT INTO trades
                (id, user_id, side, from_coin, to_coin, from_amount, to_amount, from_price, to_price,
                 fee, slippage_bps, status, transaction_hash, confirmations, error, created_at, completed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 'pending', $12, $13, NULL, $14, NULL)",
        )
        .bind(trade.id)
        .bind(trade.user_id)
        .bind(trade.side.as_str())
        .bind(&trade.from_coin)
        .bind(&trade.to_coin)
        .bind(trade.from_amount)
        .bind(trade.to_amount)
        .bind(trade.from_price)
        .bind(trade.to_price)
        .bind(trade.fee)
        .bind(trade.slippage_bps)
        .bind(&trade.transaction_hash)
        .bind(trade.confirmations)
        .bind(trade.created_at)
        .execute(&mut tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn attach_submission(
        &self,
        trade_id: Uuid,
        transaction_hash: &str,
        fill: &Fill,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let trade = fetch_trade(&mut tx, trade_id).await?;
        ensure_pending(&trade, TradeStatus::Pending)?;
        sqlx::query(
            "UPDATE trades SET transaction_hash = $2, to_amount = $3, from_price = $4, to_price = $5
             WHERE id = $1",
        )
        .bind(trade_id)
        .bind(transaction_hash)
        .bind(fill.to_amount)
        .bind(fill.from_price)
        .bind(fill.to_price)
        .execute(&mut tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn trade(&self, trade_id: Uuid) -> Result<Option<Trade>> {
        let row = sqlx::query_as::<_, TradeRow>("SELECT * FROM trades WHERE id = $1")
            .bind(trade_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Trade::try_from).transpose()
    }

    async fn trades_for_user(&self, user_id: i64) -> Result<Vec<Trade>> {
        let rows = sqlx::query_as::<_, TradeRow>(
            "SELECT * FROM trades WHERE user_id = $1 ORDER BY created_at",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        into_trades(rows)
    }

    async fn completed_trades(&self) -> Result<Vec<Trade>> {
        let rows = sqlx::query_as::<_, TradeRow>(
            "SELECT * FROM trades WHERE status = 'completed' ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        into_trades(rows)
    }

    async fn stale_pending_trades(&self, created_before: DateTime<Utc>) -> Result<Vec<Trade>> {
        let rows = sqlx::query_as::<_, TradeRow>(
            "SELECT * FROM trades WHERE status = 'pending' AND created_at < $1 ORDER BY created_at",
        )
        .bind(created_before)
        .fetch_all(&self.pool)
        .await?;
        into_trades(rows)
    }

    async fn record_confirmations(&self, trade_id: Uuid, confirmations: u32) -> Result<()> {
        sqlx::query("UPDATE trades SET confirmations = $2 WHERE id = $1 AND status = 'pending'")
            .bind(trade_id)
            .bind(confirmations.min(i32::MAX as u32) as i32)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn settle_trade(&self, trade_id: Uuid) -> Result<Settlement> {
        let mut tx = self.pool.begin().await?;

        // Wallet first, matching open_trade's lock order.
        let user_id: (i64,) = sqlx::query_as("SELECT user_id FROM trades WHERE id = $1")
            .bind(trade_id)
            .fetch_optional(&mut tx)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("trade {}", trade_id)))?;
        let wallet = lock_wallet(&mut tx, user_id.0).await?;
        let trade = fetch_trade(&mut tx, trade_id).await?;
        let from_holding = locked_holding(&mut tx, trade.user_id, &trade.from_coin).await?;
        let to_holding = locked_holding(&mut tx, trade.user_id, &trade.to_coin).await?;

        let now = Utc::now();
        let settlement = plan_settlement(&trade, &wallet, from_holding, to_holding, now)?;

        for asset in settlement.sold.iter().chain(settlement.bought.iter()) {
            write_holding(&mut tx, asset).await?;
        }
        sqlx::query("UPDATE wallets SET balance = $2, last_updated = $3 WHERE user_id = $1")
            .bind(trade.user_id)
            .bind(settlement.wallet_balance)
            .bind(now)
            .execute(&mut tx)
            .await?;
        sqlx::query(
            "UPDATE trades SET status = 'completed', completed_at = $2, error = NULL WHERE id = $1",
        )
        .bind(trade_id)
        .bind(now)
        .execute(&mut tx)
        .await?;

        tx.commit().await?;
        Ok(settlement)
    }

    async fn fail_trade(&self, trade_id: Uuid, reason: &str) -> Result<Trade> {
        let mut tx = self.pool.begin().await?;
        let mut trade = fetch_trade(&mut tx, trade_id).await?;
        ensure_pending(&trade, TradeStatus::Failed)?;

        let now = Utc::now();
        sqlx::query(
            "UPDATE trades SET status = 'failed', error = $2, completed_at = $3 WHERE id = $1",
        )
        .bind(trade_id)
        .bind(reason)
        .bind(now)
        .execute(&mut tx)
        .await?;
        tx.commit().await?;

        trade.status = TradeStatus::Failed;
        trade.error = Some(reason.to_string());
        trade.completed_at = Some(now);
        Ok(trade)
    }
}
