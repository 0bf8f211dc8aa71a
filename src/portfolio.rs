// Portfolio Module - holding math and the portfolio reader
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;

use crate::error::{EngineError, Result};
use crate::ledger::LedgerStore;
use crate::models::{PortfolioAsset, Trade, TradeSide, TradeStatus};

// ==================== HOLDING MATH ====================

/// Adds `amount` bought at `price`, recomputing the volume-weighted average.
pub fn apply_buy(holding: &PortfolioAsset, amount: Decimal, price: Decimal) -> PortfolioAsset {
    let new_amount = holding.amount + amount;
    let average_buy_price = if new_amount.is_zero() {
        Decimal::ZERO
    } else {
        (holding.amount * holding.average_buy_price + amount * price) / new_amount
    };
    PortfolioAsset {
        user_id: holding.user_id,
        coin_id: holding.coin_id.clone(),
        amount: new_amount,
        average_buy_price,
    }
}

/// Removes `amount`; the average buy price is unchanged. Never goes negative.
pub fn apply_sell(holding: &PortfolioAsset, amount: Decimal) -> Result<PortfolioAsset> {
    if amount > holding.amount {
        return Err(EngineError::insufficient(
            format!("{} {}", amount, holding.coin_id),
            format!("{} {}", holding.amount, holding.coin_id),
        ));
    }
    Ok(PortfolioAsset {
        amount: holding.amount - amount,
        ..holding.clone()
    })
}

pub fn realized_pnl(amount: Decimal, sell_price: Decimal, average_buy_price: Decimal) -> Decimal {
    amount * (sell_price - average_buy_price)
}

// ==================== REALIZED P&L REPLAY ====================

/// Outcome of one completed trade once history is replayed in order.
#[derive(Debug, Clone, Serialize)]
pub struct RealizedTrade {
    pub trade_id: uuid::Uuid,
    pub user_id: i64,
    pub coin_id: String,
    pub side: TradeSide,
    /// `None` for buys, which open or extend a position without realizing.
    pub pnl: Option<Decimal>,
    pub volume: Decimal,
    pub fee: Decimal,
    pub completed_at: DateTime<Utc>,
}

/// Replays completed trades oldest-first per user and coin, reconstructing
/// the average buy price at the moment of every sell. Realized P&L is never
/// stored, so this is the single place it is derived from trade rows.
pub fn replay_realized(trades: &[Trade]) -> Vec<RealizedTrade> {
    let mut completed: Vec<&Trade> = trades
        .iter()
        .filter(|t| t.status == TradeStatus::Completed)
        .collect();
    completed.sort_by_key(|t| (t.completed_at.unwrap_or(t.created_at), t.created_at));

    let mut books: HashMap<(i64, String), PortfolioAsset> = HashMap::new();
    let mut out = Vec::with_capacity(completed.len());

    for trade in completed {
        let mut pnl = None;

        if let Some((coin, amount)) = trade.holding_requirement() {
            let key = (trade.user_id, coin.to_string());
            let book = books
                .entry(key)
                .or_insert_with(|| PortfolioAsset::empty(trade.user_id, coin));
            pnl = Some(realized_pnl(amount, trade.from_price, book.average_buy_price));
            // History that starts mid-position can oversell; clamp instead of failing the report.
            book.amount = (book.amount - amount).max(Decimal::ZERO);
        }

        if trade.side != TradeSide::Sell {
            let key = (trade.user_id, trade.to_coin.clone());
            let book = books
                .entry(key)
                .or_insert_with(|| PortfolioAsset::empty(trade.user_id, &trade.to_coin));
            *book = apply_buy(book, trade.to_amount, trade.to_price);
        }

        out.push(RealizedTrade {
            trade_id: trade.id,
            user_id: trade.user_id,
            coin_id: trade.coin_id().to_string(),
            side: trade.side,
            pnl,
            volume: trade.notional(),
            fee: trade.fee,
            completed_at: trade.completed_at.unwrap_or(trade.created_at),
        });
    }

    out
}

// ==================== PORTFOLIO READER ====================

#[derive(Debug, Serialize)]
pub struct HoldingView {
    pub coin_id: String,
    pub symbol: String,
    pub amount: Decimal,
    pub average_buy_price: Decimal,
    pub current_price: Decimal,
    pub market_value: Decimal,
    pub cost_basis: Decimal,
    pub unrealized_pnl: Decimal,
    pub unrealized_pnl_percent: Decimal,
}

#[derive(Debug, Serialize)]
pub struct PortfolioSummary {
    pub user_id: i64,
    pub wallet_balance: Decimal,
    pub holdings: Vec<HoldingView>,
    pub total_value: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub total_fees: Decimal,
    pub timestamp: i64,
}

/// Current holdings valued in the base asset, using the stored coin prices.
pub async fn portfolio_view(
    ledger: &dyn LedgerStore,
    base_mint: &str,
    user_id: i64,
) -> Result<PortfolioSummary> {
    let wallet = ledger
        .wallet_for_user(user_id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("wallet for user {}", user_id)))?;
    let base_usd = ledger
        .find_coin(base_mint)
        .await?
        .map(|c| c.current_price_usd)
        .unwrap_or(Decimal::ZERO);

    let mut holdings = Vec::new();
    for asset in ledger.portfolio(user_id).await? {
        if asset.amount.is_zero() {
            continue;
        }
        let coin = ledger.find_coin(&asset.coin_id).await?;
        let symbol = coin.as_ref().map(|c| c.symbol.clone()).unwrap_or_default();
        let current_price = match coin {
            Some(c) if !base_usd.is_zero() => c.current_price_usd / base_usd,
            _ => Decimal::ZERO,
        };
        let market_value = asset.amount * current_price;
        let cost_basis = asset.amount * asset.average_buy_price;
        let unrealized_pnl = market_value - cost_basis;
        let unrealized_pnl_percent = if cost_basis.is_zero() {
            Decimal::ZERO
        } else {
            (unrealized_pnl / cost_basis * Decimal::ONE_HUNDRED).round_dp(4)
        };
        holdings.push(HoldingView {
            coin_id: asset.coin_id,
            symbol,
            amount: asset.amount,
            average_buy_price: asset.average_buy_price,
            current_price,
            market_value,
            cost_basis,
            unrealized_pnl,
            unrealized_pnl_percent,
        });
    }

    let realized = replay_realized(&ledger.trades_for_user(user_id).await?);
    let realized_pnl: Decimal = realized.iter().filter_map(|r| r.pnl).sum();
    let total_fees: Decimal = realized.iter().map(|r| r.fee).sum();
    let holdings_value: Decimal = holdings.iter().map(|h| h.market_value).sum();
    let unrealized_pnl: Decimal = holdings.iter().map(|h| h.unrealized_pnl).sum();

    Ok(PortfolioSummary {
        user_id,
        wallet_balance: wallet.balance,
        total_value: wallet.balance + holdings_value,
        holdings,
        unrealized_pnl,
        realized_pnl,
        total_fees,
        timestamp: Utc::now().timestamp(),
    })
}
