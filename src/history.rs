// Transaction History Module
use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::Result;
use crate::ledger::LedgerStore;
use crate::models::{Trade, TradeSide, TradeStatus};
use crate::portfolio::replay_realized;

#[derive(Debug, Serialize)]
pub struct TradeHistory {
    pub user_id: i64,
    /// Newest first.
    pub trades: Vec<Trade>,
    pub total_trades: usize,
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
    pub buys: usize,
    pub sells: usize,
    pub swaps: usize,
    /// Completed notional in the base asset.
    pub total_volume: Decimal,
    pub total_fees: Decimal,
    pub realized_pnl: Decimal,
}

pub fn summarize(user_id: i64, trades: &[Trade], limit: usize) -> TradeHistory {
    let count = |status: TradeStatus| trades.iter().filter(|t| t.status == status).count();
    let completed: Vec<&Trade> = trades
        .iter()
        .filter(|t| t.status == TradeStatus::Completed)
        .collect();
    let sides = |side: TradeSide| completed.iter().filter(|t| t.side == side).count();

    let mut newest = trades.to_vec();
    newest.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    newest.truncate(limit);

    TradeHistory {
        user_id,
        total_trades: trades.len(),
        pending: count(TradeStatus::Pending),
        completed: completed.len(),
        failed: count(TradeStatus::Failed),
        buys: sides(TradeSide::Buy),
        sells: sides(TradeSide::Sell),
        swaps: sides(TradeSide::Swap),
        total_volume: completed.iter().map(|t| t.notional()).sum(),
        total_fees: completed.iter().map(|t| t.fee).sum(),
        realized_pnl: replay_realized(trades).iter().filter_map(|r| r.pnl).sum(),
        trades: newest,
    }
}

pub async fn user_history(ledger: &dyn LedgerStore, user_id: i64, limit: usize) -> Result<TradeHistory> {
    let trades = ledger.trades_for_user(user_id).await?;
    Ok(summarize(user_id, &trades, limit))
}
