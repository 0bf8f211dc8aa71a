// Ledger Store - wallets, holdings and trade lifecycle persistence
//
// Every mutation of Wallet / PortfolioAsset / Trade goes through this trait.
// Implementations must run `open_trade` and `settle_trade` atomically and
// serialize them per user.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::models::{Coin, PortfolioAsset, PricePoint, Trade, TradeSide, TradeStatus, Wallet};
use crate::portfolio::{apply_buy, apply_sell, realized_pnl};

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn find_coin(&self, mint: &str) -> Result<Option<Coin>>;
    async fn list_coins(&self) -> Result<Vec<Coin>>;
    async fn upsert_coin(&self, coin: &Coin) -> Result<()>;
    /// Appends to price history and moves the coin's current price.
    async fn record_price(&self, point: &PricePoint) -> Result<()>;

    async fn create_wallet(&self, wallet: &Wallet) -> Result<()>;
    async fn wallet_for_user(&self, user_id: i64) -> Result<Option<Wallet>>;
    /// Adds funds that arrived from outside the engine (faucet, deposit).
    async fn credit_wallet(&self, user_id: i64, amount: Decimal) -> Result<Wallet>;

    async fn holding(&self, user_id: i64, coin_id: &str) -> Result<Option<PortfolioAsset>>;
    async fn portfolio(&self, user_id: i64) -> Result<Vec<PortfolioAsset>>;

    /// Checks funds under the user's lock (counting other pending trades as
    /// reserved) and inserts the trade as `pending`. Nothing is written when
    /// funds are insufficient.
    async fn open_trade(&self, trade: &Trade) -> Result<()>;
    /// Records the signature and routed fill of a still-pending trade.
    async fn attach_submission(
        &self,
        trade_id: Uuid,
        transaction_hash: &str,
        fill: &Fill,
    ) -> Result<()>;
    async fn trade(&self, trade_id: Uuid) -> Result<Option<Trade>>;
    async fn trades_for_user(&self, user_id: i64) -> Result<Vec<Trade>>;
    async fn completed_trades(&self) -> Result<Vec<Trade>>;
    async fn stale_pending_trades(&self, created_before: DateTime<Utc>) -> Result<Vec<Trade>>;
    async fn record_confirmations(&self, trade_id: Uuid, confirmations: u32) -> Result<()>;

    /// Applies a finalized trade to holdings and wallet and completes it, all
    /// or nothing.
    async fn settle_trade(&self, trade_id: Uuid) -> Result<Settlement>;
    /// Marks a pending trade failed; holdings and wallet are untouched.
    async fn fail_trade(&self, trade_id: Uuid, reason: &str) -> Result<Trade>;
}

// ==================== FUNDS CHECK ====================

/// Funds already promised to a user's open trades.
#[derive(Debug, Default, Clone)]
pub struct Reservation {
    pub wallet: Decimal,
    pub holdings: HashMap<String, Decimal>,
}

impl Reservation {
    pub fn from_pending<'a>(pending: impl IntoIterator<Item = &'a Trade>) -> Self {
        let mut reservation = Reservation::default();
        for trade in pending {
            if trade.status != TradeStatus::Pending {
                continue;
            }
            reservation.wallet += trade.wallet_requirement();
            if let Some((coin, amount)) = trade.holding_requirement() {
                *reservation.holdings.entry(coin.to_string()).or_default() += amount;
            }
        }
        reservation
    }
}

pub fn check_funds(
    trade: &Trade,
    wallet: &Wallet,
    holding: Option<&PortfolioAsset>,
    reserved: &Reservation,
) -> Result<()> {
    let available = wallet.balance - reserved.wallet;
    let required = trade.wallet_requirement();
    if required > available {
        return Err(EngineError::insufficient(required, available.max(Decimal::ZERO)));
    }

    if let Some((coin, amount)) = trade.holding_requirement() {
        let held = holding.map(|h| h.amount).unwrap_or(Decimal::ZERO);
        let locked = reserved.holdings.get(coin).copied().unwrap_or(Decimal::ZERO);
        let available = held - locked;
        if amount > available {
            return Err(EngineError::insufficient(
                format!("{} {}", amount, coin),
                format!("{} {}", available.max(Decimal::ZERO), coin),
            ));
        }
    }
    Ok(())
}

// ==================== SETTLEMENT PLAN ====================

#[derive(Debug, Clone, Serialize)]
pub struct Settlement {
    pub trade: Trade,
    pub wallet_balance: Decimal,
    /// Holding the trade sold from (sells and swaps).
    pub sold: Option<PortfolioAsset>,
    /// Holding the trade bought into (buys and swaps).
    pub bought: Option<PortfolioAsset>,
    pub realized_pnl: Option<Decimal>,
}

/// Routed execution of a pending trade, recorded before it is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fill {
    pub to_amount: Decimal,
    pub from_price: Decimal,
    pub to_price: Decimal,
}

impl Fill {
    /// Effective prices from the routed output. Sells book the base asset the
    /// route returns; buys and swaps carry the value spent into the cost basis.
    pub fn from_route(trade: &Trade, routed: Decimal) -> Result<Self> {
        if routed <= Decimal::ZERO {
            return Err(EngineError::Upstream("route returned no output".to_string()));
        }
        let out_of_range = || EngineError::Validation("routed amount out of range".to_string());
        let (from_price, to_price) = match trade.side {
            TradeSide::Sell => (
                routed.checked_div(trade.from_amount).ok_or_else(out_of_range)?,
                trade.to_price,
            ),
            TradeSide::Buy | TradeSide::Swap => (
                trade.from_price,
                trade.notional().checked_div(routed).ok_or_else(out_of_range)?,
            ),
        };
        Ok(Fill {
            to_amount: routed,
            from_price,
            to_price,
        })
    }
}

/// Computes every row a finalized trade changes without writing anything.
pub fn plan_settlement(
    trade: &Trade,
    wallet: &Wallet,
    from_holding: Option<PortfolioAsset>,
    to_holding: Option<PortfolioAsset>,
    now: DateTime<Utc>,
) -> Result<Settlement> {
    ensure_pending(trade, TradeStatus::Completed)?;

    let mut sold = None;
    let mut realized = None;
    if let Some((coin, amount)) = trade.holding_requirement() {
        let held = from_holding.unwrap_or_else(|| PortfolioAsset::empty(trade.user_id, coin));
        realized = Some(realized_pnl(amount, trade.from_price, held.average_buy_price));
        sold = Some(apply_sell(&held, amount)?);
    }

    let bought = if trade.side == TradeSide::Sell {
        None
    } else {
        let held =
            to_holding.unwrap_or_else(|| PortfolioAsset::empty(trade.user_id, &trade.to_coin));
        Some(apply_buy(&held, trade.to_amount, trade.to_price))
    };

    let delta = match trade.side {
        TradeSide::Buy => -(trade.notional() + trade.fee),
        TradeSide::Sell => trade.notional() - trade.fee,
        TradeSide::Swap => -trade.fee,
    };
    let wallet_balance = wallet.balance + delta;
    if wallet_balance < Decimal::ZERO {
        return Err(EngineError::insufficient(-delta, wallet.balance));
    }

    let mut completed = trade.clone();
    completed.status = TradeStatus::Completed;
    completed.completed_at = Some(now);
    completed.error = None;

    Ok(Settlement {
        trade: completed,
        wallet_balance,
        sold,
        bought,
        realized_pnl: realized,
    })
}

pub fn ensure_pending(trade: &Trade, target: TradeStatus) -> Result<()> {
    if trade.status.is_terminal() {
        return Err(EngineError::InvalidTransition {
            trade_id: trade.id,
            status: trade.status.to_string(),
            target: target.to_string(),
        });
    }
    Ok(())
}

// ==================== IN-MEMORY STORE ====================

#[derive(Debug, Default, Clone)]
struct LedgerState {
    coins: HashMap<String, Coin>,
    prices: Vec<PricePoint>,
    wallets: HashMap<i64, Wallet>,
    holdings: HashMap<(i64, String), PortfolioAsset>,
    trades: HashMap<Uuid, Trade>,
}

/// Process-local store behind the same contract as Postgres. One lock
/// serializes all writers; settlement is staged on a copy and swapped in.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: RwLock<LedgerState>,
    fail_next_settlement: AtomicBool,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next settlement fail after its holding writes but before the
    /// trade row is completed.
    #[cfg(test)]
    pub fn inject_settlement_fault(&self) {
        self.fail_next_settlement.store(true, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub async fn set_holding(&self, asset: PortfolioAsset) {
        let mut state = self.state.write().await;
        state
            .holdings
            .insert((asset.user_id, asset.coin_id.clone()), asset);
    }

    #[cfg(test)]
    pub async fn price_history(&self, coin_id: &str) -> Vec<PricePoint> {
        let state = self.state.read().await;
        state
            .prices
            .iter()
            .filter(|p| p.coin_id == coin_id)
            .cloned()
            .collect()
    }
}

fn sorted_trades<'a>(trades: impl Iterator<Item = &'a Trade>) -> Vec<Trade> {
    let mut out: Vec<Trade> = trades.cloned().collect();
    out.sort_by_key(|t| t.created_at);
    out
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn find_coin(&self, mint: &str) -> Result<Option<Coin>> {
        Ok(self.state.read().await.coins.get(mint).cloned())
    }

    async fn list_coins(&self) -> Result<Vec<Coin>> {
        let mut coins: Vec<Coin> = self.state.read().await.coins.values().cloned().collect();
        coins.sort_by(|a, b| a.mint.cmp(&b.mint));
        Ok(coins)
    }

    async fn upsert_coin(&self, coin: &Coin) -> Result<()> {
        self.state
            .write()
            .await
            .coins
            .insert(coin.mint.clone(), coin.clone());
        Ok(())
    }

    async fn record_price(&self, point: &PricePoint) -> Result<()> {
        let mut state = self.state.write().await;
        let coin = state
            .coins
            .get_mut(&point.coin_id)
            .ok_or_else(|| EngineError::NotFound(format!("coin {}", point.coin_id)))?;
        coin.current_price_usd = point.price_usd;
        coin.updated_at = point.recorded_at;
        state.prices.push(point.clone());
        Ok(())
    }

    async fn create_wallet(&self, wallet: &Wallet) -> Result<()> {
        let mut state = self.state.write().await;
        if state.wallets.contains_key(&wallet.user_id) {
            return Err(EngineError::Validation(format!(
                "user {} already has a wallet",
                wallet.user_id
            )));
        }
        state.wallets.insert(wallet.user_id, wallet.clone());
        Ok(())
    }

    async fn wallet_for_user(&self, user_id: i64) -> Result<Option<Wallet>> {
        Ok(self.state.read().await.wallets.get(&user_id).cloned())
    }

    async fn credit_wallet(&self, user_id: i64, amount: Decimal) -> Result<Wallet> {
        let mut state = self.state.write().await;
        let wallet = state
            .wallets
            .get_mut(&user_id)
            .ok_or_else(|| EngineError::NotFound(format!("wallet for user {}", user_id)))?;
        wallet.balance += amount;
        wallet.last_updated = Utc::now();
        Ok(wallet.clone())
    }

    async fn holding(&self, user_id: i64, coin_id: &str) -> Result<Option<PortfolioAsset>> {
        Ok(self
            .state
            .read()
            .await
            .holdings
            .get(&(user_id, coin_id.to_string()))
            .cloned())
    }

    async fn portfolio(&self, user_id: i64) -> Result<Vec<PortfolioAsset>> {
        let state = self.state.read().await;
        let mut assets: Vec<PortfolioAsset> = state
            .holdings
            .values()
            .filter(|h| h.user_id == user_id)
            .cloned()
            .collect();
        assets.sort_by(|a, b| a.coin_id.cmp(&b.coin_id));
        Ok(assets)
    }

    async fn open_trade(&self, trade: &Trade) -> Result<()> {
        let mut state = self.state.write().await;
        let wallet = state
            .wallets
            .get(&trade.user_id)
            .ok_or_else(|| EngineError::NotFound(format!("wallet for user {}", trade.user_id)))?;
        let reserved = Reservation::from_pending(
            state.trades.values().filter(|t| t.user_id == trade.user_id),
        );
        let holding = trade
            .holding_requirement()
            .and_then(|(coin, _)| state.holdings.get(&(trade.user_id, coin.to_string())));
        check_funds(trade, wallet, holding, &reserved)?;

        let mut pending = trade.clone();
        pending.status = TradeStatus::Pending;
        state.trades.insert(pending.id, pending);
        Ok(())
    }

    async fn attach_submission(
        &self,
        trade_id: Uuid,
        transaction_hash: &str,
        fill: &Fill,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let trade = state
            .trades
            .get_mut(&trade_id)
            .ok_or_else(|| EngineError::NotFound(format!("trade {}", trade_id)))?;
        ensure_pending(trade, TradeStatus::Pending)?;
        trade.transaction_hash = Some(transaction_hash.to_string());
        trade.to_amount = fill.to_amount;
        trade.from_price = fill.from_price;
        trade.to_price = fill.to_price;
        Ok(())
    }

    async fn trade(&self, trade_id: Uuid) -> Result<Option<Trade>> {
        Ok(self.state.read().await.trades.get(&trade_id).cloned())
    }

    async fn trades_for_user(&self, user_id: i64) -> Result<Vec<Trade>> {
        let state = self.state.read().await;
        Ok(sorted_trades(
            state.trades.values().filter(|t| t.user_id == user_id),
        ))
    }

    async fn completed_trades(&self) -> Result<Vec<Trade>> {
        let state = self.state.read().await;
        Ok(sorted_trades(
            state
                .trades
                .values()
                .filter(|t| t.status == TradeStatus::Completed),
        ))
    }

    async fn stale_pending_trades(&self, created_before: DateTime<Utc>) -> Result<Vec<Trade>> {
        let state = self.state.read().await;
        Ok(sorted_trades(state.trades.values().filter(|t| {
            t.status == TradeStatus::Pending && t.created_at < created_before
        })))
    }

    async fn record_confirmations(&self, trade_id: Uuid, confirmations: u32) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(trade) = state.trades.get_mut(&trade_id) {
            if trade.status == TradeStatus::Pending {
                trade.confirmations = confirmations.min(i32::MAX as u32) as i32;
            }
        }
        Ok(())
    }

    async fn settle_trade(&self, trade_id: Uuid) -> Result<Settlement> {
        let mut state = self.state.write().await;
        let trade = state
            .trades
            .get(&trade_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("trade {}", trade_id)))?;
        let wallet = state
            .wallets
            .get(&trade.user_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("wallet for user {}", trade.user_id)))?;
        let from_holding = state
            .holdings
            .get(&(trade.user_id, trade.from_coin.clone()))
            .cloned();
        let to_holding = state
            .holdings
            .get(&(trade.user_id, trade.to_coin.clone()))
            .cloned();

        let now = Utc::now();
        let settlement = plan_settlement(&trade, &wallet, from_holding, to_holding, now)?;

        let mut staged = state.clone();
        if let Some(w) = staged.wallets.get_mut(&trade.user_id) {
            w.balance = settlement.wallet_balance;
            w.last_updated = now;
        }
        for asset in settlement.sold.iter().chain(settlement.bought.iter()) {
            staged
                .holdings
                .insert((asset.user_id, asset.coin_id.clone()), asset.clone());
        }
        if self.fail_next_settlement.swap(false, Ordering::SeqCst) {
            return Err(EngineError::Database(sqlx::Error::Protocol(
                "injected settlement fault".to_string(),
            )));
        }
        staged.trades.insert(trade_id, settlement.trade.clone());

        *state = staged;
        Ok(settlement)
    }

    async fn fail_trade(&self, trade_id: Uuid, reason: &str) -> Result<Trade> {
        let mut state = self.state.write().await;
        let trade = state
            .trades
            .get_mut(&trade_id)
            .ok_or_else(|| EngineError::NotFound(format!("trade {}", trade_id)))?;
        ensure_pending(trade, TradeStatus::Failed)?;
        trade.status = TradeStatus::Failed;
        trade.error = Some(reason.to_string());
        trade.completed_at = Some(Utc::now());
        Ok(trade.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{base_trade, seeded_ledger, tolerance, BONK, USER};
    use rust_decimal_macros::dec;

    async fn open_and_settle(ledger: &MemoryLedger, trade: Trade) -> Result<Settlement> {
        ledger.open_trade(&trade).await?;
        ledger.settle_trade(trade.id).await
    }

    #[tokio::test]
    async fn buy_into_empty_portfolio() {
        let ledger = seeded_ledger(dec!(100)).await;
        let buy = base_trade(TradeSide::Buy, dec!(100), dec!(0.1), dec!(0));
        open_and_settle(&ledger, buy).await.unwrap();

        let held = ledger.holding(USER, BONK).await.unwrap().unwrap();
        assert_eq!(held.amount, dec!(100));
        assert_eq!(held.average_buy_price, dec!(0.1));
        let wallet = ledger.wallet_for_user(USER).await.unwrap().unwrap();
        assert_eq!(wallet.balance, dec!(90));
    }

    #[tokio::test]
    async fn buy_sell_scenario_conserves_balances() {
        let ledger = seeded_ledger(dec!(100)).await;
        open_and_settle(&ledger, base_trade(TradeSide::Buy, dec!(100), dec!(0.1), dec!(0)))
            .await
            .unwrap();
        open_and_settle(&ledger, base_trade(TradeSide::Buy, dec!(50), dec!(0.2), dec!(0)))
            .await
            .unwrap();

        let held = ledger.holding(USER, BONK).await.unwrap().unwrap();
        assert_eq!(held.amount, dec!(150));
        let avg = (dec!(100) * dec!(0.1) + dec!(50) * dec!(0.2)) / dec!(150);
        assert!((held.average_buy_price - avg).abs() < tolerance());

        let sell = base_trade(TradeSide::Sell, dec!(60), dec!(0.3), dec!(0));
        let settlement = open_and_settle(&ledger, sell).await.unwrap();
        assert!((settlement.realized_pnl.unwrap() - dec!(10)).abs() < tolerance());

        let held = ledger.holding(USER, BONK).await.unwrap().unwrap();
        assert_eq!(held.amount, dec!(90));
        assert!((held.average_buy_price - avg).abs() < tolerance());

        // 100 - 10 - 10 + 18
        let wallet = ledger.wallet_for_user(USER).await.unwrap().unwrap();
        assert_eq!(wallet.balance, dec!(98));
    }

    #[tokio::test]
    async fn oversell_is_rejected_without_writes() {
        let ledger = seeded_ledger(dec!(100)).await;
        ledger
            .set_holding(PortfolioAsset {
                user_id: USER,
                coin_id: BONK.into(),
                amount: dec!(90),
                average_buy_price: dec!(0.1),
            })
            .await;

        let sell = base_trade(TradeSide::Sell, dec!(1000), dec!(0.3), dec!(0));
        let err = ledger.open_trade(&sell).await.unwrap_err();
        assert!(matches!(err, EngineError::InsufficientBalance { .. }));
        assert!(ledger.trade(sell.id).await.unwrap().is_none());
        assert_eq!(ledger.holding(USER, BONK).await.unwrap().unwrap().amount, dec!(90));
    }

    #[tokio::test]
    async fn pending_sells_reserve_the_holding() {
        let ledger = seeded_ledger(dec!(100)).await;
        ledger
            .set_holding(PortfolioAsset {
                user_id: USER,
                coin_id: BONK.into(),
                amount: dec!(90),
                average_buy_price: dec!(0.1),
            })
            .await;

        let first = base_trade(TradeSide::Sell, dec!(60), dec!(0.3), dec!(0));
        ledger.open_trade(&first).await.unwrap();
        let second = base_trade(TradeSide::Sell, dec!(60), dec!(0.3), dec!(0));
        assert!(matches!(
            ledger.open_trade(&second).await,
            Err(EngineError::InsufficientBalance { .. })
        ));
    }

    #[tokio::test]
    async fn pending_buys_reserve_the_wallet() {
        let ledger = seeded_ledger(dec!(15)).await;
        let first = base_trade(TradeSide::Buy, dec!(100), dec!(0.1), dec!(0.01));
        ledger.open_trade(&first).await.unwrap();
        let second = base_trade(TradeSide::Buy, dec!(100), dec!(0.1), dec!(0.01));
        assert!(matches!(
            ledger.open_trade(&second).await,
            Err(EngineError::InsufficientBalance { .. })
        ));
    }

    #[tokio::test]
    async fn terminal_status_is_written_once() {
        let ledger = seeded_ledger(dec!(100)).await;
        let buy = base_trade(TradeSide::Buy, dec!(10), dec!(0.1), dec!(0));
        open_and_settle(&ledger, buy.clone()).await.unwrap();

        assert!(matches!(
            ledger.fail_trade(buy.id, "late failure").await,
            Err(EngineError::InvalidTransition { .. })
        ));
        assert!(matches!(
            ledger.settle_trade(buy.id).await,
            Err(EngineError::InvalidTransition { .. })
        ));
        let stored = ledger.trade(buy.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TradeStatus::Completed);
        assert_eq!(ledger.holding(USER, BONK).await.unwrap().unwrap().amount, dec!(10));

        let other = base_trade(TradeSide::Buy, dec!(10), dec!(0.1), dec!(0));
        ledger.open_trade(&other).await.unwrap();
        ledger.fail_trade(other.id, "slippage").await.unwrap();
        assert!(matches!(
            ledger.settle_trade(other.id).await,
            Err(EngineError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn interrupted_settlement_changes_nothing() {
        let ledger = seeded_ledger(dec!(100)).await;
        let buy = base_trade(TradeSide::Buy, dec!(100), dec!(0.1), dec!(0.01));
        ledger.open_trade(&buy).await.unwrap();

        ledger.inject_settlement_fault();
        assert!(matches!(
            ledger.settle_trade(buy.id).await,
            Err(EngineError::Database(_))
        ));

        assert!(ledger.holding(USER, BONK).await.unwrap().is_none());
        let wallet = ledger.wallet_for_user(USER).await.unwrap().unwrap();
        assert_eq!(wallet.balance, dec!(100));
        let stored = ledger.trade(buy.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TradeStatus::Pending);

        // The fault is one-shot; a retry settles cleanly.
        ledger.settle_trade(buy.id).await.unwrap();
        assert_eq!(ledger.holding(USER, BONK).await.unwrap().unwrap().amount, dec!(100));
    }

    #[tokio::test]
    async fn failed_trade_leaves_ledger_untouched() {
        let ledger = seeded_ledger(dec!(100)).await;
        let buy = base_trade(TradeSide::Buy, dec!(100), dec!(0.1), dec!(0));
        ledger.open_trade(&buy).await.unwrap();
        let failed = ledger.fail_trade(buy.id, "slippage tolerance exceeded").await.unwrap();

        assert_eq!(failed.status, TradeStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("slippage tolerance exceeded"));
        assert!(ledger.holding(USER, BONK).await.unwrap().is_none());
        assert_eq!(
            ledger.wallet_for_user(USER).await.unwrap().unwrap().balance,
            dec!(100)
        );
    }
}
