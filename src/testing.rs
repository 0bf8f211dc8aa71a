// Test fakes shared by the unit tests
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use solana_sdk::{
    message::{Message, VersionedMessage},
    pubkey::Pubkey,
    signature::Signature,
    system_instruction,
    transaction::VersionedTransaction,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use crate::config::WRAPPED_SOL_MINT;
use crate::error::{ChainFailure, EngineError, Result};
use crate::execution::{ChainClient, ChainStatus, SwapOrder, UnsignedSwap};
use crate::ledger::{LedgerStore, MemoryLedger};
use crate::models::{Coin, Trade, TradeSide, TradeStatus};
use crate::price::{PriceProvider, TokenPrice};
use crate::wallet::{provision_wallet, MasterKeyVault};

pub const USER: i64 = 1;
pub const SOL: &str = WRAPPED_SOL_MINT;
pub const BONK: &str = "DezXAZ8z7PnrnRJjz3wXBoRgixCa6xjnB7YaB1pPB263";
pub const WIF: &str = "EKpQGSJtjMFqKZ9KQanSqYXRcF8fBopzLHYxdM65zcjm";

pub fn tolerance() -> Decimal {
    Decimal::new(1, 6)
}

pub fn test_vault() -> MasterKeyVault {
    MasterKeyVault::new("unit-test-master-key-0123456789").expect("test key is long enough")
}

fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
}

pub fn coin(mint: &str, symbol: &str, decimals: i16, price_usd: Decimal, volume: Decimal) -> Coin {
    Coin {
        mint: mint.to_string(),
        symbol: symbol.to_string(),
        name: symbol.to_string(),
        decimals,
        current_price_usd: price_usd,
        market_cap_usd: Decimal::ZERO,
        volume_24h_usd: volume,
        updated_at: Utc::now(),
    }
}

/// SOL at $100 and BONK at $10 (0.1 SOL), plus USER's wallet holding
/// `balance` SOL on the ledger.
pub async fn seeded_ledger(balance: Decimal) -> MemoryLedger {
    let ledger = MemoryLedger::new();
    ledger
        .upsert_coin(&coin(SOL, "SOL", 9, Decimal::from(100), Decimal::from(50_000_000)))
        .await
        .unwrap();
    ledger
        .upsert_coin(&coin(BONK, "BONK", 5, Decimal::from(10), Decimal::from(1_000_000)))
        .await
        .unwrap();
    ledger
        .upsert_coin(&coin(WIF, "WIF", 6, Decimal::from(2), Decimal::from(500_000)))
        .await
        .unwrap();
    provision_wallet(&ledger, &test_vault(), USER, None).await.unwrap();
    if !balance.is_zero() {
        ledger.credit_wallet(USER, balance).await.unwrap();
    }
    ledger
}

/// A pending BONK trade for USER priced in SOL. `amount` is BONK units.
pub fn base_trade(side: TradeSide, amount: Decimal, price: Decimal, fee: Decimal) -> Trade {
    let (from_coin, to_coin, from_amount, to_amount, from_price, to_price) = match side {
        TradeSide::Buy => (SOL, BONK, amount * price, amount, Decimal::ONE, price),
        _ => (BONK, SOL, amount, amount * price, price, Decimal::ONE),
    };
    Trade {
        id: Uuid::new_v4(),
        user_id: USER,
        side,
        from_coin: from_coin.to_string(),
        to_coin: to_coin.to_string(),
        from_amount,
        to_amount,
        from_price,
        to_price,
        fee,
        slippage_bps: 50,
        status: TradeStatus::Pending,
        transaction_hash: None,
        confirmations: 0,
        error: None,
        created_at: Utc::now(),
        completed_at: None,
    }
}

/// A completed buy or sell of `coin`, finished `minute_offset` minutes after
/// a fixed epoch.
pub fn completed_trade(
    user_id: i64,
    side: TradeSide,
    coin: &str,
    amount: Decimal,
    price: Decimal,
    minute_offset: i64,
) -> Trade {
    let at = epoch() + Duration::minutes(minute_offset);
    let mut trade = base_trade(side, amount, price, Decimal::ZERO);
    trade.user_id = user_id;
    match side {
        TradeSide::Buy => trade.to_coin = coin.to_string(),
        _ => trade.from_coin = coin.to_string(),
    }
    trade.status = TradeStatus::Completed;
    trade.created_at = at;
    trade.completed_at = Some(at);
    trade
}

// ==================== PRICE FAKE ====================

#[derive(Default)]
pub struct FakePrices {
    prices: Mutex<HashMap<String, TokenPrice>>,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl FakePrices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, mint: &str, price_usd: Decimal, volume_24h_usd: Decimal) -> Self {
        self.set(mint, price_usd, volume_24h_usd);
        self
    }

    /// SOL $100, BONK $10, WIF $2: matches `seeded_ledger`.
    pub fn seeded() -> Self {
        Self::new()
            .with(SOL, Decimal::from(100), Decimal::from(50_000_000))
            .with(BONK, Decimal::from(10), Decimal::from(1_000_000))
            .with(WIF, Decimal::from(2), Decimal::from(500_000))
    }

    pub fn set(&self, mint: &str, price_usd: Decimal, volume_24h_usd: Decimal) {
        self.prices.lock().unwrap().insert(
            mint.to_string(),
            TokenPrice {
                mint: mint.to_string(),
                symbol: Some(mint.chars().take(4).collect()),
                name: None,
                price_usd,
                volume_24h_usd,
                liquidity_usd: volume_24h_usd,
                market_cap_usd: Decimal::ZERO,
                price_change_24h: 0.0,
                fetched_at: Utc::now(),
            },
        );
    }

    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PriceProvider for FakePrices {
    async fn prices(&self, mints: &[&str]) -> Result<HashMap<String, TokenPrice>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(EngineError::Upstream("DexScreener API error: 503".to_string()));
        }
        let prices = self.prices.lock().unwrap();
        Ok(mints
            .iter()
            .filter_map(|m| prices.get(*m).map(|p| (m.to_string(), p.clone())))
            .collect())
    }
}

// ==================== CHAIN FAKE ====================

/// Chain that replays a script of statuses. Once the script runs out the
/// last status repeats (`NotFound` if none was given).
pub struct ScriptedChain {
    out_amount: u64,
    statuses: Mutex<VecDeque<ChainStatus>>,
    last_status: Mutex<ChainStatus>,
    build_failure: Option<String>,
    send_failure: Option<ChainFailure>,
    lamports: u64,
    balance_failures: AtomicU32,
    token_balances: HashMap<Pubkey, u64>,
    status_checks: AtomicUsize,
    airdrops: Mutex<Vec<u64>>,
    orders: Mutex<Vec<SwapOrder>>,
    sent: Mutex<Vec<Signature>>,
}

impl ScriptedChain {
    pub fn new() -> Self {
        Self {
            out_amount: 0,
            statuses: Mutex::new(VecDeque::new()),
            last_status: Mutex::new(ChainStatus::NotFound),
            build_failure: None,
            send_failure: None,
            lamports: 0,
            balance_failures: AtomicU32::new(0),
            token_balances: HashMap::new(),
            status_checks: AtomicUsize::new(0),
            airdrops: Mutex::new(Vec::new()),
            orders: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn with_statuses(self, statuses: Vec<ChainStatus>) -> Self {
        *self.statuses.lock().unwrap() = statuses.into();
        self
    }

    pub fn with_out_amount(mut self, raw: u64) -> Self {
        self.out_amount = raw;
        self
    }

    pub fn with_lamports(mut self, lamports: u64) -> Self {
        self.lamports = lamports;
        self
    }

    pub fn failing_build(mut self, reason: &str) -> Self {
        self.build_failure = Some(reason.to_string());
        self
    }

    pub fn failing_send(mut self, failure: ChainFailure) -> Self {
        self.send_failure = Some(failure);
        self
    }

    pub fn failing_balance_reads(self, times: u32) -> Self {
        self.balance_failures.store(times, Ordering::SeqCst);
        self
    }

    /// `mint` must be valid base58; test mints are.
    pub fn with_token_balance(mut self, mint: &str, raw: u64) -> Self {
        let mint: Pubkey = mint.parse().expect("test mint parses");
        self.token_balances.insert(mint, raw);
        self
    }

    pub fn status_checks(&self) -> usize {
        self.status_checks.load(Ordering::SeqCst)
    }

    pub fn airdrops(&self) -> Vec<u64> {
        self.airdrops.lock().unwrap().clone()
    }

    pub fn orders(&self) -> Vec<SwapOrder> {
        self.orders.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<Signature> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChainClient for ScriptedChain {
    async fn build_swap(&self, order: &SwapOrder) -> Result<UnsignedSwap> {
        self.orders.lock().unwrap().push(order.clone());
        if let Some(reason) = &self.build_failure {
            return Err(EngineError::Upstream(reason.clone()));
        }
        let payer = order.user_public_key;
        let message = Message::new(
            &[system_instruction::transfer(&payer, &Pubkey::new_unique(), 1)],
            Some(&payer),
        );
        Ok(UnsignedSwap {
            transaction: VersionedTransaction {
                signatures: vec![Signature::default()],
                message: VersionedMessage::Legacy(message),
            },
            out_amount: self.out_amount,
            min_out_amount: self.out_amount,
        })
    }

    async fn send(&self, transaction: &VersionedTransaction) -> Result<Signature> {
        if let Some(failure) = &self.send_failure {
            return Err(EngineError::ChainExecution(failure.clone()));
        }
        let signature = transaction.signatures[0];
        self.sent.lock().unwrap().push(signature);
        Ok(signature)
    }

    async fn signature_status(&self, _signature: &Signature) -> Result<ChainStatus> {
        self.status_checks.fetch_add(1, Ordering::SeqCst);
        let next = self.statuses.lock().unwrap().pop_front();
        let mut last = self.last_status.lock().unwrap();
        if let Some(status) = next {
            *last = status;
        }
        Ok(last.clone())
    }

    async fn native_balance(&self, _owner: &Pubkey) -> Result<u64> {
        let remaining = self.balance_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.balance_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(EngineError::Upstream("Solana RPC: connection reset".to_string()));
        }
        Ok(self.lamports)
    }

    async fn token_balance(&self, _owner: &Pubkey, mint: &Pubkey) -> Result<Option<u64>> {
        Ok(self.token_balances.get(mint).copied())
    }

    async fn request_airdrop(&self, _to: &Pubkey, lamports: u64) -> Result<Signature> {
        self.airdrops.lock().unwrap().push(lamports);
        Ok(Signature::new_unique())
    }
}
