// Ledger Entities - coins, wallets, holdings and trades
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::EngineError;

// ==================== COINS ====================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Coin {
    pub mint: String,
    pub symbol: String,
    pub name: String,
    pub decimals: i16,
    pub current_price_usd: Decimal,
    pub market_cap_usd: Decimal,
    pub volume_24h_usd: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl Coin {
    pub fn decimals(&self) -> u8 {
        self.decimals.clamp(0, 18) as u8
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PricePoint {
    pub coin_id: String,
    pub price_usd: Decimal,
    pub recorded_at: DateTime<Utc>,
}

// ==================== WALLETS ====================
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Wallet {
    pub id: Uuid,
    pub user_id: i64,
    pub public_key: String,
    #[serde(skip_serializing, default)]
    pub encrypted_private_key: String,
    /// Base-asset balance as tracked by the ledger.
    pub balance: Decimal,
    pub last_updated: DateTime<Utc>,
}

// ==================== HOLDINGS ====================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PortfolioAsset {
    pub user_id: i64,
    pub coin_id: String,
    pub amount: Decimal,
    pub average_buy_price: Decimal,
}

impl PortfolioAsset {
    pub fn empty(user_id: i64, coin_id: &str) -> Self {
        Self {
            user_id,
            coin_id: coin_id.to_string(),
            amount: Decimal::ZERO,
            average_buy_price: Decimal::ZERO,
        }
    }
}

// ==================== TRADES ====================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
    Swap,
}

impl TradeSide {
    /// Buying spends the base asset, selling receives it, swaps touch two coins.
    pub fn classify(from: &str, to: &str, base_mint: &str) -> Self {
        if from == base_mint {
            TradeSide::Buy
        } else if to == base_mint {
            TradeSide::Sell
        } else {
            TradeSide::Swap
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "buy",
            TradeSide::Sell => "sell",
            TradeSide::Swap => "swap",
        }
    }
}

impl FromStr for TradeSide {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(TradeSide::Buy),
            "sell" => Ok(TradeSide::Sell),
            "swap" => Ok(TradeSide::Swap),
            other => Err(EngineError::Validation(format!("unknown trade type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Pending,
    Completed,
    Failed,
}

impl TradeStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TradeStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Pending => "pending",
            TradeStatus::Completed => "completed",
            TradeStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TradeStatus::Pending),
            "completed" => Ok(TradeStatus::Completed),
            "failed" => Ok(TradeStatus::Failed),
            other => Err(EngineError::Validation(format!("unknown trade status: {}", other))),
        }
    }
}

/// One swap attempt. Prices and fee are denominated in the base asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub user_id: i64,
    pub side: TradeSide,
    pub from_coin: String,
    pub to_coin: String,
    pub from_amount: Decimal,
    pub to_amount: Decimal,
    pub from_price: Decimal,
    pub to_price: Decimal,
    pub fee: Decimal,
    pub slippage_bps: i32,
    pub status: TradeStatus,
    pub transaction_hash: Option<String>,
    pub confirmations: i32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Trade {
    /// The non-base coin a buy or sell is about; the bought coin for swaps.
    pub fn coin_id(&self) -> &str {
        match self.side {
            TradeSide::Sell => &self.from_coin,
            TradeSide::Buy | TradeSide::Swap => &self.to_coin,
        }
    }

    /// Traded value in base units (what the wallet pays or receives before fees).
    /// For buys `from_price` is 1, so this is exactly the base amount spent.
    pub fn notional(&self) -> Decimal {
        self.from_amount * self.from_price
    }

    /// Base-asset debit the wallet must cover while the trade is open.
    pub fn wallet_requirement(&self) -> Decimal {
        match self.side {
            TradeSide::Buy => self.notional() + self.fee,
            TradeSide::Sell | TradeSide::Swap => self.fee,
        }
    }

    /// Coin units a sell or swap takes out of a holding.
    pub fn holding_requirement(&self) -> Option<(&str, Decimal)> {
        match self.side {
            TradeSide::Buy => None,
            TradeSide::Sell | TradeSide::Swap => Some((&self.from_coin, self.from_amount)),
        }
    }
}

/// Database row shape; enums travel as text.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TradeRow {
    pub id: Uuid,
    pub user_id: i64,
    pub side: String,
    pub from_coin: String,
    pub to_coin: String,
    pub from_amount: Decimal,
    pub to_amount: Decimal,
    pub from_price: Decimal,
    pub to_price: Decimal,
    pub fee: Decimal,
    pub slippage_bps: i32,
    pub status: String,
    pub transaction_hash: Option<String>,
    pub confirmations: i32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<TradeRow> for Trade {
    type Error = EngineError;

    fn try_from(row: TradeRow) -> Result<Self, Self::Error> {
        Ok(Trade {
            id: row.id,
            user_id: row.user_id,
            side: row.side.parse()?,
            from_coin: row.from_coin,
            to_coin: row.to_coin,
            from_amount: row.from_amount,
            to_amount: row.to_amount,
            from_price: row.from_price,
            to_price: row.to_price,
            fee: row.fee,
            slippage_bps: row.slippage_bps,
            status: row.status.parse()?,
            transaction_hash: row.transaction_hash,
            confirmations: row.confirmations,
            error: row.error,
            created_at: row.created_at,
            completed_at: row.completed_at,
        })
    }
}
