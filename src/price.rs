// Price Fetching Module - DexScreener backed price provider
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{EngineError, Result};
use crate::ledger::LedgerStore;
use crate::models::{Coin, PricePoint};

/// DexScreener accepts at most this many addresses per token lookup.
const MAX_TOKENS_PER_REQUEST: usize = 30;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TokenPrice {
    pub mint: String,
    pub symbol: Option<String>,
    pub name: Option<String>,
    pub price_usd: Decimal,
    pub volume_24h_usd: Decimal,
    pub liquidity_usd: Decimal,
    pub market_cap_usd: Decimal,
    pub price_change_24h: f64,
    pub fetched_at: DateTime<Utc>,
}

#[async_trait]
pub trait PriceProvider: Send + Sync {
    /// Current prices for every mint the provider knows, in one round trip.
    /// Unknown mints are simply absent from the map.
    async fn prices(&self, mints: &[&str]) -> Result<HashMap<String, TokenPrice>>;
}

// ==================== DEXSCREENER ====================

#[derive(Debug, Deserialize)]
struct TokensResponse {
    #[serde(default)]
    pairs: Option<Vec<Pair>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Pair {
    chain_id: String,
    base_token: PairToken,
    price_usd: Option<String>,
    #[serde(default)]
    volume: Option<Window>,
    #[serde(default)]
    price_change: Option<Window>,
    #[serde(default)]
    liquidity: Option<Liquidity>,
    #[serde(default)]
    market_cap: Option<f64>,
    #[serde(default)]
    fdv: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct PairToken {
    address: String,
    name: Option<String>,
    symbol: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Window {
    h24: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct Liquidity {
    usd: Option<f64>,
}

fn to_decimal(value: Option<f64>) -> Decimal {
    value.and_then(Decimal::from_f64).unwrap_or(Decimal::ZERO)
}

impl Pair {
    fn liquidity_usd(&self) -> Decimal {
        to_decimal(self.liquidity.as_ref().and_then(|l| l.usd))
    }

    fn into_price(self, fetched_at: DateTime<Utc>) -> Option<TokenPrice> {
        let price_usd = self
            .price_usd
            .as_deref()
            .and_then(|p| Decimal::from_str(p).ok())?;
        Some(TokenPrice {
            liquidity_usd: self.liquidity_usd(),
            mint: self.base_token.address,
            symbol: self.base_token.symbol,
            name: self.base_token.name,
            price_usd,
            volume_24h_usd: to_decimal(self.volume.and_then(|v| v.h24)),
            market_cap_usd: to_decimal(self.market_cap.or(self.fdv)),
            price_change_24h: self.price_change.and_then(|p| p.h24).unwrap_or(0.0),
            fetched_at,
        })
    }
}

/// Keeps, for each requested mint, the most liquid Solana pair quoting it as
/// the base token.
fn best_prices(pairs: Vec<Pair>, mints: &[&str]) -> HashMap<String, TokenPrice> {
    let now = Utc::now();
    let mut best: HashMap<String, Pair> = HashMap::new();
    for pair in pairs {
        if pair.chain_id != "solana" || !mints.contains(&pair.base_token.address.as_str()) {
            continue;
        }
        let replace = match best.get(&pair.base_token.address) {
            Some(current) => pair.liquidity_usd() > current.liquidity_usd(),
            None => true,
        };
        if replace {
            best.insert(pair.base_token.address.clone(), pair);
        }
    }
    best.into_iter()
        .filter_map(|(mint, pair)| pair.into_price(now).map(|p| (mint, p)))
        .collect()
}

pub struct DexScreenerPrices {
    http: reqwest::Client,
    base_url: String,
}

impl DexScreenerPrices {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl PriceProvider for DexScreenerPrices {
    async fn prices(&self, mints: &[&str]) -> Result<HashMap<String, TokenPrice>> {
        let mut out = HashMap::new();
        for chunk in mints.chunks(MAX_TOKENS_PER_REQUEST) {
            let url = format!("{}/tokens/{}", self.base_url, chunk.join(","));
            let response = self.http.get(&url).send().await?;
            if !response.status().is_success() {
                return Err(EngineError::Upstream(format!(
                    "DexScreener API error: {}",
                    response.status()
                )));
            }
            let body: TokensResponse = response.json().await?;
            let pairs = body.pairs.unwrap_or_default();
            if pairs.is_empty() {
                tracing::warn!("⚠️ No trading pairs found for {} token(s)", chunk.len());
            }
            out.extend(best_prices(pairs, chunk));
        }
        Ok(out)
    }
}

// ==================== LEDGER REFRESH ====================

/// Starts tracking a coin, filling symbol and name from the provider.
pub async fn track_coin(
    ledger: &dyn LedgerStore,
    prices: &dyn PriceProvider,
    mint: &str,
    decimals: u8,
) -> Result<Coin> {
    let quote = prices
        .prices(&[mint])
        .await?
        .remove(mint)
        .ok_or_else(|| EngineError::NotFound(format!("no price for token {}", mint)))?;

    let coin = Coin {
        mint: mint.to_string(),
        symbol: quote.symbol.clone().unwrap_or_else(|| mint.chars().take(6).collect()),
        name: quote.name.clone().unwrap_or_default(),
        decimals: decimals as i16,
        current_price_usd: quote.price_usd,
        market_cap_usd: quote.market_cap_usd,
        volume_24h_usd: quote.volume_24h_usd,
        updated_at: quote.fetched_at,
    };
    ledger.upsert_coin(&coin).await?;
    ledger
        .record_price(&PricePoint {
            coin_id: coin.mint.clone(),
            price_usd: coin.current_price_usd,
            recorded_at: coin.updated_at,
        })
        .await?;
    tracing::info!("🪙 Tracking {} ({}) at ${}", coin.symbol, coin.mint, coin.current_price_usd);
    Ok(coin)
}

/// Refreshes every known coin and appends a history point per update.
/// Returns how many coins received a new price.
pub async fn refresh_coin_prices(
    ledger: &dyn LedgerStore,
    prices: &dyn PriceProvider,
) -> Result<usize> {
    let coins = ledger.list_coins().await?;
    if coins.is_empty() {
        return Ok(0);
    }
    let mints: Vec<&str> = coins.iter().map(|c| c.mint.as_str()).collect();
    let mut fresh = prices.prices(&mints).await?;

    let mut updated = 0;
    for coin in &coins {
        let Some(quote) = fresh.remove(&coin.mint) else {
            tracing::debug!("No price for {} this round", coin.symbol);
            continue;
        };
        let refreshed = Coin {
            current_price_usd: quote.price_usd,
            market_cap_usd: quote.market_cap_usd,
            volume_24h_usd: quote.volume_24h_usd,
            updated_at: quote.fetched_at,
            ..coin.clone()
        };
        ledger.upsert_coin(&refreshed).await?;
        ledger
            .record_price(&PricePoint {
                coin_id: coin.mint.clone(),
                price_usd: quote.price_usd,
                recorded_at: quote.fetched_at,
            })
            .await?;
        updated += 1;
    }
    Ok(updated)
}
