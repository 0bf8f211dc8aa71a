// Quote Engine - price a swap between two tracked coins
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::ledger::LedgerStore;
use crate::models::{Coin, TradeSide};
use crate::price::{PriceProvider, TokenPrice};

#[derive(Debug, Clone, Serialize)]
pub struct Quote {
    pub from_coin: String,
    pub to_coin: String,
    pub from_symbol: String,
    pub to_symbol: String,
    pub side: TradeSide,
    pub amount: Decimal,
    pub from_price_usd: Decimal,
    pub to_price_usd: Decimal,
    /// Prices in the base asset, as stored on trades.
    pub from_price: Decimal,
    pub to_price: Decimal,
    pub exchange_rate: Decimal,
    pub estimated_output: Decimal,
    pub fee_usd: Decimal,
    /// Platform fee in the base asset.
    pub fee: Decimal,
    pub price_impact_pct: Decimal,
    #[serde(skip)]
    pub from_decimals: u8,
    #[serde(skip)]
    pub to_decimals: u8,
    pub quoted_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct QuoteService {
    ledger: Arc<dyn LedgerStore>,
    prices: Arc<dyn PriceProvider>,
    base_mint: String,
    fee_rate: Decimal,
}

fn usd_price(prices: &std::collections::HashMap<String, TokenPrice>, mint: &str) -> Result<TokenPrice> {
    match prices.get(mint) {
        Some(p) if p.price_usd > Decimal::ZERO => Ok(p.clone()),
        Some(_) => Err(EngineError::Upstream(format!("zero price reported for {}", mint))),
        None => Err(EngineError::Upstream(format!("no price available for {}", mint))),
    }
}

/// Share of a pool's daily volume this trade represents, capped at 100%.
fn leg_impact(value_usd: Decimal, volume_24h_usd: Decimal) -> Decimal {
    if volume_24h_usd <= Decimal::ZERO {
        return Decimal::ONE_HUNDRED;
    }
    value_usd
        .checked_div(volume_24h_usd)
        .and_then(|share| share.checked_mul(Decimal::ONE_HUNDRED))
        .map_or(Decimal::ONE_HUNDRED, |pct| pct.min(Decimal::ONE_HUNDRED))
}

fn out_of_range() -> EngineError {
    EngineError::Validation("amount out of range".to_string())
}

impl QuoteService {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        prices: Arc<dyn PriceProvider>,
        base_mint: impl Into<String>,
        fee_rate: Decimal,
    ) -> Self {
        Self {
            ledger,
            prices,
            base_mint: base_mint.into(),
            fee_rate,
        }
    }

    pub fn base_mint(&self) -> &str {
        &self.base_mint
    }

    async fn coin(&self, mint: &str) -> Result<Coin> {
        self.ledger
            .find_coin(mint)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("coin {}", mint)))
    }

    pub async fn get_quote(&self, from: &str, to: &str, amount: Decimal) -> Result<Quote> {
        if amount <= Decimal::ZERO {
            return Err(EngineError::Validation("amount must be positive".to_string()));
        }
        if from == to {
            return Err(EngineError::Validation(
                "from and to must be different coins".to_string(),
            ));
        }
        let from_coin = self.coin(from).await?;
        let to_coin = self.coin(to).await?;

        let mut mints = vec![from, to];
        if from != self.base_mint && to != self.base_mint {
            mints.push(self.base_mint.as_str());
        }
        let fresh = self.prices.prices(&mints).await?;
        let from_px = usd_price(&fresh, from)?;
        let to_px = usd_price(&fresh, to)?;
        let base_usd = usd_price(&fresh, &self.base_mint)?.price_usd;

        let exchange_rate = from_px
            .price_usd
            .checked_div(to_px.price_usd)
            .ok_or_else(out_of_range)?;
        let estimated_output = amount.checked_mul(exchange_rate).ok_or_else(out_of_range)?;
        let value_usd = amount.checked_mul(from_px.price_usd).ok_or_else(out_of_range)?;
        let fee_usd = value_usd.checked_mul(self.fee_rate).ok_or_else(out_of_range)?;
        let from_price = from_px.price_usd.checked_div(base_usd).ok_or_else(out_of_range)?;
        let to_price = to_px.price_usd.checked_div(base_usd).ok_or_else(out_of_range)?;
        let fee = fee_usd.checked_div(base_usd).ok_or_else(out_of_range)?;
        // The ledger later multiplies these back out; refuse what it cannot hold.
        amount.checked_mul(from_price).ok_or_else(out_of_range)?;
        estimated_output.checked_mul(to_price).ok_or_else(out_of_range)?;

        let price_impact_pct = [(from, &from_px), (to, &to_px)]
            .iter()
            .filter(|(mint, _)| *mint != self.base_mint)
            .map(|(_, px)| leg_impact(value_usd, px.volume_24h_usd))
            .max()
            .unwrap_or(Decimal::ZERO)
            .round_dp(4);

        let from_decimals = from_coin.decimals();
        let to_decimals = to_coin.decimals();
        Ok(Quote {
            from_coin: from.to_string(),
            to_coin: to.to_string(),
            from_symbol: from_coin.symbol,
            to_symbol: to_coin.symbol,
            side: TradeSide::classify(from, to, &self.base_mint),
            amount,
            from_price_usd: from_px.price_usd,
            to_price_usd: to_px.price_usd,
            from_price,
            to_price,
            exchange_rate,
            estimated_output,
            fee_usd,
            fee,
            price_impact_pct,
            from_decimals,
            to_decimals,
            quoted_at: Utc::now(),
        })
    }
}
