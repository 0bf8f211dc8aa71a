// Trade Submission - validate, reserve, route, sign, send
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::PollPolicy;
use crate::error::{EngineError, Result};
use crate::execution::{
    from_raw_units, parse_pubkey, sign_swap, to_raw_units, ChainClient, SwapOrder,
};
use crate::ledger::{Fill, LedgerStore};
use crate::models::{Trade, TradeSide, TradeStatus};
use crate::poller::{ConfirmationPoller, PollOutcome};
use crate::quote::QuoteService;
use crate::wallet::{signing_keypair, KeyVault};

pub const MIN_SLIPPAGE_BPS: u32 = 1;
pub const MAX_SLIPPAGE_BPS: u32 = 5000;

#[derive(Debug, Clone, Deserialize)]
pub struct TradeRequest {
    pub user_id: i64,
    pub from_coin: String,
    pub to_coin: String,
    pub amount: Decimal,
    pub slippage_bps: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmittedTrade {
    pub trade_id: Uuid,
    pub transaction_hash: String,
    pub side: TradeSide,
    pub status: TradeStatus,
    pub from_amount: Decimal,
    pub expected_to_amount: Decimal,
    /// Least the route may deliver before the swap program aborts.
    pub minimum_to_amount: Decimal,
    pub fee: Decimal,
}

#[derive(Clone)]
pub struct TradeService {
    ledger: Arc<dyn LedgerStore>,
    chain: Arc<dyn ChainClient>,
    vault: Arc<dyn KeyVault>,
    quotes: QuoteService,
    poll: PollPolicy,
    default_slippage_bps: u32,
}

impl TradeService {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        chain: Arc<dyn ChainClient>,
        vault: Arc<dyn KeyVault>,
        quotes: QuoteService,
        poll: PollPolicy,
        default_slippage_bps: u32,
    ) -> Self {
        Self {
            ledger,
            chain,
            vault,
            quotes,
            poll,
            default_slippage_bps,
        }
    }

    pub fn poller(&self) -> ConfirmationPoller {
        ConfirmationPoller::new(self.ledger.clone(), self.chain.clone(), self.poll.clone())
    }

    /// Submits the swap and returns as soon as it is on the wire; settlement
    /// happens in the background poller.
    pub async fn submit_trade(&self, request: TradeRequest) -> Result<SubmittedTrade> {
        let (submitted, _poller) = self.submit_and_track(request).await?;
        Ok(submitted)
    }

    /// Like `submit_trade`, also handing back the poller task.
    pub async fn submit_and_track(
        &self,
        request: TradeRequest,
    ) -> Result<(SubmittedTrade, JoinHandle<Result<PollOutcome>>)> {
        let slippage_bps = request.slippage_bps.unwrap_or(self.default_slippage_bps);
        if !(MIN_SLIPPAGE_BPS..=MAX_SLIPPAGE_BPS).contains(&slippage_bps) {
            return Err(EngineError::Validation(format!(
                "slippage must be between {} and {} bps",
                MIN_SLIPPAGE_BPS, MAX_SLIPPAGE_BPS
            )));
        }

        let wallet = self
            .ledger
            .wallet_for_user(request.user_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("wallet for user {}", request.user_id)))?;
        let quote = self
            .quotes
            .get_quote(&request.from_coin, &request.to_coin, request.amount)
            .await?;
        let raw_amount = to_raw_units(request.amount, quote.from_decimals)?;
        let signer = signing_keypair(self.vault.as_ref(), &wallet)?;
        let user_public_key = parse_pubkey(&wallet.public_key)?;

        let trade = Trade {
            id: Uuid::new_v4(),
            user_id: request.user_id,
            side: quote.side,
            from_coin: request.from_coin.clone(),
            to_coin: request.to_coin.clone(),
            from_amount: request.amount,
            to_amount: quote.estimated_output,
            from_price: quote.from_price,
            to_price: quote.to_price,
            fee: quote.fee,
            slippage_bps: slippage_bps as i32,
            status: TradeStatus::Pending,
            transaction_hash: None,
            confirmations: 0,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        self.ledger.open_trade(&trade).await?;
        tracing::info!(
            "📝 Trade {} opened: {} {} {} -> {}",
            trade.id,
            trade.side.as_str(),
            trade.from_amount,
            quote.from_symbol,
            quote.to_symbol
        );

        let order = SwapOrder {
            user_public_key,
            input_mint: request.from_coin,
            output_mint: request.to_coin,
            amount: raw_amount,
            slippage_bps: slippage_bps as u16,
        };
        let routed = self.route_and_send(&trade, &order, quote.to_decimals, &signer).await;
        let (signature, minimum_to_amount) = match routed {
            Ok(sent) => sent,
            Err(e) => {
                let reason = e.to_string();
                if let Err(fail_err) = self.ledger.fail_trade(trade.id, &reason).await {
                    tracing::error!("Failed to mark trade {} failed: {}", trade.id, fail_err);
                }
                tracing::warn!("❌ Trade {} rejected before confirmation: {}", trade.id, reason);
                return Err(e);
            }
        };

        let stored = self
            .ledger
            .trade(trade.id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("trade {}", trade.id)))?;
        let handle = self.poller().spawn(trade.id, signature);

        Ok((
            SubmittedTrade {
                trade_id: trade.id,
                transaction_hash: signature.to_string(),
                side: stored.side,
                status: stored.status,
                from_amount: stored.from_amount,
                expected_to_amount: stored.to_amount,
                minimum_to_amount,
                fee: stored.fee,
            },
            handle,
        ))
    }

    /// Builds, signs and sends the swap. Returns the signature and the
    /// minimum output the route guarantees.
    async fn route_and_send(
        &self,
        trade: &Trade,
        order: &SwapOrder,
        to_decimals: u8,
        signer: &solana_sdk::signature::Keypair,
    ) -> Result<(solana_sdk::signature::Signature, Decimal)> {
        let unsigned = self.chain.build_swap(order).await?;
        let signed = sign_swap(unsigned.transaction, signer)?;
        let signature = signed.signatures[0];

        let fill = Fill::from_route(trade, from_raw_units(unsigned.out_amount, to_decimals))?;
        let minimum = from_raw_units(unsigned.min_out_amount, to_decimals);
        self.ledger
            .attach_submission(trade.id, &signature.to_string(), &fill)
            .await?;

        let signature = self.chain.send(&signed).await?;
        Ok((signature, minimum))
    }
}
