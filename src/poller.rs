// Confirmation Poller - drives a submitted trade to a terminal status
use serde::Serialize;
use solana_sdk::signature::Signature;
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::PollPolicy;
use crate::error::{ChainFailure, EngineError, Result};
use crate::execution::{ChainClient, ChainStatus};
use crate::ledger::{LedgerStore, Settlement};
use crate::models::TradeStatus;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PollOutcome {
    Finalized { settlement: Settlement },
    Failed { reason: String },
    /// Attempts ran out; the trade stays pending for the reconciliation sweep.
    TimedOut { attempts: u32 },
    /// Something else (usually the sweep) already finished the trade.
    AlreadyTerminal { status: TradeStatus },
}

#[derive(Clone)]
pub struct ConfirmationPoller {
    ledger: Arc<dyn LedgerStore>,
    chain: Arc<dyn ChainClient>,
    policy: PollPolicy,
}

impl ConfirmationPoller {
    pub fn new(ledger: Arc<dyn LedgerStore>, chain: Arc<dyn ChainClient>, policy: PollPolicy) -> Self {
        Self {
            ledger,
            chain,
            policy,
        }
    }

    pub fn spawn(self, trade_id: Uuid, signature: Signature) -> JoinHandle<Result<PollOutcome>> {
        tokio::spawn(async move {
            let outcome = self.poll_until_final(trade_id, signature).await;
            if let Err(e) = &outcome {
                tracing::error!("❌ Poller for trade {} stopped: {}", trade_id, e);
            }
            outcome
        })
    }

    pub async fn poll_until_final(&self, trade_id: Uuid, signature: Signature) -> Result<PollOutcome> {
        for attempt in 1..=self.policy.max_attempts {
            tokio::time::sleep(self.policy.delay_for(attempt)).await;

            let status = match self.chain.signature_status(&signature).await {
                Ok(status) => status,
                Err(e) => {
                    tracing::warn!(%trade_id, %signature, attempt, "⚠️ Status check failed: {}", e);
                    continue;
                }
            };

            match status {
                ChainStatus::NotFound => {
                    tracing::debug!(%trade_id, attempt, "Transaction not visible yet");
                }
                ChainStatus::Processed { confirmations } | ChainStatus::Confirmed { confirmations } => {
                    self.ledger.record_confirmations(trade_id, confirmations).await?;
                }
                ChainStatus::Finalized => return self.finalize(trade_id).await,
                ChainStatus::Failed(failure) => return self.fail(trade_id, failure).await,
            }
        }

        tracing::warn!(
            "⏳ Trade {} still pending after {} attempts, leaving it to reconciliation",
            trade_id,
            self.policy.max_attempts
        );
        Ok(PollOutcome::TimedOut {
            attempts: self.policy.max_attempts,
        })
    }

    async fn finalize(&self, trade_id: Uuid) -> Result<PollOutcome> {
        match self.ledger.settle_trade(trade_id).await {
            Ok(settlement) => {
                tracing::info!(
                    "✅ Trade {} finalized: wallet balance {}",
                    trade_id,
                    settlement.wallet_balance
                );
                Ok(PollOutcome::Finalized { settlement })
            }
            Err(EngineError::InvalidTransition { .. }) => self.already_terminal(trade_id).await,
            Err(e) => Err(e),
        }
    }

    async fn fail(&self, trade_id: Uuid, failure: ChainFailure) -> Result<PollOutcome> {
        let reason = failure.to_string();
        match self.ledger.fail_trade(trade_id, &reason).await {
            Ok(_) => {
                tracing::warn!("❌ Trade {} failed on chain: {}", trade_id, reason);
                Ok(PollOutcome::Failed { reason })
            }
            Err(EngineError::InvalidTransition { .. }) => self.already_terminal(trade_id).await,
            Err(e) => Err(e),
        }
    }

    async fn already_terminal(&self, trade_id: Uuid) -> Result<PollOutcome> {
        let trade = self
            .ledger
            .trade(trade_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("trade {}", trade_id)))?;
        Ok(PollOutcome::AlreadyTerminal {
            status: trade.status,
        })
    }
}
