// Reconciliation Sweep - resolves trades whose poller gave up or died
use chrono::{DateTime, Utc};
use serde::Serialize;
use solana_sdk::signature::Signature;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::ReconcilePolicy;
use crate::error::{EngineError, Result};
use crate::execution::{ChainClient, ChainStatus};
use crate::ledger::LedgerStore;
use crate::models::Trade;

pub const NEVER_SUBMITTED: &str = "never submitted";
pub const EXPIRED: &str = "expired: transaction not found on chain";

#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
pub struct ReconcileReport {
    pub examined: usize,
    pub settled: usize,
    pub failed: usize,
    pub expired: usize,
    pub left_pending: usize,
    pub errors: usize,
}

#[derive(Clone)]
pub struct Reconciler {
    ledger: Arc<dyn LedgerStore>,
    chain: Arc<dyn ChainClient>,
    policy: ReconcilePolicy,
}

enum Resolution {
    Settled,
    Failed,
    Expired,
    Pending,
}

fn chrono_duration(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}

impl Reconciler {
    pub fn new(ledger: Arc<dyn LedgerStore>, chain: Arc<dyn ChainClient>, policy: ReconcilePolicy) -> Self {
        Self {
            ledger,
            chain,
            policy,
        }
    }

    /// One pass over pending trades older than `stale_after`.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<ReconcileReport> {
        let cutoff = now - chrono_duration(self.policy.stale_after);
        let stale = self.ledger.stale_pending_trades(cutoff).await?;

        let mut report = ReconcileReport {
            examined: stale.len(),
            ..Default::default()
        };
        for trade in &stale {
            match self.resolve(trade, now).await {
                Ok(Resolution::Settled) => report.settled += 1,
                Ok(Resolution::Failed) => report.failed += 1,
                Ok(Resolution::Expired) => report.expired += 1,
                Ok(Resolution::Pending) => report.left_pending += 1,
                // Someone else finished it between the read and the write.
                Err(EngineError::InvalidTransition { .. }) => {}
                Err(e) => {
                    tracing::warn!("⚠️ Could not reconcile trade {}: {}", trade.id, e);
                    report.errors += 1;
                }
            }
        }
        Ok(report)
    }

    async fn resolve(&self, trade: &Trade, now: DateTime<Utc>) -> Result<Resolution> {
        let Some(hash) = trade.transaction_hash.as_deref() else {
            self.ledger.fail_trade(trade.id, NEVER_SUBMITTED).await?;
            return Ok(Resolution::Failed);
        };
        let signature = match Signature::from_str(hash) {
            Ok(signature) => signature,
            Err(_) => {
                self.ledger
                    .fail_trade(trade.id, &format!("invalid transaction hash {}", hash))
                    .await?;
                return Ok(Resolution::Failed);
            }
        };

        match self.chain.signature_status(&signature).await? {
            ChainStatus::Finalized => {
                self.ledger.settle_trade(trade.id).await?;
                tracing::info!("✅ Reconciled trade {} as completed", trade.id);
                Ok(Resolution::Settled)
            }
            ChainStatus::Failed(failure) => {
                self.ledger.fail_trade(trade.id, &failure.to_string()).await?;
                tracing::info!("Reconciled trade {} as failed: {}", trade.id, failure);
                Ok(Resolution::Failed)
            }
            ChainStatus::NotFound if now - trade.created_at >= chrono_duration(self.policy.expire_after) => {
                self.ledger.fail_trade(trade.id, EXPIRED).await?;
                tracing::warn!("⌛ Trade {} expired without landing", trade.id);
                Ok(Resolution::Expired)
            }
            ChainStatus::Processed { confirmations } | ChainStatus::Confirmed { confirmations } => {
                self.ledger.record_confirmations(trade.id, confirmations).await?;
                Ok(Resolution::Pending)
            }
            ChainStatus::NotFound => Ok(Resolution::Pending),
        }
    }

    /// Sweeps forever on the configured interval.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.policy.interval);
        loop {
            ticker.tick().await;
            match self.sweep_once(Utc::now()).await {
                Ok(report) if report.examined > 0 => {
                    tracing::info!("🧹 Reconciliation sweep: {:?}", report);
                }
                Ok(_) => {}
                Err(e) => tracing::error!("❌ Reconciliation sweep failed: {}", e),
            }
        }
    }
}
