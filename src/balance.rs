// Balance Checking Module - faucet funding and ledger/chain drift
use rust_decimal::Decimal;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;

use crate::config::Network;
use crate::error::{EngineError, Result};
use crate::execution::{from_raw_units, parse_pubkey, to_raw_units, ChainClient, ChainStatus};
use crate::ledger::LedgerStore;
use crate::models::Wallet;

const SOL_DECIMALS: u8 = 9;
/// Devnet and testnet faucets refuse larger single requests.
const MAX_AIRDROP_SOL: i64 = 2;

#[derive(Debug, Serialize, Clone)]
pub struct AirdropReceipt {
    pub user_id: i64,
    pub public_key: String,
    pub signature: String,
    pub amount: Decimal,
    pub wallet_balance: Decimal,
}

#[derive(Debug, Serialize, Clone)]
pub struct BalanceReport {
    pub user_id: i64,
    pub public_key: String,
    pub ledger_balance: Decimal,
    pub on_chain_balance: Decimal,
    /// On-chain minus ledger; non-zero after fees the ledger does not model
    /// or deposits made outside the engine.
    pub drift: Decimal,
    pub tokens: Vec<TokenBalance>,
    pub last_updated: i64,
}

/// Ledger holding next to the wallet's token account for the same mint.
#[derive(Debug, Serialize, Clone)]
pub struct TokenBalance {
    pub coin_id: String,
    pub ledger_amount: Decimal,
    /// Zero when the wallet has no token account for the mint.
    pub on_chain_amount: Decimal,
    pub drift: Decimal,
}

/// Retries transient failures of `op` with exponential backoff: 100ms,
/// 200ms, 400ms, ... Anything else is returned on first sight.
pub async fn retry_with_backoff<T, F, Fut>(label: &str, max_retries: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < max_retries => {
                let delay_ms = 100 * 2_u64.pow(attempt);
                tracing::debug!("Retry {} for {} (delay: {}ms): {}", attempt + 1, label, delay_ms, e);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn user_wallet(ledger: &dyn LedgerStore, user_id: i64) -> Result<Wallet> {
    ledger
        .wallet_for_user(user_id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("wallet for user {}", user_id)))
}

/// Requests faucet SOL for the user's wallet and, once the airdrop lands,
/// credits the ledger balance. Refused on mainnet.
pub async fn fund_testnet_wallet(
    ledger: &dyn LedgerStore,
    chain: &dyn ChainClient,
    network: Network,
    user_id: i64,
    amount_sol: Decimal,
) -> Result<AirdropReceipt> {
    if !network.is_test() {
        return Err(EngineError::Validation(
            "airdrops are only available on devnet and testnet".to_string(),
        ));
    }
    if amount_sol <= Decimal::ZERO || amount_sol > Decimal::from(MAX_AIRDROP_SOL) {
        return Err(EngineError::Validation(format!(
            "airdrop amount must be between 0 and {} SOL",
            MAX_AIRDROP_SOL
        )));
    }

    let wallet = user_wallet(ledger, user_id).await?;
    let pubkey = parse_pubkey(&wallet.public_key)?;
    let lamports = to_raw_units(amount_sol, SOL_DECIMALS)?;

    tracing::info!("💧 Requesting airdrop of {} SOL for {}", amount_sol, wallet.public_key);
    let signature = chain.request_airdrop(&pubkey, lamports).await?;

    retry_with_backoff("airdrop confirmation", 8, || async move {
        match chain.signature_status(&signature).await? {
            ChainStatus::Confirmed { .. } | ChainStatus::Finalized => Ok(()),
            ChainStatus::Failed(failure) => Err(EngineError::ChainExecution(failure)),
            _ => Err(EngineError::Timeout(format!("airdrop {}", signature))),
        }
    })
    .await?;

    let credited = ledger.credit_wallet(user_id, amount_sol).await?;
    tracing::info!("✅ Airdrop {} landed, balance now {}", signature, credited.balance);

    Ok(AirdropReceipt {
        user_id,
        public_key: wallet.public_key,
        signature: signature.to_string(),
        amount: amount_sol,
        wallet_balance: credited.balance,
    })
}

/// Compares the ledger balance with the wallet's on-chain lamports.
pub async fn wallet_balance_report(
    ledger: &dyn LedgerStore,
    chain: &dyn ChainClient,
    user_id: i64,
) -> Result<BalanceReport> {
    let wallet = user_wallet(ledger, user_id).await?;
    let pubkey = parse_pubkey(&wallet.public_key)?;

    let lamports = retry_with_backoff("balance check", 3, || async move {
        chain.native_balance(&pubkey).await
    })
    .await
    .map_err(|e| {
        EngineError::Upstream(format!(
            "Failed to get balance after retries: {}. Try again in a moment.",
            e
        ))
    })?;
    let on_chain_balance = from_raw_units(lamports, SOL_DECIMALS);

    let mut tokens = Vec::new();
    for holding in ledger.portfolio(user_id).await? {
        let Some(coin) = ledger.find_coin(&holding.coin_id).await? else {
            tracing::warn!("⚠️ Holding {} has no tracked coin", holding.coin_id);
            continue;
        };
        let mint = parse_pubkey(&coin.mint)?;
        let raw = retry_with_backoff("token balance", 3, || async move {
            chain.token_balance(&pubkey, &mint).await
        })
        .await?;
        let on_chain_amount = raw.map_or(Decimal::ZERO, |r| from_raw_units(r, coin.decimals()));
        tokens.push(TokenBalance {
            coin_id: holding.coin_id,
            ledger_amount: holding.amount,
            on_chain_amount,
            drift: on_chain_amount - holding.amount,
        });
    }

    Ok(BalanceReport {
        user_id,
        public_key: wallet.public_key,
        ledger_balance: wallet.balance,
        on_chain_balance,
        drift: on_chain_balance - wallet.balance,
        tokens,
        last_updated: chrono::Utc::now().timestamp(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChainFailure;
    use crate::models::PortfolioAsset;
    use crate::testing::{seeded_ledger, ScriptedChain, BONK, USER, WIF};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn mainnet_airdrop_is_refused() {
        let ledger = seeded_ledger(dec!(0)).await;
        let chain = ScriptedChain::new();
        let err = fund_testnet_wallet(&ledger, &chain, Network::Mainnet, USER, dec!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(chain.airdrops().is_empty());
    }

    #[tokio::test]
    async fn devnet_airdrop_credits_ledger_once_landed() {
        let ledger = seeded_ledger(dec!(0.5)).await;
        let chain = ScriptedChain::new().with_statuses(vec![
            ChainStatus::NotFound,
            ChainStatus::Confirmed { confirmations: 1 },
        ]);
        let receipt = fund_testnet_wallet(&ledger, &chain, Network::Devnet, USER, dec!(1.5))
            .await
            .unwrap();
        assert_eq!(receipt.wallet_balance, dec!(2.0));
        assert_eq!(chain.airdrops(), vec![1_500_000_000]);
    }

    #[tokio::test]
    async fn rejected_airdrop_stops_at_first_status() {
        let ledger = seeded_ledger(dec!(0)).await;
        let chain = ScriptedChain::new()
            .with_statuses(vec![ChainStatus::Failed(ChainFailure::InsufficientFunds)]);
        let err = fund_testnet_wallet(&ledger, &chain, Network::Devnet, USER, dec!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ChainExecution(ChainFailure::InsufficientFunds)));
        assert_eq!(chain.status_checks(), 1);
        assert_eq!(ledger.wallet_for_user(USER).await.unwrap().unwrap().balance, dec!(0));
    }

    #[tokio::test]
    async fn oversized_airdrop_is_rejected() {
        let ledger = seeded_ledger(dec!(0)).await;
        let chain = ScriptedChain::new();
        let err = fund_testnet_wallet(&ledger, &chain, Network::Testnet, USER, dec!(5))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn balance_report_retries_and_reports_drift() {
        let ledger = seeded_ledger(dec!(1)).await;
        let chain = ScriptedChain::new().with_lamports(1_250_000_000).failing_balance_reads(2);
        let report = wallet_balance_report(&ledger, &chain, USER).await.unwrap();
        assert_eq!(report.on_chain_balance, dec!(1.25));
        assert_eq!(report.drift, dec!(0.25));
    }

    #[tokio::test]
    async fn balance_report_compares_token_accounts() {
        let ledger = seeded_ledger(dec!(1)).await;
        for (coin, amount) in [(BONK, dec!(100)), (WIF, dec!(3))] {
            ledger
                .set_holding(PortfolioAsset {
                    user_id: USER,
                    coin_id: coin.to_string(),
                    amount,
                    average_buy_price: dec!(0.1),
                })
                .await;
        }
        // BONK at 5 decimals; no WIF token account on chain
        let chain = ScriptedChain::new()
            .with_lamports(1_000_000_000)
            .with_token_balance(BONK, 9_950_000);

        let report = wallet_balance_report(&ledger, &chain, USER).await.unwrap();
        assert_eq!(report.tokens.len(), 2);
        let bonk = report.tokens.iter().find(|t| t.coin_id == BONK).unwrap();
        assert_eq!(bonk.on_chain_amount, dec!(99.5));
        assert_eq!(bonk.drift, dec!(-0.5));
        let wif = report.tokens.iter().find(|t| t.coin_id == WIF).unwrap();
        assert_eq!(wif.on_chain_amount, dec!(0));
        assert_eq!(wif.drift, dec!(-3));
    }

    #[tokio::test]
    async fn balance_report_gives_up_after_retries() {
        let ledger = seeded_ledger(dec!(1)).await;
        let chain = ScriptedChain::new().failing_balance_reads(5);
        assert!(matches!(
            wallet_balance_report(&ledger, &chain, USER).await,
            Err(EngineError::Upstream(_))
        ));
    }
}
