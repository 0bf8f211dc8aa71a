// Operator tool: run one reconciliation sweep over stale pending trades
use chrono::Utc;
use std::sync::Arc;

use swap_engine::config::EngineConfig;
use swap_engine::execution::SolanaChain;
use swap_engine::reconcile::Reconciler;
use swap_engine::store::{self, PgLedger};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    dotenv::dotenv().ok();

    let config = EngineConfig::from_env()?;
    println!("🔍 Reconciling pending trades older than {:?}", config.reconcile.stale_after);

    let pool = store::connect(&config).await?;
    let ledger = Arc::new(PgLedger::new(pool));
    ledger.health_check().await?;
    let chain = Arc::new(SolanaChain::new(
        &config.solana_rpc,
        &config.jupiter_api_url,
        config.jupiter_api_key.as_deref(),
    )?);

    let report = Reconciler::new(ledger, chain, config.reconcile.clone())
        .sweep_once(Utc::now())
        .await?;

    println!("   Examined:     {}", report.examined);
    println!("   ✅ Settled:    {}", report.settled);
    println!("   ❌ Failed:     {}", report.failed);
    println!("   ⌛ Expired:    {}", report.expired);
    println!("   🔄 Pending:    {}", report.left_pending);
    if report.errors > 0 {
        println!("   ⚠️ Errors:     {}", report.errors);
    }
    println!("\n✨ Reconciliation complete!");
    Ok(())
}
