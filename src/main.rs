// Swap Engine - HTTP server, confirmation pollers and background sweeps
use std::sync::Arc;

use swap_engine::api::{self, AppState};
use swap_engine::config::EngineConfig;
use swap_engine::execution::{ChainClient, SolanaChain};
use swap_engine::ledger::LedgerStore;
use swap_engine::price::{self, DexScreenerPrices, PriceProvider};
use swap_engine::quote::QuoteService;
use swap_engine::reconcile::Reconciler;
use swap_engine::store::{self, PgLedger};
use swap_engine::trade::TradeService;
use swap_engine::wallet::{KeyVault, MasterKeyVault};

const BASE_DECIMALS: u8 = 9;

// ==================== BACKGROUND TASKS ====================
async fn refresh_prices(
    ledger: Arc<dyn LedgerStore>,
    prices: Arc<dyn PriceProvider>,
    every: std::time::Duration,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        match price::refresh_coin_prices(ledger.as_ref(), prices.as_ref()).await {
            Ok(updated) => tracing::debug!("🔄 Refreshed {} coin prices", updated),
            Err(e) => tracing::warn!("⚠️ Price refresh failed: {}", e),
        }
    }
}

// ==================== MAIN ====================
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load environment variables
    dotenv::dotenv().ok();

    tracing::info!("🚀 Starting Swap Engine...");

    let config = EngineConfig::from_env()?;
    tracing::info!("🔗 Solana RPC: {} ({:?})", config.solana_rpc, config.network);

    let pool = store::connect(&config).await?;
    let ledger: Arc<dyn LedgerStore> = Arc::new(PgLedger::new(pool));
    let chain: Arc<dyn ChainClient> = Arc::new(SolanaChain::new(
        &config.solana_rpc,
        &config.jupiter_api_url,
        config.jupiter_api_key.as_deref(),
    )?);
    let prices: Arc<dyn PriceProvider> =
        Arc::new(DexScreenerPrices::new(&config.dexscreener_api_url)?);
    let vault: Arc<dyn KeyVault> = Arc::new(MasterKeyVault::new(&config.master_encryption_key)?);

    if ledger.find_coin(&config.base_mint).await?.is_none() {
        let tracked =
            price::track_coin(ledger.as_ref(), prices.as_ref(), &config.base_mint, BASE_DECIMALS).await;
        match tracked {
            Ok(coin) => tracing::info!("✅ Tracking base asset {} ({})", coin.symbol, coin.mint),
            Err(e) => tracing::warn!("⚠️ Could not track base asset yet: {}", e),
        }
    }

    let quotes = QuoteService::new(
        ledger.clone(),
        prices.clone(),
        config.base_mint.clone(),
        config.fee_rate(),
    );
    let trades = TradeService::new(
        ledger.clone(),
        chain.clone(),
        vault.clone(),
        quotes.clone(),
        config.poll.clone(),
        config.default_slippage_bps,
    );

    // Resolve trades whose pollers died with a previous process
    let reconciler = Reconciler::new(ledger.clone(), chain.clone(), config.reconcile.clone());
    tokio::spawn(reconciler.run());
    tokio::spawn(refresh_prices(ledger.clone(), prices.clone(), config.price_refresh));

    let state = AppState {
        ledger,
        chain,
        prices,
        vault,
        quotes,
        trades,
        network: config.network,
    };
    let app = api::router(state);

    let addr = format!("0.0.0.0:{}", config.port);

    tracing::info!("✅ Swap engine running on {}", addr);
    tracing::info!("🧹 Reconciliation every {:?}", config.reconcile.interval);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
