// Engine Configuration - environment driven
use crate::error::{EngineError, Result};
use rust_decimal::Decimal;
use std::time::Duration;

pub const WRAPPED_SOL_MINT: &str = "So11111111111111111111111111111111111111112";
pub const JUPITER_API_URL: &str = "https://quote-api.jup.ag/v6";
pub const DEXSCREENER_API_URL: &str = "https://api.dexscreener.com/latest/dex";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Devnet,
    Testnet,
}

impl Network {
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_lowercase().as_str() {
            "mainnet" | "mainnet-beta" => Ok(Network::Mainnet),
            "devnet" => Ok(Network::Devnet),
            "testnet" => Ok(Network::Testnet),
            other => Err(EngineError::Config(format!("unknown SOLANA_NETWORK: {}", other))),
        }
    }

    /// Devnet and testnet hand out faucet SOL; mainnet never does.
    pub fn is_test(&self) -> bool {
        !matches!(self, Network::Mainnet)
    }

    pub fn default_rpc(&self) -> &'static str {
        match self {
            Network::Mainnet => "https://api.mainnet-beta.solana.com",
            Network::Devnet => "https://api.devnet.solana.com",
            Network::Testnet => "https://api.testnet.solana.com",
        }
    }
}

/// Bounded exponential backoff for confirmation polling.
#[derive(Debug, Clone)]
pub struct PollPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            multiplier: 1.5,
            max_delay: Duration::from_millis(8000),
            max_attempts: 40,
        }
    }
}

impl PollPolicy {
    /// Delay to wait before `attempt` (1-based). The first attempt is immediate.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.powi(attempt as i32 - 2);
        let delay = self.initial_delay.mul_f64(factor.max(1.0));
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct ReconcilePolicy {
    pub interval: Duration,
    /// Pending trades younger than this are still owned by their poller.
    pub stale_after: Duration,
    /// Pending trades the chain has never seen are failed after this age.
    pub expire_after: Duration,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(120),
            expire_after: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub solana_rpc: String,
    pub network: Network,
    pub jupiter_api_url: String,
    pub jupiter_api_key: Option<String>,
    pub dexscreener_api_url: String,
    pub master_encryption_key: String,
    pub base_mint: String,
    pub fee_bps: u32,
    pub default_slippage_bps: u32,
    pub poll: PollPolicy,
    pub reconcile: ReconcilePolicy,
    pub price_refresh: Duration,
    pub port: u16,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn required(key: &str) -> Result<String> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(EngineError::Config(format!("{} must be set", key))),
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let network = Network::parse(
            &std::env::var("SOLANA_NETWORK").unwrap_or_else(|_| "mainnet".to_string()),
        )?;
        let solana_rpc =
            std::env::var("SOLANA_RPC").unwrap_or_else(|_| network.default_rpc().to_string());

        let poll = PollPolicy {
            initial_delay: Duration::from_millis(env_or("POLL_INITIAL_MS", 1000)),
            multiplier: env_or("POLL_MULTIPLIER", 1.5),
            max_delay: Duration::from_millis(env_or("POLL_MAX_MS", 8000)),
            max_attempts: env_or("POLL_MAX_ATTEMPTS", 40),
        };
        if poll.max_attempts == 0 || poll.multiplier < 1.0 {
            return Err(EngineError::Config(
                "POLL_MAX_ATTEMPTS must be > 0 and POLL_MULTIPLIER >= 1".to_string(),
            ));
        }

        let reconcile = ReconcilePolicy {
            interval: Duration::from_secs(env_or("RECONCILE_INTERVAL_SECS", 60)),
            stale_after: Duration::from_secs(env_or("RECONCILE_STALE_SECS", 120)),
            expire_after: Duration::from_secs(env_or("RECONCILE_EXPIRE_SECS", 300)),
        };

        let config = Self {
            database_url: required("DATABASE_URL")?,
            database_max_connections: env_or("DATABASE_MAX_CONNECTIONS", 10),
            solana_rpc,
            network,
            jupiter_api_url: std::env::var("JUPITER_API_URL")
                .unwrap_or_else(|_| JUPITER_API_URL.to_string()),
            jupiter_api_key: std::env::var("JUPITER_API_KEY").ok().filter(|k| !k.is_empty()),
            dexscreener_api_url: std::env::var("DEXSCREENER_API_URL")
                .unwrap_or_else(|_| DEXSCREENER_API_URL.to_string()),
            master_encryption_key: required("MASTER_ENCRYPTION_KEY")?,
            base_mint: std::env::var("BASE_MINT").unwrap_or_else(|_| WRAPPED_SOL_MINT.to_string()),
            fee_bps: env_or("FEE_BPS", 10),
            default_slippage_bps: env_or("DEFAULT_SLIPPAGE_BPS", 50),
            poll,
            reconcile,
            price_refresh: Duration::from_secs(env_or("PRICE_REFRESH_SECS", 30)),
            port: env_or("PORT", 3000),
        };
        Ok(config)
    }

    pub fn fee_rate(&self) -> Decimal {
        fee_rate_from_bps(self.fee_bps)
    }
}

pub fn fee_rate_from_bps(bps: u32) -> Decimal {
    Decimal::new(bps as i64, 4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_poll_is_immediate_then_backs_off() {
        let policy = PollPolicy {
            initial_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            max_delay: Duration::from_millis(5000),
            max_attempts: 6,
        };
        assert_eq!(policy.delay_for(1), Duration::ZERO);
        assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(4000));
        assert_eq!(policy.delay_for(5), Duration::from_millis(5000));
    }

    #[test]
    fn default_fee_is_ten_bps() {
        assert_eq!(fee_rate_from_bps(10), Decimal::new(1, 3));
    }

    #[test]
    fn parses_network_names() {
        assert_eq!(Network::parse("mainnet-beta").unwrap(), Network::Mainnet);
        assert_eq!(Network::parse("Devnet").unwrap(), Network::Devnet);
        assert!(Network::parse("localnet").is_err());
        assert!(Network::Testnet.is_test());
        assert!(!Network::Mainnet.is_test());
    }
}
