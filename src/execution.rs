// Execution Layer - Jupiter routed swaps and on-chain status over Solana RPC
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::RpcSendTransactionConfig;
use solana_sdk::{
    commitment_config::CommitmentConfig,
    program_pack::Pack,
    pubkey::Pubkey,
    signature::{Keypair, Signature},
    transaction::VersionedTransaction,
};
use solana_transaction_status::{TransactionConfirmationStatus, TransactionStatus};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ChainFailure, EngineError, Result};

pub const ASSOCIATED_TOKEN_PROGRAM_ID: Pubkey =
    solana_sdk::pubkey!("ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL");

// ==================== JUPITER TYPES ====================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteResponse {
    pub input_mint: String,
    pub in_amount: String,
    pub output_mint: String,
    pub out_amount: String,
    pub other_amount_threshold: String,
    pub slippage_bps: u64,
    pub price_impact_pct: String,
    /// Route plan and the rest of the payload, echoed back to `/swap` untouched.
    #[serde(flatten)]
    pub rest: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SwapRequest<'a> {
    quote_response: &'a QuoteResponse,
    user_public_key: String,
    wrap_and_unwrap_sol: bool,
    prioritization_fee_lamports: &'static str,
    dynamic_compute_unit_limit: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SwapResponse {
    swap_transaction: String,
}

// ==================== CHAIN CLIENT ====================

#[derive(Debug, Clone)]
pub struct SwapOrder {
    pub user_public_key: Pubkey,
    pub input_mint: String,
    pub output_mint: String,
    /// Input amount in the input token's smallest unit.
    pub amount: u64,
    pub slippage_bps: u16,
}

#[derive(Debug, Clone)]
pub struct UnsignedSwap {
    pub transaction: VersionedTransaction,
    /// Routed output in the output token's smallest unit.
    pub out_amount: u64,
    /// Output floor after slippage, in the same unit.
    pub min_out_amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainStatus {
    NotFound,
    Processed { confirmations: u32 },
    Confirmed { confirmations: u32 },
    Finalized,
    Failed(ChainFailure),
}

impl ChainStatus {
    pub fn from_rpc(status: Option<TransactionStatus>) -> Self {
        let Some(status) = status else {
            return ChainStatus::NotFound;
        };
        if let Some(err) = &status.err {
            return ChainStatus::Failed(ChainFailure::from_transaction_error(err));
        }
        let confirmations = status
            .confirmations
            .map(|c| c.min(u32::MAX as usize) as u32);
        match (status.confirmation_status, confirmations) {
            (Some(TransactionConfirmationStatus::Finalized), _) | (None, None) => {
                ChainStatus::Finalized
            }
            (Some(TransactionConfirmationStatus::Confirmed), c) => ChainStatus::Confirmed {
                confirmations: c.unwrap_or(0),
            },
            (Some(TransactionConfirmationStatus::Processed), c) | (None, c) => {
                ChainStatus::Processed {
                    confirmations: c.unwrap_or(0),
                }
            }
        }
    }
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn build_swap(&self, order: &SwapOrder) -> Result<UnsignedSwap>;
    async fn send(&self, transaction: &VersionedTransaction) -> Result<Signature>;
    async fn signature_status(&self, signature: &Signature) -> Result<ChainStatus>;
    async fn native_balance(&self, owner: &Pubkey) -> Result<u64>;
    /// `None` when the owner has no token account for the mint.
    async fn token_balance(&self, owner: &Pubkey, mint: &Pubkey) -> Result<Option<u64>>;
    async fn request_airdrop(&self, to: &Pubkey, lamports: u64) -> Result<Signature>;
}

pub fn parse_pubkey(value: &str) -> Result<Pubkey> {
    Pubkey::from_str(value)
        .map_err(|e| EngineError::Validation(format!("invalid address {}: {}", value, e)))
}

pub fn associated_token_address(owner: &Pubkey, mint: &Pubkey) -> Pubkey {
    let token_program = spl_token::id();
    Pubkey::find_program_address(
        &[owner.as_ref(), token_program.as_ref(), mint.as_ref()],
        &ASSOCIATED_TOKEN_PROGRAM_ID,
    )
    .0
}

/// Signs the routed transaction as its only required signer.
pub fn sign_swap(unsigned: VersionedTransaction, signer: &Keypair) -> Result<VersionedTransaction> {
    VersionedTransaction::try_new(unsigned.message, &[signer])
        .map_err(|e| EngineError::KeyVault(format!("failed to sign swap: {}", e)))
}

pub struct SolanaChain {
    rpc: RpcClient,
    http: reqwest::Client,
    jupiter_url: String,
}

impl SolanaChain {
    pub fn new(rpc_url: &str, jupiter_url: &str, jupiter_api_key: Option<&str>) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(api_key) = jupiter_api_key {
            let mut value = reqwest::header::HeaderValue::from_str(api_key)
                .map_err(|e| EngineError::Config(format!("invalid JUPITER_API_KEY: {}", e)))?;
            value.set_sensitive(true);
            headers.insert("x-api-key", value);
        }
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(15))
            .build()?;

        Ok(Self {
            rpc: RpcClient::new_with_commitment(rpc_url.to_string(), CommitmentConfig::confirmed()),
            http,
            jupiter_url: jupiter_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn get_jupiter_quote(&self, order: &SwapOrder) -> Result<QuoteResponse> {
        let url = format!(
            "{}/quote?inputMint={}&outputMint={}&amount={}&slippageBps={}",
            self.jupiter_url, order.input_mint, order.output_mint, order.amount, order.slippage_bps
        );
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Upstream(format!("Jupiter quote {}: {}", status, body)));
        }
        Ok(response.json().await?)
    }
}

fn parse_raw(value: &str, field: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|_| EngineError::Upstream(format!("Jupiter returned bad {}: {}", field, value)))
}

#[async_trait]
impl ChainClient for SolanaChain {
    async fn build_swap(&self, order: &SwapOrder) -> Result<UnsignedSwap> {
        tracing::info!(
            "🔄 Fetching Jupiter Quote: {} -> {} (Amt: {})",
            order.input_mint,
            order.output_mint,
            order.amount
        );

        let output_mint = parse_pubkey(&order.output_mint)?;
        if output_mint != spl_token::native_mint::id() {
            let ata = associated_token_address(&order.user_public_key, &output_mint);
            let existing = self
                .rpc
                .get_account_with_commitment(&ata, CommitmentConfig::confirmed())
                .await?
                .value;
            if existing.is_none() {
                tracing::info!("   Token account {} missing, route will create it", ata);
            }
        }

        let quote = self.get_jupiter_quote(order).await?;
        tracing::info!(
            "   Quote received. Out Amount: {} (Impact: {}%)",
            quote.out_amount,
            quote.price_impact_pct
        );

        let request = SwapRequest {
            quote_response: &quote,
            user_public_key: order.user_public_key.to_string(),
            wrap_and_unwrap_sol: true,
            prioritization_fee_lamports: "auto",
            dynamic_compute_unit_limit: true,
        };
        let response = self
            .http
            .post(format!("{}/swap", self.jupiter_url))
            .json(&request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(EngineError::Upstream(format!(
                "Jupiter swap {}",
                response.status()
            )));
        }
        let swap: SwapResponse = response.json().await?;

        let bytes = STANDARD
            .decode(&swap.swap_transaction)
            .map_err(|e| EngineError::Upstream(format!("swap transaction not base64: {}", e)))?;
        let transaction: VersionedTransaction = bincode::deserialize(&bytes)
            .map_err(|e| EngineError::Upstream(format!("failed to deserialize versioned tx: {}", e)))?;

        Ok(UnsignedSwap {
            transaction,
            out_amount: parse_raw(&quote.out_amount, "outAmount")?,
            min_out_amount: parse_raw(&quote.other_amount_threshold, "otherAmountThreshold")?,
        })
    }

    async fn send(&self, transaction: &VersionedTransaction) -> Result<Signature> {
        tracing::info!("🚀 Sending Transaction...");
        let config = RpcSendTransactionConfig {
            skip_preflight: true,
            max_retries: Some(3),
            ..Default::default()
        };
        let signature = self
            .rpc
            .send_transaction_with_config(transaction, config)
            .await?;
        tracing::info!("✅ Transaction Sent: {}", signature);
        Ok(signature)
    }

    async fn signature_status(&self, signature: &Signature) -> Result<ChainStatus> {
        let statuses = self
            .rpc
            .get_signature_statuses_with_history(&[*signature])
            .await?
            .value;
        Ok(ChainStatus::from_rpc(statuses.into_iter().next().flatten()))
    }

    async fn native_balance(&self, owner: &Pubkey) -> Result<u64> {
        Ok(self.rpc.get_balance(owner).await?)
    }

    async fn token_balance(&self, owner: &Pubkey, mint: &Pubkey) -> Result<Option<u64>> {
        let ata = associated_token_address(owner, mint);
        let account = self
            .rpc
            .get_account_with_commitment(&ata, CommitmentConfig::confirmed())
            .await?
            .value;
        match account {
            None => Ok(None),
            Some(account) => {
                let state = spl_token::state::Account::unpack(&account.data).map_err(|e| {
                    EngineError::Upstream(format!("token account {} unreadable: {}", ata, e))
                })?;
                Ok(Some(state.amount))
            }
        }
    }

    async fn request_airdrop(&self, to: &Pubkey, lamports: u64) -> Result<Signature> {
        Ok(self.rpc.request_airdrop(to, lamports).await?)
    }
}

// ==================== UNITS ====================

/// Converts a token amount to its smallest unit. Amounts finer than the
/// token's precision are refused so the ledger never books more than the
/// chain moves.
pub fn to_raw_units(amount: Decimal, decimals: u8) -> Result<u64> {
    let scale = Decimal::from(10u64.pow(decimals.min(18) as u32));
    let scaled = amount
        .checked_mul(scale)
        .ok_or_else(|| EngineError::Validation(format!("amount {} out of range", amount)))?;
    if !scaled.fract().is_zero() {
        return Err(EngineError::Validation(format!(
            "amount {} has more than {} decimal places",
            amount, decimals
        )));
    }
    let raw = scaled
        .to_u64()
        .ok_or_else(|| EngineError::Validation(format!("amount {} out of range", amount)))?;
    if raw == 0 {
        return Err(EngineError::Validation(format!(
            "amount {} is below the token's smallest unit",
            amount
        )));
    }
    Ok(raw)
}

pub fn from_raw_units(raw: u64, decimals: u8) -> Decimal {
    Decimal::from_i128_with_scale(raw as i128, decimals.min(28) as u32).normalize()
}
