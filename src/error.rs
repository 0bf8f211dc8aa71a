// Error Taxonomy - shared by every engine component
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use solana_sdk::{instruction::InstructionError, transaction::TransactionError};
use thiserror::Error;
use uuid::Uuid;

/// Jupiter aggregator program: `SlippageToleranceExceeded` (0x1771).
pub const JUPITER_SLIPPAGE_EXCEEDED: u32 = 6001;
/// SPL token `InsufficientFunds` and system `ResultWithNegativeLamports`.
pub const CUSTOM_INSUFFICIENT_FUNDS: u32 = 1;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: String, available: String },

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Chain execution failed: {0}")]
    ChainExecution(ChainFailure),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Trade {trade_id} is {status}, cannot become {target}")]
    InvalidTransition {
        trade_id: Uuid,
        status: String,
        target: String,
    },

    #[error("Key vault error: {0}")]
    KeyVault(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn insufficient(required: impl ToString, available: impl ToString) -> Self {
        EngineError::InsufficientBalance {
            required: required.to_string(),
            available: available.to_string(),
        }
    }

    /// Errors worth another attempt; the upstream may recover on its own.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Upstream(_) | EngineError::Timeout(_))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::InsufficientBalance { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::InvalidTransition { .. } => StatusCode::CONFLICT,
            EngineError::Upstream(_) | EngineError::ChainExecution(_) => StatusCode::BAD_GATEWAY,
            EngineError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            EngineError::KeyVault(_) | EngineError::Config(_) | EngineError::Database(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        EngineError::Upstream(e.to_string())
    }
}

impl From<solana_client::client_error::ClientError> for EngineError {
    fn from(e: solana_client::client_error::ClientError) -> Self {
        match e.get_transaction_error() {
            Some(tx_err) => EngineError::ChainExecution(ChainFailure::from_transaction_error(&tx_err)),
            None => EngineError::Upstream(format!("Solana RPC: {}", e)),
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (
            status,
            Json(serde_json::json!({
                "success": false,
                "error": self.to_string(),
            })),
        )
            .into_response()
    }
}

// ==================== CHAIN FAILURES ====================

/// A submitted transaction that the chain rejected, decoded from the RPC's
/// structured `TransactionError` rather than its message text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainFailure {
    InsufficientFunds,
    SlippageExceeded,
    BlockhashExpired,
    ProgramError { instruction: u8, code: u32 },
    Other(String),
}

impl ChainFailure {
    pub fn from_transaction_error(err: &TransactionError) -> Self {
        match err {
            TransactionError::InsufficientFundsForFee
            | TransactionError::InsufficientFundsForRent { .. } => ChainFailure::InsufficientFunds,
            TransactionError::BlockhashNotFound => ChainFailure::BlockhashExpired,
            TransactionError::InstructionError(_, InstructionError::InsufficientFunds) => {
                ChainFailure::InsufficientFunds
            }
            TransactionError::InstructionError(idx, InstructionError::Custom(code)) => match *code {
                CUSTOM_INSUFFICIENT_FUNDS => ChainFailure::InsufficientFunds,
                JUPITER_SLIPPAGE_EXCEEDED => ChainFailure::SlippageExceeded,
                code => ChainFailure::ProgramError { instruction: *idx, code },
            },
            other => ChainFailure::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for ChainFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainFailure::InsufficientFunds => write!(f, "insufficient funds on chain"),
            ChainFailure::SlippageExceeded => write!(f, "slippage tolerance exceeded"),
            ChainFailure::BlockhashExpired => write!(f, "blockhash expired before landing"),
            ChainFailure::ProgramError { instruction, code } => {
                write!(f, "program error 0x{:x} in instruction {}", code, instruction)
            }
            ChainFailure::Other(msg) => write!(f, "{}", msg),
        }
    }
}
