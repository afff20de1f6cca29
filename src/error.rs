//! Error type for the ledger engine's fallible boundaries (transport, cache,
//! configuration). The reconciliation pipeline itself never returns errors;
//! record-level problems are carried on the entry instead.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Network error communicating with {url}: {message}")]
    Network { url: String, message: String },

    #[error("Ledger webhook did not answer within {0:?}")]
    Timeout(Duration),

    #[error("Ledger webhook returned HTTP {status}: {message}")]
    HttpStatus { status: u16, message: String },

    #[error("Remote rejected {action}: {message}")]
    RemoteRejection { action: String, message: String },

    #[error("Malformed response for {action}: {detail}")]
    MalformedResponse { action: String, detail: String },

    #[error("A settlement for {0} is already in progress")]
    SettlementInFlight(String),

    #[error("None of the requested ids are in the current ledger view")]
    NothingToSettle,

    #[error("Local cache error: {0}")]
    Cache(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Credential store error: {0}")]
    Credential(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LedgerError {
    /// Transport-level failures: the request may or may not have reached the
    /// sheet, so the outcome of a write is unknown.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            LedgerError::Network { .. } | LedgerError::Timeout(_) | LedgerError::HttpStatus { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
