use std::time::Duration;

use thiserror::Error;

/// Backoff applied when the upstream bridge cannot be reached at all.
pub const BRIDGE_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ImporterError {
    #[error("cardano-http-bridge is not accessible: {0}")]
    BridgeUnavailable(String),

    #[error("bridge returned http {status}: {body}")]
    BridgeHttp { status: u16, body: String },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("storage error: {0}")]
    Storage(#[from] tokio_postgres::Error),

    #[error("storage pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("{0}")]
    Validation(String),

    #[error("failed to query input utxos for tx: {0} in db or block")]
    UtxoMissing(String),

    #[error("config error: {0}")]
    Config(String),
}

impl ImporterError {
    pub fn validation(msg: impl Into<String>) -> Self {
        ImporterError::Validation(msg.into())
    }

    /// Retryable errors map to a sleep; everything else is fatal for the
    /// sync loop.
    pub fn backoff(&self) -> Option<Duration> {
        match self {
            ImporterError::BridgeUnavailable(_) => Some(BRIDGE_BACKOFF),
            _ => None,
        }
    }
}

impl From<pallas_codec::minicbor::decode::Error> for ImporterError {
    fn from(e: pallas_codec::minicbor::decode::Error) -> Self {
        ImporterError::Decode(e.to_string())
    }
}
