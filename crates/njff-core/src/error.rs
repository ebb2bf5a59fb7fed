//! Tagged failure taxonomy shared by the orchestrator and adapters.

use std::time::Duration;

use thiserror::Error;

/// Every way an ingestion run can degrade. The orchestrator branches on the
/// kind, never on message text.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("transient network failure: {0}")]
    Transient(String),

    #[error("rate limited or challenged by source: {0}")]
    RateLimited(String),

    #[error("schema drift: {missing} of {total} rows missing critical fields")]
    SchemaDrift { missing: usize, total: usize },

    #[error("volume anomaly: batch of {got} below threshold {threshold:.1} (30-day avg {average:.1})")]
    VolumeAnomaly {
        got: usize,
        average: f64,
        threshold: f64,
    },

    #[error("circuit open for adapter {0}")]
    CircuitOpen(String),

    #[error("row parse failure: {0}")]
    RowParse(String),

    #[error("enrichment unavailable: {0}")]
    Enrichment(String),

    #[error("store write failed: {0}")]
    StoreWrite(String),

    #[error("adapter exceeded deadline of {0:?}")]
    Timeout(Duration),

    #[error("configuration error: {0}")]
    Config(String),
}

impl IngestError {
    /// Errors worth a retry with backoff; everything else fails fast.
    pub fn is_transient(&self) -> bool {
        matches!(self, IngestError::Transient(_) | IngestError::RateLimited(_))
    }
}
