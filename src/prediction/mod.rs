//! Forecasts and the prediction cache
//!
//! - `predictor`: the `Predictor` seam plus the HTTP model-server client and
//!   a local last-value fallback
//! - `cache`: per-measurement forecast series with tolerance lookup and
//!   prefetch scheduling

pub mod cache;
pub mod predictor;

pub use cache::{PredictionCache, PrefetchSummary};
pub use predictor::{
    assemble_history, build_predictor, forecast_timestamps, infer_step, HttpPredictor,
    LastValuePredictor, Predictor,
};

use std::time::Duration;

use crate::storage::StorageError;

/// Why no forecast is available. The cache treats every variant as a miss.
#[derive(Debug, thiserror::Error)]
pub enum PredictError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("model server returned status {0}")]
    Status(reqwest::StatusCode),

    #[error("forecast shape mismatch: expected {expected} values, got {got}")]
    Shape { expected: usize, got: usize },

    #[error("forecast timed out after {0:?}")]
    Timeout(Duration),

    #[error("no history to forecast from")]
    EmptyHistory,

    #[error("history query failed: {0}")]
    Storage(#[from] StorageError),
}
