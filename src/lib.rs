//! aiot-collector: industrial telemetry acquisition, forecast caching and
//! deviation alerting
//!
//! ## Architecture
//!
//! - **Acquisition**: per-device protocol sessions, subscription diffing
//!   against the device registry, backoff on session limits, and routing of
//!   pushed value changes into storage
//! - **Prediction**: per-measurement forecast series with tolerance lookup,
//!   lazy warm-up and a prefetch scheduler
//! - **Alerting**: deviation scan with signature-keyed duplicate suppression,
//!   plus operator disposal (acknowledge / ignore)
//! - **Storage**: time-series and alert stores (in-memory or sled)

pub mod acquisition;
pub mod alerting;
pub mod background;
pub mod config;
pub mod prediction;
pub mod registry;
pub mod storage;
pub mod types;

// Re-export configuration
pub use config::CollectorConfig;

// Re-export commonly used types
pub use types::{
    Alert, AlertSeverity, AlertType, DataPoint, Device, DeviceId, Disposal, Forecast,
    Measurement, MeasurementId, TagValue,
};

// Re-export the core subsystems
pub use acquisition::{Collector, PollingCollector, SubscriptionCollector, TickSummary};
pub use alerting::{AlertService, DeviationScanner, ScanSummary};
pub use prediction::{PredictionCache, Predictor};
pub use registry::{DeviceRegistry, FileRegistry, StaticRegistry};
pub use storage::{AlertStore, PendingInsert, StorageError, TimeSeriesStore};
