//! Deviation alerting
//!
//! - `deviation`: deviation percentage and severity tiers
//! - `scanner`: periodic scan with signature-keyed duplicate suppression
//! - `service`: acknowledge/ignore, batch disposal, listing and statistics

pub mod deviation;
pub mod scanner;
pub mod service;

pub use deviation::{classify_severity, compute_deviation_percent};
pub use scanner::{DeviationScanner, Evaluation, ScanSummary};
pub use service::{AlertError, AlertService, AlertStats, BatchResult, HourBucket};
