//! Background tasks
//!
//! Three independent periodic loops plus two long-lived drains:
//!
//! | Task        | Period                           | Work                                   |
//! |-------------|----------------------------------|----------------------------------------|
//! | acquisition | `acquisition.tick_period_ms`     | `Collector::collect_once`              |
//! | prefetch    | `prediction_cache.prefetch_interval_ms` | `PredictionCache::prefetch_all` |
//! | scan        | `alert.scan_interval_ms`         | `DeviationScanner::scan_once`          |
//! | router      | on demand                        | stores pushed value changes            |
//! | registry    | on demand                        | counts devices-file reloads            |
//!
//! Loops run with fixed delay between passes (a slow pass is never followed
//! by a burst of catch-up passes) and stop when the cancellation token fires.
//! No lock is shared between them.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::acquisition::{
    Collector, EndpointRouter, PollingCollector, ProtocolClient, SimulatedClient,
    SubscriptionCollector, ValueNotification, ValueRouter,
};
use crate::alerting::DeviationScanner;
use crate::config::{AcquisitionConfig, CollectorStrategy};
use crate::prediction::PredictionCache;
use crate::registry::watcher::RegistryEvent;
use crate::registry::DeviceRegistry;
use crate::storage::TimeSeriesStore;

/// Client certificate and trusted server certificates for OPC UA sessions.
#[cfg(feature = "opcua")]
const OPCUA_PKI_DIR: &str = "pki";

/// Protocol client for all endpoints.
///
/// `sim://` endpoints are always served in-process. With the `opcua`
/// feature, `opc.tcp://` endpoints get a real OPC UA session. With
/// `simulate_all` every other endpoint is simulated too; otherwise endpoints
/// without a registered transport fail to connect with `UnsupportedEndpoint`.
pub fn build_client(simulate_all: bool) -> Arc<dyn ProtocolClient> {
    let sim: Arc<dyn ProtocolClient> = Arc::new(SimulatedClient::new());
    let router = EndpointRouter::new().route("sim", sim.clone());
    #[cfg(feature = "opcua")]
    let router = if simulate_all {
        router
    } else {
        router.route("opc.tcp", Arc::new(crate::acquisition::OpcUaClient::new(OPCUA_PKI_DIR)))
    };
    let router = if simulate_all { router.fallback(sim) } else { router };
    Arc::new(router)
}

/// A collector plus, for the subscription strategy, the router that must
/// drain its notification channel.
pub struct AcquisitionParts {
    pub collector: Arc<dyn Collector>,
    pub router: Option<(Arc<ValueRouter>, mpsc::Receiver<ValueNotification>)>,
}

/// Build the collector selected by `acquisition.strategy`.
pub fn build_collector(
    config: &AcquisitionConfig,
    registry: Arc<dyn DeviceRegistry>,
    client: Arc<dyn ProtocolClient>,
    storage: Arc<dyn TimeSeriesStore>,
) -> AcquisitionParts {
    match config.strategy {
        CollectorStrategy::Subscription => {
            let (collector, rx) =
                SubscriptionCollector::new(config.clone(), registry, client, storage);
            let router = collector.router();
            AcquisitionParts {
                collector: Arc::new(collector),
                router: Some((router, rx)),
            }
        }
        CollectorStrategy::Polling => AcquisitionParts {
            collector: Arc::new(PollingCollector::new(config.clone(), registry, client, storage)),
            router: None,
        },
    }
}

fn fixed_delay(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Acquisition ticks until cancelled, then disconnect every session.
pub async fn run_acquisition_loop(
    collector: Arc<dyn Collector>,
    period: Duration,
    cancel: CancellationToken,
) {
    info!(strategy = collector.name(), period_ms = period.as_millis(), "Acquisition loop started");
    let mut ticker = fixed_delay(period);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match collector.collect_once().await {
            Ok(summary) => {
                if summary.failed > 0 {
                    warn!(
                        failed = summary.failed,
                        in_backoff = summary.in_backoff,
                        synced = summary.synced,
                        "Acquisition tick had device failures"
                    );
                }
            }
            Err(e) => error!(error = %e, "Acquisition tick failed"),
        }
    }

    let report = collector.shutdown().await;
    info!(closed = report.closed, failed = report.failed, "Acquisition loop stopped");
}

/// Prediction prefetch passes until cancelled.
pub async fn run_prefetch_loop(
    cache: Arc<PredictionCache>,
    registry: Arc<dyn DeviceRegistry>,
    period: Duration,
    cancel: CancellationToken,
) {
    if !cache.is_enabled() {
        info!("Prediction cache disabled, prefetch loop not started");
        return;
    }
    info!(period_ms = period.as_millis(), "Prefetch loop started");
    let mut ticker = fixed_delay(period);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match registry.list_devices_with_measurements() {
            Ok(devices) => {
                let summary = cache.prefetch_all(&devices).await;
                if summary.failed > 0 {
                    debug!(failed = summary.failed, checked = summary.checked, "Some forecasts unavailable");
                }
            }
            Err(e) => warn!(error = %e, "Prefetch skipped, device registry unavailable"),
        }
    }
    info!("Prefetch loop stopped");
}

/// Deviation scans until cancelled.
pub async fn run_scan_loop(
    scanner: Arc<DeviationScanner>,
    registry: Arc<dyn DeviceRegistry>,
    period: Duration,
    cancel: CancellationToken,
) {
    if !scanner.is_enabled() {
        info!("Deviation alerting disabled, scan loop not started");
        return;
    }
    info!(period_ms = period.as_millis(), "Scan loop started");
    let mut ticker = fixed_delay(period);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match registry.list_devices_with_measurements() {
            Ok(devices) => {
                let summary = scanner.scan_once(&devices).await;
                if summary.created > 0 {
                    info!(created = summary.created, suppressed = summary.suppressed, "Deviation alerts raised");
                }
            }
            Err(e) => warn!(error = %e, "Scan skipped, device registry unavailable"),
        }
    }
    info!("Scan loop stopped");
}

/// Reload outcomes drained by `run_registry_events`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryEventCounts {
    pub reloads: usize,
    pub failures: usize,
}

/// Drain devices-file watcher events until cancelled or the watcher stops.
/// The watcher logs each reload outcome; this only counts them.
pub async fn run_registry_events(
    mut rx: mpsc::Receiver<RegistryEvent>,
    cancel: CancellationToken,
) -> RegistryEventCounts {
    let mut counts = RegistryEventCounts::default();
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(RegistryEvent::Reloaded(_)) => counts.reloads += 1,
                Some(RegistryEvent::Error(_)) => counts.failures += 1,
                None => break,
            },
        }
    }
    debug!(reloads = counts.reloads, failures = counts.failures, "Registry event drain stopped");
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::TickSummary;
    use crate::registry::{RegistryChange, StaticRegistry};
    use crate::storage::InMemoryTimeSeries;
    use crate::types::Device;

    #[tokio::test]
    async fn acquisition_loop_ticks_and_shuts_down() {
        let registry: Arc<dyn DeviceRegistry> = Arc::new(StaticRegistry::new(vec![
            Device::new(1, "d", "sim://d").with_measurement(10, "a", "ns=2;i=1"),
        ]));
        let client = Arc::new(SimulatedClient::silent());
        let storage = Arc::new(InMemoryTimeSeries::new());
        let config = AcquisitionConfig {
            strategy: CollectorStrategy::Polling,
            ..AcquisitionConfig::default()
        };
        let parts = build_collector(&config, registry, client.clone(), storage.clone());
        assert!(parts.router.is_none());

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_acquisition_loop(
            parts.collector.clone(),
            Duration::from_millis(10),
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();
        task.await.expect("loop exits");

        assert!(client.counters(1).reads >= 2);
        assert!(!storage.is_empty());
        assert!(!client.is_connected(1));
    }

    #[tokio::test]
    async fn subscription_strategy_hands_out_its_router() {
        let registry: Arc<dyn DeviceRegistry> = Arc::new(StaticRegistry::new(Vec::new()));
        let parts = build_collector(
            &AcquisitionConfig::default(),
            registry,
            build_client(false),
            Arc::new(InMemoryTimeSeries::new()),
        );
        assert_eq!(parts.collector.name(), "subscription");
        assert!(parts.router.is_some());
        let summary = parts.collector.collect_once().await.expect("tick");
        assert_eq!(summary, TickSummary::default());
    }

    #[tokio::test]
    async fn registry_events_are_counted_until_the_watcher_stops() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(RegistryEvent::Reloaded(RegistryChange { devices: 2, measurements: 5 }))
            .await
            .expect("send");
        tx.send(RegistryEvent::Error("bad toml".into())).await.expect("send");
        drop(tx);

        let counts = run_registry_events(rx, CancellationToken::new()).await;
        assert_eq!(counts, RegistryEventCounts { reloads: 1, failures: 1 });
    }
}
