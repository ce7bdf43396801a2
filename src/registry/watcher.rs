//! Polling-based devices-file watcher.
//!
//! Checks the devices file's mtime every 2 seconds. When a change is
//! detected, debounces for 500ms (editors often write in stages), then calls
//! `FileRegistry::reload()` and sends the result via an mpsc channel.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{FileRegistry, RegistryChange};
use crate::config::defaults::{REGISTRY_DEBOUNCE_MS, REGISTRY_POLL_INTERVAL_MS};

/// Events emitted by the registry watcher.
#[derive(Debug)]
pub enum RegistryEvent {
    /// Devices file was reloaded.
    Reloaded(RegistryChange),
    /// Reload failed; the previous device list remains active.
    Error(String),
}

/// Run the watcher with the default poll/debounce timing.
pub async fn run_registry_watcher(
    registry: Arc<FileRegistry>,
    tx: mpsc::Sender<RegistryEvent>,
    cancel: CancellationToken,
) {
    watch_with_timing(
        registry,
        tx,
        cancel,
        Duration::from_millis(REGISTRY_POLL_INTERVAL_MS),
        Duration::from_millis(REGISTRY_DEBOUNCE_MS),
    )
    .await;
}

/// Watcher loop. Returns when cancelled or the channel closes.
pub async fn watch_with_timing(
    registry: Arc<FileRegistry>,
    tx: mpsc::Sender<RegistryEvent>,
    cancel: CancellationToken,
    poll_interval: Duration,
    debounce: Duration,
) {
    let path = registry.path().to_path_buf();
    tracing::info!(path = %path.display(), "Registry watcher started");

    let mut last_mtime = get_mtime(&path);

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                tracing::debug!("Registry watcher cancelled");
                return;
            }
            () = tokio::time::sleep(poll_interval) => {}
        }

        let Some(current) = get_mtime(&path) else {
            if last_mtime.is_some() {
                tracing::warn!(
                    path = %path.display(),
                    "Devices file not accessible, keeping current devices"
                );
                last_mtime = None;
            }
            continue;
        };

        if last_mtime == Some(current) {
            continue;
        }

        tokio::time::sleep(debounce).await;
        if get_mtime(&path) != Some(current) {
            // still being written
            continue;
        }
        last_mtime = Some(current);

        let event = match registry.reload() {
            Ok(change) => {
                tracing::info!(
                    devices = change.devices,
                    measurements = change.measurements,
                    "Devices file reloaded"
                );
                RegistryEvent::Reloaded(change)
            }
            Err(e) => {
                tracing::error!(error = %e, "Devices file reload failed, keeping previous devices");
                RegistryEvent::Error(e.to_string())
            }
        };

        if tx.send(event).await.is_err() {
            tracing::debug!("Registry watcher channel closed, stopping");
            return;
        }
    }
}

fn get_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).ok().and_then(|m| m.modified().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DeviceRegistry;

    #[tokio::test]
    async fn reload_event_after_file_change() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("devices.toml");
        std::fs::write(&path, "").expect("write");

        let registry = Arc::new(FileRegistry::open(&path).expect("open"));
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(watch_with_timing(
            registry.clone(),
            tx,
            cancel.clone(),
            Duration::from_millis(20),
            Duration::from_millis(10),
        ));

        // mtime granularity can be coarse; make sure it moves
        tokio::time::sleep(Duration::from_millis(1100)).await;
        std::fs::write(
            &path,
            "[[devices]]\nid = 3\nname = \"x\"\nendpoint = \"sim://x\"\n",
        )
        .expect("write");

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open");
        assert!(matches!(event, RegistryEvent::Reloaded(RegistryChange { devices: 1, .. })));
        assert_eq!(registry.list_devices_with_measurements().expect("list").len(), 1);

        cancel.cancel();
        handle.await.expect("watcher exits");
    }
}
