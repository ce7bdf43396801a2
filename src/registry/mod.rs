//! Device Registry
//!
//! Supplies the current device list (with measurements) to the acquisition
//! engine and the background loops. Polled at the start of every tick, so
//! implementations hand out a cheap snapshot.
//!
//! - `StaticRegistry`: replaceable in-memory list (tests, embedding)
//! - `FileRegistry`: `[[devices]]` TOML file, hot-reloaded by `watcher`

pub mod watcher;

use arc_swap::ArcSwap;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::types::Device;

/// Registry errors
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to read {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
    #[error("devices file parse error: {0}")]
    Parse(String),
    #[error("invalid devices file: {0}")]
    Invalid(String),
}

/// Source of the desired device/measurement set.
pub trait DeviceRegistry: Send + Sync {
    /// Current devices, each with its ordered measurements.
    fn list_devices_with_measurements(&self) -> Result<Arc<Vec<Device>>, RegistryError>;
}

// ============================================================================
// StaticRegistry
// ============================================================================

/// In-memory registry whose contents can be swapped at any time.
#[derive(Default)]
pub struct StaticRegistry {
    devices: ArcSwap<Vec<Device>>,
}

impl StaticRegistry {
    pub fn new(devices: Vec<Device>) -> Self {
        Self {
            devices: ArcSwap::from_pointee(devices),
        }
    }

    /// Replace the whole device list.
    pub fn set(&self, devices: Vec<Device>) {
        self.devices.store(Arc::new(devices));
    }
}

impl DeviceRegistry for StaticRegistry {
    fn list_devices_with_measurements(&self) -> Result<Arc<Vec<Device>>, RegistryError> {
        Ok(self.devices.load_full())
    }
}

// ============================================================================
// FileRegistry
// ============================================================================

#[derive(Debug, Deserialize)]
struct DevicesFile {
    #[serde(default)]
    devices: Vec<Device>,
}

/// Summary of a reload, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryChange {
    pub devices: usize,
    pub measurements: usize,
}

/// Registry backed by a TOML devices file.
pub struct FileRegistry {
    path: PathBuf,
    devices: ArcSwap<Vec<Device>>,
}

impl FileRegistry {
    /// Load the devices file. A missing file yields an empty registry.
    pub fn open(path: &Path) -> Result<Self, RegistryError> {
        let devices = if path.exists() {
            parse_devices_file(path)?
        } else {
            tracing::warn!(path = %path.display(), "Devices file not found, starting with no devices");
            Vec::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            devices: ArcSwap::from_pointee(devices),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the file and swap the snapshot. On error the previous
    /// snapshot stays active.
    pub fn reload(&self) -> Result<RegistryChange, RegistryError> {
        let devices = parse_devices_file(&self.path)?;
        let change = RegistryChange {
            devices: devices.len(),
            measurements: devices.iter().map(|d| d.measurements.len()).sum(),
        };
        self.devices.store(Arc::new(devices));
        Ok(change)
    }
}

impl DeviceRegistry for FileRegistry {
    fn list_devices_with_measurements(&self) -> Result<Arc<Vec<Device>>, RegistryError> {
        Ok(self.devices.load_full())
    }
}

fn parse_devices_file(path: &Path) -> Result<Vec<Device>, RegistryError> {
    let contents =
        std::fs::read_to_string(path).map_err(|e| RegistryError::Io(path.to_path_buf(), e))?;
    parse_devices(&contents)
}

/// Parse `[[devices]]` TOML, stamping owning device ids onto measurements.
pub fn parse_devices(contents: &str) -> Result<Vec<Device>, RegistryError> {
    let file: DevicesFile =
        toml::from_str(contents).map_err(|e| RegistryError::Parse(e.to_string()))?;

    let mut device_ids = HashSet::new();
    let mut measurement_ids = HashSet::new();
    let mut devices = file.devices;
    for device in &mut devices {
        if !device_ids.insert(device.id) {
            return Err(RegistryError::Invalid(format!("duplicate device id {}", device.id)));
        }
        if device.connection.endpoint.trim().is_empty() {
            return Err(RegistryError::Invalid(format!("device {} has no endpoint", device.id)));
        }
        for m in &mut device.measurements {
            if !measurement_ids.insert(m.id) {
                return Err(RegistryError::Invalid(format!("duplicate measurement id {}", m.id)));
            }
            m.device_id = device.id;
        }
    }
    Ok(devices)
}
