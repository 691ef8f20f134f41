//! Device connectivity snapshots and installed package records.

use serde::{Deserialize, Serialize};

/// Connectivity state of the tethered device as last observed by a probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No probe has completed yet.
    #[default]
    Unknown,
    /// A probe is running.
    Probing,
    /// Exactly one authorized device is reachable.
    Connected,
    /// No device, or the single device could not be authorized.
    Disconnected,
    /// More than one device is attached.
    Ambiguous,
}

/// Result of a connectivity probe, as handed to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// True only when exactly one authorized device was found.
    pub connected: bool,
    /// Number of devices the bridge enumerated.
    pub device_count: usize,
    /// Serial of the device when exactly one was found.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    /// Human-readable reason when not connected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// State this probe resolved to.
    pub state: ConnectionState,
}

impl DeviceInfo {
    /// A probe that found nothing usable.
    pub fn disconnected(device_count: usize, message: impl Into<String>) -> Self {
        Self {
            connected: false,
            device_count,
            serial: None,
            error_message: Some(message.into()),
            state: ConnectionState::Disconnected,
        }
    }
}

/// An on-device package belonging to the bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledPackage {
    /// Package identifier, e.g. `com.penumbraos.pinitd`.
    pub name: String,
    /// `versionName` reported by the package manager, if any.
    pub version: Option<String>,
}
