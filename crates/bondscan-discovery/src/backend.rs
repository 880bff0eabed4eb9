/*!
 * Platform Bluetooth backend abstraction.
 *
 * The adapter controller talks to the platform stack only through the
 * [`BluetoothBackend`] trait, which keeps the controller testable and lets
 * each platform map its own device objects into [`DeviceRecord`]s.
 */
use std::fmt::{self, Debug};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use bondscan_core::error::Result;
use bondscan_core::types::DeviceRecord;

/// Runtime permissions a scan needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    /// Talk to paired devices and read their names
    BluetoothConnect,
    /// Run inquiry scans
    BluetoothScan,
    /// Location access, required by the platform for scan results
    AccessFineLocation,
}

impl Permission {
    /// Every permission required before scanning
    pub const REQUIRED: [Permission; 3] = [
        Permission::BluetoothConnect,
        Permission::BluetoothScan,
        Permission::AccessFineLocation,
    ];
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::BluetoothConnect => f.write_str("BLUETOOTH_CONNECT"),
            Permission::BluetoothScan => f.write_str("BLUETOOTH_SCAN"),
            Permission::AccessFineLocation => f.write_str("ACCESS_FINE_LOCATION"),
        }
    }
}

/// Events delivered by the platform while discovery runs
#[derive(Debug, Clone)]
pub enum BackendEvent {
    /// A device answered the inquiry
    DeviceFound(DeviceRecord),
    /// The platform finished the inquiry
    DiscoveryFinished,
}

/// Platform Bluetooth backend
#[async_trait]
pub trait BluetoothBackend: Send + Sync + Debug {
    /// Get the backend name
    fn name(&self) -> &'static str;

    /// Whether the platform has a Bluetooth adapter at all
    async fn is_supported(&self) -> bool;

    /// Whether the adapter is powered on
    async fn is_enabled(&self) -> Result<bool>;

    /// Ask to power the adapter on; returns whether the request was accepted
    async fn request_enable(&self) -> Result<bool>;

    /// Power the adapter off
    async fn disable(&self) -> Result<()>;

    /// Required permissions that are not currently granted
    async fn missing_permissions(&self) -> Result<Vec<Permission>>;

    /// Request `permissions`; returns those still denied afterwards
    async fn request_permissions(&self, permissions: &[Permission]) -> Result<Vec<Permission>>;

    /// Devices the platform has a stored pairing with
    async fn bonded_devices(&self) -> Result<Vec<DeviceRecord>>;

    /// Whether an inquiry is running
    async fn is_discovering(&self) -> Result<bool>;

    /// Start an inquiry.
    ///
    /// Found devices are delivered on the returned channel, followed by
    /// [`BackendEvent::DiscoveryFinished`]. The channel closes when the
    /// inquiry is cancelled.
    async fn start_discovery(&self) -> Result<mpsc::Receiver<BackendEvent>>;

    /// Stop a running inquiry
    async fn cancel_discovery(&self) -> Result<()>;
}
