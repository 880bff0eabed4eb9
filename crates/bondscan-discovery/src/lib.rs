/*!
 * bondscan Discovery
 *
 * This crate keeps the list of Bluetooth devices found during a scan,
 * split into bonded ("connected") and not bonded ("disconnected")
 * buckets, and drives a platform backend to fill it.
 */

#![warn(missing_docs)]

pub use bondscan_core::prelude;

pub mod backend;
pub mod discovery;
pub mod registry;
pub mod simulated;

pub use backend::{BackendEvent, BluetoothBackend, Permission};
pub use discovery::{
    AdapterController, DiscoveryOptions, DiscoverySession, PowerState, PowerTransition,
    SessionSummary,
};
pub use registry::{
    Bucket, Classification, DiscoveryRegistry, FinishReason, Outcome, RegistryEvent,
    RegistrySnapshot, SharedDiscoveryRegistry,
};
pub use simulated::SimulatedBackend;

/// bondscan discovery crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the discovery system
pub fn init() -> Result<(), bondscan_core::error::Error> {
    tracing::info!("bondscan discovery {} initialized", VERSION);
    Ok(())
}
