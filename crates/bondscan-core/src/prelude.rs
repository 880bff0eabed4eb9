/*!
 * Prelude module for bondscan Core.
 *
 * Re-exports the types most callers need in one import.
 */

pub use crate::config::{Config, ConfigBuilder, DiscoveryConfig, SharedConfig};
pub use crate::error::{Error, Result};
pub use crate::types::{Address, BondState, DeviceRecord, Id, UNKNOWN_DEVICE_LABEL};

pub use tracing::{debug, error, info, trace, warn};
