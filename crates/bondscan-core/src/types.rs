/*!
 * Core data types for bondscan.
 *
 * This module defines the device record that flows from the platform
 * scanner into the discovery registry, plus the identifiers around it.
 */
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Label shown for devices that do not advertise a name
pub const UNKNOWN_DEVICE_LABEL: &str = "Unknown Device";

/// A unique identifier for bondscan resources such as discovery sessions
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Id(String);

impl Id {
    /// Create a new ID with a random UUID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create an ID from a string
    pub fn from_string<S: AsRef<str>>(s: S) -> Self {
        Self(s.as_ref().to_string())
    }

    /// Get the string representation of the ID
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Self {
        Self::from_string(s)
    }
}

impl From<Uuid> for Id {
    fn from(uuid: Uuid) -> Self {
        Self::from_string(uuid.to_string())
    }
}

/// Hardware address of a Bluetooth device.
///
/// Addresses are trimmed and upper-cased on construction so that the same
/// radio reported as `aa:bb:..` and `AA:BB:..` lands on one registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// Create a normalized address
    pub fn new<S: AsRef<str>>(s: S) -> Self {
        Self(s.as_ref().trim().to_ascii_uppercase())
    }

    /// Get the string representation of the address
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the address carries no characters
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Address {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.0
    }
}

/// Whether the platform holds a stored pairing for a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BondState {
    /// Previously paired
    Bonded,
    /// No stored pairing
    NotBonded,
}

impl BondState {
    /// Bond state from a "is this address in the bonded set" check
    pub fn from_bonded(bonded: bool) -> Self {
        if bonded {
            BondState::Bonded
        } else {
            BondState::NotBonded
        }
    }

    /// Whether this is [`BondState::Bonded`]
    pub fn is_bonded(self) -> bool {
        matches!(self, BondState::Bonded)
    }
}

impl fmt::Display for BondState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BondState::Bonded => f.write_str("bonded"),
            BondState::NotBonded => f.write_str("not bonded"),
        }
    }
}

/// One observation of a nearby device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Hardware address, the registry key
    pub address: Address,
    /// Advertised name, if any
    pub display_name: Option<String>,
    /// Bond state at the time of observation
    pub bond_state: BondState,
    /// When the observation was made
    pub observed_at: DateTime<Utc>,
}

impl DeviceRecord {
    /// Create a record observed now
    pub fn new<A, N>(address: A, display_name: Option<N>, bond_state: BondState) -> Self
    where
        A: Into<Address>,
        N: Into<String>,
    {
        Self {
            address: address.into(),
            display_name: display_name
                .map(Into::into)
                .filter(|name: &String| !name.trim().is_empty()),
            bond_state,
            observed_at: Utc::now(),
        }
    }

    /// Create a bonded record observed now
    pub fn bonded<A: Into<Address>>(address: A, display_name: Option<&str>) -> Self {
        Self::new(address, display_name, BondState::Bonded)
    }

    /// Create a not-bonded record observed now
    pub fn not_bonded<A: Into<Address>>(address: A, display_name: Option<&str>) -> Self {
        Self::new(address, display_name, BondState::NotBonded)
    }

    /// Name to render, falling back to `fallback` when the device is nameless
    pub fn label_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.display_name.as_deref().unwrap_or(fallback)
    }

    /// Name to render, falling back to [`UNKNOWN_DEVICE_LABEL`]
    pub fn label(&self) -> &str {
        self.label_or(UNKNOWN_DEVICE_LABEL)
    }

    /// Whether two records describe the same device state, ignoring when
    /// they were observed
    pub fn same_state(&self, other: &DeviceRecord) -> bool {
        self.address == other.address
            && self.display_name == other.display_name
            && self.bond_state == other.bond_state
    }
}

impl fmt::Display for DeviceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.label(), self.address)
    }
}
