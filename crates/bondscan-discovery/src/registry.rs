/*!
 * Discovery registry for bondscan.
 *
 * The registry ingests device observations for one discovery session and
 * keeps them partitioned into a connected (bonded) bucket and a
 * disconnected (not bonded) bucket, keyed by hardware address.
 */
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use bondscan_core::config::DiscoveryConfig;
use bondscan_core::error::{Error, Result};
use bondscan_core::types::{Address, BondState, DeviceRecord, Id, UNKNOWN_DEVICE_LABEL};

const DEFAULT_EVENT_CAPACITY: usize = 100;

/// Which list a device is rendered in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Bucket {
    /// Bonded devices
    Connected,
    /// Devices without a stored pairing
    Disconnected,
}

impl From<BondState> for Bucket {
    fn from(state: BondState) -> Self {
        match state {
            BondState::Bonded => Bucket::Connected,
            BondState::NotBonded => Bucket::Disconnected,
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bucket::Connected => f.write_str("connected"),
            Bucket::Disconnected => f.write_str("disconnected"),
        }
    }
}

/// What an observation did to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// First time this address was seen in the session
    New,
    /// The address moved buckets because its bond state changed
    Reclassified {
        /// The bucket it left
        from: Bucket,
    },
    /// The address was already in this bucket
    Refreshed {
        /// Whether the stored record changed (e.g. a new name)
        changed: bool,
    },
}

/// Result of [`DiscoveryRegistry::record_discovered`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    /// The device address
    pub address: Address,
    /// The bucket the device is in now
    pub bucket: Bucket,
    /// How it got there
    pub outcome: Outcome,
}

impl Classification {
    /// Whether a rendering layer has anything new to draw
    pub fn needs_render(&self) -> bool {
        match self.outcome {
            Outcome::New | Outcome::Reclassified { .. } => true,
            Outcome::Refreshed { changed } => changed,
        }
    }
}

/// Why a discovery session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    /// The platform reported the scan as complete
    Completed,
    /// The configured timeout elapsed first
    TimedOut,
    /// The scan was cancelled or the platform stopped delivering events
    Cancelled,
}

/// Change notifications published by the registry
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A device observation was applied
    DeviceClassified(Classification),
    /// All collections were cleared
    Reset {
        /// Generation number after the reset
        generation: u64,
    },
    /// A discovery session began
    DiscoveryStarted {
        /// The session ID
        session: Id,
    },
    /// A discovery session ended
    DiscoveryFinished {
        /// The session ID
        session: Id,
        /// Why it ended
        reason: FinishReason,
    },
}

/// Both buckets captured at one point in time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    /// Generation the snapshot was taken in
    pub generation: u64,
    /// Bonded devices, in first-observed order
    pub connected: Vec<DeviceRecord>,
    /// Not bonded devices, in first-observed order
    pub disconnected: Vec<DeviceRecord>,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    bucket: Bucket,
    seq: u64,
}

#[derive(Debug, Default)]
struct RegistryState {
    generation: u64,
    next_seq: u64,
    all_found: Vec<DeviceRecord>,
    index: HashMap<Address, Slot>,
    connected: BTreeMap<u64, DeviceRecord>,
    disconnected: BTreeMap<u64, DeviceRecord>,
}

impl RegistryState {
    fn bucket_mut(&mut self, bucket: Bucket) -> &mut BTreeMap<u64, DeviceRecord> {
        match bucket {
            Bucket::Connected => &mut self.connected,
            Bucket::Disconnected => &mut self.disconnected,
        }
    }

    fn bucket(&self, bucket: Bucket) -> &BTreeMap<u64, DeviceRecord> {
        match bucket {
            Bucket::Connected => &self.connected,
            Bucket::Disconnected => &self.disconnected,
        }
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn apply(&mut self, mut record: DeviceRecord) -> Classification {
        self.all_found.push(record.clone());

        let address = record.address.clone();
        let target = Bucket::from(record.bond_state);

        let outcome = match self.index.get(&address).copied() {
            None => {
                let seq = self.take_seq();
                self.bucket_mut(target).insert(seq, record);
                self.index.insert(address.clone(), Slot { bucket: target, seq });
                Outcome::New
            }
            Some(slot) if slot.bucket == target => {
                let entry = self.bucket_mut(target).entry(slot.seq);
                let stored = entry.or_insert_with(|| record.clone());
                if record.display_name.is_none() {
                    record.display_name = stored.display_name.clone();
                }
                let changed = !stored.same_state(&record);
                *stored = record;
                Outcome::Refreshed { changed }
            }
            Some(slot) => {
                let previous = self.bucket_mut(slot.bucket).remove(&slot.seq);
                if record.display_name.is_none() {
                    record.display_name = previous.and_then(|p| p.display_name);
                }
                let seq = self.take_seq();
                self.bucket_mut(target).insert(seq, record);
                self.index.insert(address.clone(), Slot { bucket: target, seq });
                Outcome::Reclassified { from: slot.bucket }
            }
        };

        Classification {
            address,
            bucket: target,
            outcome,
        }
    }

    fn clear(&mut self) {
        self.all_found.clear();
        self.index.clear();
        self.connected.clear();
        self.disconnected.clear();
        self.next_seq = 0;
        self.generation += 1;
    }
}

/// Discovery registry
///
/// Holds the found log and the two classified buckets behind a single lock.
/// Writers publish their notification while still holding the write lock,
/// so subscribers see events in the same order the state changed.
#[derive(Debug)]
pub struct DiscoveryRegistry {
    state: RwLock<RegistryState>,
    event_sender: broadcast::Sender<RegistryEvent>,
    unknown_label: String,
}

impl DiscoveryRegistry {
    /// Create a new, empty registry
    pub fn new() -> Self {
        Self::with_settings(DEFAULT_EVENT_CAPACITY, UNKNOWN_DEVICE_LABEL)
    }

    /// Create a registry from the `[discovery]` config section
    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self::with_settings(config.event_capacity, &config.unknown_device_label)
    }

    fn with_settings(capacity: usize, unknown_label: &str) -> Self {
        let (event_sender, _) = broadcast::channel(capacity.max(1));
        Self {
            state: RwLock::new(RegistryState::default()),
            event_sender,
            unknown_label: unknown_label.to_string(),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, RegistryState>> {
        self.state
            .read()
            .map_err(|_| Error::lock_poisoned("Failed to acquire read lock on discovery registry"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, RegistryState>> {
        self.state
            .write()
            .map_err(|_| Error::lock_poisoned("Failed to acquire write lock on discovery registry"))
    }

    /// Record one device observation.
    ///
    /// Appends to the found log and upserts the device into the bucket that
    /// matches its bond state, removing it from the other bucket. A nameless
    /// observation keeps the name already known for the address.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidRecord`] when the address is empty; nothing changes.
    pub fn record_discovered(&self, record: DeviceRecord) -> Result<Classification> {
        Self::validate(&record)?;
        let mut state = self.write()?;
        Ok(self.apply_locked(&mut state, record))
    }

    /// Record an observation only if no reset happened since `generation`.
    ///
    /// Returns `Ok(None)` and leaves the registry untouched when the
    /// observation belongs to an earlier session.
    pub fn record_in_generation(
        &self,
        generation: u64,
        record: DeviceRecord,
    ) -> Result<Option<Classification>> {
        Self::validate(&record)?;
        let mut state = self.write()?;
        if state.generation != generation {
            debug!(
                address = %record.address,
                stale = generation,
                current = state.generation,
                "Dropping observation from an earlier session"
            );
            return Ok(None);
        }
        Ok(Some(self.apply_locked(&mut state, record)))
    }

    fn validate(record: &DeviceRecord) -> Result<()> {
        if record.address.is_empty() {
            warn!("Rejecting device observation without an address");
            return Err(Error::invalid_record("device address is empty"));
        }
        Ok(())
    }

    fn apply_locked(&self, state: &mut RegistryState, record: DeviceRecord) -> Classification {
        let classification = state.apply(record);
        debug!(
            address = %classification.address,
            bucket = %classification.bucket,
            outcome = ?classification.outcome,
            "Classified device"
        );
        let _ = self
            .event_sender
            .send(RegistryEvent::DeviceClassified(classification.clone()));
        classification
    }

    /// Clear all collections for a new discovery session
    pub fn reset(&self) -> Result<()> {
        self.begin_generation().map(|_| ())
    }

    /// Clear all collections and return the generation that starts now
    pub fn begin_generation(&self) -> Result<u64> {
        let mut state = self.write()?;
        state.clear();
        let generation = state.generation;
        debug!(generation, "Discovery registry reset");
        let _ = self.event_sender.send(RegistryEvent::Reset { generation });
        Ok(generation)
    }

    /// Copy of the connected bucket in first-observed order
    pub fn snapshot_connected(&self) -> Result<Vec<DeviceRecord>> {
        let state = self.read()?;
        Ok(state.connected.values().cloned().collect())
    }

    /// Copy of the disconnected bucket in first-observed order
    pub fn snapshot_disconnected(&self) -> Result<Vec<DeviceRecord>> {
        let state = self.read()?;
        Ok(state.disconnected.values().cloned().collect())
    }

    /// Copy of both buckets taken under one lock acquisition
    pub fn snapshot(&self) -> Result<RegistrySnapshot> {
        let state = self.read()?;
        Ok(RegistrySnapshot {
            generation: state.generation,
            connected: state.connected.values().cloned().collect(),
            disconnected: state.disconnected.values().cloned().collect(),
        })
    }

    /// Copy of every accepted observation, repeats included
    pub fn all_found(&self) -> Result<Vec<DeviceRecord>> {
        let state = self.read()?;
        Ok(state.all_found.clone())
    }

    /// Bucket currently holding `address`, if any
    pub fn bucket_of(&self, address: &Address) -> Result<Option<Bucket>> {
        let state = self.read()?;
        Ok(state.index.get(address).map(|slot| slot.bucket))
    }

    /// Stored record for `address`, if any
    pub fn get(&self, address: &Address) -> Result<Option<DeviceRecord>> {
        let state = self.read()?;
        Ok(state
            .index
            .get(address)
            .and_then(|slot| state.bucket(slot.bucket).get(&slot.seq))
            .cloned())
    }

    /// Number of distinct classified addresses
    pub fn len(&self) -> Result<usize> {
        let state = self.read()?;
        Ok(state.index.len())
    }

    /// Whether no device has been classified since the last reset
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Number of resets since creation
    pub fn generation(&self) -> Result<u64> {
        let state = self.read()?;
        Ok(state.generation)
    }

    /// Label rendered for nameless devices
    pub fn unknown_label(&self) -> &str {
        &self.unknown_label
    }

    /// Name to render for `record`
    pub fn display_label<'a>(&'a self, record: &'a DeviceRecord) -> &'a str {
        record.label_or(&self.unknown_label)
    }

    /// Label a renderer would show for `address` right now
    pub fn label_of(&self, address: &Address) -> Result<Option<String>> {
        Ok(self
            .get(address)?
            .map(|record| self.display_label(&record).to_string()))
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }

    pub(crate) fn publish(&self, event: RegistryEvent) {
        trace!(?event, "Publishing registry event");
        let _ = self.event_sender.send(event);
    }
}

impl Default for DiscoveryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A shared discovery registry that can be cloned
#[derive(Debug, Clone)]
pub struct SharedDiscoveryRegistry(Arc<DiscoveryRegistry>);

impl SharedDiscoveryRegistry {
    /// Create a new shared discovery registry
    pub fn new() -> Self {
        Self(Arc::new(DiscoveryRegistry::new()))
    }

    /// Create a shared registry from the `[discovery]` config section
    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self(Arc::new(DiscoveryRegistry::from_config(config)))
    }

    /// Get a reference to the discovery registry
    pub fn registry(&self) -> &DiscoveryRegistry {
        &self.0
    }
}

impl Default for SharedDiscoveryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AsRef<DiscoveryRegistry> for SharedDiscoveryRegistry {
    fn as_ref(&self) -> &DiscoveryRegistry {
        self.registry()
    }
}

impl std::ops::Deref for SharedDiscoveryRegistry {
    type Target = DiscoveryRegistry;

    fn deref(&self) -> &Self::Target {
        self.registry()
    }
}
