/*!
 * In-memory Bluetooth backend.
 *
 * Plays back a scripted inquiry so the controller and registry can be
 * driven without a radio. Bond state of each found device is looked up
 * in the simulated bonded set at the moment it is reported, the same way
 * a real stack answers.
 */
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use bondscan_core::error::{Error, Result};
use bondscan_core::types::{Address, BondState, DeviceRecord};

use crate::backend::{BackendEvent, BluetoothBackend, Permission};

const EVENT_BUFFER: usize = 32;

#[derive(Debug, Clone)]
enum ScriptStep {
    Nearby { address: String, name: Option<String> },
    Pair(Address),
}

#[derive(Debug)]
struct SimState {
    supported: bool,
    enabled: bool,
    accept_enable: bool,
    granted: HashSet<Permission>,
    grant_on_request: bool,
    bonded: Vec<DeviceRecord>,
    discovering: bool,
}

impl SimState {
    fn bond(&mut self, address: Address) {
        if !self.bonded.iter().any(|record| record.address == address) {
            self.bonded.push(DeviceRecord::bonded(address, None));
        }
    }

    fn is_bonded(&self, address: &Address) -> bool {
        self.bonded.iter().any(|record| &record.address == address)
    }
}

fn lock(state: &Mutex<SimState>) -> Result<MutexGuard<'_, SimState>> {
    state
        .lock()
        .map_err(|_| Error::backend("Failed to acquire lock on simulated adapter"))
}

/// Scripted, in-memory backend
#[derive(Debug)]
pub struct SimulatedBackend {
    state: Arc<Mutex<SimState>>,
    script: Vec<ScriptStep>,
    finishes: bool,
    event_delay: Duration,
    feeder: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedBackend {
    /// A powered adapter with every permission granted and an empty script
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                supported: true,
                enabled: true,
                accept_enable: true,
                granted: Permission::REQUIRED.into_iter().collect(),
                grant_on_request: true,
                bonded: Vec::new(),
                discovering: false,
            })),
            script: Vec::new(),
            finishes: true,
            event_delay: Duration::ZERO,
            feeder: Mutex::new(None),
        }
    }

    /// A platform without any Bluetooth adapter
    pub fn unsupported() -> Self {
        let backend = Self::new();
        if let Ok(mut state) = backend.state.lock() {
            state.supported = false;
            state.enabled = false;
        }
        backend
    }

    fn configure(self, f: impl FnOnce(&mut SimState)) -> Self {
        if let Ok(mut state) = self.state.lock() {
            f(&mut state);
        }
        self
    }

    /// Set whether the adapter starts powered on
    pub fn powered(self, enabled: bool) -> Self {
        self.configure(|s| s.enabled = enabled)
    }

    /// Refuse requests to power the adapter on
    pub fn decline_enable(self) -> Self {
        self.configure(|s| s.accept_enable = false)
    }

    /// Start with no runtime permissions granted
    pub fn without_permissions(self) -> Self {
        self.configure(|s| s.granted.clear())
    }

    /// Refuse permission requests
    pub fn deny_permission_requests(self) -> Self {
        self.configure(|s| s.grant_on_request = false)
    }

    /// Add a device to the bonded set
    pub fn with_bonded(self, record: DeviceRecord) -> Self {
        self.configure(|s| {
            s.bonded.retain(|b| b.address != record.address);
            s.bonded.push(record);
        })
    }

    /// Append a found device to the inquiry script
    pub fn with_nearby(mut self, address: &str, name: Option<&str>) -> Self {
        self.script.push(ScriptStep::Nearby {
            address: address.to_string(),
            name: name.map(str::to_string),
        });
        self
    }

    /// Pair `address` at this point of the script
    pub fn then_pair(mut self, address: &str) -> Self {
        self.script.push(ScriptStep::Pair(Address::new(address)));
        self
    }

    /// Keep the inquiry open after the script instead of finishing
    pub fn never_finishes(mut self) -> Self {
        self.finishes = false;
        self
    }

    /// Wait `delay` before each scripted step
    pub fn with_event_delay(mut self, delay: Duration) -> Self {
        self.event_delay = delay;
        self
    }

    /// Pair a device while the backend is running
    pub fn pair(&self, address: &str) -> Result<()> {
        lock(&self.state)?.bond(Address::new(address));
        Ok(())
    }

    fn stop_feeder(&self) -> Result<()> {
        let handle = self
            .feeder
            .lock()
            .map_err(|_| Error::backend("Failed to acquire lock on discovery task"))?
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
        lock(&self.state)?.discovering = false;
        Ok(())
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

async fn play(
    state: Arc<Mutex<SimState>>,
    script: Vec<ScriptStep>,
    finishes: bool,
    delay: Duration,
    tx: mpsc::Sender<BackendEvent>,
) {
    for step in script {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let event = {
            let Ok(mut state) = lock(&state) else { return };
            match step {
                ScriptStep::Pair(address) => {
                    trace!(%address, "Simulated pairing");
                    state.bond(address);
                    continue;
                }
                ScriptStep::Nearby { address, name } => {
                    let bonded = state.is_bonded(&Address::new(&address));
                    DeviceRecord::new(address.as_str(), name, BondState::from_bonded(bonded))
                }
            }
        };

        if tx.send(BackendEvent::DeviceFound(event)).await.is_err() {
            return;
        }
    }

    if finishes {
        if let Ok(mut state) = lock(&state) {
            state.discovering = false;
        }
        let _ = tx.send(BackendEvent::DiscoveryFinished).await;
    } else {
        // Hold the sender until the inquiry is cancelled
        std::future::pending::<()>().await;
    }
}

#[async_trait]
impl BluetoothBackend for SimulatedBackend {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn is_supported(&self) -> bool {
        lock(&self.state).map(|s| s.supported).unwrap_or(false)
    }

    async fn is_enabled(&self) -> Result<bool> {
        Ok(lock(&self.state)?.enabled)
    }

    async fn request_enable(&self) -> Result<bool> {
        let mut state = lock(&self.state)?;
        if state.accept_enable {
            state.enabled = true;
        }
        Ok(state.accept_enable)
    }

    async fn disable(&self) -> Result<()> {
        self.stop_feeder()?;
        lock(&self.state)?.enabled = false;
        Ok(())
    }

    async fn missing_permissions(&self) -> Result<Vec<Permission>> {
        let state = lock(&self.state)?;
        Ok(Permission::REQUIRED
            .into_iter()
            .filter(|p| !state.granted.contains(p))
            .collect())
    }

    async fn request_permissions(&self, permissions: &[Permission]) -> Result<Vec<Permission>> {
        let mut state = lock(&self.state)?;
        if state.grant_on_request {
            state.granted.extend(permissions.iter().copied());
        }
        Ok(permissions
            .iter()
            .copied()
            .filter(|p| !state.granted.contains(p))
            .collect())
    }

    async fn bonded_devices(&self) -> Result<Vec<DeviceRecord>> {
        let state = lock(&self.state)?;
        if !state.enabled {
            return Err(Error::AdapterDisabled);
        }
        Ok(state.bonded.clone())
    }

    async fn is_discovering(&self) -> Result<bool> {
        Ok(lock(&self.state)?.discovering)
    }

    async fn start_discovery(&self) -> Result<mpsc::Receiver<BackendEvent>> {
        self.stop_feeder()?;
        {
            let mut state = lock(&self.state)?;
            if !state.enabled {
                return Err(Error::AdapterDisabled);
            }
            state.discovering = true;
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let handle = tokio::spawn(play(
            self.state.clone(),
            self.script.clone(),
            self.finishes,
            self.event_delay,
            tx,
        ));
        *self
            .feeder
            .lock()
            .map_err(|_| Error::backend("Failed to acquire lock on discovery task"))? = Some(handle);

        debug!("Simulated discovery started with {} steps", self.script.len());
        Ok(rx)
    }

    async fn cancel_discovery(&self) -> Result<()> {
        self.stop_feeder()
    }
}
