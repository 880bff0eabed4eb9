/*!
 * Adapter controller for bondscan.
 *
 * Turns "toggle power" and "scan" intents into backend calls and pumps the
 * resulting discovery events into the [`DiscoveryRegistry`].
 *
 * [`DiscoveryRegistry`]: crate::registry::DiscoveryRegistry
 */
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn, Instrument};

use bondscan_core::config::{Config, DiscoveryConfig};
use bondscan_core::error::{Error, Result};
use bondscan_core::logging::{component_span, operation_span};
use bondscan_core::types::Id;

use crate::backend::{BackendEvent, BluetoothBackend, Permission};
use crate::registry::{FinishReason, Outcome, RegistryEvent, SharedDiscoveryRegistry};

/// Discovery options
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// How long a session may run before it is cancelled
    pub timeout: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        DiscoveryOptions::from(&DiscoveryConfig::default())
    }
}

impl From<&DiscoveryConfig> for DiscoveryOptions {
    fn from(config: &DiscoveryConfig) -> Self {
        Self {
            timeout: config.timeout(),
        }
    }
}

/// Adapter power as seen by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    /// Powered on
    On,
    /// Powered off
    Off,
    /// No adapter on this platform
    Unsupported,
}

/// What a power request ended up doing
#[derive(Debug)]
pub enum PowerTransition {
    /// The adapter was switched off
    Disabled,
    /// The adapter is on and a discovery session was started
    Scanning(DiscoverySession),
    /// The user declined to switch the adapter on
    EnableDeclined,
}

/// A running discovery session
#[derive(Debug)]
pub struct DiscoverySession {
    id: Id,
    generation: u64,
    started_at: DateTime<Utc>,
    bonded: usize,
    events: mpsc::Receiver<BackendEvent>,
}

impl DiscoverySession {
    /// Session ID
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Registry generation this session writes into
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// When the session started
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// How many bonded devices were recorded when the session started
    pub fn bonded_count(&self) -> usize {
        self.bonded
    }
}

/// Tally of a finished session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    /// Session ID
    pub session: Id,
    /// Why the session ended
    pub reason: FinishReason,
    /// First-time addresses
    pub new: usize,
    /// Addresses that changed bucket
    pub reclassified: usize,
    /// Repeat observations
    pub refreshed: usize,
    /// Observations rejected as invalid
    pub rejected: usize,
}

impl SessionSummary {
    fn new(session: Id) -> Self {
        Self {
            session,
            reason: FinishReason::Cancelled,
            new: 0,
            reclassified: 0,
            refreshed: 0,
            rejected: 0,
        }
    }

    fn tally(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::New => self.new += 1,
            Outcome::Reclassified { .. } => self.reclassified += 1,
            Outcome::Refreshed { .. } => self.refreshed += 1,
        }
    }
}

/// Adapter controller
///
/// Owns the path from a platform backend into the registry. The registry is
/// shared so a rendering layer can hold its own handle.
#[derive(Debug)]
pub struct AdapterController<B: BluetoothBackend> {
    backend: Arc<B>,
    registry: SharedDiscoveryRegistry,
    options: DiscoveryOptions,
}

impl<B: BluetoothBackend> AdapterController<B> {
    /// Create a controller over an existing registry
    pub fn new(backend: Arc<B>, registry: SharedDiscoveryRegistry, options: DiscoveryOptions) -> Self {
        Self {
            backend,
            registry,
            options,
        }
    }

    /// Create a controller and a fresh registry from configuration
    pub fn from_config(backend: Arc<B>, config: impl AsRef<Config>) -> Self {
        let config = config.as_ref();
        Self::new(
            backend,
            SharedDiscoveryRegistry::from_config(&config.discovery),
            DiscoveryOptions::from(&config.discovery),
        )
    }

    /// Get the registry handle
    pub fn registry(&self) -> &SharedDiscoveryRegistry {
        &self.registry
    }

    /// Get the backend
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Current adapter power
    pub async fn power_state(&self) -> Result<PowerState> {
        if !self.backend.is_supported().await {
            return Ok(PowerState::Unsupported);
        }
        if self.backend.is_enabled().await? {
            Ok(PowerState::On)
        } else {
            Ok(PowerState::Off)
        }
    }

    /// Make sure every required permission is granted, asking for the
    /// missing ones
    pub async fn ensure_permissions(&self) -> Result<()> {
        let missing = self.backend.missing_permissions().await?;
        if missing.is_empty() {
            return Ok(());
        }

        debug!("Requesting permissions: {:?}", missing);
        let denied = self.backend.request_permissions(&missing).await?;
        if denied.is_empty() {
            info!("Bluetooth permissions granted");
            return Ok(());
        }

        let names: Vec<String> = denied.iter().map(Permission::to_string).collect();
        warn!("Bluetooth permissions denied: {}", names.join(", "));
        Err(Error::permission_denied(names.join(", ")))
    }

    /// Handle the power button: asks for missing permissions first and then
    /// switches the adapter on and scans, otherwise toggles power.
    pub async fn request_toggle(&self) -> Result<PowerTransition> {
        if self.backend.missing_permissions().await?.is_empty() {
            return self.toggle_power().await;
        }
        self.ensure_permissions().await?;
        self.enable_and_scan().await
    }

    /// Switch the adapter off when on; otherwise ask to switch it on and
    /// start scanning once accepted
    pub async fn toggle_power(&self) -> Result<PowerTransition> {
        match self.power_state().await? {
            PowerState::Unsupported => Err(Error::AdapterUnavailable),
            PowerState::On => {
                if self.backend.is_discovering().await? {
                    self.backend.cancel_discovery().await?;
                }
                self.backend.disable().await?;
                info!("Bluetooth disabled");
                Ok(PowerTransition::Disabled)
            }
            PowerState::Off => self.enable_and_scan().await,
        }
    }

    /// Switch the adapter on if needed, then start a session
    pub async fn enable_and_scan(&self) -> Result<PowerTransition> {
        match self.power_state().await? {
            PowerState::Unsupported => Err(Error::AdapterUnavailable),
            PowerState::On => Ok(PowerTransition::Scanning(self.start_session().await?)),
            PowerState::Off => {
                if !self.backend.request_enable().await? {
                    info!("Bluetooth was not enabled");
                    return Ok(PowerTransition::EnableDeclined);
                }
                info!("Bluetooth enabled");
                Ok(PowerTransition::Scanning(self.start_session().await?))
            }
        }
    }

    /// Start a discovery session.
    ///
    /// Restarts any inquiry already running, clears the registry, records
    /// every bonded device, then starts the inquiry.
    pub async fn start_session(&self) -> Result<DiscoverySession> {
        match self.power_state().await? {
            PowerState::Unsupported => return Err(Error::AdapterUnavailable),
            PowerState::Off => return Err(Error::AdapterDisabled),
            PowerState::On => {}
        }

        if self.backend.is_discovering().await? {
            debug!("Cancelling discovery already in progress");
            self.backend.cancel_discovery().await?;
        }

        let generation = self.registry.begin_generation()?;

        let mut bonded = 0;
        for record in self.backend.bonded_devices().await? {
            match self.registry.record_in_generation(generation, record) {
                Ok(Some(_)) => bonded += 1,
                Ok(None) => {
                    return Err(Error::backend(
                        "discovery restarted while loading bonded devices",
                    ))
                }
                Err(e) if e.is_recoverable() => warn!("Skipping bonded device: {}", e),
                Err(e) => return Err(e),
            }
        }

        let events = self.backend.start_discovery().await?;
        let id = Id::new();
        info!(session = %id, bonded, backend = self.backend.name(), "Starting Bluetooth discovery");
        self.registry
            .publish(RegistryEvent::DiscoveryStarted { session: id.clone() });

        Ok(DiscoverySession {
            id,
            generation,
            started_at: Utc::now(),
            bonded,
            events,
        })
    }

    /// Feed a session's events into the registry until the platform
    /// finishes, the channel closes, or the timeout elapses
    pub async fn run_session(&self, session: DiscoverySession) -> Result<SessionSummary> {
        let component = component_span("adapter_controller", Some(self.backend.name()));
        let span = operation_span("run_session", "adapter_controller");
        self.pump(session)
            .instrument(span)
            .instrument(component)
            .await
    }

    async fn pump(&self, mut session: DiscoverySession) -> Result<SessionSummary> {
        let mut summary = SessionSummary::new(session.id.clone());
        let deadline = Instant::now() + self.options.timeout;

        loop {
            match timeout_at(deadline, session.events.recv()).await {
                Ok(Some(BackendEvent::DeviceFound(record))) => {
                    match self.registry.record_in_generation(session.generation, record) {
                        Ok(Some(classification)) => {
                            let label = self
                                .registry
                                .label_of(&classification.address)?
                                .unwrap_or_else(|| self.registry.unknown_label().to_string());
                            info!("Found device: {} - {}", label, classification.address);
                            summary.tally(classification.outcome);
                        }
                        Ok(None) => {
                            debug!(session = %summary.session, "Registry moved on to a newer session");
                            summary.reason = FinishReason::Cancelled;
                            break;
                        }
                        Err(e) if e.is_recoverable() => {
                            warn!("Ignoring device observation: {}", e);
                            summary.rejected += 1;
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(Some(BackendEvent::DiscoveryFinished)) => {
                    summary.reason = FinishReason::Completed;
                    break;
                }
                Ok(None) => {
                    debug!("Discovery channel closed");
                    summary.reason = FinishReason::Cancelled;
                    break;
                }
                Err(_) => {
                    warn!("Discovery timed out after {:?}", self.options.timeout);
                    if let Err(e) = self.backend.cancel_discovery().await {
                        warn!("Failed to cancel discovery: {}", e);
                    }
                    summary.reason = FinishReason::TimedOut;
                    break;
                }
            }
        }

        info!(
            session = %summary.session,
            reason = ?summary.reason,
            new = summary.new,
            reclassified = summary.reclassified,
            "Bluetooth discovery finished"
        );
        self.registry.publish(RegistryEvent::DiscoveryFinished {
            session: summary.session.clone(),
            reason: summary.reason,
        });

        Ok(summary)
    }

    /// Start a session and run it to completion
    pub async fn scan(&self) -> Result<SessionSummary> {
        let session = self.start_session().await?;
        self.run_session(session).await
    }

    /// Cancel a running inquiry; the running session ends as cancelled
    pub async fn cancel(&self) -> Result<()> {
        if self.backend.is_discovering().await? {
            self.backend.cancel_discovery().await?;
            info!("Bluetooth discovery cancelled");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Bucket;
    use crate::simulated::SimulatedBackend;
    use bondscan_core::types::{Address, DeviceRecord};

    fn controller(backend: SimulatedBackend) -> AdapterController<SimulatedBackend> {
        AdapterController::new(
            Arc::new(backend),
            SharedDiscoveryRegistry::new(),
            DiscoveryOptions {
                timeout: Duration::from_secs(5),
            },
        )
    }

    #[test_log::test(tokio::test)]
    async fn test_scan_classifies_bonded_and_nearby() -> Result<()> {
        let backend = SimulatedBackend::new()
            .with_bonded(DeviceRecord::bonded("AA:BB", Some("Phone")))
            .with_nearby("CC:DD", None)
            .with_nearby("AA:BB", Some("Phone"));
        let controller = controller(backend);

        let summary = controller.scan().await?;
        assert_eq!(summary.reason, FinishReason::Completed);
        assert_eq!(summary.new, 1);
        assert_eq!(summary.refreshed, 1);

        let snapshot = controller.registry().snapshot()?;
        assert_eq!(snapshot.connected.len(), 1);
        assert_eq!(snapshot.connected[0].address.as_str(), "AA:BB");
        assert_eq!(snapshot.disconnected.len(), 1);
        assert_eq!(
            controller.registry().display_label(&snapshot.disconnected[0]),
            "Unknown Device"
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_start_session_resets_previous_results() -> Result<()> {
        let backend = SimulatedBackend::new().with_nearby("CC:DD", Some("Speaker"));
        let controller = controller(backend);
        controller
            .registry()
            .record_discovered(DeviceRecord::not_bonded("EE:FF", Some("Stale")))?;

        let session = controller.start_session().await?;
        assert!(controller
            .registry()
            .bucket_of(&Address::new("EE:FF"))?
            .is_none());

        controller.run_session(session).await?;
        assert_eq!(
            controller.registry().bucket_of(&Address::new("CC:DD"))?,
            Some(Bucket::Disconnected)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_refuses_to_scan_when_disabled_or_unsupported() {
        let off = controller(SimulatedBackend::new().powered(false));
        assert!(matches!(off.scan().await, Err(Error::AdapterDisabled)));

        let missing = controller(SimulatedBackend::unsupported());
        assert!(matches!(missing.scan().await, Err(Error::AdapterUnavailable)));
        assert!(matches!(
            missing.toggle_power().await,
            Err(Error::AdapterUnavailable)
        ));
        assert_eq!(missing.power_state().await.unwrap(), PowerState::Unsupported);
    }

    #[tokio::test]
    async fn test_toggle_power() -> Result<()> {
        let controller = controller(SimulatedBackend::new().with_nearby("CC:DD", None));

        assert!(matches!(
            controller.toggle_power().await?,
            PowerTransition::Disabled
        ));
        assert_eq!(controller.power_state().await?, PowerState::Off);

        match controller.toggle_power().await? {
            PowerTransition::Scanning(session) => {
                let summary = controller.run_session(session).await?;
                assert_eq!(summary.new, 1);
            }
            other => panic!("unexpected transition: {:?}", other),
        }
        assert_eq!(controller.power_state().await?, PowerState::On);
        Ok(())
    }

    #[tokio::test]
    async fn test_enable_declined() -> Result<()> {
        let controller = controller(SimulatedBackend::new().powered(false).decline_enable());
        assert!(matches!(
            controller.toggle_power().await?,
            PowerTransition::EnableDeclined
        ));
        assert_eq!(controller.power_state().await?, PowerState::Off);
        Ok(())
    }

    #[tokio::test]
    async fn test_permissions_requested_before_scanning() -> Result<()> {
        let controller = controller(
            SimulatedBackend::new()
                .without_permissions()
                .with_nearby("CC:DD", None),
        );

        match controller.request_toggle().await? {
            PowerTransition::Scanning(session) => {
                controller.run_session(session).await?;
            }
            other => panic!("unexpected transition: {:?}", other),
        }
        assert!(controller.backend().missing_permissions().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_permission_denied() {
        let controller = controller(
            SimulatedBackend::new()
                .without_permissions()
                .deny_permission_requests(),
        );

        let err = controller.request_toggle().await.unwrap_err();
        match err {
            Error::PermissionDenied(names) => {
                assert!(names.contains("BLUETOOTH_SCAN"));
                assert!(names.contains("ACCESS_FINE_LOCATION"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        // Power was left alone
        assert_eq!(controller.power_state().await.unwrap(), PowerState::On);
    }

    #[tokio::test]
    async fn test_timeout_ends_session() -> Result<()> {
        let backend = SimulatedBackend::new()
            .with_nearby("CC:DD", None)
            .never_finishes();
        let controller = AdapterController::new(
            Arc::new(backend),
            SharedDiscoveryRegistry::new(),
            DiscoveryOptions {
                timeout: Duration::from_millis(50),
            },
        );

        let summary = controller.scan().await?;
        assert_eq!(summary.reason, FinishReason::TimedOut);
        assert_eq!(summary.new, 1);
        assert!(!controller.backend().is_discovering().await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_ends_session() -> Result<()> {
        let backend = SimulatedBackend::new().never_finishes();
        let controller = Arc::new(controller(backend));

        let session = controller.start_session().await?;
        let runner = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.run_session(session).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        controller.cancel().await?;

        let summary = runner.await.expect("session task panicked")?;
        assert_eq!(summary.reason, FinishReason::Cancelled);
        Ok(())
    }

    #[tokio::test]
    async fn test_pairing_mid_session_reclassifies() -> Result<()> {
        let backend = SimulatedBackend::new()
            .with_nearby("CC:DD", Some("Headset"))
            .then_pair("CC:DD")
            .with_nearby("CC:DD", Some("Headset"));
        let controller = controller(backend);

        let summary = controller.scan().await?;
        assert_eq!(summary.new, 1);
        assert_eq!(summary.reclassified, 1);
        assert_eq!(
            controller.registry().bucket_of(&Address::new("CC:DD"))?,
            Some(Bucket::Connected)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_observations_are_skipped() -> Result<()> {
        let backend = SimulatedBackend::new()
            .with_nearby("", Some("Broken"))
            .with_nearby("CC:DD", None);
        let controller = controller(backend);

        let summary = controller.scan().await?;
        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.new, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_earlier_session_cannot_write_after_restart() -> Result<()> {
        let backend = SimulatedBackend::new()
            .with_nearby("OLD:01", None)
            .never_finishes();
        let controller = controller(backend);

        let old = controller.start_session().await?;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let new = controller.start_session().await?;
        assert!(new.generation() > old.generation());

        let summary = controller.run_session(old).await?;
        assert_eq!(summary.reason, FinishReason::Cancelled);
        assert_eq!(summary.new, 0);
        assert!(controller
            .registry()
            .bucket_of(&Address::new("OLD:01"))?
            .is_none());
        assert!(controller.registry().all_found()?.is_empty());

        controller.cancel().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_nameless_repeat_keeps_bonded_name() -> Result<()> {
        let backend = SimulatedBackend::new()
            .with_bonded(DeviceRecord::bonded("AA:BB", Some("Phone")))
            .with_nearby("AA:BB", None);
        let controller = controller(backend);

        let summary = controller.scan().await?;
        assert_eq!(summary.refreshed, 1);
        assert_eq!(
            controller
                .registry()
                .label_of(&Address::new("AA:BB"))?
                .as_deref(),
            Some("Phone")
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_session_events_are_published() -> Result<()> {
        let controller = controller(SimulatedBackend::new().with_nearby("CC:DD", None));
        let mut rx = controller.registry().subscribe();

        let summary = controller.scan().await?;

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(matches!(events.first(), Some(RegistryEvent::Reset { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, RegistryEvent::DiscoveryStarted { session } if *session == summary.session)));
        assert!(matches!(
            events.last(),
            Some(RegistryEvent::DiscoveryFinished {
                reason: FinishReason::Completed,
                ..
            })
        ));
        Ok(())
    }
}
