use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bondscan_core::config::{ConfigBuilder, SharedConfig};
use bondscan_core::logging;
use bondscan_core::types::DeviceRecord;
use bondscan_discovery::{
    AdapterController, PowerTransition, RegistryEvent, SimulatedBackend,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ConfigBuilder::new()
        .with_config_file("bondscan.toml")
        .with_environment_prefix("BONDSCAN")
        .build()
        .map(SharedConfig::new)?;
    logging::init_from_config(&config.get().logging)?;
    bondscan_discovery::init()?;

    // A pretend adapter that is off, with one paired phone nearby
    let backend = SimulatedBackend::new()
        .powered(false)
        .without_permissions()
        .with_bonded(DeviceRecord::bonded("00:11:22:33:44:55", Some("Pixel 8")))
        .with_nearby("00:11:22:33:44:55", Some("Pixel 8"))
        .with_nearby("66:77:88:99:AA:BB", Some("JBL Flip 5"))
        .with_nearby("CC:DD:EE:FF:00:11", None)
        .then_pair("66:77:88:99:AA:BB")
        .with_nearby("66:77:88:99:AA:BB", Some("JBL Flip 5"))
        .with_event_delay(Duration::from_millis(150));

    let controller = AdapterController::from_config(Arc::new(backend), &config);

    // Re-render both lists on every change, like a list view adapter would
    let registry = controller.registry().clone();
    let mut events = registry.subscribe();
    let renderer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let RegistryEvent::DiscoveryFinished { .. } = event {
                break;
            }
            let Ok(snapshot) = registry.snapshot() else { break };
            println!("--- connected ---");
            for record in &snapshot.connected {
                println!("  {:<20} {}", registry.display_label(record), record.address);
            }
            println!("--- disconnected ---");
            for record in &snapshot.disconnected {
                println!("  {:<20} {}", registry.display_label(record), record.address);
            }
        }
    });

    match controller.request_toggle().await? {
        PowerTransition::Scanning(session) => {
            let summary = controller.run_session(session).await?;
            info!("Session ended: {:?}", summary);
        }
        other => info!("No scan started: {:?}", other),
    }

    renderer.await?;
    Ok(())
}
