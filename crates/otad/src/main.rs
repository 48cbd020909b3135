//! otad - firmware update daemon
//!
//! Waits for a plausible wall clock, then checks the release origin on the
//! poll interval and installs new images into the inactive slot.

use anyhow::{bail, Result};
use ota_common::{build_info, ensure_clock_ready, SystemWallClock, UpdateService};
use otad::slot_sink::read_active;
use otad::{logging, CommandRestarter, DeviceResources, OtadConfig, TrustAnchor};
use tracing::{info, warn};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let logs = logging::init();
    info!("otad v{} starting", env!("CARGO_PKG_VERSION"));

    let config = OtadConfig::load()?;
    if let Err(e) = logs.apply_level(&config.log_level) {
        warn!("{:#}, keeping {}", e, logging::DEFAULT_LEVEL);
    }

    info!("Firmware version: {}", build_info::RUNNING_VERSION);
    info!("Release URL: {}", build_info::RELEASE_URL);
    match read_active(&config.slots.dir) {
        Ok(Some(active)) => info!(
            "Active {} ({} bytes, committed {})",
            active.slot, active.size, active.committed_at
        ),
        Ok(None) => info!("No image committed in {}", config.slots.dir.display()),
        Err(e) => warn!("Slot pointer unreadable: {}", e),
    }

    let ready = ensure_clock_ready(&SystemWallClock).await;
    TrustAnchor::load(&config.trust_anchor)?;

    let resources = DeviceResources::new(ready, &config);
    let restarter = CommandRestarter::new(config.restart.command.clone());
    let service =
        UpdateService::new(config.to_settings(), resources, restarter).with_tick(config.tick());

    tokio::select! {
        report = service.run() => {
            info!("Update cycle finished: {:?}", report.outcome);
            if !service.restarter().succeeded() {
                bail!("New image committed but the restart command failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down gracefully");
        }
    }

    Ok(())
}
