//! Per-cycle device resources.

use crate::config::{OtadConfig, SlotConfig};
use crate::http::{ReqwestConnector, TrustAnchor};
use crate::slot_sink::FileSlotSink;
use ota_common::{ClockReady, CycleContext, CycleResources, SetupError};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Builds a fresh connector and slot sink for every cycle
///
/// The trust anchor is re-read each time, so a rotated CA file is picked up
/// at the next check without restarting the daemon.
pub struct DeviceResources {
    ready: ClockReady,
    trust_anchor: PathBuf,
    user_agent: String,
    probe_timeout: Duration,
    slots: SlotConfig,
}

impl DeviceResources {
    pub fn new(ready: ClockReady, config: &OtadConfig) -> Self {
        Self {
            ready,
            trust_anchor: config.trust_anchor.clone(),
            user_agent: config.user_agent.clone(),
            probe_timeout: config.probe_timeout(),
            slots: config.slots.clone(),
        }
    }
}

impl CycleResources for DeviceResources {
    type Connector = ReqwestConnector;
    type Sink = FileSlotSink;

    fn prepare(&self) -> Result<CycleContext<ReqwestConnector, FileSlotSink>, SetupError> {
        let anchor = TrustAnchor::load(&self.trust_anchor)
            .map_err(|e| SetupError(format!("{:#}", e)))?;
        let connector = ReqwestConnector::new(&self.ready, &anchor, &self.user_agent)?
            .with_probe_timeout(self.probe_timeout);
        debug!("Cycle resources ready (slots in {})", self.slots.dir.display());

        Ok(CycleContext {
            connector,
            sink: FileSlotSink::new(self.slots.dir.clone(), self.slots.capacity_bytes),
        })
    }
}
