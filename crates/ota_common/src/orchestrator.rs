//! Update cycle orchestrator.
//!
//! One cycle walks `Idle -> Checking -> (NoUpdate | Downloading) -> Idle`,
//! or `Downloading -> Flashing -> Rebooting` when a new image is committed.
//! Any failure returns to `Idle`; nothing is carried into the next cycle.
//!
//! `UpdateService` runs cycles on a fixed poll interval. Cycles are awaited
//! inline, so at most one is ever in flight and ticks that elapse meanwhile
//! are skipped rather than queued.

use crate::build_info;
use crate::error::SetupError;
use crate::flash::{flash_write, FlashSink};
use crate::release::{build_asset_url, extract_tag, is_new_version};
use crate::resolver::{resolve, Deadline, DEFAULT_REDIRECT_DEADLINE};
use crate::status::StatusBand;
use crate::transport::{
    Connector, FetchResponse, StallGuard, TransferSession, TrustSelector,
};
use std::fmt;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Default time between update checks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default longest wait for the download headers and for each body chunk
pub const DEFAULT_DOWNLOAD_STALL: Duration = Duration::from_secs(60);

/// Default period of the scheduler tick
pub const DEFAULT_TICK: Duration = Duration::from_millis(500);

// ============================================================================
// Settings and collaborators
// ============================================================================

/// Fixed inputs of every cycle
#[derive(Debug, Clone)]
pub struct UpdateSettings {
    /// Tag of the running image
    pub running_version: String,
    /// "Latest release" endpoint; its host is the pinned origin
    pub release_url: String,
    pub redirect_deadline: Duration,
    pub download_stall: Duration,
    pub poll_interval: Duration,
}

impl UpdateSettings {
    /// Settings carrying the identity compiled into this build
    pub fn from_build() -> Self {
        Self {
            running_version: build_info::RUNNING_VERSION.to_string(),
            release_url: build_info::RELEASE_URL.to_string(),
            redirect_deadline: DEFAULT_REDIRECT_DEADLINE,
            download_stall: DEFAULT_DOWNLOAD_STALL,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self::from_build()
    }
}

/// Restarts the device into the newly committed image
pub trait Restarter: Send + Sync {
    fn restart(&self);
}

/// Capabilities owned by exactly one cycle
pub struct CycleContext<C, S> {
    pub connector: C,
    pub sink: S,
}

/// Builds a fresh `CycleContext` for every cycle
pub trait CycleResources: Send + Sync {
    type Connector: Connector;
    type Sink: FlashSink;

    fn prepare(&self) -> Result<CycleContext<Self::Connector, Self::Sink>, SetupError>;
}

// ============================================================================
// Cycle state machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Checking,
    NoUpdate,
    Downloading,
    Flashing,
    Rebooting,
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Checking => "checking",
            Self::NoUpdate => "no_update",
            Self::Downloading => "downloading",
            Self::Flashing => "flashing",
            Self::Rebooting => "rebooting",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Remote tag equals the running version
    UpToDate { tag: String },
    /// New image committed and restart requested
    Updated { tag: String },
    /// Cycle abandoned in `stage`
    Failed { stage: CycleState, reason: String },
}

impl CycleOutcome {
    pub fn reboot_requested(&self) -> bool {
        matches!(self, Self::Updated { .. })
    }
}

/// Visited states and final outcome of one cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub transitions: Vec<CycleState>,
    pub outcome: CycleOutcome,
}

struct CycleTrace {
    transitions: Vec<CycleState>,
}

impl CycleTrace {
    fn start() -> Self {
        Self {
            transitions: vec![CycleState::Idle],
        }
    }

    fn current(&self) -> CycleState {
        self.transitions
            .last()
            .copied()
            .unwrap_or(CycleState::Idle)
    }

    fn enter(&mut self, state: CycleState) {
        debug!("Cycle {} -> {}", self.current(), state);
        self.transitions.push(state);
    }

    fn fail(mut self, reason: String) -> CycleReport {
        let stage = self.current();
        warn!("Update cycle failed while {}: {}", stage, reason);
        self.enter(CycleState::Idle);
        self.finish(CycleOutcome::Failed { stage, reason })
    }

    fn finish(self, outcome: CycleOutcome) -> CycleReport {
        CycleReport {
            transitions: self.transitions,
            outcome,
        }
    }
}

/// Run one check/download/flash cycle.
///
/// Consumes the context: every connection and the sink handle are dropped
/// before this returns, on every path.
pub async fn run_cycle<C, S, R>(
    settings: &UpdateSettings,
    ctx: CycleContext<C, S>,
    restarter: &R,
) -> CycleReport
where
    C: Connector,
    S: FlashSink,
    R: Restarter + ?Sized,
{
    let CycleContext {
        connector,
        mut sink,
    } = ctx;
    let origin = TrustSelector::for_origin(&settings.release_url);
    let mut trace = CycleTrace::start();

    trace.enter(CycleState::Checking);
    info!("Check for update at {}", settings.release_url);
    let release = match resolve(
        &connector,
        &settings.release_url,
        &origin,
        Deadline::starting_now(settings.redirect_deadline),
    )
    .await
    {
        Ok(r) if r.is_success() => r,
        Ok(r) => {
            return trace.fail(format!(
                "release lookup ended at {} with {} ({})",
                r.url,
                r.status,
                r.band()
            ))
        }
        Err(e) => return trace.fail(format!("release lookup failed: {}", e)),
    };

    let tag = extract_tag(&release.url).to_string();
    if !is_new_version(&tag, &settings.running_version) {
        info!("Running version {} is current", settings.running_version);
        trace.enter(CycleState::NoUpdate);
        trace.enter(CycleState::Idle);
        return trace.finish(CycleOutcome::UpToDate { tag });
    }
    info!("New tag detected: {} (running {})", tag, settings.running_version);

    trace.enter(CycleState::Downloading);
    let response = match open_download(settings, &connector, &origin, &release.url, &tag).await {
        Ok(r) => r,
        Err(reason) => return trace.fail(reason),
    };
    let declared = response.content_length.unwrap_or(0);
    info!("Content length: {}", declared);
    let mut body = StallGuard::new(response.body, settings.download_stall);

    if declared == 0 {
        let outcome = flash_write(&mut body, declared, &mut sink).await;
        return trace.fail(outcome.to_string());
    }

    trace.enter(CycleState::Flashing);
    let outcome = flash_write(&mut body, declared, &mut sink).await;
    drop(body);
    if !outcome.authorizes_reboot() {
        return trace.fail(outcome.to_string());
    }

    trace.enter(CycleState::Rebooting);
    info!("Update to {} complete, rebooting", tag);
    drop(sink);
    drop(connector);
    restarter.restart();
    trace.finish(CycleOutcome::Updated { tag })
}

type BodyOf<C> = <<C as Connector>::Session as TransferSession>::Body;

/// Resolve the asset URL for `tag` and start its download
async fn open_download<C: Connector>(
    settings: &UpdateSettings,
    connector: &C,
    origin: &TrustSelector,
    release_url: &str,
    tag: &str,
) -> Result<FetchResponse<BodyOf<C>>, String> {
    let asset_url = build_asset_url(release_url, tag).map_err(|e| e.to_string())?;
    info!("Download begin: {}", asset_url);

    let asset = resolve(
        connector,
        &asset_url,
        origin,
        Deadline::starting_now(settings.redirect_deadline),
    )
    .await
    .map_err(|e| format!("asset lookup failed: {}", e))?;
    if !asset.is_success() {
        return Err(format!(
            "asset lookup ended at {} with {} ({})",
            asset.url,
            asset.status,
            asset.band()
        ));
    }

    let session = connector
        .open(&asset.url, origin.mode_for(&asset.url))
        .map_err(|e| e.to_string())?;
    let response = tokio::time::timeout(settings.download_stall, session.fetch())
        .await
        .map_err(|_| {
            format!(
                "asset download sent no headers within {:?}",
                settings.download_stall
            )
        })?
        .map_err(|e| e.to_string())?;
    info!("GET {} code: {}", asset.url, response.status);

    if StatusBand::classify(response.status) != StatusBand::Success {
        return Err(format!("asset download answered {}", response.status));
    }
    Ok(response)
}

// ============================================================================
// Polling
// ============================================================================

/// Decides when the next cycle may start
///
/// The first check is due immediately; afterwards the interval is measured
/// from the start of the previous cycle.
#[derive(Debug, Clone)]
pub struct PollSchedule {
    interval: Duration,
    last_start: Option<Instant>,
}

impl PollSchedule {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_start: None,
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_start {
            None => true,
            Some(started) => now.saturating_duration_since(started) >= self.interval,
        }
    }

    pub fn mark_started(&mut self, now: Instant) {
        self.last_start = Some(now);
    }

    pub fn last_start(&self) -> Option<Instant> {
        self.last_start
    }
}

/// Runs update cycles on the poll interval until one requests a reboot
pub struct UpdateService<P, R> {
    settings: UpdateSettings,
    resources: P,
    restarter: R,
    tick: Duration,
}

impl<P: CycleResources, R: Restarter> UpdateService<P, R> {
    pub fn new(settings: UpdateSettings, resources: P, restarter: R) -> Self {
        Self {
            settings,
            resources,
            restarter,
            tick: DEFAULT_TICK,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn settings(&self) -> &UpdateSettings {
        &self.settings
    }

    pub fn restarter(&self) -> &R {
        &self.restarter
    }

    /// Poll forever; returns the report of the cycle that requested a reboot
    pub async fn run(&self) -> CycleReport {
        info!(
            "Update service started (running {}, checks every {:?})",
            self.settings.running_version, self.settings.poll_interval
        );
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut schedule = PollSchedule::new(self.settings.poll_interval);

        loop {
            ticker.tick().await;
            let now = Instant::now();
            if !schedule.is_due(now) {
                continue;
            }
            schedule.mark_started(now);

            if let Some(report) = self.poll_once().await {
                if report.outcome.reboot_requested() {
                    return report;
                }
            }
        }
    }

    /// Run a single cycle now; `None` when its resources could not be built
    pub async fn poll_once(&self) -> Option<CycleReport> {
        let ctx = match self.resources.prepare() {
            Ok(ctx) => ctx,
            Err(e) => {
                error!("{}", e);
                return None;
            }
        };

        let report = run_cycle(&self.settings, ctx, &self.restarter).await;
        match &report.outcome {
            CycleOutcome::UpToDate { tag } => debug!("Cycle done, up to date at {}", tag),
            CycleOutcome::Updated { tag } => info!("Cycle done, updated to {}", tag),
            CycleOutcome::Failed { stage, reason } => {
                info!("Cycle abandoned while {} ({}), retrying next interval", stage, reason)
            }
        }
        Some(report)
    }
}
