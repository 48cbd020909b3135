//! OTA Common - firmware update pipeline shared by the daemon and its tests
//!
//! Resolves the "latest release" location through a redirect chain, compares
//! the release tag with the running image, and streams the matching binary
//! into a flash sink. Network, flash, clock and restart are collaborators
//! behind traits; `otad` provides the device implementations and `testing`
//! provides deterministic fakes.

pub mod build_info;
pub mod clock;
pub mod error;
pub mod flash;
pub mod orchestrator;
pub mod release;
pub mod resolver;
pub mod status;
pub mod testing;
pub mod transport;

pub use clock::{ensure_clock_ready, ClockReady, SystemWallClock, WallClock};
pub use error::{AssetUrlError, ResolveError, SetupError, TransportError};
pub use flash::{flash_write, FinalizeReport, FlashOutcome, FlashSink};
pub use orchestrator::{
    run_cycle, CycleContext, CycleOutcome, CycleReport, CycleResources, CycleState, PollSchedule,
    Restarter, UpdateService, UpdateSettings,
};
pub use release::{build_asset_url, extract_tag, is_new_version};
pub use resolver::{resolve, Deadline, Resolution};
pub use status::StatusBand;
pub use transport::{
    BodyStream, Connector, FetchResponse, ProbeResponse, StallGuard, TransferSession, TrustMode,
    TrustSelector,
};
