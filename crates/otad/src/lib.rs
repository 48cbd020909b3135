//! otad - firmware update daemon
//!
//! Device-side implementations of the `ota_common` collaborators: a reqwest
//! connector with a pinned trust anchor, a file-backed A/B slot sink and a
//! command restarter, wired together by `service::DeviceResources`.

pub mod config;
pub mod http;
pub mod logging;
pub mod restart;
pub mod service;
pub mod slot_sink;

pub use config::OtadConfig;
pub use http::{ReqwestConnector, TrustAnchor};
pub use restart::CommandRestarter;
pub use service::DeviceResources;
pub use slot_sink::{ActiveSlot, FileSlotSink, SinkError, Slot};
