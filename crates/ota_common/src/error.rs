//! Error types for the update pipeline.
//!
//! Every error here ends the current cycle only; the daemon retries at the
//! next poll interval.

use std::time::Duration;
use thiserror::Error;

/// Failures of a single transfer session (probe or download)
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Request to {url} failed: {reason}")]
    Request { url: String, reason: String },

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("Body stream error: {0}")]
    Stream(String),

    #[error("Body stalled for {0:?}")]
    Stalled(Duration),
}

/// Failures while following the redirect chain
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Redirect {status} from {url} carried no location header")]
    MissingLocation { url: String, status: u16 },

    #[error("No answer from {url} within the {limit:?} redirect deadline")]
    TimedOut { url: String, limit: Duration },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Malformed release URLs
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssetUrlError {
    #[error("Release URL has no release base above the tag: {0}")]
    MissingReleaseBase(String),

    #[error("Release URL carries an empty tag: {0}")]
    EmptyTag(String),
}

/// Per-cycle resources (connector, sink) could not be built
#[derive(Error, Debug)]
#[error("Cycle setup failed: {0}")]
pub struct SetupError(pub String);

impl From<TransportError> for SetupError {
    fn from(e: TransportError) -> Self {
        Self(e.to_string())
    }
}
