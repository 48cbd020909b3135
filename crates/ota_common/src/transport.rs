//! Transfer sessions and trust selection.
//!
//! A `Connector` owns two immutable capabilities, one per `TrustMode`, and
//! hands out a fresh `TransferSession` for every probe or download. Sessions
//! are consumed by use, so they cannot be reused across attempts.
//!
//! ## Trust split
//!
//! The origin host (the host of the release-check URL) is always contacted
//! with `TrustMode::Pinned`: the peer must chain to the embedded trust anchor.
//! Any other host met along the redirect chain is a content-delivery host for
//! the asset and is contacted with `TrustMode::Unverified`. Those hosts are
//! only ever reached through a `location` header served by the pinned origin,
//! and pinning them would reject legitimate CDN certificates. Using
//! `Unverified` for the origin would drop the only trust check in the chain.

use crate::error::TransportError;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// Response header requested by every probe
pub const LOCATION_HEADER: &str = "location";

/// Certificate policy of a connection capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrustMode {
    /// Peer must validate against the embedded trust anchor
    Pinned,
    /// No certificate validation (content-delivery hosts only)
    Unverified,
}

impl fmt::Display for TrustMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pinned => write!(f, "pinned"),
            Self::Unverified => write!(f, "unverified"),
        }
    }
}

/// Headers-only answer to a probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
    pub status: u16,
    pub location: Option<String>,
}

impl ProbeResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            location: None,
        }
    }

    pub fn redirect(status: u16, location: impl Into<String>) -> Self {
        Self {
            status,
            location: Some(location.into()),
        }
    }
}

/// Answer to a download request; the body is streamed, never buffered whole
pub struct FetchResponse<B> {
    pub status: u16,
    pub content_length: Option<u64>,
    pub body: B,
}

/// Streaming response body
#[async_trait]
pub trait BodyStream: Send {
    /// Next chunk of the body, `None` once exhausted
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, TransportError>;
}

/// One request against one URL over one connection
#[async_trait]
pub trait TransferSession: Send {
    type Body: BodyStream;

    fn url(&self) -> &str;

    fn trust(&self) -> TrustMode;

    /// Header-only request (HEAD), collecting `location`
    async fn probe(self) -> Result<ProbeResponse, TransportError>;

    /// Full request (GET) returning the body stream
    async fn fetch(self) -> Result<FetchResponse<Self::Body>, TransportError>;
}

/// Opens transfer sessions with a given trust policy
pub trait Connector: Send + Sync {
    type Session: TransferSession;

    fn open(&self, url: &str, trust: TrustMode) -> Result<Self::Session, TransportError>;
}

/// Maps each URL to the trust mode its host requires
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustSelector {
    /// Same mode for every host
    Fixed(TrustMode),
    /// `Pinned` for the origin host, `Unverified` for every other host
    Origin { host: String },
}

impl TrustSelector {
    pub fn fixed(mode: TrustMode) -> Self {
        Self::Fixed(mode)
    }

    /// Selector anchored on the host of the release-check URL
    pub fn for_origin(release_url: &str) -> Self {
        Self::Origin {
            host: host_of(release_url).unwrap_or_default().to_ascii_lowercase(),
        }
    }

    pub fn mode_for(&self, url: &str) -> TrustMode {
        match self {
            Self::Fixed(mode) => *mode,
            Self::Origin { host } => match host_of(url) {
                Some(h) if !host.is_empty() && h.eq_ignore_ascii_case(host) => TrustMode::Pinned,
                _ => TrustMode::Unverified,
            },
        }
    }
}

/// Host part of an absolute URL, without userinfo or port
pub fn host_of(url: &str) -> Option<&str> {
    let (_, rest) = url.split_once("://")?;
    let authority = rest
        .split(|c| c == '/' || c == '?' || c == '#')
        .next()
        .unwrap_or("");
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, h)| h);

    let host = if let Some(bracketed) = host_port.strip_prefix('[') {
        bracketed.split(']').next().unwrap_or("")
    } else {
        host_port.split(':').next().unwrap_or("")
    };

    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

/// Resolve a `location` header against the URL that returned it
///
/// Absolute locations are returned as-is; origin-relative ones (`/path`) and
/// scheme-relative ones (`//host/path`) are joined with the current URL.
pub fn join_location(current: &str, location: &str) -> String {
    let location = location.trim();
    if location.contains("://") {
        return location.to_string();
    }

    let (scheme, rest) = current.split_once("://").unwrap_or(("https", current));
    if let Some(scheme_relative) = location.strip_prefix("//") {
        return format!("{}://{}", scheme, scheme_relative);
    }

    let authority = rest.split('/').next().unwrap_or("");
    if location.starts_with('/') {
        format!("{}://{}{}", scheme, authority, location)
    } else {
        let base = current.rsplit_once('/').map_or(current, |(b, _)| b);
        format!("{}/{}", base, location)
    }
}

/// Bounds every chunk read of a body by a stall timeout
pub struct StallGuard<B> {
    inner: B,
    limit: Duration,
}

impl<B: BodyStream> StallGuard<B> {
    pub fn new(inner: B, limit: Duration) -> Self {
        Self { inner, limit }
    }
}

#[async_trait]
impl<B: BodyStream> BodyStream for StallGuard<B> {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        match tokio::time::timeout(self.limit, self.inner.next_chunk()).await {
            Ok(chunk) => chunk,
            Err(_) => Err(TransportError::Stalled(self.limit)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBody;

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("https://github.com/a/b"), Some("github.com"));
        assert_eq!(host_of("https://github.com"), Some("github.com"));
        assert_eq!(host_of("https://user:pw@example.org:8443/x"), Some("example.org"));
        assert_eq!(host_of("http://[::1]:8080/x"), Some("::1"));
        assert_eq!(host_of("https://cdn.example.net?sig=1"), Some("cdn.example.net"));
        assert_eq!(host_of("no-scheme/path"), None);
        assert_eq!(host_of("https:///path"), None);
    }

    #[test]
    fn test_origin_selector_pins_only_origin() {
        let selector =
            TrustSelector::for_origin("https://github.com/owner/fw/releases/latest");
        assert_eq!(
            selector.mode_for("https://github.com/owner/fw/releases/tag/v1"),
            TrustMode::Pinned
        );
        assert_eq!(
            selector.mode_for("https://GitHub.com/owner/fw/releases/tag/v1"),
            TrustMode::Pinned
        );
        assert_eq!(
            selector.mode_for("https://objects.githubusercontent.com/blob"),
            TrustMode::Unverified
        );
        // Hosts that merely contain the origin name are not the origin
        assert_eq!(
            selector.mode_for("https://github.com.evil.example/x"),
            TrustMode::Unverified
        );
    }

    #[test]
    fn test_fixed_selector() {
        let selector = TrustSelector::fixed(TrustMode::Pinned);
        assert_eq!(selector.mode_for("https://anything.example/x"), TrustMode::Pinned);
    }

    #[test]
    fn test_join_location() {
        let current = "https://github.com/o/r/releases/latest";
        assert_eq!(
            join_location(current, "https://github.com/o/r/releases/tag/v2"),
            "https://github.com/o/r/releases/tag/v2"
        );
        assert_eq!(
            join_location(current, "/o/r/releases/tag/v2"),
            "https://github.com/o/r/releases/tag/v2"
        );
        assert_eq!(
            join_location(current, "//cdn.example.net/blob"),
            "https://cdn.example.net/blob"
        );
        assert_eq!(
            join_location(current, "tag/v2"),
            "https://github.com/o/r/releases/tag/v2"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_guard_passes_chunks() {
        let body = FakeBody::from_chunks(vec![vec![1, 2], vec![3]]);
        let mut guarded = StallGuard::new(body, Duration::from_secs(5));
        assert_eq!(guarded.next_chunk().await.unwrap(), Some(vec![1, 2]));
        assert_eq!(guarded.next_chunk().await.unwrap(), Some(vec![3]));
        assert_eq!(guarded.next_chunk().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_guard_times_out() {
        let body = FakeBody::from_chunks(vec![vec![1; 10]]).stall_after_chunks(Duration::from_secs(600));
        let mut guarded = StallGuard::new(body, Duration::from_secs(5));
        assert!(guarded.next_chunk().await.unwrap().is_some());
        match guarded.next_chunk().await {
            Err(TransportError::Stalled(limit)) => assert_eq!(limit, Duration::from_secs(5)),
            other => panic!("expected stall, got {:?}", other),
        }
    }
}
