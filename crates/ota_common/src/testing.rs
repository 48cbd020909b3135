//! Deterministic fakes for the pipeline collaborators.
//!
//! No network, flash or clock access: responses are scripted per URL and
//! every call is recorded for assertions. Delays go through `tokio::time`,
//! so tests run them instantly under a paused clock.
//!
//! ```rust,ignore
//! let connector = FakeConnector::new()
//!     .redirect("https://origin/latest", 302, "https://origin/tag/v2")
//!     .status("https://origin/tag/v2", 200);
//! ```

use crate::error::{SetupError, TransportError};
use crate::flash::{FinalizeReport, FlashSink};
use crate::orchestrator::{CycleContext, CycleResources, Restarter};
use crate::transport::{
    BodyStream, Connector, FetchResponse, ProbeResponse, TransferSession, TrustMode,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Fake body
// ============================================================================

/// Scripted response body
#[derive(Debug, Clone, Default)]
pub struct FakeBody {
    chunks: VecDeque<Vec<u8>>,
    fail_at_end: bool,
    stall: Option<Duration>,
}

impl FakeBody {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_chunks(chunks: Vec<Vec<u8>>) -> Self {
        Self {
            chunks: chunks.into(),
            ..Self::default()
        }
    }

    /// Split `data` into chunks of at most `size` bytes
    pub fn chunked(data: &[u8], size: usize) -> Self {
        Self::from_chunks(data.chunks(size.max(1)).map(|c| c.to_vec()).collect())
    }

    /// End with a stream error instead of a clean end of body
    pub fn fail_at_end(mut self) -> Self {
        self.fail_at_end = true;
        self
    }

    /// Hang for `stall` once the scripted chunks are consumed
    pub fn stall_after_chunks(mut self, stall: Duration) -> Self {
        self.stall = Some(stall);
        self
    }

    /// True once every scripted chunk was read
    pub fn is_drained(&self) -> bool {
        self.chunks.is_empty()
    }
}

#[async_trait]
impl BodyStream for FakeBody {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        if let Some(chunk) = self.chunks.pop_front() {
            return Ok(Some(chunk));
        }
        if let Some(stall) = self.stall {
            tokio::time::sleep(stall).await;
        }
        if self.fail_at_end {
            return Err(TransportError::Stream("connection reset by peer".to_string()));
        }
        Ok(None)
    }
}

// ============================================================================
// Fake connector
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeMethod {
    Probe,
    Fetch,
}

/// One recorded session use
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeCall {
    pub method: FakeMethod,
    pub url: String,
    pub trust: TrustMode,
}

#[derive(Debug, Clone)]
struct FakeAsset {
    status: u16,
    content_length: Option<u64>,
    body: FakeBody,
}

#[derive(Debug, Default)]
struct ConnectorState {
    probes: HashMap<String, ProbeResponse>,
    assets: HashMap<String, FakeAsset>,
    unreachable: HashSet<String>,
    probe_delay: Duration,
    fetch_delay: Duration,
    calls: Vec<FakeCall>,
}

/// Connector answering from per-URL scripts
///
/// Unscripted URLs answer 404. Clones share scripts and the call log.
#[derive(Debug, Clone, Default)]
pub struct FakeConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn probe_response(self, url: &str, response: ProbeResponse) -> Self {
        lock(&self.state).probes.insert(url.to_string(), response);
        self
    }

    pub fn redirect(self, from: &str, status: u16, to: &str) -> Self {
        self.probe_response(from, ProbeResponse::redirect(status, to))
    }

    pub fn status(self, url: &str, status: u16) -> Self {
        self.probe_response(url, ProbeResponse::new(status))
    }

    /// Serve `data` at `url` (probe 200, GET 200 with content length)
    pub fn asset(self, url: &str, data: &[u8]) -> Self {
        let connector = self.fetch_response(
            url,
            200,
            Some(data.len() as u64),
            FakeBody::chunked(data, 512),
        );
        let has_probe = lock(&connector.state).probes.contains_key(url);
        if has_probe {
            connector
        } else {
            connector.status(url, 200)
        }
    }

    pub fn fetch_response(
        self,
        url: &str,
        status: u16,
        content_length: Option<u64>,
        body: FakeBody,
    ) -> Self {
        lock(&self.state).assets.insert(
            url.to_string(),
            FakeAsset {
                status,
                content_length,
                body,
            },
        );
        self
    }

    /// Every request to `url` fails at the transport level
    pub fn unreachable(self, url: &str) -> Self {
        lock(&self.state).unreachable.insert(url.to_string());
        self
    }

    /// Time each probe takes
    pub fn probe_delay(self, delay: Duration) -> Self {
        lock(&self.state).probe_delay = delay;
        self
    }

    /// Time each GET takes before its headers arrive
    pub fn fetch_delay(self, delay: Duration) -> Self {
        lock(&self.state).fetch_delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        lock(&self.state).calls.clone()
    }

    pub fn count(&self, method: FakeMethod) -> usize {
        lock(&self.state)
            .calls
            .iter()
            .filter(|c| c.method == method)
            .count()
    }
}

impl Connector for FakeConnector {
    type Session = FakeSession;

    fn open(&self, url: &str, trust: TrustMode) -> Result<FakeSession, TransportError> {
        Ok(FakeSession {
            url: url.to_string(),
            trust,
            state: Arc::clone(&self.state),
        })
    }
}

/// Session handed out by `FakeConnector`
#[derive(Debug)]
pub struct FakeSession {
    url: String,
    trust: TrustMode,
    state: Arc<Mutex<ConnectorState>>,
}

impl FakeSession {
    fn record(&self, method: FakeMethod) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.calls.push(FakeCall {
            method,
            url: self.url.clone(),
            trust: self.trust,
        });
        if state.unreachable.contains(&self.url) {
            return Err(TransportError::Request {
                url: self.url.clone(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl TransferSession for FakeSession {
    type Body = FakeBody;

    fn url(&self) -> &str {
        &self.url
    }

    fn trust(&self) -> TrustMode {
        self.trust
    }

    async fn probe(self) -> Result<ProbeResponse, TransportError> {
        self.record(FakeMethod::Probe)?;
        let (delay, response) = {
            let state = lock(&self.state);
            let response = state
                .probes
                .get(&self.url)
                .cloned()
                .unwrap_or_else(|| ProbeResponse::new(404));
            (state.probe_delay, response)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(response)
    }

    async fn fetch(self) -> Result<FetchResponse<FakeBody>, TransportError> {
        self.record(FakeMethod::Fetch)?;
        let (delay, asset) = {
            let state = lock(&self.state);
            (state.fetch_delay, state.assets.get(&self.url).cloned())
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(match asset {
            Some(asset) => FetchResponse {
                status: asset.status,
                content_length: asset.content_length,
                body: asset.body,
            },
            None => FetchResponse {
                status: 404,
                content_length: Some(0),
                body: FakeBody::empty(),
            },
        })
    }
}

// ============================================================================
// Fake flash sink
// ============================================================================

/// Everything the fake sink observed
#[derive(Debug, Clone, Default)]
pub struct FakeSinkState {
    pub reserved: Option<u64>,
    pub data: Vec<u8>,
    pub committed: bool,
    pub error_code: i32,
    pub reserve_calls: usize,
    pub append_calls: usize,
    pub finalize_calls: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct SinkBehaviour {
    refuse_space: bool,
    accept_limit: Option<u64>,
    invalid_code: Option<i32>,
}

/// In-memory sink with scriptable failures
///
/// Clones share the recorded state, so a test can keep a handle after the
/// sink moved into a cycle.
#[derive(Debug, Clone, Default)]
pub struct FakeFlashSink {
    behaviour: SinkBehaviour,
    state: Arc<Mutex<FakeSinkState>>,
}

impl FakeFlashSink {
    /// Write failed (accept limit reached)
    pub const WRITE_CODE: i32 = 1;
    /// Reservation refused, or bytes past the reservation
    pub const OVERFLOW_CODE: i32 = 4;
    /// Finalized with a size different from the reservation
    pub const SIZE_CODE: i32 = 5;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn refuse_space(mut self) -> Self {
        self.behaviour.refuse_space = true;
        self
    }

    /// Stop accepting bytes after `limit` in total
    pub fn accept_only(mut self, limit: u64) -> Self {
        self.behaviour.accept_limit = Some(limit);
        self
    }

    /// Complete images fail validation with `code`
    pub fn invalid_image(mut self, code: i32) -> Self {
        self.behaviour.invalid_code = Some(code);
        self
    }

    pub fn snapshot(&self) -> FakeSinkState {
        lock(&self.state).clone()
    }
}

impl FlashSink for FakeFlashSink {
    fn reserve(&mut self, size: u64) -> bool {
        let mut state = lock(&self.state);
        state.reserve_calls += 1;
        if self.behaviour.refuse_space {
            state.error_code = Self::OVERFLOW_CODE;
            return false;
        }
        state.reserved = Some(size);
        state.data.clear();
        state.error_code = 0;
        true
    }

    fn append(&mut self, bytes: &[u8]) -> usize {
        let mut state = lock(&self.state);
        state.append_calls += 1;
        let Some(reserved) = state.reserved else {
            state.error_code = Self::WRITE_CODE;
            return 0;
        };

        let limit = self.behaviour.accept_limit.unwrap_or(u64::MAX);
        let capacity = reserved.min(limit);
        let room = capacity.saturating_sub(state.data.len() as u64);
        let take = (bytes.len() as u64).min(room) as usize;
        state.data.extend_from_slice(&bytes[..take]);

        if take < bytes.len() {
            state.error_code = if limit < reserved {
                Self::WRITE_CODE
            } else {
                Self::OVERFLOW_CODE
            };
        }
        take
    }

    fn finalize(&mut self) -> FinalizeReport {
        let mut state = lock(&self.state);
        state.finalize_calls += 1;

        let complete = state.reserved == Some(state.data.len() as u64);
        if !complete || state.error_code != 0 {
            if state.error_code == 0 {
                state.error_code = Self::SIZE_CODE;
            }
            state.committed = false;
            return FinalizeReport {
                committed: false,
                valid: false,
            };
        }

        if let Some(code) = self.behaviour.invalid_code {
            state.error_code = code;
            state.committed = false;
            return FinalizeReport {
                committed: true,
                valid: false,
            };
        }

        state.committed = true;
        FinalizeReport {
            committed: true,
            valid: true,
        }
    }

    fn error_code(&self) -> i32 {
        lock(&self.state).error_code
    }
}

// ============================================================================
// Fake clock, restarter, resources
// ============================================================================

/// Unix time reported once the fake clock is "synced"
pub const FAKE_SYNCED_TIME: i64 = 1_700_000_000;

/// Unix time reported before sync (seconds since boot)
pub const FAKE_UNSYNCED_TIME: i64 = 3;

/// Clock that becomes plausible after a number of samples
#[derive(Debug, Default)]
pub struct FakeWallClock {
    sync_after: Option<u64>,
    samples: AtomicU64,
}

impl FakeWallClock {
    pub fn synced() -> Self {
        Self::syncing_after(0)
    }

    pub fn syncing_after(samples: u64) -> Self {
        Self {
            sync_after: Some(samples),
            samples: AtomicU64::new(0),
        }
    }

    pub fn never_synced() -> Self {
        Self::default()
    }

    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::SeqCst)
    }
}

impl crate::clock::WallClock for FakeWallClock {
    fn unix_time(&self) -> i64 {
        let n = self.samples.fetch_add(1, Ordering::SeqCst);
        match self.sync_after {
            Some(after) if n >= after => FAKE_SYNCED_TIME,
            _ => FAKE_UNSYNCED_TIME,
        }
    }
}

/// Counts restart requests
#[derive(Debug, Clone, Default)]
pub struct FakeRestarter {
    restarts: Arc<AtomicUsize>,
}

impl FakeRestarter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }
}

impl Restarter for FakeRestarter {
    fn restart(&self) {
        self.restarts.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands every cycle clones of one fake connector and sink
#[derive(Debug, Clone, Default)]
pub struct FakeResources {
    pub connector: FakeConnector,
    pub sink: FakeFlashSink,
    fail_setup: bool,
    prepared: Arc<AtomicUsize>,
}

impl FakeResources {
    pub fn new(connector: FakeConnector, sink: FakeFlashSink) -> Self {
        Self {
            connector,
            sink,
            fail_setup: false,
            prepared: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Every `prepare` fails
    pub fn failing() -> Self {
        Self {
            fail_setup: true,
            ..Self::default()
        }
    }

    /// Contexts requested so far (one per started cycle)
    pub fn prepared(&self) -> usize {
        self.prepared.load(Ordering::SeqCst)
    }
}

impl CycleResources for FakeResources {
    type Connector = FakeConnector;
    type Sink = FakeFlashSink;

    fn prepare(&self) -> Result<CycleContext<FakeConnector, FakeFlashSink>, SetupError> {
        self.prepared.fetch_add(1, Ordering::SeqCst);
        if self.fail_setup {
            return Err(SetupError("trust anchor unavailable".to_string()));
        }
        Ok(CycleContext {
            connector: self.connector.clone(),
            sink: self.sink.clone(),
        })
    }
}
