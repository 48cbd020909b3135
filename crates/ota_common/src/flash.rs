//! Streaming flash writer.
//!
//! Moves a response body of declared length into a `FlashSink` chunk by
//! chunk. Only `FlashOutcome::Success` authorizes booting the new image; the
//! sink itself guarantees that anything short of a finalized, valid image is
//! never committed.

use crate::transport::BodyStream;
use std::fmt;
use tracing::{debug, error, info, warn};

/// Result of `FlashSink::finalize`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalizeReport {
    /// The sink committed the image
    pub committed: bool,
    /// The committed image is complete and bootable
    pub valid: bool,
}

impl FinalizeReport {
    pub fn accepted(&self) -> bool {
        self.committed && self.valid
    }
}

/// Update-capable storage for one firmware image
///
/// Atomic-or-rejecting: either a full valid image is committed by
/// `finalize`, or nothing is.
pub trait FlashSink: Send {
    /// Reserve room for an image of `size` bytes; false when it cannot fit
    fn reserve(&mut self, size: u64) -> bool;

    /// Append bytes, returning how many were accepted
    fn append(&mut self, bytes: &[u8]) -> usize;

    /// Commit the image if it is complete and valid
    fn finalize(&mut self) -> FinalizeReport;

    /// Sink-specific code of the last error, 0 when none
    fn error_code(&self) -> i32;
}

/// How a flash attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashOutcome {
    /// Every declared byte written and the image committed as valid
    Success,
    /// Stream ended (or sink stopped accepting) before the declared length
    PartialWrite { written: u64, declared: u64 },
    /// Sink refused to commit the image
    SinkRejected { code: i32 },
    /// Sink has no room for the declared length
    InsufficientSpace,
    /// Response declared no content
    NoContent,
}

impl FlashOutcome {
    pub fn authorizes_reboot(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for FlashOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "image written and committed"),
            Self::PartialWrite { written, declared } => {
                write!(f, "written only {}/{} bytes", written, declared)
            }
            Self::SinkRejected { code } => write!(f, "sink rejected image (error #{})", code),
            Self::InsufficientSpace => write!(f, "not enough space to begin update"),
            Self::NoContent => write!(f, "no content in the response"),
        }
    }
}

/// Bytes accepted by the sink against the declared length
#[derive(Debug, Clone, Copy)]
struct FlashProgress {
    written: u64,
    declared: u64,
    reported_decile: u64,
}

impl FlashProgress {
    fn new(declared: u64) -> Self {
        Self {
            written: 0,
            declared,
            reported_decile: 0,
        }
    }

    fn record(&mut self, accepted: usize) {
        self.written += accepted as u64;
        let decile = (self.written.min(self.declared) * 10) / self.declared.max(1);
        if decile > self.reported_decile {
            self.reported_decile = decile;
            debug!(
                "Flash progress {}% ({}/{} bytes)",
                decile * 10,
                self.written,
                self.declared
            );
        }
    }

    fn complete(&self) -> bool {
        self.written == self.declared
    }
}

/// Stream `body` into `sink`, expecting exactly `declared` bytes.
pub async fn flash_write<B, S>(body: &mut B, declared: u64, sink: &mut S) -> FlashOutcome
where
    B: BodyStream + ?Sized,
    S: FlashSink + ?Sized,
{
    if declared == 0 {
        warn!("There was no content in the response");
        drain(body).await;
        return FlashOutcome::NoContent;
    }

    if !sink.reserve(declared) {
        error!("Not enough space to begin update ({} bytes)", declared);
        drain(body).await;
        return FlashOutcome::InsufficientSpace;
    }

    info!("Begin flashing {} bytes", declared);
    let mut progress = FlashProgress::new(declared);

    loop {
        let chunk = match body.next_chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => {
                warn!("Download interrupted after {} bytes: {}", progress.written, e);
                break;
            }
        };
        if chunk.is_empty() {
            continue;
        }

        let accepted = sink.append(&chunk);
        progress.record(accepted);
        if accepted < chunk.len() {
            warn!(
                "Sink accepted {} of {} bytes (error #{}), stopping write",
                accepted,
                chunk.len(),
                sink.error_code()
            );
            drain(body).await;
            break;
        }
    }

    if progress.complete() {
        info!("Written {} bytes successfully", progress.written);
    } else {
        warn!("Written only {}/{} bytes", progress.written, declared);
    }

    // Finalize even after a short write so the sink reports its own error
    let report = sink.finalize();

    if !progress.complete() {
        if !report.accepted() {
            debug!("Sink refused partial image (error #{})", sink.error_code());
        }
        return FlashOutcome::PartialWrite {
            written: progress.written,
            declared,
        };
    }

    if !report.committed {
        let code = sink.error_code();
        error!("Finalize failed, error #{}", code);
        return FlashOutcome::SinkRejected { code };
    }
    if !report.valid {
        let code = sink.error_code();
        error!("Update not finished, image invalid (error #{})", code);
        return FlashOutcome::SinkRejected { code };
    }

    info!("Update successfully completed");
    FlashOutcome::Success
}

/// Read and discard the rest of a body
async fn drain<B: BodyStream + ?Sized>(body: &mut B) {
    let mut discarded: u64 = 0;
    loop {
        match body.next_chunk().await {
            Ok(Some(chunk)) => discarded += chunk.len() as u64,
            Ok(None) => break,
            Err(e) => {
                debug!("Drain stopped: {}", e);
                break;
            }
        }
    }
    if discarded > 0 {
        debug!("Discarded {} unread bytes", discarded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBody, FakeFlashSink};

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_full_write_succeeds() {
        let data = payload(1000);
        let mut body = FakeBody::chunked(&data, 128);
        let mut sink = FakeFlashSink::new();

        let outcome = flash_write(&mut body, 1000, &mut sink).await;

        assert_eq!(outcome, FlashOutcome::Success);
        assert!(outcome.authorizes_reboot());
        let state = sink.snapshot();
        assert_eq!(state.data, data);
        assert_eq!(state.reserved, Some(1000));
        assert_eq!(state.finalize_calls, 1);
    }

    #[tokio::test]
    async fn test_sink_short_write_is_partial() {
        let mut body = FakeBody::chunked(&payload(1000), 100);
        let mut sink = FakeFlashSink::new().accept_only(998);

        let outcome = flash_write(&mut body, 1000, &mut sink).await;

        assert_eq!(
            outcome,
            FlashOutcome::PartialWrite {
                written: 998,
                declared: 1000
            }
        );
        assert!(!outcome.authorizes_reboot());
        let state = sink.snapshot();
        assert_eq!(state.finalize_calls, 1);
        assert!(!state.committed);
        assert!(body.is_drained());
    }

    #[tokio::test]
    async fn test_truncated_stream_is_partial() {
        let mut body = FakeBody::chunked(&payload(600), 100).fail_at_end();
        let mut sink = FakeFlashSink::new();

        let outcome = flash_write(&mut body, 1000, &mut sink).await;

        assert_eq!(
            outcome,
            FlashOutcome::PartialWrite {
                written: 600,
                declared: 1000
            }
        );
        assert_eq!(sink.snapshot().finalize_calls, 1);
        assert!(!sink.snapshot().committed);
    }

    #[tokio::test]
    async fn test_overlong_stream_is_partial() {
        let mut body = FakeBody::chunked(&payload(1200), 100);
        let mut sink = FakeFlashSink::new();

        let outcome = flash_write(&mut body, 1000, &mut sink).await;

        // The sink refuses bytes past the reservation and will not commit
        assert_eq!(
            outcome,
            FlashOutcome::SinkRejected {
                code: FakeFlashSink::OVERFLOW_CODE
            }
        );
        assert_eq!(sink.snapshot().data.len(), 1000);
        assert!(body.is_drained());
    }

    #[tokio::test]
    async fn test_zero_length_never_touches_sink() {
        let mut body = FakeBody::chunked(&payload(10), 4);
        let mut sink = FakeFlashSink::new();

        let outcome = flash_write(&mut body, 0, &mut sink).await;

        assert_eq!(outcome, FlashOutcome::NoContent);
        let state = sink.snapshot();
        assert_eq!(state.reserve_calls, 0);
        assert_eq!(state.append_calls, 0);
        assert_eq!(state.finalize_calls, 0);
        assert!(body.is_drained());
    }

    #[tokio::test]
    async fn test_reserve_refused_never_appends() {
        let mut body = FakeBody::chunked(&payload(1000), 100);
        let mut sink = FakeFlashSink::new().refuse_space();

        let outcome = flash_write(&mut body, 1000, &mut sink).await;

        assert_eq!(outcome, FlashOutcome::InsufficientSpace);
        let state = sink.snapshot();
        assert_eq!(state.reserve_calls, 1);
        assert_eq!(state.append_calls, 0);
        assert_eq!(state.finalize_calls, 0);
        assert!(body.is_drained());
    }

    #[tokio::test]
    async fn test_invalid_image_rejected() {
        let mut body = FakeBody::chunked(&payload(1000), 250);
        let mut sink = FakeFlashSink::new().invalid_image(8);

        let outcome = flash_write(&mut body, 1000, &mut sink).await;

        assert_eq!(outcome, FlashOutcome::SinkRejected { code: 8 });
        assert!(!outcome.authorizes_reboot());
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(
            FlashOutcome::PartialWrite {
                written: 998,
                declared: 1000
            }
            .to_string(),
            "written only 998/1000 bytes"
        );
        assert_eq!(
            FlashOutcome::SinkRejected { code: 6 }.to_string(),
            "sink rejected image (error #6)"
        );
    }
}
