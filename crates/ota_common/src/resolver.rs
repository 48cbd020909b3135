//! Redirect resolver.
//!
//! Follows a redirect chain one hop at a time with header-only probes, so the
//! trust mode can change with the host and the whole walk stays under an
//! explicit deadline. Each hop is a single attempt on a fresh session.

use crate::error::ResolveError;
use crate::status::StatusBand;
use crate::transport::{join_location, Connector, TransferSession, TrustSelector};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Ceiling on one redirect walk
pub const DEFAULT_REDIRECT_DEADLINE: Duration = Duration::from_secs(15);

/// Point in time after which no further probe is issued
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    limit: Duration,
}

impl Deadline {
    pub fn starting_now(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn expired(&self) -> bool {
        self.elapsed() > self.limit
    }

    /// Time left before expiry, zero once passed
    pub fn remaining(&self) -> Duration {
        self.limit.saturating_sub(self.elapsed())
    }
}

/// Where a redirect walk ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Last URL adopted by the walk
    pub url: String,
    /// Status of the last probe
    pub status: u16,
    /// Probes issued
    pub probes: u32,
}

impl Resolution {
    pub fn band(&self) -> StatusBand {
        StatusBand::classify(self.status)
    }

    pub fn is_success(&self) -> bool {
        self.band() == StatusBand::Success
    }
}

/// Walk the redirect chain starting at `start_url`.
///
/// Stops on the first non-redirect status, or once the deadline has passed,
/// returning the last-seen status and URL. A deadline stop leaves the
/// resolution in the redirect band, which callers treat as failure. Each
/// probe is itself bounded by the time left, so an unanswered request ends
/// the walk at the deadline; with no status seen yet that is `TimedOut`.
pub async fn resolve<C: Connector + ?Sized>(
    connector: &C,
    start_url: &str,
    trust: &TrustSelector,
    deadline: Deadline,
) -> Result<Resolution, ResolveError> {
    let mut url = start_url.to_string();
    let mut probes: u32 = 0;
    let mut last_status: Option<u16> = None;

    loop {
        let mode = trust.mode_for(&url);
        debug!("Probing {} ({})", url, mode);
        let session = connector.open(&url, mode)?;
        probes += 1;
        let response = match tokio::time::timeout(deadline.remaining(), session.probe()).await {
            Ok(response) => response?,
            Err(_) => {
                warn!(
                    "Probe of {} unanswered at the {:?} redirect deadline",
                    url,
                    deadline.limit()
                );
                return match last_status {
                    Some(status) => Ok(Resolution {
                        url,
                        status,
                        probes,
                    }),
                    None => Err(ResolveError::TimedOut {
                        url,
                        limit: deadline.limit(),
                    }),
                };
            }
        };
        last_status = Some(response.status);

        if StatusBand::classify(response.status) != StatusBand::Redirect {
            debug!("Resolved {} with status {} after {} probes", url, response.status, probes);
            return Ok(Resolution {
                url,
                status: response.status,
                probes,
            });
        }

        let location = response
            .location
            .filter(|l| !l.trim().is_empty())
            .ok_or_else(|| ResolveError::MissingLocation {
                url: url.clone(),
                status: response.status,
            })?;
        url = join_location(&url, &location);
        debug!("Redirects to: {}", url);

        if deadline.expired() {
            warn!(
                "Redirect deadline of {:?} exceeded after {} probes, last location {}",
                deadline.limit(),
                probes,
                url
            );
            return Ok(Resolution {
                url,
                status: response.status,
                probes,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeConnector, FakeMethod};
    use crate::transport::{ProbeResponse, TrustMode};

    fn pinned() -> TrustSelector {
        TrustSelector::fixed(TrustMode::Pinned)
    }

    #[tokio::test(start_paused = true)]
    async fn test_follows_chain_to_success() {
        let connector = FakeConnector::new()
            .redirect("https://a.example/latest", 302, "https://a.example/b")
            .redirect("https://a.example/b", 302, "https://a.example/c")
            .status("https://a.example/c", 200);

        let resolution = resolve(
            &connector,
            "https://a.example/latest",
            &pinned(),
            Deadline::starting_now(DEFAULT_REDIRECT_DEADLINE),
        )
        .await
        .unwrap();

        assert_eq!(resolution.url, "https://a.example/c");
        assert_eq!(resolution.status, 200);
        assert_eq!(resolution.probes, 3);
        assert!(resolution.is_success());
        assert_eq!(connector.count(FakeMethod::Probe), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_on_failure_status() {
        let connector = FakeConnector::new()
            .redirect("https://a.example/latest", 301, "https://a.example/gone")
            .status("https://a.example/gone", 404);

        let resolution = resolve(
            &connector,
            "https://a.example/latest",
            &pinned(),
            Deadline::starting_now(DEFAULT_REDIRECT_DEADLINE),
        )
        .await
        .unwrap();

        assert_eq!(resolution.status, 404);
        assert_eq!(resolution.band(), StatusBand::Failure);
        assert_eq!(resolution.probes, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_redirect_without_location_fails() {
        let connector = FakeConnector::new()
            .probe_response("https://a.example/latest", ProbeResponse::new(302));

        let result = resolve(
            &connector,
            "https://a.example/latest",
            &pinned(),
            Deadline::starting_now(DEFAULT_REDIRECT_DEADLINE),
        )
        .await;

        match result {
            Err(ResolveError::MissingLocation { url, status }) => {
                assert_eq!(url, "https://a.example/latest");
                assert_eq!(status, 302);
            }
            other => panic!("expected missing location, got {:?}", other),
        }
        assert_eq!(connector.count(FakeMethod::Probe), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_location_is_missing() {
        let connector = FakeConnector::new()
            .probe_response("https://a.example/latest", ProbeResponse::redirect(307, "  "));

        let result = resolve(
            &connector,
            "https://a.example/latest",
            &pinned(),
            Deadline::starting_now(DEFAULT_REDIRECT_DEADLINE),
        )
        .await;
        assert!(matches!(result, Err(ResolveError::MissingLocation { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_bounds_redirect_loop() {
        // Every probe takes 4s and points back at itself
        let connector = FakeConnector::new()
            .redirect("https://a.example/loop", 302, "https://a.example/loop")
            .probe_delay(Duration::from_secs(4));
        let started = Instant::now();

        let resolution = resolve(
            &connector,
            "https://a.example/loop",
            &pinned(),
            Deadline::starting_now(Duration::from_secs(15)),
        )
        .await
        .unwrap();

        // Probes issued at 0s, 4s, 8s, 12s; the last is cut off at 15s
        assert_eq!(resolution.probes, 4);
        assert_eq!(connector.count(FakeMethod::Probe), 4);
        assert_eq!(resolution.status, 302);
        assert_eq!(resolution.url, "https://a.example/loop");
        assert_eq!(resolution.band(), StatusBand::Redirect);
        assert_eq!(started.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_first_probe_times_out_at_deadline() {
        let connector = FakeConnector::new()
            .status("https://a.example/latest", 200)
            .probe_delay(Duration::from_secs(3600));
        let started = Instant::now();

        let result = resolve(
            &connector,
            "https://a.example/latest",
            &pinned(),
            Deadline::starting_now(Duration::from_secs(15)),
        )
        .await;

        match result {
            Err(ResolveError::TimedOut { url, limit }) => {
                assert_eq!(url, "https://a.example/latest");
                assert_eq!(limit, Duration::from_secs(15));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(started.elapsed(), Duration::from_secs(15));
        assert_eq!(connector.count(FakeMethod::Probe), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_shrinks_to_zero() {
        let deadline = Deadline::starting_now(Duration::from_secs(15));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(deadline.remaining(), Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(deadline.remaining(), Duration::ZERO);
        assert!(deadline.expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_ends_walk() {
        let connector = FakeConnector::new()
            .redirect("https://a.example/latest", 302, "https://a.example/down")
            .unreachable("https://a.example/down");

        let result = resolve(
            &connector,
            "https://a.example/latest",
            &pinned(),
            Deadline::starting_now(DEFAULT_REDIRECT_DEADLINE),
        )
        .await;
        assert!(matches!(result, Err(ResolveError::Transport(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_trust_switches_with_host() {
        let connector = FakeConnector::new()
            .redirect(
                "https://github.com/o/fw/releases/download/v2/firmware-v2.bin",
                302,
                "https://objects.cdn.example/blob?sig=abc",
            )
            .status("https://objects.cdn.example/blob?sig=abc", 200);
        let selector = TrustSelector::for_origin("https://github.com/o/fw/releases/latest");

        let resolution = resolve(
            &connector,
            "https://github.com/o/fw/releases/download/v2/firmware-v2.bin",
            &selector,
            Deadline::starting_now(DEFAULT_REDIRECT_DEADLINE),
        )
        .await
        .unwrap();

        assert!(resolution.is_success());
        let trusts: Vec<TrustMode> = connector.calls().iter().map(|c| c.trust).collect();
        assert_eq!(trusts, vec![TrustMode::Pinned, TrustMode::Unverified]);
    }
}
