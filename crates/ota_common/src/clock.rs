//! Clock readiness gate.
//!
//! Certificate validity cannot be checked against an unsynchronized clock, so
//! no trust-anchored connection is built before the wall clock reports a
//! plausible time. The gate never gives up: stalling is preferable to
//! silently accepting expired certificates.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, info};

/// Unix time below which the clock is considered unsynchronized (16 hours past the epoch)
pub const PLAUSIBLE_EPOCH_SECS: i64 = 8 * 3600 * 2;

/// Delay between clock samples
pub const CLOCK_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// Source of wall-clock time, synchronized by something outside this crate
pub trait WallClock: Send + Sync {
    /// Seconds since the Unix epoch
    fn unix_time(&self) -> i64;
}

/// The host's system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemWallClock;

impl WallClock for SystemWallClock {
    fn unix_time(&self) -> i64 {
        Utc::now().timestamp()
    }
}

/// Proof that the wall clock was trustworthy at least once
///
/// Only `ensure_clock_ready` creates one; trust-anchored connectors require it.
#[derive(Debug, Clone, Copy)]
pub struct ClockReady {
    synced_at: i64,
}

impl ClockReady {
    /// Unix time observed when the gate opened
    pub fn synced_at(&self) -> i64 {
        self.synced_at
    }
}

/// Block until the clock reaches `PLAUSIBLE_EPOCH_SECS`.
pub async fn ensure_clock_ready<C: WallClock + ?Sized>(clock: &C) -> ClockReady {
    info!("Waiting for wall clock sync");
    let mut samples: u64 = 0;

    loop {
        let now = clock.unix_time();
        if now >= PLAUSIBLE_EPOCH_SECS {
            match DateTime::<Utc>::from_timestamp(now, 0) {
                Some(at) => info!("Clock ready, current time: {}", at.to_rfc3339()),
                None => info!("Clock ready, unix time {}", now),
            }
            return ClockReady { synced_at: now };
        }

        samples += 1;
        if samples % 20 == 0 {
            debug!("Clock still unsynced after {} samples (unix time {})", samples, now);
        }
        tokio::time::sleep(CLOCK_SAMPLE_INTERVAL).await;
    }
}
