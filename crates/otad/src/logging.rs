//! Logging setup.
//!
//! The subscriber is installed before the config file is read so config
//! loading is logged too; the configured `log_level` is applied afterwards
//! unless `RUST_LOG` is set.

use anyhow::{Context, Result};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

/// Filter in effect until the config is loaded
pub const DEFAULT_LEVEL: &str = "info";

pub struct LogHandle {
    handle: reload::Handle<EnvFilter, Registry>,
    from_env: bool,
}

/// Install the global subscriber
pub fn init() -> LogHandle {
    let (filter, from_env) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, true),
        Err(_) => (EnvFilter::new(DEFAULT_LEVEL), false),
    };
    let (filter, handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();

    LogHandle { handle, from_env }
}

impl LogHandle {
    /// Switch to the configured level; `RUST_LOG` wins when present
    pub fn apply_level(&self, level: &str) -> Result<()> {
        if self.from_env {
            return Ok(());
        }
        let filter = EnvFilter::try_new(level)
            .with_context(|| format!("Invalid log_level {:?}", level))?;
        self.handle
            .reload(filter)
            .context("Failed to apply log_level")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tracing::{debug, info};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    fn capturing(from_env: bool) -> (impl tracing::Subscriber + Send + Sync, LogHandle, Captured) {
        let captured = Captured::default();
        let writer = captured.clone();
        let (filter, handle) = reload::Layer::new(EnvFilter::new(DEFAULT_LEVEL));
        let subscriber = tracing_subscriber::registry().with(filter).with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(move || writer.clone()),
        );
        (subscriber, LogHandle { handle, from_env }, captured)
    }

    #[test]
    fn test_logs_before_and_after_config_level() {
        let (subscriber, logs, captured) = capturing(false);

        tracing::subscriber::with_default(subscriber, || {
            info!("before config");
            debug!("hidden at default level");
            logs.apply_level("debug").unwrap();
            debug!("shown after config");
        });

        let text = captured.text();
        assert!(text.contains("before config"));
        assert!(!text.contains("hidden at default level"));
        assert!(text.contains("shown after config"));
    }

    #[test]
    fn test_env_filter_wins_over_config() {
        let (subscriber, logs, captured) = capturing(true);

        tracing::subscriber::with_default(subscriber, || {
            logs.apply_level("debug").unwrap();
            debug!("still filtered");
        });

        assert!(!captured.text().contains("still filtered"));
    }

    #[test]
    fn test_invalid_level_is_an_error() {
        let (_subscriber, logs, _) = capturing(false);
        assert!(logs.apply_level("info,[[[").is_err());
    }
}
