//! Configuration for otad.
//!
//! Loads settings from /etc/otad/config.toml (or `$OTAD_CONFIG`). A missing
//! file means defaults; a file that exists but does not parse is an error.

use anyhow::{Context, Result};
use ota_common::UpdateSettings;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/otad/config.toml";

/// Environment variable overriding `CONFIG_PATH`
pub const CONFIG_ENV: &str = "OTAD_CONFIG";

/// Firmware slot storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotConfig {
    /// Directory holding `slot_a`, `slot_b` and the `active` pointer
    #[serde(default = "default_slot_dir")]
    pub dir: PathBuf,

    /// Largest image a slot accepts
    #[serde(default = "default_capacity_bytes")]
    pub capacity_bytes: u64,
}

fn default_slot_dir() -> PathBuf {
    PathBuf::from("/var/lib/otad/slots")
}

fn default_capacity_bytes() -> u64 {
    4 * 1024 * 1024
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self {
            dir: default_slot_dir(),
            capacity_bytes: default_capacity_bytes(),
        }
    }
}

/// How the device is restarted into a new image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartConfig {
    /// Program and arguments
    #[serde(default = "default_restart_command")]
    pub command: Vec<String>,
}

fn default_restart_command() -> Vec<String> {
    vec!["systemctl".to_string(), "reboot".to_string()]
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            command: default_restart_command(),
        }
    }
}

/// Main otad configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtadConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Ceiling on one redirect walk
    #[serde(default = "default_redirect_deadline")]
    pub redirect_deadline_secs: u64,

    /// Longest wait for the download headers and for each body chunk
    #[serde(default = "default_download_stall")]
    pub download_stall_secs: u64,

    /// Whole-request timeout of one HEAD probe
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    #[serde(default = "default_tick_millis")]
    pub tick_millis: u64,

    /// PEM bundle trusted for the release origin
    #[serde(default = "default_trust_anchor")]
    pub trust_anchor: PathBuf,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Filter used when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub slots: SlotConfig,

    #[serde(default)]
    pub restart: RestartConfig,
}

fn default_poll_interval() -> u64 {
    24 * 60 * 60
}

fn default_redirect_deadline() -> u64 {
    15
}

fn default_download_stall() -> u64 {
    60
}

fn default_probe_timeout() -> u64 {
    10
}

fn default_tick_millis() -> u64 {
    500
}

fn default_trust_anchor() -> PathBuf {
    PathBuf::from("/etc/otad/release-ca.pem")
}

fn default_user_agent() -> String {
    format!("otad/{}", env!("CARGO_PKG_VERSION"))
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for OtadConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            redirect_deadline_secs: default_redirect_deadline(),
            download_stall_secs: default_download_stall(),
            probe_timeout_secs: default_probe_timeout(),
            tick_millis: default_tick_millis(),
            trust_anchor: default_trust_anchor(),
            user_agent: default_user_agent(),
            log_level: default_log_level(),
            slots: SlotConfig::default(),
            restart: RestartConfig::default(),
        }
    }
}

impl OtadConfig {
    /// Load from `$OTAD_CONFIG` or `CONFIG_PATH`
    pub fn load() -> Result<Self> {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(CONFIG_PATH));
        Self::load_from_path(&path)
    }

    /// Load config from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("Config {} not found, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };

        let config: OtadConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.validate()?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let durations = [
            ("poll_interval_secs", self.poll_interval_secs),
            ("redirect_deadline_secs", self.redirect_deadline_secs),
            ("download_stall_secs", self.download_stall_secs),
            ("probe_timeout_secs", self.probe_timeout_secs),
            ("tick_millis", self.tick_millis),
        ];
        for (key, value) in durations {
            if value == 0 {
                anyhow::bail!("{} must be greater than zero", key);
            }
        }
        if self.restart.command.is_empty() {
            anyhow::bail!("restart.command must name a program");
        }
        Ok(())
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_millis)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Cycle settings: compiled-in identity plus configured timings
    pub fn to_settings(&self) -> UpdateSettings {
        UpdateSettings {
            redirect_deadline: Duration::from_secs(self.redirect_deadline_secs),
            download_stall: Duration::from_secs(self.download_stall_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            ..UpdateSettings::from_build()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OtadConfig::default();
        assert_eq!(config.poll_interval_secs, 86400);
        assert_eq!(config.redirect_deadline_secs, 15);
        assert_eq!(config.slots.capacity_bytes, 4 * 1024 * 1024);
        assert_eq!(config.restart.command, vec!["systemctl", "reboot"]);
        assert!(config.user_agent.starts_with("otad/"));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let config: OtadConfig = toml::from_str(
            r#"
            poll_interval_secs = 3600

            [slots]
            dir = "/tmp/otad"
            "#,
        )
        .unwrap();

        assert_eq!(config.poll_interval_secs, 3600);
        assert_eq!(config.download_stall_secs, 60);
        assert_eq!(config.slots.dir, PathBuf::from("/tmp/otad"));
        assert_eq!(config.slots.capacity_bytes, 4 * 1024 * 1024);
    }

    #[test]
    fn test_to_settings() {
        let config = OtadConfig {
            poll_interval_secs: 600,
            redirect_deadline_secs: 5,
            ..OtadConfig::default()
        };
        let settings = config.to_settings();
        assert_eq!(settings.poll_interval, Duration::from_secs(600));
        assert_eq!(settings.redirect_deadline, Duration::from_secs(5));
        assert_eq!(settings.running_version, ota_common::build_info::RUNNING_VERSION);
    }

    #[test]
    fn test_rejects_zero_interval() {
        let config = OtadConfig {
            poll_interval_secs: 0,
            ..OtadConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_timeouts() {
        let stall = OtadConfig {
            download_stall_secs: 0,
            ..OtadConfig::default()
        };
        let err = stall.validate().unwrap_err();
        assert!(err.to_string().contains("download_stall_secs"));

        let deadline = OtadConfig {
            redirect_deadline_secs: 0,
            ..OtadConfig::default()
        };
        let err = deadline.validate().unwrap_err();
        assert!(err.to_string().contains("redirect_deadline_secs"));

        let probe = OtadConfig {
            probe_timeout_secs: 0,
            ..OtadConfig::default()
        };
        assert!(probe.validate().is_err());
        assert!(OtadConfig::default().validate().is_ok());
    }
}
