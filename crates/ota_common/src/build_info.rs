//! Firmware identity fixed at build time.
//!
//! `build.rs` reads `FIRMWARE_VERSION` and `FIRMWARE_RELEASE_URL` from the
//! build environment; neither can be changed at runtime.

/// Release tag of the running image
pub const RUNNING_VERSION: &str = env!("OTA_RUNNING_VERSION");

/// Well-known "latest release" endpoint
pub const RELEASE_URL: &str = env!("OTA_RELEASE_URL");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_identity_present() {
        assert!(!RUNNING_VERSION.is_empty());
        assert!(RELEASE_URL.contains("://"));
    }
}
