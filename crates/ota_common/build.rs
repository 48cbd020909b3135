// Build script for ota_common - embeds the running firmware identity at compile time

/// Tag of the image being built (release CI sets it to the release tag)
const DEFAULT_VERSION: &str = "v0.0.0";

/// Well-known "latest release" endpoint polled by the updater
const DEFAULT_RELEASE_URL: &str = "https://github.com/aviborg/esp-ota-sandbox/releases/latest";

fn main() {
    let version =
        std::env::var("FIRMWARE_VERSION").unwrap_or_else(|_| DEFAULT_VERSION.to_string());
    let release_url =
        std::env::var("FIRMWARE_RELEASE_URL").unwrap_or_else(|_| DEFAULT_RELEASE_URL.to_string());

    println!("cargo:rustc-env=OTA_RUNNING_VERSION={}", version);
    println!("cargo:rustc-env=OTA_RELEASE_URL={}", release_url);

    println!("cargo:rerun-if-env-changed=FIRMWARE_VERSION");
    println!("cargo:rerun-if-env-changed=FIRMWARE_RELEASE_URL");
}
