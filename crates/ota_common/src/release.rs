//! Release tag extraction and asset URL construction.
//!
//! Release pages live at `<base>/tag/<tag>` and their binaries at
//! `<base>/download/<tag>/firmware-<tag>.bin`.

use crate::error::AssetUrlError;

/// File name prefix of the firmware asset attached to every release
pub const ASSET_PREFIX: &str = "firmware-";

/// File name suffix of the firmware asset
pub const ASSET_SUFFIX: &str = ".bin";

/// Final path segment of a resolved release URL.
///
/// A URL without any `/` yields the whole string.
pub fn extract_tag(resolved_url: &str) -> &str {
    resolved_url
        .rsplit_once('/')
        .map_or(resolved_url, |(_, tag)| tag)
}

/// True when the remote tag differs from the running one.
///
/// Exact, case-sensitive string comparison: any difference is an update,
/// including an older tag.
pub fn is_new_version(tag: &str, running_version: &str) -> bool {
    tag != running_version
}

/// Direct asset URL for `tag`, derived from its release page URL.
pub fn build_asset_url(resolved_release_url: &str, tag: &str) -> Result<String, AssetUrlError> {
    if tag.is_empty() {
        return Err(AssetUrlError::EmptyTag(resolved_release_url.to_string()));
    }

    // Drop "<tag>", then the "tag" segment above it
    let base = resolved_release_url
        .rsplit_once('/')
        .and_then(|(page, _)| page.rsplit_once('/'))
        .map(|(base, _)| base)
        .filter(|base| !base.is_empty() && !base.ends_with(':') && !base.ends_with('/'))
        .ok_or_else(|| AssetUrlError::MissingReleaseBase(resolved_release_url.to_string()))?;

    Ok(format!(
        "{}/download/{}/{}{}{}",
        base, tag, ASSET_PREFIX, tag, ASSET_SUFFIX
    ))
}
