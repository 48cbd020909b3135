//! reqwest-backed transfer sessions.
//!
//! Two clients share one connector: `Pinned` trusts only the configured
//! anchor, `Unverified` accepts any certificate. Neither follows redirects
//! nor keeps idle connections, so every session is a fresh connection.
//!
//! HEAD probes carry a request timeout. GETs do not, since a firmware image
//! may take long to arrive; their header wait and each body chunk are
//! bounded by the caller.

use anyhow::{Context, Result};
use async_trait::async_trait;
use ota_common::transport::LOCATION_HEADER;
use ota_common::{
    BodyStream, ClockReady, Connector, FetchResponse, ProbeResponse, TransferSession,
    TransportError, TrustMode,
};
use reqwest::{redirect, Certificate, Client};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Connection establishment timeout for both clients
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default whole-request timeout of a HEAD probe
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

const PEM_MARKER: &str = "-----BEGIN CERTIFICATE-----";

/// Certificate trusted for the release origin
#[derive(Clone)]
pub struct TrustAnchor {
    path: PathBuf,
    cert: Certificate,
}

impl TrustAnchor {
    /// Read a PEM certificate from `path`
    pub fn load(path: &Path) -> Result<Self> {
        let pem = fs::read(path)
            .with_context(|| format!("Failed to read trust anchor: {}", path.display()))?;
        if !String::from_utf8_lossy(&pem).contains(PEM_MARKER) {
            anyhow::bail!("Trust anchor {} holds no PEM certificate", path.display());
        }
        let cert = Certificate::from_pem(&pem)
            .with_context(|| format!("Failed to parse trust anchor: {}", path.display()))?;
        info!("Loaded trust anchor from {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            cert,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Connector over two reqwest clients
#[derive(Clone)]
pub struct ReqwestConnector {
    pinned: Client,
    unverified: Client,
    probe_timeout: Duration,
}

impl ReqwestConnector {
    /// Build both clients. Requires a synced clock for certificate validity.
    pub fn new(
        _ready: &ClockReady,
        anchor: &TrustAnchor,
        user_agent: &str,
    ) -> Result<Self, TransportError> {
        let pinned = base_builder(user_agent)
            .tls_built_in_root_certs(false)
            .add_root_certificate(anchor.cert.clone())
            .build()
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        let unverified = base_builder(user_agent)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        debug!("Built pinned client with anchor {}", anchor.path.display());

        Ok(Self {
            pinned,
            unverified,
            probe_timeout: PROBE_TIMEOUT,
        })
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }
}

fn base_builder(user_agent: &str) -> reqwest::ClientBuilder {
    Client::builder()
        .user_agent(user_agent)
        .redirect(redirect::Policy::none())
        .pool_max_idle_per_host(0)
        .connect_timeout(CONNECT_TIMEOUT)
}

impl Connector for ReqwestConnector {
    type Session = ReqwestSession;

    fn open(&self, url: &str, trust: TrustMode) -> Result<ReqwestSession, TransportError> {
        let client = match trust {
            TrustMode::Pinned => self.pinned.clone(),
            TrustMode::Unverified => self.unverified.clone(),
        };
        Ok(ReqwestSession {
            client,
            url: url.to_string(),
            trust,
            probe_timeout: self.probe_timeout,
        })
    }
}

pub struct ReqwestSession {
    client: Client,
    url: String,
    trust: TrustMode,
    probe_timeout: Duration,
}

impl ReqwestSession {
    fn request_error(&self, e: reqwest::Error) -> TransportError {
        TransportError::Request {
            url: self.url.clone(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl TransferSession for ReqwestSession {
    type Body = ReqwestBody;

    fn url(&self) -> &str {
        &self.url
    }

    fn trust(&self) -> TrustMode {
        self.trust
    }

    async fn probe(self) -> Result<ProbeResponse, TransportError> {
        let response = self
            .client
            .head(&self.url)
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        let status = response.status().as_u16();
        let location = response
            .headers()
            .get(LOCATION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        debug!("HEAD {} code: {}", self.url, status);
        Ok(ProbeResponse { status, location })
    }

    async fn fetch(self) -> Result<FetchResponse<ReqwestBody>, TransportError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        Ok(FetchResponse {
            status: response.status().as_u16(),
            content_length: response.content_length(),
            body: ReqwestBody { response },
        })
    }
}

/// Body read chunk by chunk off the connection
pub struct ReqwestBody {
    response: reqwest::Response,
}

#[async_trait]
impl BodyStream for ReqwestBody {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        self.response
            .chunk()
            .await
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .map_err(|e| TransportError::Stream(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_missing_anchor_fails() {
        let err = TrustAnchor::load(Path::new("/nonexistent/otad/ca.pem"))
            .err()
            .unwrap();
        assert!(err.to_string().contains("Failed to read trust anchor"));
    }

    #[test]
    fn test_non_pem_anchor_fails() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"not a certificate").unwrap();

        let err = TrustAnchor::load(file.path()).err().unwrap();
        assert!(err.to_string().contains("holds no PEM certificate"));
    }
}
