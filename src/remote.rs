use reqwest::header::{ACCEPT_ENCODING, RANGE};
use reqwest::{Client, Response, StatusCode};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Result, UpdateError};
use crate::util;

/// Asks for the 4-byte patch version, skipping the pack version byte.
const VERSION_RANGE: &str = "bytes=1-4";
const VERSION_LEN: usize = 4;

/// HTTP side of the updater: URL layout, range-request version probe, full fetch.
#[derive(Debug, Clone)]
pub struct RemoteClient {
    http: Client,
    base_uri: String,
    platform: String,
}

impl RemoteClient {
    pub fn new(base_uri: &str, platform: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("airpatch/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()
            .map_err(|e| UpdateError::Config(format!("http client: {e}")))?;
        Ok(Self {
            http,
            base_uri: util::normalize_base_uri(base_uri),
            platform: platform.to_string(),
        })
    }

    pub fn base_uri(&self) -> &str {
        &self.base_uri
    }

    /// `<base>/<platform>/newest/base` without an installed patch, otherwise the
    /// delta from the installed version: `<base>/<platform>/<version>/patch`.
    pub fn patch_url(&self, installed: Option<u32>) -> String {
        match installed {
            None => format!("{}{}/newest/base", self.base_uri, self.platform),
            Some(version) => format!("{}{}/{}/patch", self.base_uri, self.platform, version),
        }
    }

    /// Latest version published at `url`, learned from a 4-byte range request.
    ///
    /// Only `206` is accepted: a server ignoring the range would hand back the start
    /// of the header, whose first byte is the pack version, not the patch version.
    pub async fn fetch_version(&self, url: &str) -> Result<u32> {
        debug!(url, "probing remote patch version");
        let response = self
            .http
            .get(url)
            .header(RANGE, VERSION_RANGE)
            .header(ACCEPT_ENCODING, "identity")
            .send()
            .await
            .map_err(|e| UpdateError::network(url, e))?;

        let status = response.status();
        if status != StatusCode::PARTIAL_CONTENT {
            if status.is_success() {
                return Err(UpdateError::Protocol(format!(
                    "server answered the version range request with HTTP {} instead of 206",
                    status.as_u16()
                )));
            }
            return Err(UpdateError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                expected: StatusCode::PARTIAL_CONTENT.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| UpdateError::network(url, e))?;
        if body.len() != VERSION_LEN {
            return Err(UpdateError::Protocol(format!(
                "server returned {} bytes for the {VERSION_LEN}-byte patch version",
                body.len()
            )));
        }

        let mut raw = [0u8; VERSION_LEN];
        raw.copy_from_slice(&body[..VERSION_LEN]);
        let version = u32::from_be_bytes(raw);
        info!(url, version, "remote patch version");
        Ok(version)
    }

    /// Start a full patch download. The caller streams the body with `Response::chunk`;
    /// dropping the response closes the connection on every exit path.
    pub async fn open_patch(&self, url: &str) -> Result<Response> {
        debug!(url, "downloading patch");
        let response = self
            .http
            .get(url)
            .header(ACCEPT_ENCODING, "identity")
            .send()
            .await
            .map_err(|e| UpdateError::network(url, e))?;

        if response.status() != StatusCode::OK {
            return Err(UpdateError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
                expected: StatusCode::OK.as_u16(),
            });
        }
        Ok(response)
    }
}
