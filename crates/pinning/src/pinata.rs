//! Pinata pinning API client.

use crate::{ensure_cid, ensure_content, PinError, PinReceipt, PinService};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

pub const DEFAULT_PINATA_BASE_URL: &str = "https://api.pinata.cloud";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Pinata credentials. A JWT takes precedence over the key pair.
#[derive(Clone)]
pub enum PinataAuth {
    Jwt(String),
    ApiKey { key: String, secret: String },
}

impl std::fmt::Debug for PinataAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PinataAuth::Jwt(_) => f.write_str("Jwt(<redacted>)"),
            PinataAuth::ApiKey { .. } => f.write_str("ApiKey(<redacted>)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PinataConfig {
    pub base_url: String,
    pub auth: PinataAuth,
    pub timeout: Duration,
}

impl PinataConfig {
    /// Build a config from optional credentials. Blank values count as missing.
    pub fn from_credentials(
        jwt: Option<String>,
        api_key: Option<String>,
        api_secret: Option<String>,
    ) -> Result<Self, PinError> {
        let present = |value: Option<String>| value.filter(|v| !v.trim().is_empty());

        let auth = match (present(jwt), present(api_key), present(api_secret)) {
            (Some(jwt), _, _) => PinataAuth::Jwt(jwt),
            (None, Some(key), Some(secret)) => PinataAuth::ApiKey { key, secret },
            _ => {
                return Err(PinError::Config(
                    "set PINATA_JWT or both PINATA_API_KEY and PINATA_API_SECRET".to_string(),
                ))
            }
        };

        Ok(Self {
            base_url: DEFAULT_PINATA_BASE_URL.to_string(),
            auth,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Read `PINATA_JWT`, `PINATA_API_KEY`, `PINATA_API_SECRET` and the optional
    /// `PINATA_BASE_URL` from the environment.
    pub fn from_env() -> Result<Self, PinError> {
        let var = |name: &str| std::env::var(name).ok();
        let mut config = Self::from_credentials(
            var("PINATA_JWT"),
            var("PINATA_API_KEY"),
            var("PINATA_API_SECRET"),
        )?;
        if let Some(base_url) = var("PINATA_BASE_URL").filter(|v| !v.trim().is_empty()) {
            config.base_url = base_url;
        }
        Ok(config)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PinByHashRequest<'a> {
    hash_to_pin: &'a str,
    pinata_metadata: PinataMetadata,
}

#[derive(Serialize)]
struct PinataMetadata {
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PinataPinResponse {
    ipfs_hash: String,
    #[serde(default)]
    pin_size: u64,
    #[serde(default)]
    timestamp: String,
}

/// HTTP client for the Pinata file upload, pin-by-hash and unpin endpoints.
#[derive(Debug, Clone)]
pub struct PinataClient {
    http: Client,
    base_url: Url,
    auth: PinataAuth,
}

impl PinataClient {
    pub fn new(config: PinataConfig) -> Result<Self, PinError> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| PinError::Config(format!("invalid base URL {}: {e}", config.base_url)))?;
        if base_url.cannot_be_a_base() {
            return Err(PinError::Config(format!(
                "base URL {} cannot carry a path",
                config.base_url
            )));
        }
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| PinError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url,
            auth: config.auth,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, PinError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| PinError::Config("base URL cannot carry a path".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            PinataAuth::Jwt(token) => request.bearer_auth(token),
            PinataAuth::ApiKey { key, secret } => request
                .header("pinata_api_key", key)
                .header("pinata_secret_api_key", secret),
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response, PinError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| PinError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(PinError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

async fn parse_pin_response(response: reqwest::Response) -> Result<PinataPinResponse, PinError> {
    response
        .json()
        .await
        .map_err(|e| PinError::InvalidResponse(e.to_string()))
}

/// Display name Pinata stores alongside the pin.
fn pin_label(cid: &str) -> String {
    format!("Pinned-{}", cid.chars().take(10).collect::<String>())
}

#[async_trait]
impl PinService for PinataClient {
    async fn pin(&self, cid: &str) -> Result<PinReceipt, PinError> {
        ensure_cid(cid)?;
        info!(cid = cid, "Attempting to pin CID");

        let url = self.endpoint(&["pinning", "pinByHash"])?;
        let body = PinByHashRequest {
            hash_to_pin: cid,
            pinata_metadata: PinataMetadata {
                name: pin_label(cid),
            },
        };

        let response = match self.send(self.http.post(url).json(&body)).await {
            Ok(response) => response,
            Err(err) => {
                warn!(cid = cid, error = %err, "Failed to pin CID");
                return Err(err);
            }
        };
        let parsed = parse_pin_response(response).await?;

        info!(
            cid = cid,
            ipfs_hash = %parsed.ipfs_hash,
            pin_size = parsed.pin_size,
            timestamp = %parsed.timestamp,
            "Pinned CID"
        );
        Ok(PinReceipt {
            pinned_hash: parsed.ipfs_hash,
            size: parsed.pin_size,
            timestamp: parsed.timestamp,
        })
    }

    async fn unpin(&self, cid: &str) -> Result<(), PinError> {
        ensure_cid(cid)?;
        info!(cid = cid, "Attempting to unpin CID");

        let url = self.endpoint(&["pinning", "unpin", cid])?;
        if let Err(err) = self.send(self.http.delete(url)).await {
            warn!(cid = cid, error = %err, "Failed to unpin CID");
            return Err(err);
        }
        info!(cid = cid, "Unpinned CID");
        Ok(())
    }

    async fn upload(&self, file_name: &str, content: Vec<u8>) -> Result<PinReceipt, PinError> {
        ensure_content(&content)?;
        let size = content.len();
        info!(file_name = file_name, size, "Uploading file to IPFS");

        let metadata = serde_json::to_string(&PinataMetadata {
            name: file_name.to_string(),
        })
        .map_err(|e| PinError::Config(format!("failed to encode pin metadata: {e}")))?;
        let form = Form::new()
            .part("file", Part::bytes(content).file_name(file_name.to_string()))
            .text("pinataMetadata", metadata);

        let url = self.endpoint(&["pinning", "pinFileToIPFS"])?;
        let response = match self.send(self.http.post(url).multipart(form)).await {
            Ok(response) => response,
            Err(err) => {
                warn!(file_name = file_name, error = %err, "Failed to upload file");
                return Err(err);
            }
        };
        let parsed = parse_pin_response(response).await?;

        info!(
            file_name = file_name,
            ipfs_hash = %parsed.ipfs_hash,
            pin_size = parsed.pin_size,
            "Uploaded file"
        );
        Ok(PinReceipt {
            pinned_hash: parsed.ipfs_hash,
            size: parsed.pin_size,
            timestamp: parsed.timestamp,
        })
    }

    fn name(&self) -> &'static str {
        "pinata"
    }
}
