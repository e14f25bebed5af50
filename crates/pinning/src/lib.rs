//! Pinning service clients.
//!
//! The registry only records that a CID is flagged as pinned; keeping the
//! content available is the job of a remote pinning service reached through
//! [`PinService`].

pub mod pinata;
pub mod stub;

pub use pinata::{PinataAuth, PinataClient, PinataConfig, DEFAULT_PINATA_BASE_URL};
pub use stub::StubPinService;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Public gateway used to build retrieval links for uploaded content.
pub const DEFAULT_IPFS_GATEWAY: &str = "https://ipfs.io/ipfs/";

/// Errors that can occur while talking to a pinning service.
#[derive(Debug, Error)]
pub enum PinError {
    #[error("pinning service configuration error: {0}")]
    Config(String),

    #[error("CID must not be empty")]
    EmptyCid,

    #[error("file content must not be empty")]
    EmptyContent,

    #[error("pinning service unreachable: {0}")]
    Transport(String),

    #[error("pinning service rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("unexpected pinning service response: {0}")]
    InvalidResponse(String),
}

/// Confirmation returned by a successful pin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinReceipt {
    /// Content hash as reported by the service.
    pub pinned_hash: String,
    /// Pinned size in bytes.
    pub size: u64,
    /// Service-side timestamp of the pin.
    pub timestamp: String,
}

/// Remote pinning collaborator. Both calls are safe to retry.
#[async_trait]
pub trait PinService: Send + Sync {
    async fn pin(&self, cid: &str) -> Result<PinReceipt, PinError>;

    async fn unpin(&self, cid: &str) -> Result<(), PinError>;

    /// Add `content` to IPFS and pin it; the receipt carries the new CID.
    async fn upload(&self, file_name: &str, content: Vec<u8>) -> Result<PinReceipt, PinError>;

    /// Backend name for logs and health output.
    fn name(&self) -> &'static str;
}

/// Retrieval link for `cid` under `gateway`, tolerating a missing trailing slash.
pub fn gateway_url(gateway: &str, cid: &str) -> String {
    format!("{}/{}", gateway.trim_end_matches('/'), cid)
}

pub(crate) fn ensure_content(content: &[u8]) -> Result<(), PinError> {
    if content.is_empty() {
        Err(PinError::EmptyContent)
    } else {
        Ok(())
    }
}

pub(crate) fn ensure_cid(cid: &str) -> Result<(), PinError> {
    if cid.trim().is_empty() {
        Err(PinError::EmptyCid)
    } else {
        Ok(())
    }
}
