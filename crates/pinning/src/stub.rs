//! In-memory pin service for development nodes and tests.

use crate::{ensure_cid, ensure_content, PinError, PinReceipt, PinService};
use async_trait::async_trait;
use parking_lot::RwLock;
use sha3::{Digest, Keccak256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;

/// Stub implementation backed by an in-memory map.
#[derive(Clone, Default)]
pub struct StubPinService {
    pins: Arc<RwLock<HashMap<String, PinReceipt>>>,
    calls: Arc<AtomicUsize>,
}

impl StubPinService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_pinned(&self, cid: &str) -> bool {
        self.pins.read().contains_key(cid)
    }

    /// Content address the stub hands out for uploaded bytes.
    pub fn content_cid(content: &[u8]) -> String {
        let digest = Keccak256::digest(content);
        format!("Qm{}", hex::encode(&digest[..22]))
    }

    /// Number of requests received so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PinService for StubPinService {
    async fn pin(&self, cid: &str) -> Result<PinReceipt, PinError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        ensure_cid(cid)?;

        let mut pins = self.pins.write();
        let receipt = pins
            .entry(cid.to_string())
            .or_insert_with(|| PinReceipt {
                pinned_hash: cid.to_string(),
                size: 0,
                timestamp: now_rfc3339(),
            })
            .clone();
        debug!(cid = cid, "stub: pinned");
        Ok(receipt)
    }

    async fn unpin(&self, cid: &str) -> Result<(), PinError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        ensure_cid(cid)?;
        self.pins.write().remove(cid);
        debug!(cid = cid, "stub: unpinned");
        Ok(())
    }

    async fn upload(&self, file_name: &str, content: Vec<u8>) -> Result<PinReceipt, PinError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        ensure_content(&content)?;

        let cid = Self::content_cid(&content);
        let receipt = PinReceipt {
            pinned_hash: cid.clone(),
            size: content.len() as u64,
            timestamp: now_rfc3339(),
        };
        self.pins.write().insert(cid.clone(), receipt.clone());
        debug!(cid = %cid, file_name = file_name, "stub: uploaded");
        Ok(receipt)
    }

    fn name(&self) -> &'static str {
        "stub"
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}
