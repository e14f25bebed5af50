//! Notifications emitted by the registry after a transaction commits.

use crate::types::{Address, CidHash};
use serde::{Deserialize, Serialize};

/// Cost of a store transaction, reported for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationCost {
    /// Wall-clock time spent inside the transaction, in microseconds.
    pub elapsed_us: u64,
    /// Bytes handed to the ledger store for this change.
    pub persisted_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RegistryEvent {
    FileStored {
        cid: String,
        cid_hash: CidHash,
        uploader: Address,
        cost: OperationCost,
    },
    /// Lookups by CID are logged for auditability even though they change nothing.
    FileRetrieved { cid_hash: CidHash, caller: Address },
    PinFlagUpdated { cid_hash: CidHash, pinned: bool },
}

impl RegistryEvent {
    pub fn cid_hash(&self) -> CidHash {
        match self {
            RegistryEvent::FileStored { cid_hash, .. }
            | RegistryEvent::FileRetrieved { cid_hash, .. }
            | RegistryEvent::PinFlagUpdated { cid_hash, .. } => *cid_hash,
        }
    }
}
