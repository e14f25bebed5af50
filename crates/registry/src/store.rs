//! Durable backends for the registry ledger.

use crate::types::{Address, CidHash, FileRecord, ADDRESS_BYTES, CID_HASH_BYTES};
use anyhow::{anyhow, Context, Result};
use parking_lot::RwLock;
use sled::{Batch, Db, Tree};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

/// Committed ledger contents as read back from a store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub owner: Address,
    pub records: HashMap<CidHash, FileRecord>,
    /// Per-uploader hashes in the order they were stored.
    pub uploader_index: HashMap<Address, Vec<CidHash>>,
}

/// A single change applied by one registry transaction.
#[derive(Debug, Clone, Copy)]
pub enum LedgerChange<'a> {
    Initialized {
        owner: Address,
    },
    RecordStored {
        record: &'a FileRecord,
        /// Position of the record in its uploader's index.
        index_position: u64,
    },
    /// Carries the record with its new `pinned` value.
    PinUpdated {
        record: &'a FileRecord,
    },
}

/// Trait for ledger storage backends.
pub trait LedgerStore: Send + Sync {
    /// Load the committed ledger, or `None` if nothing was ever initialized.
    fn load(&self) -> Result<Option<LedgerSnapshot>>;

    /// Persist one change atomically. Returns the number of bytes written.
    fn commit(&self, change: &LedgerChange<'_>) -> Result<u64>;

    /// Flush buffered writes to durable media.
    fn flush(&self) -> Result<()>;
}

/// In-memory ledger store (for testing and ephemeral nodes).
#[derive(Default)]
pub struct MemoryLedgerStore {
    snapshot: RwLock<Option<LedgerSnapshot>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that already holds an empty ledger owned by `owner`.
    pub fn initialized(owner: Address) -> Self {
        Self {
            snapshot: RwLock::new(Some(LedgerSnapshot {
                owner,
                ..Default::default()
            })),
        }
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn load(&self) -> Result<Option<LedgerSnapshot>> {
        Ok(self.snapshot.read().clone())
    }

    fn commit(&self, change: &LedgerChange<'_>) -> Result<u64> {
        let mut guard = self.snapshot.write();
        match change {
            LedgerChange::Initialized { owner } => {
                *guard = Some(LedgerSnapshot {
                    owner: *owner,
                    ..Default::default()
                });
                Ok(ADDRESS_BYTES as u64)
            }
            LedgerChange::RecordStored {
                record,
                index_position,
            } => {
                let snapshot = guard
                    .as_mut()
                    .ok_or_else(|| anyhow!("ledger not initialized"))?;
                let encoded = serde_json::to_vec(record)?;
                let index = snapshot.uploader_index.entry(record.uploader).or_default();
                if *index_position != index.len() as u64 {
                    return Err(anyhow!(
                        "uploader index position {} out of sequence (expected {})",
                        index_position,
                        index.len()
                    ));
                }
                index.push(record.cid_hash);
                snapshot.records.insert(record.cid_hash, (*record).clone());
                Ok((encoded.len() + CID_HASH_BYTES) as u64)
            }
            LedgerChange::PinUpdated { record } => {
                let snapshot = guard
                    .as_mut()
                    .ok_or_else(|| anyhow!("ledger not initialized"))?;
                let encoded = serde_json::to_vec(record)?;
                snapshot.records.insert(record.cid_hash, (*record).clone());
                Ok(encoded.len() as u64)
            }
        }
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

const OWNER_KEY: &[u8] = b"meta:owner";
const RECORD_PREFIX: &[u8] = b"record:";
const UPLOADER_PREFIX: &[u8] = b"uploader:";

/// Sled-backed ledger store.
///
/// Everything lives in one tree so each change can be applied as a single
/// batch:
/// - `meta:owner` → 20-byte owner address
/// - `record:<hash>` → JSON `FileRecord`
/// - `uploader:<address><position u64 BE>` → 32-byte hash
pub struct SledLedgerStore {
    db: Db,
    ledger: Tree,
}

impl SledLedgerStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let db = sled::open(path)
            .with_context(|| format!("failed to open ledger database at {}", path.display()))?;
        let ledger = db.open_tree("ledger")?;
        info!("Opened sled ledger at {}", path.display());
        Ok(Self { db, ledger })
    }

    fn record_key(hash: &CidHash) -> Vec<u8> {
        let mut key = Vec::with_capacity(RECORD_PREFIX.len() + CID_HASH_BYTES);
        key.extend_from_slice(RECORD_PREFIX);
        key.extend_from_slice(hash.as_bytes());
        key
    }

    fn uploader_key(uploader: &Address, position: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(UPLOADER_PREFIX.len() + ADDRESS_BYTES + 8);
        key.extend_from_slice(UPLOADER_PREFIX);
        key.extend_from_slice(uploader.as_bytes());
        key.extend_from_slice(&position.to_be_bytes());
        key
    }

    fn decode_uploader_entry(key: &[u8], value: &[u8]) -> Result<(Address, CidHash)> {
        let expected = UPLOADER_PREFIX.len() + ADDRESS_BYTES + 8;
        if key.len() != expected {
            return Err(anyhow!(
                "corrupt uploader index key: {} bytes (expected {})",
                key.len(),
                expected
            ));
        }
        let start = UPLOADER_PREFIX.len();
        let address: [u8; ADDRESS_BYTES] = key[start..start + ADDRESS_BYTES]
            .try_into()
            .map_err(|_| anyhow!("corrupt uploader address"))?;
        let hash: [u8; CID_HASH_BYTES] = value
            .try_into()
            .map_err(|_| anyhow!("corrupt uploader index value: {} bytes", value.len()))?;
        Ok((Address(address), CidHash(hash)))
    }
}

impl LedgerStore for SledLedgerStore {
    fn load(&self) -> Result<Option<LedgerSnapshot>> {
        let Some(owner_bytes) = self.ledger.get(OWNER_KEY)? else {
            return Ok(None);
        };
        let owner = <[u8; ADDRESS_BYTES]>::try_from(&owner_bytes[..])
            .map_err(|_| anyhow!("corrupt owner entry: {} bytes", owner_bytes.len()))?;

        let mut records = HashMap::new();
        for entry in self.ledger.scan_prefix(RECORD_PREFIX) {
            let (_, value) = entry?;
            let record: FileRecord =
                serde_json::from_slice(&value).context("failed to decode file record")?;
            records.insert(record.cid_hash, record);
        }

        // Keys sort by address then big-endian position, so pushes keep store order.
        let mut uploader_index: HashMap<Address, Vec<CidHash>> = HashMap::new();
        for entry in self.ledger.scan_prefix(UPLOADER_PREFIX) {
            let (key, value) = entry?;
            let (uploader, hash) = Self::decode_uploader_entry(&key, &value)?;
            uploader_index.entry(uploader).or_default().push(hash);
        }

        debug!(
            records = records.len(),
            uploaders = uploader_index.len(),
            "Loaded ledger snapshot"
        );

        Ok(Some(LedgerSnapshot {
            owner: Address(owner),
            records,
            uploader_index,
        }))
    }

    fn commit(&self, change: &LedgerChange<'_>) -> Result<u64> {
        let mut batch = Batch::default();
        let written = match change {
            LedgerChange::Initialized { owner } => {
                batch.insert(OWNER_KEY, owner.as_bytes().to_vec());
                (OWNER_KEY.len() + ADDRESS_BYTES) as u64
            }
            LedgerChange::RecordStored {
                record,
                index_position,
            } => {
                let value = serde_json::to_vec(record)?;
                let record_key = Self::record_key(&record.cid_hash);
                let index_key = Self::uploader_key(&record.uploader, *index_position);
                let written = record_key.len() + value.len() + index_key.len() + CID_HASH_BYTES;
                batch.insert(record_key, value);
                batch.insert(index_key, record.cid_hash.as_bytes().to_vec());
                written as u64
            }
            LedgerChange::PinUpdated { record } => {
                let value = serde_json::to_vec(record)?;
                let record_key = Self::record_key(&record.cid_hash);
                let written = record_key.len() + value.len();
                batch.insert(record_key, value);
                written as u64
            }
        };
        self.ledger
            .apply_batch(batch)
            .context("failed to apply ledger batch")?;
        Ok(written)
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::compute_cid_hash;
    use tempfile::TempDir;

    fn record(cid: &str, uploader: Address) -> FileRecord {
        FileRecord {
            cid_hash: compute_cid_hash(cid),
            name: format!("{cid}.bin"),
            size: 2048,
            uploader,
            timestamp: 1_700_000_000,
            pinned: false,
        }
    }

    #[test]
    fn fresh_stores_load_nothing() {
        let memory = MemoryLedgerStore::new();
        assert!(memory.load().unwrap().is_none());

        let dir = TempDir::new().unwrap();
        let sled_store = SledLedgerStore::open(dir.path()).unwrap();
        assert!(sled_store.load().unwrap().is_none());
    }

    #[test]
    fn sled_store_preserves_uploader_order_across_reopen() {
        let dir = TempDir::new().unwrap();
        let owner = Address([9u8; ADDRESS_BYTES]);
        let alice = Address([1u8; ADDRESS_BYTES]);
        let bob = Address([2u8; ADDRESS_BYTES]);
        let cids = ["QmA", "QmB", "QmC"];

        {
            let store = SledLedgerStore::open(dir.path()).unwrap();
            store.commit(&LedgerChange::Initialized { owner }).unwrap();
            for (i, cid) in cids.iter().enumerate() {
                let rec = record(cid, alice);
                store
                    .commit(&LedgerChange::RecordStored {
                        record: &rec,
                        index_position: i as u64,
                    })
                    .unwrap();
            }
            let other = record("QmBob", bob);
            store
                .commit(&LedgerChange::RecordStored {
                    record: &other,
                    index_position: 0,
                })
                .unwrap();
            store.flush().unwrap();
        }

        let store = SledLedgerStore::open(dir.path()).unwrap();
        let snapshot = store.load().unwrap().expect("initialized ledger");
        assert_eq!(snapshot.owner, owner);
        assert_eq!(snapshot.records.len(), 4);
        let expected: Vec<CidHash> = cids.iter().map(|c| compute_cid_hash(c)).collect();
        assert_eq!(snapshot.uploader_index[&alice], expected);
        assert_eq!(snapshot.uploader_index[&bob], vec![compute_cid_hash("QmBob")]);
    }

    #[test]
    fn sled_pin_update_overwrites_record() {
        let dir = TempDir::new().unwrap();
        let store = SledLedgerStore::open(dir.path()).unwrap();
        let owner = Address([9u8; ADDRESS_BYTES]);
        store.commit(&LedgerChange::Initialized { owner }).unwrap();

        let mut rec = record("QmPin", owner);
        store
            .commit(&LedgerChange::RecordStored {
                record: &rec,
                index_position: 0,
            })
            .unwrap();
        rec.pinned = true;
        store.commit(&LedgerChange::PinUpdated { record: &rec }).unwrap();

        let snapshot = store.load().unwrap().unwrap();
        assert!(snapshot.records[&rec.cid_hash].pinned);
        assert_eq!(snapshot.uploader_index[&owner].len(), 1);
    }

    #[test]
    fn memory_store_rejects_out_of_sequence_index() {
        let store = MemoryLedgerStore::new();
        let owner = Address([3u8; ADDRESS_BYTES]);
        store.commit(&LedgerChange::Initialized { owner }).unwrap();

        let rec = record("QmGap", owner);
        let result = store.commit(&LedgerChange::RecordStored {
            record: &rec,
            index_position: 5,
        });
        assert!(result.is_err());
        assert!(store.load().unwrap().unwrap().records.is_empty());
    }

    #[test]
    fn commit_reports_bytes_written() {
        let store = MemoryLedgerStore::new();
        let owner = Address([3u8; ADDRESS_BYTES]);
        store.commit(&LedgerChange::Initialized { owner }).unwrap();
        let rec = record("QmSize", owner);
        let written = store
            .commit(&LedgerChange::RecordStored {
                record: &rec,
                index_position: 0,
            })
            .unwrap();
        assert!(written > CID_HASH_BYTES as u64);
    }
}
