//! File registry implementation
//!
//! Authoritative, append-only mapping from CID hash to file metadata, with a
//! per-uploader index and owner/uploader-gated pin flags.

use crate::errors::*;
use crate::events::{OperationCost, RegistryEvent};
use crate::store::{LedgerChange, LedgerSnapshot, LedgerStore, MemoryLedgerStore};
use crate::types::*;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// In-memory view of the committed ledger.
#[derive(Debug)]
struct LedgerState {
    owner: Address,
    /// CID hash → record
    records: HashMap<CidHash, FileRecord>,
    /// Uploader → hashes in store order
    uploader_index: HashMap<Address, Vec<CidHash>>,
    file_count: u64,
}

impl LedgerState {
    fn empty(owner: Address) -> Self {
        Self {
            owner,
            records: HashMap::new(),
            uploader_index: HashMap::new(),
            file_count: 0,
        }
    }

    /// Rebuild state from a snapshot, refusing one that breaks the index invariants.
    fn from_snapshot(snapshot: LedgerSnapshot) -> Result<Self> {
        let mut indexed = 0usize;
        for (uploader, hashes) in &snapshot.uploader_index {
            for hash in hashes {
                match snapshot.records.get(hash) {
                    Some(record) if record.uploader == *uploader => indexed += 1,
                    _ => {
                        return Err(RegistryError::Storage(anyhow::anyhow!(
                            "uploader index entry {} for {} has no matching record",
                            hash,
                            uploader
                        )))
                    }
                }
            }
        }
        if indexed != snapshot.records.len() {
            return Err(RegistryError::Storage(anyhow::anyhow!(
                "uploader index covers {} of {} records",
                indexed,
                snapshot.records.len()
            )));
        }

        Ok(Self {
            owner: snapshot.owner,
            file_count: snapshot.records.len() as u64,
            records: snapshot.records,
            uploader_index: snapshot.uploader_index,
        })
    }
}

/// File registry
///
/// Every state-changing operation holds the write lock across precondition
/// checks, the ledger store commit and the in-memory update, so transactions
/// are serialized and a failed one leaves no trace.
pub struct FileRegistry {
    state: RwLock<LedgerState>,
    store: Arc<dyn LedgerStore>,
    events: broadcast::Sender<RegistryEvent>,
}

impl std::fmt::Debug for FileRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("FileRegistry")
            .field("owner", &state.owner)
            .field("file_count", &state.file_count)
            .finish()
    }
}

impl FileRegistry {
    /// Create an empty registry backed by memory only.
    pub fn new(owner: Address) -> Self {
        Self::with_state(
            LedgerState::empty(owner),
            Arc::new(MemoryLedgerStore::initialized(owner)),
        )
    }

    /// Open a registry on top of `store`, initializing it for `owner` if empty.
    ///
    /// An already initialized ledger keeps its persisted owner.
    pub fn open(owner: Address, store: Arc<dyn LedgerStore>) -> Result<Self> {
        let state = match store.load()? {
            Some(snapshot) => {
                if snapshot.owner != owner {
                    warn!(
                        configured = %owner,
                        persisted = %snapshot.owner,
                        "Configured owner differs from ledger owner; keeping ledger owner"
                    );
                }
                let state = LedgerState::from_snapshot(snapshot)?;
                info!(
                    owner = %state.owner,
                    file_count = state.file_count,
                    "Loaded file registry"
                );
                state
            }
            None => {
                store.commit(&LedgerChange::Initialized { owner })?;
                info!(owner = %owner, "Initialized new file registry");
                LedgerState::empty(owner)
            }
        };
        Ok(Self::with_state(state, store))
    }

    fn with_state(state: LedgerState, store: Arc<dyn LedgerStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(state),
            store,
            events,
        }
    }

    /// Register a new CID for `caller`.
    pub fn store_file(
        &self,
        caller: Address,
        cid: &str,
        name: impl Into<String>,
        size: u64,
    ) -> Result<FileRecord> {
        self.store_file_metered(caller, cid, name, size)
            .map(|(record, _)| record)
    }

    /// Same as [`FileRegistry::store_file`], also returning the transaction cost.
    pub fn store_file_metered(
        &self,
        caller: Address,
        cid: &str,
        name: impl Into<String>,
        size: u64,
    ) -> Result<(FileRecord, OperationCost)> {
        if cid.is_empty() {
            warn!(caller = %caller, "Rejected store of empty CID");
            return Err(RegistryError::EmptyCid);
        }

        let started = Instant::now();
        let cid_hash = compute_cid_hash(cid);

        let mut state = self.state.write();
        if state.records.contains_key(&cid_hash) {
            warn!(caller = %caller, cid = cid, "Rejected duplicate store");
            return Err(RegistryError::DuplicateRecord { cid_hash });
        }

        let record = FileRecord {
            cid_hash,
            name: name.into(),
            size,
            uploader: caller,
            timestamp: unix_now(),
            pinned: false,
        };
        let index_position = state
            .uploader_index
            .get(&caller)
            .map_or(0, |hashes| hashes.len() as u64);

        let persisted_bytes = self.store.commit(&LedgerChange::RecordStored {
            record: &record,
            index_position,
        })?;

        state.records.insert(cid_hash, record.clone());
        state.uploader_index.entry(caller).or_default().push(cid_hash);
        state.file_count += 1;

        let cost = OperationCost {
            elapsed_us: started.elapsed().as_micros() as u64,
            persisted_bytes,
        };
        info!(
            cid = cid,
            cid_hash = %cid_hash,
            uploader = %caller,
            size = record.size,
            elapsed_us = cost.elapsed_us,
            "File stored"
        );
        // Sent under the write guard so subscribers observe commit order.
        self.emit(RegistryEvent::FileStored {
            cid: cid.to_string(),
            cid_hash,
            uploader: caller,
            cost,
        });
        Ok((record, cost))
    }

    /// Look up a record by CID. The lookup is announced as a `FileRetrieved` event.
    pub fn get_file_meta(&self, caller: Address, cid: &str) -> Result<FileRecord> {
        let cid_hash = compute_cid_hash(cid);
        let record = self.get_file_meta_by_hash(&cid_hash)?;
        debug!(cid = cid, caller = %caller, "File metadata retrieved");
        self.emit(RegistryEvent::FileRetrieved { cid_hash, caller });
        Ok(record)
    }

    /// Look up a record by its precomputed hash without emitting anything.
    pub fn get_file_meta_by_hash(&self, cid_hash: &CidHash) -> Result<FileRecord> {
        let state = self.state.read();
        state
            .records
            .get(cid_hash)
            .cloned()
            .ok_or(RegistryError::NotFound {
                cid_hash: *cid_hash,
            })
    }

    pub fn file_exists_by_cid(&self, cid: &str) -> bool {
        self.file_exists_by_hash(&compute_cid_hash(cid))
    }

    pub fn file_exists_by_hash(&self, cid_hash: &CidHash) -> bool {
        self.state.read().records.contains_key(cid_hash)
    }

    pub fn is_pinned(&self, cid_hash: &CidHash) -> Result<bool> {
        self.get_file_meta_by_hash(cid_hash).map(|record| record.pinned)
    }

    pub fn pin_cid(&self, caller: Address, cid_hash: &CidHash) -> Result<()> {
        self.set_pinned(caller, cid_hash, true)
    }

    pub fn unpin_cid(&self, caller: Address, cid_hash: &CidHash) -> Result<()> {
        self.set_pinned(caller, cid_hash, false)
    }

    /// Check that `caller` may change the pin flag of `cid_hash`.
    ///
    /// Fails with `NotFound` before `Unauthorized`.
    pub fn authorize_modification(&self, caller: Address, cid_hash: &CidHash) -> Result<()> {
        let state = self.state.read();
        let record = state
            .records
            .get(cid_hash)
            .ok_or(RegistryError::NotFound {
                cid_hash: *cid_hash,
            })?;
        ensure_can_modify(&state.owner, record, &caller)
    }

    fn set_pinned(&self, caller: Address, cid_hash: &CidHash, pinned: bool) -> Result<()> {
        let mut state = self.state.write();
        let current = state
            .records
            .get(cid_hash)
            .ok_or(RegistryError::NotFound {
                cid_hash: *cid_hash,
            })?;
        if let Err(err) = ensure_can_modify(&state.owner, current, &caller) {
            warn!(caller = %caller, cid_hash = %cid_hash, "Rejected pin flag change");
            return Err(err);
        }

        let mut updated = current.clone();
        updated.pinned = pinned;
        self.store
            .commit(&LedgerChange::PinUpdated { record: &updated })?;
        state.records.insert(*cid_hash, updated);

        info!(cid_hash = %cid_hash, caller = %caller, pinned, "Pin flag updated");
        self.emit(RegistryEvent::PinFlagUpdated {
            cid_hash: *cid_hash,
            pinned,
        });
        Ok(())
    }

    /// Hashes stored by `account`, oldest first.
    pub fn get_uploader_files(&self, account: &Address) -> Vec<CidHash> {
        let state = self.state.read();
        state
            .uploader_index
            .get(account)
            .cloned()
            .unwrap_or_default()
    }

    pub fn file_count(&self) -> u64 {
        self.state.read().file_count
    }

    pub fn owner(&self) -> Address {
        self.state.read().owner
    }

    pub fn stats(&self) -> RegistryStats {
        let state = self.state.read();
        RegistryStats {
            owner: state.owner,
            file_count: state.file_count,
            pinned_count: state.records.values().filter(|r| r.pinned).count() as u64,
            uploader_count: state.uploader_index.len() as u64,
        }
    }

    /// Subscribe to events emitted after each committed operation.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub fn flush(&self) -> Result<()> {
        self.store.flush()?;
        Ok(())
    }

    fn emit(&self, event: RegistryEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// The single authorization rule: only the uploader or the registry owner.
fn ensure_can_modify(owner: &Address, record: &FileRecord, caller: &Address) -> Result<()> {
    if record.uploader == *caller || owner == caller {
        Ok(())
    } else {
        Err(RegistryError::Unauthorized {
            caller: *caller,
            cid_hash: record.cid_hash,
        })
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    const CIDS: [&str; 5] = [
        "QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG",
        "QmPChd2hVbrJ6bfo3WBcTW4iZnpHm8TEzWkLHmLpXhF68A",
        "QmZULkCELmmk5XNfCgTnCyFgAVxBRBXyDHGGMVoLFLiXEN",
        "QmT78zSuBmuS4z925WZfrqQ1qHaJ56DQaTfyMUF7F8ff5o",
        "QmXnnyufdzAWL5CqZ2RnSNgPbvCc1ALT73s6epPrRnZ1Xy",
    ];

    fn account(byte: u8) -> Address {
        Address([byte; ADDRESS_BYTES])
    }

    fn setup() -> (FileRegistry, Address, Address, Address) {
        let owner = account(0xAA);
        (FileRegistry::new(owner), owner, account(1), account(2))
    }

    #[test]
    fn test_new_registry_is_empty() {
        let (registry, owner, user1, _) = setup();
        assert_eq!(registry.owner(), owner);
        assert_eq!(registry.file_count(), 0);
        assert!(registry.get_uploader_files(&user1).is_empty());
    }

    #[test]
    fn test_store_and_lookup() {
        let (registry, _, user1, user2) = setup();

        let stored = registry
            .store_file(user1, CIDS[0], "test-file.pdf", 1_024_000)
            .unwrap();
        assert_eq!(registry.file_count(), 1);
        assert!(registry.file_exists_by_cid(CIDS[0]));

        let meta = registry.get_file_meta(user2, CIDS[0]).unwrap();
        assert_eq!(meta, stored);
        assert_eq!(meta.name, "test-file.pdf");
        assert_eq!(meta.size, 1_024_000);
        assert_eq!(meta.uploader, user1);
        assert!(!meta.pinned);
        assert!(meta.timestamp > 0);
    }

    #[test]
    fn test_duplicate_store_leaves_state_untouched() {
        let (registry, _, user1, user2) = setup();
        registry.store_file(user1, CIDS[0], "file1.pdf", 1000).unwrap();
        let before = registry.get_file_meta_by_hash(&compute_cid_hash(CIDS[0])).unwrap();

        let err = registry
            .store_file(user2, CIDS[0], "file2.pdf", 2000)
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateRecord { .. }));
        assert_eq!(err.to_string().split(':').next(), Some("File already stored"));

        assert_eq!(registry.file_count(), 1);
        assert!(registry.get_uploader_files(&user2).is_empty());
        assert_eq!(
            registry.get_file_meta_by_hash(&compute_cid_hash(CIDS[0])).unwrap(),
            before
        );
    }

    #[test]
    fn test_empty_cid_rejected() {
        let (registry, _, user1, _) = setup();
        assert!(matches!(
            registry.store_file(user1, "", "empty", 1),
            Err(RegistryError::EmptyCid)
        ));
        assert_eq!(registry.file_count(), 0);
    }

    #[test]
    fn test_file_count_tracks_distinct_stores() {
        let (registry, _, user1, _) = setup();
        for (i, cid) in CIDS.iter().enumerate() {
            let size = 500_000 + i as u64 * 100_000;
            registry
                .store_file(user1, cid, format!("test-file-{}.pdf", i + 1), size)
                .unwrap();
        }
        assert_eq!(registry.file_count(), 5);
        for cid in CIDS {
            assert!(registry.file_exists_by_cid(cid));
        }
        assert!(registry.store_file(user1, CIDS[3], "again", 1).is_err());
        assert_eq!(registry.file_count(), 5);
    }

    #[test]
    fn test_lookup_missing_file() {
        let (registry, _, user1, _) = setup();
        let err = registry
            .get_file_meta(user1, "QmInvalidCIDThatDoesNotExist123456789")
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));
        assert!(!registry.file_exists_by_cid("QmInvalidCIDThatDoesNotExist123456789"));
        assert!(registry.is_pinned(&compute_cid_hash("QmMissing")).is_err());
    }

    #[test]
    fn test_pin_unpin_roundtrip() {
        let (registry, _, user1, _) = setup();
        let original = registry.store_file(user1, CIDS[0], "test.pdf", 1000).unwrap();
        let hash = original.cid_hash;

        registry.pin_cid(user1, &hash).unwrap();
        assert!(registry.is_pinned(&hash).unwrap());

        registry.unpin_cid(user1, &hash).unwrap();
        assert!(!registry.is_pinned(&hash).unwrap());
        assert_eq!(registry.get_file_meta_by_hash(&hash).unwrap(), original);
    }

    #[test]
    fn test_pin_authorization() {
        let (registry, owner, user1, user2) = setup();
        let hash = registry
            .store_file(user1, CIDS[0], "test.pdf", 1000)
            .unwrap()
            .cid_hash;

        let err = registry.pin_cid(user2, &hash).unwrap_err();
        assert!(matches!(err, RegistryError::Unauthorized { caller, .. } if caller == user2));
        assert!(!registry.is_pinned(&hash).unwrap());

        // The owner may override.
        registry.pin_cid(owner, &hash).unwrap();
        assert!(registry.is_pinned(&hash).unwrap());

        assert!(registry.unpin_cid(user2, &hash).is_err());
        assert!(registry.is_pinned(&hash).unwrap());
    }

    #[test]
    fn test_pin_unknown_hash_is_not_found() {
        let (registry, owner, _, _) = setup();
        let err = registry
            .pin_cid(owner, &compute_cid_hash("QmNothing"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));
    }

    #[test]
    fn test_uploader_index_order_and_isolation() {
        let (registry, _, user1, user2) = setup();
        for (i, cid) in CIDS.iter().enumerate().take(3) {
            registry
                .store_file(user1, cid, format!("file{i}.pdf"), 1000 * (i as u64 + 1))
                .unwrap();
        }
        for (i, cid) in CIDS.iter().enumerate().skip(3) {
            registry
                .store_file(user2, cid, format!("file{i}.pdf"), 1000 * (i as u64 + 1))
                .unwrap();
        }

        let expected1: Vec<CidHash> = CIDS[..3].iter().map(|c| compute_cid_hash(c)).collect();
        let expected2: Vec<CidHash> = CIDS[3..].iter().map(|c| compute_cid_hash(c)).collect();
        assert_eq!(registry.get_uploader_files(&user1), expected1);
        assert_eq!(registry.get_uploader_files(&user2), expected2);
    }

    #[test]
    fn test_events_emitted() {
        let (registry, _, user1, user2) = setup();
        let mut rx = registry.subscribe();

        registry.store_file(user1, CIDS[0], "a.pdf", 1024).unwrap();
        let hash = compute_cid_hash(CIDS[0]);
        match rx.try_recv().unwrap() {
            RegistryEvent::FileStored {
                cid,
                cid_hash,
                uploader,
                cost,
            } => {
                assert_eq!(cid, CIDS[0]);
                assert_eq!(cid_hash, hash);
                assert_eq!(uploader, user1);
                assert!(cost.persisted_bytes > 0);
            }
            other => panic!("unexpected event {other:?}"),
        }

        registry.get_file_meta(user2, CIDS[0]).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            RegistryEvent::FileRetrieved {
                cid_hash: hash,
                caller: user2
            }
        );

        // Reads by hash are silent.
        registry.get_file_meta_by_hash(&hash).unwrap();
        registry.pin_cid(user1, &hash).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            RegistryEvent::PinFlagUpdated {
                cid_hash: hash,
                pinned: true
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_rejections_emit_nothing() {
        let (registry, _, user1, user2) = setup();
        let hash = registry.store_file(user1, CIDS[0], "a", 1).unwrap().cid_hash;
        let mut rx = registry.subscribe();

        assert!(registry.store_file(user2, CIDS[0], "b", 2).is_err());
        assert!(registry.pin_cid(user2, &hash).is_err());
        assert!(registry.get_file_meta(user2, "QmMissing").is_err());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_stats() {
        let (registry, owner, user1, user2) = setup();
        registry.store_file(user1, CIDS[0], "a", 1).unwrap();
        registry.store_file(user2, CIDS[1], "b", 2).unwrap();
        registry.pin_cid(owner, &compute_cid_hash(CIDS[1])).unwrap();

        let stats = registry.stats();
        assert_eq!(stats.owner, owner);
        assert_eq!(stats.file_count, 2);
        assert_eq!(stats.pinned_count, 1);
        assert_eq!(stats.uploader_count, 2);
    }

    #[test]
    fn test_example_scenario() {
        let (registry, _, a, b) = setup();
        let hash = registry
            .store_file(a, "Qm111", "a.pdf", 1024)
            .unwrap()
            .cid_hash;
        assert_eq!(registry.file_count(), 1);
        assert!(registry.store_file(b, "Qm111", "a.pdf", 1024).is_err());

        registry.pin_cid(a, &hash).unwrap();
        assert!(registry.is_pinned(&hash).unwrap());

        let err = registry.pin_cid(b, &hash).unwrap_err();
        assert!(matches!(err, RegistryError::Unauthorized { .. }));
    }

    struct FlakyStore {
        inner: MemoryLedgerStore,
        fail: AtomicBool,
    }

    impl LedgerStore for FlakyStore {
        fn load(&self) -> anyhow::Result<Option<LedgerSnapshot>> {
            self.inner.load()
        }

        fn commit(&self, change: &LedgerChange<'_>) -> anyhow::Result<u64> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("disk full");
            }
            self.inner.commit(change)
        }

        fn flush(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_failed_commit_is_atomic() {
        let owner = account(0xAA);
        let user1 = account(1);
        let store = Arc::new(FlakyStore {
            inner: MemoryLedgerStore::new(),
            fail: AtomicBool::new(false),
        });
        let registry = FileRegistry::open(owner, store.clone()).unwrap();
        let hash = registry.store_file(user1, CIDS[0], "a", 1).unwrap().cid_hash;

        store.fail.store(true, Ordering::SeqCst);
        let err = registry.store_file(user1, CIDS[1], "b", 2).unwrap_err();
        assert!(matches!(err, RegistryError::Storage(_)));
        assert!(registry.pin_cid(user1, &hash).is_err());

        assert_eq!(registry.file_count(), 1);
        assert!(!registry.file_exists_by_cid(CIDS[1]));
        assert_eq!(registry.get_uploader_files(&user1), vec![hash]);
        assert!(!registry.is_pinned(&hash).unwrap());

        // The record can still be stored once the store recovers.
        store.fail.store(false, Ordering::SeqCst);
        registry.store_file(user1, CIDS[1], "b", 2).unwrap();
        assert_eq!(registry.get_uploader_files(&user1).len(), 2);
    }

    #[test]
    fn test_reopen_keeps_persisted_owner() {
        let owner = account(0xAA);
        let store: Arc<dyn LedgerStore> = Arc::new(MemoryLedgerStore::new());
        {
            let registry = FileRegistry::open(owner, store.clone()).unwrap();
            registry.store_file(account(1), CIDS[0], "a", 1).unwrap();
            registry
                .pin_cid(owner, &compute_cid_hash(CIDS[0]))
                .unwrap();
        }

        let reopened = FileRegistry::open(account(0xBB), store).unwrap();
        assert_eq!(reopened.owner(), owner);
        assert_eq!(reopened.file_count(), 1);
        assert!(reopened.is_pinned(&compute_cid_hash(CIDS[0])).unwrap());
    }

    #[test]
    fn test_corrupt_snapshot_rejected() {
        let owner = account(0xAA);
        let mut snapshot = LedgerSnapshot {
            owner,
            ..Default::default()
        };
        snapshot
            .uploader_index
            .insert(account(1), vec![compute_cid_hash("QmOrphan")]);
        assert!(LedgerState::from_snapshot(snapshot).is_err());
    }
}
