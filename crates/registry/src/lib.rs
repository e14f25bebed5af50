//! PinLedger File Registry
//!
//! Append-only registry of IPFS content identifiers. Each CID is keyed by the
//! Keccak-256 of its string form and carries the uploader, size, name, creation
//! time and a pin flag that only the uploader or the registry owner may toggle.

pub mod errors;
pub mod events;
pub mod registry;
pub mod store;
pub mod types;

pub use errors::*;
pub use events::{OperationCost, RegistryEvent};
pub use registry::FileRegistry;
pub use store::{LedgerChange, LedgerSnapshot, LedgerStore, MemoryLedgerStore, SledLedgerStore};
pub use types::*;
