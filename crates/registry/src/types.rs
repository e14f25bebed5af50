//! Core data types for the file registry.

use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::fmt;
use std::str::FromStr;

/// Number of raw bytes in a CID hash.
pub const CID_HASH_BYTES: usize = 32;
/// Number of raw bytes in an account address.
pub const ADDRESS_BYTES: usize = 20;

/// Errors that can occur when parsing hashes and addresses from strings.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("address must start with '0x'")]
    MissingPrefix,
    #[error("expected {expected} hex characters, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("value is not valid hexadecimal")]
    InvalidHex,
}

/// Hash a CID string into its registry key.
///
/// Keccak-256 over the UTF-8 bytes of the CID, exactly as given. Clients can
/// run this locally to check existence before attempting a store.
pub fn compute_cid_hash(cid: &str) -> CidHash {
    let digest = Keccak256::digest(cid.as_bytes());
    let mut out = [0u8; CID_HASH_BYTES];
    out.copy_from_slice(&digest);
    CidHash(out)
}

/// Fixed-size digest of a CID string, used as the registry's storage key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CidHash(pub [u8; CID_HASH_BYTES]);

impl CidHash {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; CID_HASH_BYTES]) -> Self {
        Self(bytes)
    }

    /// Get the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; CID_HASH_BYTES] {
        &self.0
    }

    /// `0x`-prefixed lowercase hex.
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    /// Parse from hex, with or without the `0x` prefix.
    pub fn from_hex(value: &str) -> Result<Self, ParseError> {
        let normalized = strip_hex_prefix(value.trim()).unwrap_or(value.trim());
        decode_fixed::<CID_HASH_BYTES>(normalized).map(Self)
    }
}

impl fmt::Display for CidHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CidHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CidHash({})", self.to_hex())
    }
}

impl FromStr for CidHash {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<CidHash> for String {
    fn from(value: CidHash) -> Self {
        value.to_hex()
    }
}

impl TryFrom<String> for CidHash {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

/// Account identifier of an uploader or the registry owner.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(pub [u8; ADDRESS_BYTES]);

impl Address {
    /// The all-zero address, used for anonymous readers.
    pub const ZERO: Address = Address([0u8; ADDRESS_BYTES]);

    pub fn from_bytes(bytes: [u8; ADDRESS_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_BYTES] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    /// Parse a `0x`-prefixed address. Hex digits are case-insensitive.
    pub fn from_hex(value: &str) -> Result<Self, ParseError> {
        let payload = strip_hex_prefix(value.trim()).ok_or(ParseError::MissingPrefix)?;
        decode_fixed::<ADDRESS_BYTES>(payload).map(Self)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_hex())
    }
}

impl FromStr for Address {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.to_hex()
    }
}

impl TryFrom<String> for Address {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

fn strip_hex_prefix(value: &str) -> Option<&str> {
    value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
}

fn decode_fixed<const N: usize>(payload: &str) -> Result<[u8; N], ParseError> {
    if payload.len() != N * 2 {
        return Err(ParseError::InvalidLength {
            expected: N * 2,
            actual: payload.len(),
        });
    }
    let mut out = [0u8; N];
    hex::decode_to_slice(payload, &mut out).map_err(|_| ParseError::InvalidHex)?;
    Ok(out)
}

/// Metadata recorded for one registered CID.
///
/// Created once by a successful store; only `pinned` changes afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Keccak-256 of the CID string.
    pub cid_hash: CidHash,

    /// Original file name as supplied by the uploader.
    pub name: String,

    /// File size in bytes.
    pub size: u64,

    /// Account that stored the record.
    pub uploader: Address,

    /// Creation time, seconds since the Unix epoch.
    pub timestamp: u64,

    /// Whether the content is currently flagged as pinned.
    pub pinned: bool,
}

/// Aggregate view of the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub owner: Address,
    pub file_count: u64,
    pub pinned_count: u64,
    pub uploader_count: u64,
}
