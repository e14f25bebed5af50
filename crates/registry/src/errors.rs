//! Error types for the file registry

use crate::types::{Address, CidHash};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("File already stored: {cid_hash}")]
    DuplicateRecord { cid_hash: CidHash },

    #[error("File does not exist: {cid_hash}")]
    NotFound { cid_hash: CidHash },

    #[error("Only uploader or owner can modify this file: {caller} is not allowed to modify {cid_hash}")]
    Unauthorized { caller: Address, cid_hash: CidHash },

    #[error("CID must not be empty")]
    EmptyCid,

    #[error("Ledger storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl RegistryError {
    /// Short machine-readable code for the failed precondition.
    pub fn code(&self) -> &'static str {
        match self {
            RegistryError::DuplicateRecord { .. } => "duplicate_record",
            RegistryError::NotFound { .. } => "not_found",
            RegistryError::Unauthorized { .. } => "unauthorized",
            RegistryError::EmptyCid => "empty_cid",
            RegistryError::Storage(_) => "storage_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;
