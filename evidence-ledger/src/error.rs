//! Error types for the ledger

use crate::types::LedgerId;
use thiserror::Error;
use uuid::Uuid;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Ledger does not exist
    #[error("Ledger not found: {0}")]
    LedgerNotFound(LedgerId),

    /// Leaf does not exist
    #[error("Leaf not found: ledger {ledger_id}, index {index}")]
    LeafNotFound {
        /// Ledger searched
        ledger_id: LedgerId,
        /// Missing ordinal
        index: u64,
    },

    /// Seal does not exist
    #[error("Seal not found: {0}")]
    SealNotFound(Uuid),

    /// Audit entry does not exist
    #[error("Audit entry not found: {0}")]
    EntryNotFound(Uuid),

    /// Proof does not exist
    #[error("Proof not found: {0}")]
    ProofNotFound(Uuid),

    /// Content hash is not a well-formed digest
    #[error("Invalid content: {0}")]
    InvalidContent(String),

    /// Malformed request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Leaf index past the end of the ledger
    #[error("Index out of range: ledger {ledger_id}, index {index}, leaf count {leaf_count}")]
    IndexOutOfRange {
        /// Ledger addressed
        ledger_id: LedgerId,
        /// Requested ordinal
        index: u64,
        /// Leaves present at the time of the request
        leaf_count: u64,
    },

    /// Seal requested over a ledger with no leaves
    #[error("Ledger is empty: {0}")]
    LedgerEmpty(LedgerId),

    /// Lost the race for the per-ledger exclusive section
    #[error("Concurrency conflict on ledger {ledger_id}: lock not acquired within {waited_ms}ms")]
    ConcurrencyConflict {
        /// Contended ledger
        ledger_id: LedgerId,
        /// How long the caller waited
        waited_ms: u64,
    },

    /// Recomputed state disagrees with stored state
    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),

    /// No signing key configured
    #[error("Signing unavailable: {0}")]
    SigningUnavailable(String),

    /// Signature could not be produced or parsed
    #[error("Signature error: {0}")]
    SignatureError(String),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Actor mailbox or response channel closed
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Caller-facing classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Ledger, leaf, seal, proof or entry absent
    NotFound,
    /// Malformed digest, out-of-range index, empty ledger
    InvalidInput,
    /// Safe to retry the whole operation
    ConcurrencyConflict,
    /// Requires operator intervention
    IntegrityViolation,
    /// Fails closed, nothing persisted
    SigningUnavailable,
    /// Storage, serialization and runtime faults
    Internal,
}

impl Error {
    /// Map to the caller-facing taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::LedgerNotFound(_)
            | Error::LeafNotFound { .. }
            | Error::SealNotFound(_)
            | Error::EntryNotFound(_)
            | Error::ProofNotFound(_) => ErrorKind::NotFound,
            Error::InvalidContent(_)
            | Error::InvalidInput(_)
            | Error::IndexOutOfRange { .. }
            | Error::LedgerEmpty(_) => ErrorKind::InvalidInput,
            Error::ConcurrencyConflict { .. } => ErrorKind::ConcurrencyConflict,
            Error::IntegrityViolation(_) => ErrorKind::IntegrityViolation,
            Error::SigningUnavailable(_) => ErrorKind::SigningUnavailable,
            Error::SignatureError(_)
            | Error::Storage(_)
            | Error::Serialization(_)
            | Error::Concurrency(_)
            | Error::Config(_)
            | Error::Io(_) => ErrorKind::Internal,
        }
    }

    /// Only lost exclusive sections are retried locally
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::ConcurrencyConflict
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
