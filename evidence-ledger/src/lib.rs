//! Evidence Ledger
//!
//! Tamper-evident, append-only ledger of content commitments.
//!
//! # Architecture
//!
//! - **Merkle Ledger Core**: ordered leaves, deterministic root, membership proofs
//! - **Sealing**: signed point-in-time snapshots of a ledger's root and leaf set
//! - **Integrity Checker**: recomputes persisted state and reports divergence
//! - **Audit Trail**: global hash chain over every operation
//!
//! # Invariants
//!
//! - Append-only: leaves are never modified, reordered or deleted
//! - Deterministic: the root is a pure function of the ordered leaf hashes
//! - Pinned proofs: a proof verifies against the root it was generated under
//! - No silent repair: detected divergence is reported, never corrected

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod actor;
pub mod audit;
pub mod config;
pub mod crypto;
pub mod error;
pub mod integrity;
pub mod ledger;
pub mod merkle;
pub mod metrics;
pub mod sealing;
pub mod service;
pub mod storage;
pub mod types;

// Re-exports
pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use merkle::verify_proof;
pub use service::EvidenceLedger;
pub use types::{AppendReceipt, Digest, LedgerId, LedgerInfo, Leaf, Proof, ProofStep, Side, Signature};
