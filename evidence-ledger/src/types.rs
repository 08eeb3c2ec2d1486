//! Core types for the ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode for storage, JSON on the wire)
//! - Fixed-length digests (hex or base64 as text, raw bytes in storage)
//! - Immutability once persisted

use crate::{Error, Result};
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// SHA-256 digest
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; 32]);

impl Digest {
    /// All-zero digest (empty tree root, chain genesis)
    pub const ZERO: Digest = Digest([0u8; 32]);

    /// Digest length in bytes
    pub const LEN: usize = 32;

    /// Create from raw bytes
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex encoding
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Standard base64 encoding
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    /// Parse a digest from 64 hex characters or 44 base64 characters
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let bytes = match text.len() {
            64 => hex::decode(text)
                .map_err(|e| Error::InvalidContent(format!("Malformed hex digest: {}", e)))?,
            44 => base64::engine::general_purpose::STANDARD
                .decode(text)
                .map_err(|e| Error::InvalidContent(format!("Malformed base64 digest: {}", e)))?,
            n => {
                return Err(Error::InvalidContent(format!(
                    "Digest must be 64 hex or 44 base64 characters, got {}",
                    n
                )))
            }
        };

        Self::try_from(bytes.as_slice())
    }
}

impl TryFrom<&[u8]> for Digest {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        let array: [u8; 32] = bytes.try_into().map_err(|_| {
            Error::InvalidContent(format!("Digest must be 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(array))
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let text = String::deserialize(deserializer)?;
            Digest::parse(&text).map_err(de::Error::custom)
        } else {
            let bytes = Vec::<u8>::deserialize(deserializer)?;
            Digest::try_from(bytes.as_slice()).map_err(de::Error::custom)
        }
    }
}

/// Digital signature (Ed25519, 64 bytes)
#[derive(Clone, PartialEq, Eq)]
pub struct Signature([u8; 64]);

impl Signature {
    /// Create from bytes
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Get bytes
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    /// Lowercase hex encoding
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex
    pub fn from_hex(text: &str) -> Result<Self> {
        let bytes = hex::decode(text.trim())
            .map_err(|e| Error::SignatureError(format!("Malformed signature hex: {}", e)))?;
        Self::try_from(bytes.as_slice())
    }
}

impl TryFrom<&[u8]> for Signature {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        let array: [u8; 64] = bytes.try_into().map_err(|_| {
            Error::SignatureError(format!("Signature must be 64 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(array))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", self.to_hex())
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let text = String::deserialize(deserializer)?;
            Signature::from_hex(&text).map_err(de::Error::custom)
        } else {
            let bytes = Vec::<u8>::deserialize(deserializer)?;
            Signature::try_from(bytes.as_slice()).map_err(de::Error::custom)
        }
    }
}

/// Ledger identifier (UUIDv7 for time-ordering)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LedgerId(Uuid);

impl LedgerId {
    /// Generate a fresh identifier
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Key bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for LedgerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LedgerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LedgerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::InvalidInput(format!("Malformed ledger id: {}", e)))
    }
}

/// A single content-hash commitment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leaf {
    /// Owning ledger
    pub ledger_id: LedgerId,

    /// Ordinal (unique, strictly increasing, no gaps)
    pub index: u64,

    /// Hash of the external record
    pub content_hash: Digest,

    /// Opaque identifier of the external record
    pub content_ref: String,

    /// When the leaf was committed
    pub appended_at: DateTime<Utc>,
}

/// Ledger header: the tree summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerInfo {
    /// Ledger ID
    pub id: LedgerId,

    /// Human-readable name
    pub name: String,

    /// Number of leaves
    pub leaf_count: u64,

    /// Levels above the leaves
    pub height: u32,

    /// Merkle root over all leaf hashes in ordinal order
    pub root: Digest,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last append timestamp
    pub updated_at: DateTime<Utc>,
}

impl LedgerInfo {
    /// Fresh, empty ledger
    pub fn empty(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: LedgerId::new(),
            name: name.into(),
            leaf_count: 0,
            height: 0,
            root: Digest::ZERO,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the ledger holds no leaves
    pub fn is_empty(&self) -> bool {
        self.leaf_count == 0
    }
}

/// Position of a sibling relative to the running hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Sibling is on the left
    Left,
    /// Sibling is on the right
    Right,
}

/// One root-ward step of a proof path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    /// Sibling hash
    pub hash: Digest,
    /// Sibling side
    pub side: Side,
}

/// Merkle membership proof pinned to the root it was generated against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    /// Proof ID (UUIDv7)
    pub id: Uuid,

    /// Ledger the proof belongs to
    pub ledger_id: LedgerId,

    /// Leaf being proven
    pub leaf_index: u64,

    /// Leaf count when the proof was generated
    pub tree_size: u64,

    /// Sibling path, ordered leaf to root
    pub path: Vec<ProofStep>,

    /// Root the proof is evaluated against
    pub root_at_generation: Digest,

    /// Generation timestamp
    pub generated_at: DateTime<Utc>,
}

/// Result of an append, returned to the content-addressing caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendReceipt {
    /// Ledger appended to
    pub ledger_id: LedgerId,
    /// Assigned ordinal
    pub leaf_index: u64,
    /// Root after the append
    pub new_root: Digest,
    /// Leaf count after the append
    pub leaf_count: u64,
}
