//! Hash-chained audit trail
//!
//! Every operation against ledgers, seals and integrity checks is
//! recorded as an immutable entry. Entries form one global chain:
//!
//! ```text
//! entry_hash = SHA-256(bincode(entry fields) || previous_entry_hash)
//! ```
//!
//! The first entry links to the zero digest. Entries are stored as an
//! arena keyed by sequence number, so verifying the chain is a linear
//! scan. Tampering with any stored field of entry `k` makes entry `k`
//! and every later entry fail verification.
//!
//! Appends go through the single-writer [`AuditActor`](crate::actor::AuditActor);
//! reads go straight to storage.

use crate::actor::{spawn_audit_actor, AuditHandle};
use crate::config::AuditConfig;
use crate::crypto::hash_bytes;
use crate::metrics::Metrics;
use crate::storage::Storage;
use crate::types::Digest;
use crate::{Error, Result};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Entries moved to the archive per write batch
const ARCHIVE_BATCH_SIZE: usize = 1_000;

/// Audited operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Ledger created
    CreateLedger,
    /// Leaf appended
    Append,
    /// Membership proof generated
    GenerateProof,
    /// Seal created
    CreateSeal,
    /// Seal verified
    VerifySeal,
    /// Seal revoked
    RevokeSeal,
    /// Integrity check run
    IntegrityCheck,
    /// Audit chain verified
    VerifyAudit,
    /// Audit trail queried
    QueryAudit,
    /// Audit entries archived
    ArchiveAudit,
}

impl OperationType {
    /// Stable name used in the canonical form
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::CreateLedger => "create_ledger",
            OperationType::Append => "append",
            OperationType::GenerateProof => "generate_proof",
            OperationType::CreateSeal => "create_seal",
            OperationType::VerifySeal => "verify_seal",
            OperationType::RevokeSeal => "revoke_seal",
            OperationType::IntegrityCheck => "integrity_check",
            OperationType::VerifyAudit => "verify_audit",
            OperationType::QueryAudit => "query_audit",
            OperationType::ArchiveAudit => "archive_audit",
        }
    }
}

/// Kind of entity an entry refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// A ledger as a whole
    Ledger,
    /// One appended leaf
    Leaf,
    /// A generated proof
    Proof,
    /// A seal
    Seal,
    /// A persisted check result
    IntegrityCheck,
    /// The audit chain itself
    AuditTrail,
}

impl EntityType {
    /// Stable name used in the canonical form
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Ledger => "ledger",
            EntityType::Leaf => "leaf",
            EntityType::Proof => "proof",
            EntityType::Seal => "seal",
            EntityType::IntegrityCheck => "integrity_check",
            EntityType::AuditTrail => "audit_trail",
        }
    }
}

/// Audit severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    /// Routine reads
    Debug,
    /// Normal mutations
    Info,
    /// Failed or rejected operations
    Warning,
    /// Operation errors
    Error,
    /// Evidence of tampering
    Critical,
}

impl AuditSeverity {
    /// Stable name used in the canonical form
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditSeverity::Debug => "debug",
            AuditSeverity::Info => "info",
            AuditSeverity::Warning => "warning",
            AuditSeverity::Error => "error",
            AuditSeverity::Critical => "critical",
        }
    }
}

/// Immutable, hash-linked audit entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Entry ID (UUIDv7)
    pub id: Uuid,

    /// Position in the global chain, starting at 0
    pub sequence: u64,

    /// What happened
    pub operation_type: OperationType,

    /// What it happened to
    pub entity_type: EntityType,

    /// Identifier of the entity
    pub entity_id: String,

    /// Who did it
    pub actor_id: String,

    /// Entity status before the operation
    pub status_before: Option<String>,

    /// Entity status after the operation
    pub status_after: Option<String>,

    /// Severity
    pub severity: AuditSeverity,

    /// Additional details, sorted by key
    pub details: BTreeMap<String, String>,

    /// When the operation happened
    pub event_timestamp: DateTime<Utc>,

    /// SHA-256(canonical || previous_entry_hash)
    pub entry_hash: Digest,

    /// Hash of the preceding entry (zero for the first entry)
    pub previous_entry_hash: Digest,
}

impl AuditEntry {
    /// Canonical encoding covered by the entry hash
    ///
    /// Every string and the details map are length-prefixed, so no choice
    /// of field contents can make two different entries encode alike.
    pub fn canonical(&self) -> Result<Vec<u8>> {
        let canonical = CanonicalEntry {
            id: self.id.as_bytes(),
            sequence: self.sequence,
            operation: self.operation_type.as_str(),
            entity_type: self.entity_type.as_str(),
            entity_id: &self.entity_id,
            actor: &self.actor_id,
            before: self.status_before.as_deref(),
            after: self.status_after.as_deref(),
            severity: self.severity.as_str(),
            timestamp: self
                .event_timestamp
                .to_rfc3339_opts(SecondsFormat::Nanos, true),
            details: &self.details,
        };
        Ok(bincode::serialize(&canonical)?)
    }

    /// Recompute the entry hash from stored fields
    pub fn compute_hash(&self) -> Result<Digest> {
        let mut bytes = self.canonical()?;
        bytes.extend_from_slice(self.previous_entry_hash.as_bytes());
        Ok(hash_bytes(&bytes))
    }
}

/// Field order of the hashed form
#[derive(Serialize)]
struct CanonicalEntry<'a> {
    id: &'a [u8; 16],
    sequence: u64,
    operation: &'static str,
    entity_type: &'static str,
    entity_id: &'a str,
    actor: &'a str,
    before: Option<&'a str>,
    after: Option<&'a str>,
    severity: &'static str,
    timestamp: String,
    details: &'a BTreeMap<String, String>,
}

/// An operation to record, before it is placed on the chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    /// What happened
    pub operation_type: OperationType,
    /// What it happened to
    pub entity_type: EntityType,
    /// Identifier of the entity
    pub entity_id: String,
    /// Who did it
    pub actor_id: String,
    /// Entity status before the operation
    pub status_before: Option<String>,
    /// Entity status after the operation
    pub status_after: Option<String>,
    /// Severity
    pub severity: AuditSeverity,
    /// Additional details
    pub details: BTreeMap<String, String>,
}

impl AuditRecord {
    /// Info-severity record with no status or details
    pub fn new(
        operation_type: OperationType,
        entity_type: EntityType,
        entity_id: impl ToString,
        actor_id: impl Into<String>,
    ) -> Self {
        Self {
            operation_type,
            entity_type,
            entity_id: entity_id.to_string(),
            actor_id: actor_id.into(),
            status_before: None,
            status_after: None,
            severity: AuditSeverity::Info,
            details: BTreeMap::new(),
        }
    }

    /// Set the prior status
    pub fn before(mut self, status: impl Into<String>) -> Self {
        self.status_before = Some(status.into());
        self
    }

    /// Set the resulting status
    pub fn after(mut self, status: impl Into<String>) -> Self {
        self.status_after = Some(status.into());
        self
    }

    /// Override the severity
    pub fn severity(mut self, severity: AuditSeverity) -> Self {
        self.severity = severity;
        self
    }

    /// Add one detail, replacing any value under `key`
    pub fn detail(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.details.insert(key.into(), value.to_string());
        self
    }

    /// Mark as a failed attempt, keeping the error for forensics
    pub fn failed(self, error: &Error) -> Self {
        self.after("failed")
            .severity(AuditSeverity::Warning)
            .detail("error", error)
    }

    /// Place the record on the chain
    pub(crate) fn into_entry(
        self,
        sequence: u64,
        previous_entry_hash: Digest,
    ) -> Result<AuditEntry> {
        let mut entry = AuditEntry {
            id: Uuid::now_v7(),
            sequence,
            operation_type: self.operation_type,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            actor_id: self.actor_id,
            status_before: self.status_before,
            status_after: self.status_after,
            severity: self.severity,
            details: self.details,
            event_timestamp: Utc::now(),
            entry_hash: Digest::ZERO,
            previous_entry_hash,
        };
        entry.entry_hash = entry.compute_hash()?;
        Ok(entry)
    }
}

/// Audit query filter (all set fields must match)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditFilter {
    /// Entity kind
    pub entity_type: Option<EntityType>,
    /// Exact entity ID
    pub entity_id: Option<String>,
    /// Exact actor
    pub actor_id: Option<String>,
    /// Operation
    pub operation_type: Option<OperationType>,
    /// Inclusive lower bound on event time
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on event time
    pub to: Option<DateTime<Utc>>,
    /// Also search archived entries
    pub include_archived: bool,
}

impl AuditFilter {
    /// Check whether an entry satisfies the filter
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.entity_type.map_or(true, |t| t == entry.entity_type)
            && self
                .entity_id
                .as_deref()
                .map_or(true, |id| id == entry.entity_id)
            && self
                .actor_id
                .as_deref()
                .map_or(true, |actor| actor == entry.actor_id)
            && self
                .operation_type
                .map_or(true, |op| op == entry.operation_type)
            && self.from.map_or(true, |from| entry.event_timestamp >= from)
            && self.to.map_or(true, |to| entry.event_timestamp <= to)
    }

    fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(t) = self.entity_type {
            parts.push(format!("entity_type={}", t.as_str()));
        }
        if let Some(id) = &self.entity_id {
            parts.push(format!("entity_id={}", id));
        }
        if let Some(actor) = &self.actor_id {
            parts.push(format!("actor={}", actor));
        }
        if let Some(op) = self.operation_type {
            parts.push(format!("operation={}", op.as_str()));
        }
        if let Some(from) = self.from {
            parts.push(format!("from={}", from.to_rfc3339()));
        }
        if let Some(to) = self.to {
            parts.push(format!("to={}", to.to_rfc3339()));
        }
        if self.include_archived {
            parts.push("include_archived".to_string());
        }
        parts.join(";")
    }
}

/// Outcome of verifying a single entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryVerification {
    /// The entry and every predecessor recompute
    pub valid: bool,
    /// What was verified, or where the chain broke
    pub reason: String,
}

/// Outcome of verifying the whole chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    /// No break found
    pub valid: bool,
    /// Entries recomputed before stopping
    pub entries_checked: u64,
    /// Sequence of the first entry that failed
    pub first_broken_sequence: Option<u64>,
    /// Summary or failure detail
    pub reason: String,
}

/// Where a chain walk stopped
struct ChainBreak {
    sequence: u64,
    reason: String,
}

/// Hash-chained audit trail
pub struct AuditTrail {
    storage: Arc<Storage>,
    handle: AuditHandle,
    retention_days: i64,
    /// Held exclusively while entries move from live to archive
    archive_gate: RwLock<()>,
}

impl AuditTrail {
    /// Open the trail and spawn its writer
    ///
    /// Must be called within a Tokio runtime.
    pub fn open(storage: Arc<Storage>, config: &AuditConfig, metrics: Metrics) -> Result<Self> {
        let handle = spawn_audit_actor(storage.clone(), config.mailbox_capacity, metrics)?;
        Ok(Self {
            storage,
            handle,
            retention_days: config.retention_days,
            archive_gate: RwLock::new(()),
        })
    }

    /// Append an entry to the chain
    pub async fn log(&self, record: AuditRecord) -> Result<AuditEntry> {
        self.handle.append(record).await
    }

    /// Current `(next_sequence, head_hash)`
    pub async fn head(&self) -> Result<(u64, Digest)> {
        self.handle.head().await
    }

    /// Entry by ID
    pub fn get_entry(&self, entry_id: Uuid) -> Result<AuditEntry> {
        let sequence = self
            .storage
            .audit_sequence(entry_id)?
            .ok_or(Error::EntryNotFound(entry_id))?;
        self.storage
            .get_audit_entry(sequence)?
            .ok_or(Error::EntryNotFound(entry_id))
    }

    /// Recompute the chain from the first entry up to `entry_id`
    ///
    /// The entry is valid only if every entry up to and including it
    /// reproduces its stored hash and links to its predecessor.
    pub async fn verify_entry_integrity(
        &self,
        entry_id: Uuid,
        actor_id: &str,
    ) -> Result<EntryVerification> {
        let target = self
            .storage
            .audit_sequence(entry_id)?
            .ok_or(Error::EntryNotFound(entry_id))?;

        let (checked, broken) = {
            let _gate = self.archive_gate.read().await;
            self.walk_chain(Some(target))?
        };

        let verification = match broken {
            None if checked == target + 1 => EntryVerification {
                valid: true,
                reason: format!("Entry {} verified ({} entries recomputed)", target, checked),
            },
            None => EntryVerification {
                valid: false,
                reason: format!("Chain ends at sequence {} before entry {}", checked, target),
            },
            Some(chain_break) if chain_break.sequence == target => EntryVerification {
                valid: false,
                reason: chain_break.reason,
            },
            Some(chain_break) => EntryVerification {
                valid: false,
                reason: format!(
                    "Chain broken at sequence {} before entry {}: {}",
                    chain_break.sequence, target, chain_break.reason
                ),
            },
        };

        if !verification.valid {
            tracing::error!(
                sequence = target,
                reason = %verification.reason,
                "Audit entry failed verification"
            );
            self.log(
                AuditRecord::new(
                    OperationType::VerifyAudit,
                    EntityType::AuditTrail,
                    entry_id,
                    actor_id,
                )
                .after("invalid")
                .severity(AuditSeverity::Critical)
                .detail("reason", &verification.reason),
            )
            .await?;
        }

        Ok(verification)
    }

    /// Recompute the whole chain, archive included
    pub async fn verify_chain(&self, actor_id: &str) -> Result<ChainVerification> {
        let (checked, broken) = {
            let _gate = self.archive_gate.read().await;
            self.walk_chain(None)?
        };

        let verification = match broken {
            None => ChainVerification {
                valid: true,
                entries_checked: checked,
                first_broken_sequence: None,
                reason: format!("{} entries verified", checked),
            },
            Some(chain_break) => ChainVerification {
                valid: false,
                entries_checked: checked,
                first_broken_sequence: Some(chain_break.sequence),
                reason: chain_break.reason,
            },
        };

        let mut record = AuditRecord::new(
            OperationType::VerifyAudit,
            EntityType::AuditTrail,
            "chain",
            actor_id,
        )
        .detail("entries_checked", verification.entries_checked);

        if verification.valid {
            record = record.after("valid").severity(AuditSeverity::Debug);
        } else {
            tracing::error!(
                first_broken_sequence = ?verification.first_broken_sequence,
                reason = %verification.reason,
                "Audit chain broken"
            );
            record = record
                .after("invalid")
                .severity(AuditSeverity::Critical)
                .detail("reason", &verification.reason);
        }
        self.log(record).await?;

        Ok(verification)
    }

    /// Walk the chain from sequence 0, optionally stopping at `until`
    ///
    /// Returns the number of entries visited and the first break found.
    fn walk_chain(&self, until: Option<u64>) -> Result<(u64, Option<ChainBreak>)> {
        let mut expected_sequence = 0u64;
        let mut previous = Digest::ZERO;
        let mut broken = None;

        self.storage.scan_audit(true, |entry| {
            if until.map_or(false, |last| entry.sequence > last) {
                return Ok(false);
            }

            let problem = if entry.sequence != expected_sequence {
                Some(format!(
                    "Sequence gap: expected {}, found {}",
                    expected_sequence, entry.sequence
                ))
            } else if entry.previous_entry_hash != previous {
                Some(format!(
                    "Entry {} links to {}, but entry {} recomputes to {}",
                    entry.sequence,
                    entry.previous_entry_hash,
                    expected_sequence.wrapping_sub(1),
                    previous
                ))
            } else {
                let recomputed = entry.compute_hash()?;
                if recomputed != entry.entry_hash {
                    Some(format!(
                        "Entry {} hash mismatch: expected {}, stored {}",
                        entry.sequence, recomputed, entry.entry_hash
                    ))
                } else {
                    None
                }
            };

            if let Some(reason) = problem {
                broken = Some(ChainBreak {
                    sequence: entry.sequence,
                    reason,
                });
                return Ok(false);
            }

            previous = entry.entry_hash;
            expected_sequence += 1;
            Ok(true)
        })?;

        Ok((expected_sequence, broken))
    }

    /// Filtered entries in chain order, truncated to `limit`
    ///
    /// The query itself is recorded as a low-severity entry.
    pub async fn query(
        &self,
        filter: &AuditFilter,
        limit: usize,
        queried_by: &str,
    ) -> Result<Vec<AuditEntry>> {
        let mut results = Vec::new();

        if limit > 0 {
            let _gate = self.archive_gate.read().await;
            self.storage.scan_audit(filter.include_archived, |entry| {
                if filter.matches(&entry) {
                    results.push(entry);
                }
                Ok(results.len() < limit)
            })?;
        }

        self.log(
            AuditRecord::new(
                OperationType::QueryAudit,
                EntityType::AuditTrail,
                "query",
                queried_by,
            )
            .severity(AuditSeverity::Debug)
            .detail("filter", filter.describe())
            .detail("limit", limit)
            .detail("returned", results.len()),
        )
        .await?;

        Ok(results)
    }

    /// Move entries older than the retention window to the archive
    ///
    /// Only the contiguous oldest prefix moves, so the archive and the
    /// live chain never interleave. Returns the number of entries moved.
    pub async fn archive(&self, now: DateTime<Utc>, actor_id: &str) -> Result<usize> {
        let cutoff = now - Duration::days(self.retention_days);

        let moved = {
            let _gate = self.archive_gate.write().await;

            let mut expired = Vec::new();
            self.storage.scan_audit(false, |entry| {
                if entry.event_timestamp >= cutoff {
                    return Ok(false);
                }
                expired.push(entry);
                Ok(true)
            })?;

            for chunk in expired.chunks(ARCHIVE_BATCH_SIZE) {
                self.storage.archive_audit_entries(chunk)?;
            }
            expired.len()
        };

        self.log(
            AuditRecord::new(
                OperationType::ArchiveAudit,
                EntityType::AuditTrail,
                "archive",
                actor_id,
            )
            .detail("cutoff", cutoff.to_rfc3339())
            .detail("moved", moved),
        )
        .await?;

        Ok(moved)
    }

    /// Stop the writer
    pub async fn shutdown(&self) -> Result<()> {
        self.handle.shutdown().await
    }
}
