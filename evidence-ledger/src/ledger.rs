//! Merkle ledger core
//!
//! Owns the append-only leaf sequence of every ledger and the root
//! derived from it. The latest `(leaf_count, root)` of a ledger lives
//! only inside its [`LedgerState`], which is mutated exclusively on the
//! serialized append path.
//!
//! # Concurrency
//!
//! Each ledger has its own async `RwLock`:
//!
//! - appends and seals take it exclusively
//! - proofs, root reads and integrity checks share it
//!
//! Acquisition is bounded by `ledger.lock_timeout_ms`; a timeout is a
//! [`Error::ConcurrencyConflict`], which [`LedgerCore::with_retry`]
//! retries with exponential backoff.
//!
//! # Example
//!
//! ```no_run
//! use evidence_ledger::{Config, EvidenceLedger};
//!
//! #[tokio::main]
//! async fn main() -> evidence_ledger::Result<()> {
//!     let ledger = EvidenceLedger::open(Config::default()).await?;
//!     let info = ledger.create_ledger("devices", "enrollment").await?;
//!
//!     let content_hash = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
//!     let receipt = ledger
//!         .append_leaf(info.id, content_hash, "record-1", "enrollment")
//!         .await?;
//!     let proof = ledger.generate_proof(info.id, receipt.leaf_index, "enrollment").await?;
//!     assert!(evidence_ledger::verify_proof(&content_hash.parse()?, &proof));
//!     Ok(())
//! }
//! ```

use crate::{
    audit::{AuditRecord, AuditSeverity, AuditTrail, EntityType, OperationType},
    config::LedgerConfig,
    merkle::{self, merkle_root, tree_height, MerkleTree},
    metrics::Metrics,
    storage::Storage,
    types::{AppendReceipt, Digest, LedgerId, LedgerInfo, Leaf, Proof},
    Error, Result,
};
use chrono::Utc;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio::time::Duration;
use uuid::Uuid;

/// Longest accepted external record reference (bytes)
pub const MAX_CONTENT_REF_LEN: usize = 1024;

/// Longest accepted ledger name (bytes)
const MAX_NAME_LEN: usize = 256;

/// In-memory view of one ledger, guarded by its lock
#[derive(Debug)]
pub struct LedgerState {
    info: LedgerInfo,
    leaf_hashes: Vec<Digest>,
}

impl LedgerState {
    /// Ledger header
    pub fn info(&self) -> &LedgerInfo {
        &self.info
    }

    /// Leaf hashes in ordinal order
    pub fn leaf_hashes(&self) -> &[Digest] {
        &self.leaf_hashes
    }
}

/// Merkle ledger core
pub struct LedgerCore {
    storage: Arc<Storage>,
    audit: Arc<AuditTrail>,
    ledgers: DashMap<LedgerId, Arc<RwLock<LedgerState>>>,
    /// Ledgers whose persisted state failed recovery
    violations: DashMap<LedgerId, String>,
    config: LedgerConfig,
    metrics: Metrics,
}

impl LedgerCore {
    /// Open the core and recover every persisted ledger
    ///
    /// Roots are recomputed from persisted leaves. A ledger whose
    /// recomputed state disagrees with its stored header is refused
    /// with [`Error::IntegrityViolation`] until an operator intervenes;
    /// it is never repaired.
    pub async fn open(
        storage: Arc<Storage>,
        audit: Arc<AuditTrail>,
        config: LedgerConfig,
        metrics: Metrics,
    ) -> Result<Self> {
        let core = Self {
            storage,
            audit,
            ledgers: DashMap::new(),
            violations: DashMap::new(),
            config,
            metrics,
        };

        for info in core.storage.list_ledgers()? {
            let ledger_id = info.id;
            match core.recover_ledger(info) {
                Ok(state) => {
                    core.ledgers.insert(ledger_id, Arc::new(RwLock::new(state)));
                }
                Err(Error::IntegrityViolation(detail)) => {
                    tracing::error!(
                        ledger_id = %ledger_id,
                        detail = %detail,
                        "Ledger failed recovery"
                    );
                    core.audit
                        .log(
                            AuditRecord::new(
                                OperationType::IntegrityCheck,
                                EntityType::Ledger,
                                ledger_id,
                                "system",
                            )
                            .after("quarantined")
                            .severity(AuditSeverity::Critical)
                            .detail("phase", "recovery")
                            .detail("detail", &detail),
                        )
                        .await?;
                    core.violations.insert(ledger_id, detail);
                }
                Err(e) => return Err(e),
            }
        }

        tracing::info!(
            ledgers = core.ledgers.len(),
            quarantined = core.violations.len(),
            "Ledger core recovered"
        );

        Ok(core)
    }

    /// Rebuild a ledger's state from persisted leaves alone
    fn recover_ledger(&self, info: LedgerInfo) -> Result<LedgerState> {
        let leaves = self.storage.all_leaves(&info.id)?;

        for (position, leaf) in leaves.iter().enumerate() {
            if leaf.index != position as u64 {
                return Err(Error::IntegrityViolation(format!(
                    "ledger {}: leaf at position {} has index {}",
                    info.id, position, leaf.index
                )));
            }
        }

        if leaves.len() as u64 != info.leaf_count {
            return Err(Error::IntegrityViolation(format!(
                "ledger {}: header records {} leaves, {} persisted",
                info.id,
                info.leaf_count,
                leaves.len()
            )));
        }

        let leaf_hashes: Vec<Digest> = leaves.iter().map(|l| l.content_hash).collect();
        let recomputed = merkle_root(&leaf_hashes);

        if recomputed != info.root {
            return Err(Error::IntegrityViolation(format!(
                "ledger {}: stored root {} but leaves recompute to {}",
                info.id, info.root, recomputed
            )));
        }

        if let Some(recorded) = self.storage.root_at(&info.id, info.leaf_count)? {
            if recorded != recomputed {
                return Err(Error::IntegrityViolation(format!(
                    "ledger {}: root history at {} records {} but leaves recompute to {}",
                    info.id, info.leaf_count, recorded, recomputed
                )));
            }
        }

        Ok(LedgerState { info, leaf_hashes })
    }

    fn state(&self, ledger_id: LedgerId) -> Result<Arc<RwLock<LedgerState>>> {
        if let Some(detail) = self.violations.get(&ledger_id) {
            return Err(Error::IntegrityViolation(detail.value().clone()));
        }
        self.ledgers
            .get(&ledger_id)
            .map(|entry| entry.value().clone())
            .ok_or(Error::LedgerNotFound(ledger_id))
    }

    fn conflict(&self, ledger_id: LedgerId) -> Error {
        self.metrics.record_conflict();
        tracing::warn!(
            ledger_id = %ledger_id,
            timeout_ms = self.config.lock_timeout_ms,
            "Exclusive section not acquired in time"
        );
        Error::ConcurrencyConflict {
            ledger_id,
            waited_ms: self.config.lock_timeout_ms,
        }
    }

    /// Enter the ledger's exclusive section
    pub async fn exclusive(&self, ledger_id: LedgerId) -> Result<OwnedRwLockWriteGuard<LedgerState>> {
        let lock = self.state(ledger_id)?;
        let timeout = Duration::from_millis(self.config.lock_timeout_ms);
        tokio::time::timeout(timeout, lock.write_owned())
            .await
            .map_err(|_| self.conflict(ledger_id))
    }

    /// Enter the ledger's shared section (consistent snapshot)
    pub async fn shared(&self, ledger_id: LedgerId) -> Result<OwnedRwLockReadGuard<LedgerState>> {
        let lock = self.state(ledger_id)?;
        let timeout = Duration::from_millis(self.config.lock_timeout_ms);
        tokio::time::timeout(timeout, lock.read_owned())
            .await
            .map_err(|_| self.conflict(ledger_id))
    }

    /// Re-run `operation` on concurrency conflicts with exponential backoff
    pub async fn with_retry<T, F, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        let mut backoff = Duration::from_millis(self.config.retry_backoff_ms);

        loop {
            match operation().await {
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    tracing::warn!(attempt, backoff_ms = backoff.as_millis() as u64, "Retrying: {}", e);
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                result => return result,
            }
        }
    }

    /// Record a failed operation; the original error wins over audit errors
    async fn audit_failure(&self, record: AuditRecord, error: &Error) {
        if let Err(audit_err) = self.audit.log(record.failed(error)).await {
            tracing::error!("Failed to audit failed operation: {}", audit_err);
        }
    }

    /// Create an empty ledger
    pub async fn create_ledger(&self, name: &str, actor_id: &str) -> Result<LedgerInfo> {
        let name = name.trim();
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            let err = Error::InvalidInput(format!(
                "Ledger name must be 1..={} bytes, got {}",
                MAX_NAME_LEN,
                name.len()
            ));
            self.audit_failure(
                AuditRecord::new(OperationType::CreateLedger, EntityType::Ledger, "-", actor_id),
                &err,
            )
            .await;
            return Err(err);
        }

        let info = LedgerInfo::empty(name);
        self.storage.create_ledger(&info)?;
        self.ledgers.insert(
            info.id,
            Arc::new(RwLock::new(LedgerState {
                info: info.clone(),
                leaf_hashes: Vec::new(),
            })),
        );

        self.audit
            .log(
                AuditRecord::new(OperationType::CreateLedger, EntityType::Ledger, info.id, actor_id)
                    .after("open")
                    .detail("name", &info.name),
            )
            .await?;

        tracing::info!(ledger_id = %info.id, name = %info.name, "Ledger created");
        Ok(info)
    }

    /// Append a content hash, returning its ordinal and the new root
    ///
    /// `content_hash` must be 64 hex or 44 base64 characters.
    pub async fn append_leaf(
        &self,
        ledger_id: LedgerId,
        content_hash: &str,
        content_ref: &str,
        actor_id: &str,
    ) -> Result<AppendReceipt> {
        let result = match validate_append(content_hash, content_ref) {
            Ok(digest) => {
                self.with_retry(move || self.try_append(ledger_id, digest, content_ref, actor_id))
                    .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            self.audit_failure(
                AuditRecord::new(OperationType::Append, EntityType::Ledger, ledger_id, actor_id)
                    .detail("content_ref", content_ref),
                e,
            )
            .await;
        }

        result
    }

    async fn try_append(
        &self,
        ledger_id: LedgerId,
        content_hash: Digest,
        content_ref: &str,
        actor_id: &str,
    ) -> Result<AppendReceipt> {
        let start = Instant::now();
        let mut state = self.exclusive(ledger_id).await?;

        let now = Utc::now();
        let leaf = Leaf {
            ledger_id,
            index: state.info.leaf_count,
            content_hash,
            content_ref: content_ref.to_string(),
            appended_at: now,
        };

        state.leaf_hashes.push(content_hash);
        let mut info = state.info.clone();
        info.leaf_count += 1;
        info.height = tree_height(info.leaf_count);
        info.root = merkle_root(&state.leaf_hashes);
        info.updated_at = now;

        if let Err(e) = self.storage.append_leaf_atomic(&leaf, &info) {
            state.leaf_hashes.pop();
            return Err(e);
        }
        let previous_count = state.info.leaf_count;
        state.info = info;

        // Recorded before the section is released so audit order matches leaf order.
        // The leaf is already durable, so an audit failure does not fail the append.
        if let Err(e) = self
            .audit
            .log(
                AuditRecord::new(
                    OperationType::Append,
                    EntityType::Leaf,
                    format!("{}:{}", ledger_id, leaf.index),
                    actor_id,
                )
                .before(previous_count.to_string())
                .after(state.info.leaf_count.to_string())
                .severity(AuditSeverity::Info)
                .detail("content_hash", leaf.content_hash)
                .detail("content_ref", &leaf.content_ref)
                .detail("root", state.info.root),
            )
            .await
        {
            tracing::error!(
                ledger_id = %ledger_id,
                leaf_index = leaf.index,
                error = %e,
                "Leaf committed but its audit entry was not recorded"
            );
        }

        self.metrics.record_append(start.elapsed().as_secs_f64());

        tracing::debug!(
            ledger_id = %ledger_id,
            leaf_index = leaf.index,
            root = %state.info.root,
            "Leaf appended"
        );

        Ok(AppendReceipt {
            ledger_id,
            leaf_index: leaf.index,
            new_root: state.info.root,
            leaf_count: state.info.leaf_count,
        })
    }

    /// Current root
    pub async fn get_root(&self, ledger_id: LedgerId) -> Result<Digest> {
        Ok(self.shared(ledger_id).await?.info.root)
    }

    /// Current header
    pub async fn ledger_info(&self, ledger_id: LedgerId) -> Result<LedgerInfo> {
        Ok(self.shared(ledger_id).await?.info.clone())
    }

    /// All persisted ledger headers
    pub fn list_ledgers(&self) -> Result<Vec<LedgerInfo>> {
        self.storage.list_ledgers()
    }

    /// Leaf by ordinal
    pub async fn get_leaf(&self, ledger_id: LedgerId, index: u64) -> Result<Leaf> {
        self.state(ledger_id)?;
        self.storage
            .get_leaf(&ledger_id, index)?
            .ok_or(Error::LeafNotFound { ledger_id, index })
    }

    /// Root recorded when the ledger held `leaf_count` leaves
    pub async fn root_at(&self, ledger_id: LedgerId, leaf_count: u64) -> Result<Digest> {
        let current = self.shared(ledger_id).await?.info.leaf_count;
        self.storage
            .root_at(&ledger_id, leaf_count)?
            .ok_or(Error::IndexOutOfRange {
                ledger_id,
                index: leaf_count,
                leaf_count: current,
            })
    }

    /// Generate and persist a membership proof pinned to the current root
    pub async fn generate_proof(
        &self,
        ledger_id: LedgerId,
        leaf_index: u64,
        actor_id: &str,
    ) -> Result<Proof> {
        let result = self.try_generate_proof(ledger_id, leaf_index, actor_id).await;
        if let Err(e) = &result {
            self.audit_failure(
                AuditRecord::new(OperationType::GenerateProof, EntityType::Ledger, ledger_id, actor_id)
                    .detail("leaf_index", leaf_index),
                e,
            )
            .await;
        }
        result
    }

    async fn try_generate_proof(
        &self,
        ledger_id: LedgerId,
        leaf_index: u64,
        actor_id: &str,
    ) -> Result<Proof> {
        let proof = {
            let state = self.shared(ledger_id).await?;
            let leaf_count = state.info.leaf_count;
            if leaf_index >= leaf_count {
                return Err(Error::IndexOutOfRange {
                    ledger_id,
                    index: leaf_index,
                    leaf_count,
                });
            }

            let tree = MerkleTree::build(&state.leaf_hashes);
            let path = tree.path(leaf_index as usize).ok_or(Error::IndexOutOfRange {
                ledger_id,
                index: leaf_index,
                leaf_count,
            })?;

            Proof {
                id: Uuid::now_v7(),
                ledger_id,
                leaf_index,
                tree_size: leaf_count,
                path,
                root_at_generation: tree.root(),
                generated_at: Utc::now(),
            }
        };

        self.storage.put_proof(&proof)?;
        self.metrics.record_proof();

        self.audit
            .log(
                AuditRecord::new(OperationType::GenerateProof, EntityType::Proof, proof.id, actor_id)
                    .after("generated")
                    .detail("ledger_id", ledger_id)
                    .detail("leaf_index", leaf_index)
                    .detail("tree_size", proof.tree_size)
                    .detail("root", proof.root_at_generation),
            )
            .await?;

        tracing::debug!(
            ledger_id = %ledger_id,
            leaf_index,
            proof_id = %proof.id,
            "Proof generated"
        );

        Ok(proof)
    }

    /// Stored proof by ID
    pub fn get_proof(&self, proof_id: Uuid) -> Result<Proof> {
        self.storage
            .get_proof(proof_id)?
            .ok_or(Error::ProofNotFound(proof_id))
    }

    /// Check a proof against the root it was pinned to
    pub fn verify_proof(leaf_hash: &Digest, proof: &Proof) -> bool {
        merkle::verify_proof(leaf_hash, proof)
    }
}

fn validate_append(content_hash: &str, content_ref: &str) -> Result<Digest> {
    let digest = Digest::parse(content_hash)?;
    if content_ref.is_empty() || content_ref.len() > MAX_CONTENT_REF_LEN {
        return Err(Error::InvalidInput(format!(
            "Content ref must be 1..={} bytes, got {}",
            MAX_CONTENT_REF_LEN,
            content_ref.len()
        )));
    }
    Ok(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditFilter;
    use crate::crypto::hash_bytes;
    use crate::Config;
    use tempfile::TempDir;

    struct Fixture {
        core: LedgerCore,
        audit: Arc<AuditTrail>,
        storage: Arc<Storage>,
        _temp: TempDir,
    }

    async fn fixture_with(config: LedgerConfig) -> Fixture {
        let temp = TempDir::new().unwrap();
        let mut full = Config::default();
        full.data_dir = temp.path().to_path_buf();
        let storage = Arc::new(Storage::open(&full).unwrap());
        let metrics = Metrics::new().unwrap();
        let audit = Arc::new(AuditTrail::open(storage.clone(), &full.audit, metrics.clone()).unwrap());
        let core = LedgerCore::open(storage.clone(), audit.clone(), config, metrics)
            .await
            .unwrap();
        Fixture {
            core,
            audit,
            storage,
            _temp: temp,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(LedgerConfig::default()).await
    }

    fn h(label: &str) -> String {
        hash_bytes(label.as_bytes()).to_hex()
    }

    #[tokio::test]
    async fn test_empty_ledger() {
        let f = fixture().await;
        let info = f.core.create_ledger("devices", "alice").await.unwrap();

        assert_eq!(info.leaf_count, 0);
        assert_eq!(f.core.get_root(info.id).await.unwrap(), Digest::ZERO);
        assert!(matches!(
            f.core.generate_proof(info.id, 0, "alice").await,
            Err(Error::IndexOutOfRange { index: 0, leaf_count: 0, .. })
        ));
    }

    #[tokio::test]
    async fn test_append_assigns_contiguous_ordinals() {
        let f = fixture().await;
        let info = f.core.create_ledger("devices", "alice").await.unwrap();

        for (i, label) in ["a", "b", "c"].iter().enumerate() {
            let receipt = f.core.append_leaf(info.id, &h(label), label, "alice").await.unwrap();
            assert_eq!(receipt.leaf_index, i as u64);
            assert_eq!(receipt.leaf_count, i as u64 + 1);
        }

        let ha = hash_bytes(b"a");
        let hb = hash_bytes(b"b");
        let hc = hash_bytes(b"c");
        let expected = crate::crypto::hash_pair(
            &crate::crypto::hash_pair(&ha, &hb),
            &crate::crypto::hash_pair(&hc, &hc),
        );

        let current = f.core.ledger_info(info.id).await.unwrap();
        assert_eq!(current.root, expected);
        assert_eq!(current.height, 2);
        assert_eq!(f.core.root_at(info.id, 2).await.unwrap(), crate::crypto::hash_pair(&ha, &hb));
        assert_eq!(f.core.get_leaf(info.id, 1).await.unwrap().content_ref, "b");
    }

    #[tokio::test]
    async fn test_append_rejects_malformed_input() {
        let f = fixture().await;
        let info = f.core.create_ledger("devices", "alice").await.unwrap();

        assert!(matches!(
            f.core.append_leaf(info.id, "not-a-digest", "r", "alice").await,
            Err(Error::InvalidContent(_))
        ));
        assert!(matches!(
            f.core.append_leaf(info.id, &h("a"), "", "alice").await,
            Err(Error::InvalidInput(_))
        ));
        let long_ref = "x".repeat(MAX_CONTENT_REF_LEN + 1);
        assert!(matches!(
            f.core.append_leaf(info.id, &h("a"), &long_ref, "alice").await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            f.core.append_leaf(LedgerId::new(), &h("a"), "r", "alice").await,
            Err(Error::LedgerNotFound(_))
        ));

        assert_eq!(f.core.ledger_info(info.id).await.unwrap().leaf_count, 0);

        // Failed attempts are audited too
        let failed = f
            .audit
            .query(
                &AuditFilter {
                    operation_type: Some(OperationType::Append),
                    ..Default::default()
                },
                10,
                "auditor",
            )
            .await
            .unwrap();
        assert_eq!(failed.len(), 4);
        assert!(failed
            .iter()
            .all(|e| e.status_after.as_deref() == Some("failed")));
    }

    #[tokio::test]
    async fn test_committed_append_survives_audit_outage() {
        let f = fixture().await;
        let info = f.core.create_ledger("devices", "alice").await.unwrap();

        f.audit.shutdown().await.unwrap();
        let receipt = f.core.append_leaf(info.id, &h("a"), "a", "alice").await.unwrap();

        assert_eq!(receipt.leaf_index, 0);
        assert_eq!(f.storage.all_leaves(&info.id).unwrap().len(), 1);
        assert_eq!(f.core.get_root(info.id).await.unwrap(), receipt.new_root);
    }

    #[tokio::test]
    async fn test_proofs_verify_and_persist() {
        let f = fixture().await;
        let info = f.core.create_ledger("devices", "alice").await.unwrap();
        for label in ["a", "b", "c", "d", "e"] {
            f.core.append_leaf(info.id, &h(label), label, "alice").await.unwrap();
        }

        for index in 0..5u64 {
            let proof = f.core.generate_proof(info.id, index, "alice").await.unwrap();
            let leaf = f.core.get_leaf(info.id, index).await.unwrap();
            assert!(LedgerCore::verify_proof(&leaf.content_hash, &proof));
            assert_eq!(proof.tree_size, 5);
            assert_eq!(f.core.get_proof(proof.id).unwrap(), proof);
        }

        assert_eq!(f.storage.all_proofs(&info.id).unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_recovery_reloads_state() {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp.path().to_path_buf();
        let storage = Arc::new(Storage::open(&config).unwrap());
        let metrics = Metrics::new().unwrap();
        let audit = Arc::new(AuditTrail::open(storage.clone(), &config.audit, metrics.clone()).unwrap());

        let first = LedgerCore::open(storage.clone(), audit.clone(), config.ledger.clone(), metrics.clone())
            .await
            .unwrap();
        let info = first.create_ledger("devices", "alice").await.unwrap();
        first.append_leaf(info.id, &h("a"), "a", "alice").await.unwrap();
        let receipt = first.append_leaf(info.id, &h("b"), "b", "alice").await.unwrap();
        drop(first);

        let second = LedgerCore::open(storage, audit, config.ledger, metrics).await.unwrap();
        assert_eq!(second.get_root(info.id).await.unwrap(), receipt.new_root);

        let next = second.append_leaf(info.id, &h("c"), "c", "alice").await.unwrap();
        assert_eq!(next.leaf_index, 2);
    }

    #[tokio::test]
    async fn test_recovery_refuses_tampered_header() {
        let f = fixture().await;
        let info = f.core.create_ledger("devices", "alice").await.unwrap();
        f.core.append_leaf(info.id, &h("a"), "a", "alice").await.unwrap();

        let mut forged = f.core.ledger_info(info.id).await.unwrap();
        forged.root = hash_bytes(b"forged");
        f.storage.create_ledger(&forged).unwrap();

        let reopened = LedgerCore::open(
            f.storage.clone(),
            f.audit.clone(),
            LedgerConfig::default(),
            Metrics::new().unwrap(),
        )
        .await
        .unwrap();

        assert!(matches!(
            reopened.get_root(info.id).await,
            Err(Error::IntegrityViolation(_))
        ));
        assert!(matches!(
            reopened.append_leaf(info.id, &h("b"), "b", "alice").await,
            Err(Error::IntegrityViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_exclusive_section_times_out() {
        let f = fixture_with(LedgerConfig {
            lock_timeout_ms: 20,
            max_retries: 0,
            retry_backoff_ms: 1,
        })
        .await;
        let info = f.core.create_ledger("devices", "alice").await.unwrap();

        let guard = f.core.exclusive(info.id).await.unwrap();
        let result = f.core.append_leaf(info.id, &h("a"), "a", "alice").await;
        assert!(matches!(result, Err(Error::ConcurrencyConflict { .. })));
        drop(guard);

        assert!(f.core.append_leaf(info.id, &h("a"), "a", "alice").await.is_ok());
    }

    #[tokio::test]
    async fn test_retry_wins_after_release() {
        let f = fixture_with(LedgerConfig {
            lock_timeout_ms: 20,
            max_retries: 5,
            retry_backoff_ms: 10,
        })
        .await;
        let info = f.core.create_ledger("devices", "alice").await.unwrap();

        let guard = f.core.exclusive(info.id).await.unwrap();
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            drop(guard);
        });

        let receipt = f.core.append_leaf(info.id, &h("a"), "a", "alice").await.unwrap();
        assert_eq!(receipt.leaf_index, 0);
        release.await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_appends_never_share_an_ordinal() {
        let f = Arc::new(fixture().await);
        let ledger_id = f.core.create_ledger("devices", "alice").await.unwrap().id;

        let tasks: Vec<_> = (0..16)
            .map(|n| {
                let f = f.clone();
                tokio::spawn(async move {
                    let label = format!("leaf-{}", n);
                    f.core
                        .append_leaf(ledger_id, &h(&label), &label, "alice")
                        .await
                        .unwrap()
                        .leaf_index
                })
            })
            .collect();

        let mut indices = Vec::new();
        for task in tasks {
            indices.push(task.await.unwrap());
        }
        indices.sort_unstable();
        assert_eq!(indices, (0..16).collect::<Vec<_>>());

        let hashes: Vec<Digest> = f
            .storage
            .all_leaves(&ledger_id)
            .unwrap()
            .iter()
            .map(|l| l.content_hash)
            .collect();
        assert_eq!(merkle_root(&hashes), f.core.get_root(ledger_id).await.unwrap());
    }
}
