//! Integrity checker
//!
//! Recomputes ledger state from what is persisted and diffs it against
//! what is recorded. Nothing found here is ever repaired: every check
//! produces an [`IntegrityCheckResult`] that is persisted, and a failing
//! result is escalated as a critical audit entry.
//!
//! Checks run inside the ledger's shared section, so they observe a
//! consistent leaf set and never a half-applied append. A storage error
//! mid-scan aborts the check; partial results are not recorded.

use crate::{
    audit::{AuditRecord, AuditSeverity, AuditTrail, EntityType, OperationType},
    config::IntegrityConfig,
    ledger::{LedgerCore, LedgerState},
    merkle::{self, merkle_root, root_from_path},
    metrics::Metrics,
    storage::Storage,
    types::{Digest, LedgerId, LedgerInfo, Leaf, Proof},
    Error, Result,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{watch, OwnedRwLockReadGuard};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use uuid::Uuid;

/// Actor recorded for background scans
const SCANNER_ACTOR: &str = "integrity-scanner";

/// What a check covered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckScope {
    /// Every leaf and every stored proof
    Full,
    /// Leaves with `start_index <= index < end_index`
    #[allow(missing_docs)]
    Incremental { start_index: u64, end_index: u64 },
    /// Stored root against leaves only
    RootConsistency,
    /// Duplicate and orphaned leaves
    DataConsistency,
}

impl CheckScope {
    fn as_str(&self) -> &'static str {
        match self {
            CheckScope::Full => "full",
            CheckScope::Incremental { .. } => "incremental",
            CheckScope::RootConsistency => "root_consistency",
            CheckScope::DataConsistency => "data_consistency",
        }
    }
}

/// Overall outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    /// No findings
    Success,
    /// Hygiene findings only, or nothing to check
    Warning,
    /// At least one critical finding
    Failure,
}

impl CheckStatus {
    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Success => "success",
            CheckStatus::Warning => "warning",
            CheckStatus::Failure => "failure",
        }
    }
}

/// Severity of a single finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    /// Hygiene finding, not evidence of tampering
    Warning,
    /// Recorded state disagrees with recomputed state
    Critical,
}

/// One finding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    /// Leaf the finding is about, if any
    pub leaf_index: Option<u64>,
    /// Where it was found (`ledger.root`, `proof:<id>`, ...)
    pub location: String,
    /// Recorded or recomputed value that should hold
    pub expected: String,
    /// Value actually found
    pub actual: String,
    /// How serious the finding is
    pub severity: IssueSeverity,
}

impl Issue {
    fn critical(
        leaf_index: Option<u64>,
        location: impl Into<String>,
        expected: impl ToString,
        actual: impl ToString,
    ) -> Self {
        Self {
            leaf_index,
            location: location.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
            severity: IssueSeverity::Critical,
        }
    }

    fn warning(
        leaf_index: Option<u64>,
        location: impl Into<String>,
        expected: impl ToString,
        actual: impl ToString,
    ) -> Self {
        Self {
            severity: IssueSeverity::Warning,
            ..Self::critical(leaf_index, location, expected, actual)
        }
    }
}

/// Persisted outcome of one check invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct IntegrityCheckResult {
    pub id: Uuid,
    pub ledger_id: LedgerId,
    pub scope: CheckScope,
    pub status: CheckStatus,
    pub issues: Vec<Issue>,
    pub leaves_checked: u64,
    pub proofs_checked: u64,
    /// Root recorded in the ledger header
    pub stored_root: Option<Digest>,
    /// Root recomputed from persisted leaves
    pub recomputed_root: Option<Digest>,
    /// Where an incremental scan continues; `None` at the end
    pub next_index: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl IntegrityCheckResult {
    /// Findings that indicate tampering or corruption
    pub fn critical_issues(&self) -> impl Iterator<Item = &Issue> {
        self.issues
            .iter()
            .filter(|issue| issue.severity == IssueSeverity::Critical)
    }
}

/// Outcome of [`IntegrityChecker::check_root_consistency`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootConsistency {
    /// Stored root equals the recomputed root
    pub consistent: bool,
    /// 1.0 on exact match, 0.0 otherwise
    pub score: f64,
    /// Human-readable comparison
    pub detail: String,
    /// Persisted result backing this answer
    pub check_id: Uuid,
}

/// Accumulates findings for one check
struct Scan {
    ledger_id: LedgerId,
    scope: CheckScope,
    started_at: DateTime<Utc>,
    issues: Vec<Issue>,
    leaves_checked: u64,
    proofs_checked: u64,
    stored_root: Option<Digest>,
    recomputed_root: Option<Digest>,
    next_index: Option<u64>,
}

impl Scan {
    fn new(ledger_id: LedgerId, scope: CheckScope) -> Self {
        Self {
            ledger_id,
            scope,
            started_at: Utc::now(),
            issues: Vec::new(),
            leaves_checked: 0,
            proofs_checked: 0,
            stored_root: None,
            recomputed_root: None,
            next_index: None,
        }
    }

    /// Leaves must carry ordinals `first, first + 1, ...`
    fn check_contiguous(&mut self, leaves: &[Leaf], first: u64) {
        for (offset, leaf) in leaves.iter().enumerate() {
            let expected = first + offset as u64;
            if leaf.index != expected {
                self.issues.push(Issue::critical(
                    Some(expected),
                    "leaf.index",
                    expected,
                    leaf.index,
                ));
            }
        }
        self.leaves_checked += leaves.len() as u64;
    }

    /// Proof must recompute its own pinned root from the persisted leaf
    fn check_proof_path(&mut self, proof: &Proof, leaf_hash: Option<&Digest>) -> bool {
        self.proofs_checked += 1;
        let location = format!("proof:{}", proof.id);

        let leaf_hash = match leaf_hash {
            Some(hash) => hash,
            None => {
                self.issues.push(Issue::critical(
                    Some(proof.leaf_index),
                    location,
                    "persisted leaf",
                    "missing leaf",
                ));
                return false;
            }
        };

        if !merkle::verify_proof(leaf_hash, proof) {
            self.issues.push(Issue::critical(
                Some(proof.leaf_index),
                location,
                proof.root_at_generation,
                root_from_path(leaf_hash, &proof.path),
            ));
            return false;
        }

        true
    }

    fn finish(self) -> IntegrityCheckResult {
        let status = if self
            .issues
            .iter()
            .any(|issue| issue.severity == IssueSeverity::Critical)
        {
            CheckStatus::Failure
        } else if !self.issues.is_empty()
            || (self.scope == CheckScope::Full && self.leaves_checked == 0)
        {
            CheckStatus::Warning
        } else {
            CheckStatus::Success
        };

        IntegrityCheckResult {
            id: Uuid::now_v7(),
            ledger_id: self.ledger_id,
            scope: self.scope,
            status,
            issues: self.issues,
            leaves_checked: self.leaves_checked,
            proofs_checked: self.proofs_checked,
            stored_root: self.stored_root,
            recomputed_root: self.recomputed_root,
            next_index: self.next_index,
            started_at: self.started_at,
            completed_at: Utc::now(),
        }
    }
}

/// Detects divergence between recorded and recomputed ledger state
pub struct IntegrityChecker {
    ledger: Arc<LedgerCore>,
    storage: Arc<Storage>,
    audit: Arc<AuditTrail>,
    config: IntegrityConfig,
    metrics: Metrics,
}

impl IntegrityChecker {
    /// Create checker
    pub fn new(
        ledger: Arc<LedgerCore>,
        storage: Arc<Storage>,
        audit: Arc<AuditTrail>,
        config: IntegrityConfig,
        metrics: Metrics,
    ) -> Self {
        Self {
            ledger,
            storage,
            audit,
            config,
            metrics,
        }
    }

    /// Shared section plus the persisted header
    ///
    /// A quarantined ledger is still checked: it refuses writes, so its
    /// persisted state cannot move while we read it.
    async fn snapshot(
        &self,
        ledger_id: LedgerId,
    ) -> Result<(Option<OwnedRwLockReadGuard<LedgerState>>, LedgerInfo)> {
        let guard = match self.ledger.shared(ledger_id).await {
            Ok(guard) => Some(guard),
            Err(Error::IntegrityViolation(_)) => None,
            Err(e) => return Err(e),
        };
        let info = self
            .storage
            .get_ledger(&ledger_id)?
            .ok_or(Error::LedgerNotFound(ledger_id))?;
        Ok((guard, info))
    }

    /// Re-verify every stored proof and recompute the root from all leaves
    pub async fn full_check(&self, ledger_id: LedgerId, actor_id: &str) -> Result<IntegrityCheckResult> {
        let (guard, info) = self.snapshot(ledger_id).await?;
        let mut scan = Scan::new(ledger_id, CheckScope::Full);

        let leaves = self.storage.all_leaves(&ledger_id)?;
        scan.check_contiguous(&leaves, 0);

        if leaves.len() as u64 != info.leaf_count {
            scan.issues.push(Issue::critical(
                None,
                "ledger.leaf_count",
                info.leaf_count,
                leaves.len(),
            ));
        }

        let hashes: Vec<Digest> = leaves.iter().map(|leaf| leaf.content_hash).collect();
        let recomputed = merkle_root(&hashes);
        scan.stored_root = Some(info.root);
        scan.recomputed_root = Some(recomputed);

        if recomputed != info.root {
            scan.issues
                .push(Issue::critical(None, "ledger.root", info.root, recomputed));
        }

        // Prefix roots, one per distinct tree size
        let mut prefix_roots: HashMap<u64, Digest> = HashMap::new();

        for proof in self.storage.all_proofs(&ledger_id)? {
            let leaf_hash = hashes.get(proof.leaf_index as usize);
            if !scan.check_proof_path(&proof, leaf_hash) {
                continue;
            }

            if proof.tree_size > hashes.len() as u64 {
                scan.issues.push(Issue::critical(
                    Some(proof.leaf_index),
                    format!("proof:{}.tree_size", proof.id),
                    format!("<= {}", hashes.len()),
                    proof.tree_size,
                ));
                continue;
            }

            let prefix_root = *prefix_roots
                .entry(proof.tree_size)
                .or_insert_with(|| merkle_root(&hashes[..proof.tree_size as usize]));
            if prefix_root != proof.root_at_generation {
                scan.issues.push(Issue::critical(
                    Some(proof.leaf_index),
                    format!("proof:{}.root_at_generation", proof.id),
                    prefix_root,
                    proof.root_at_generation,
                ));
            }
        }
        drop(guard);

        self.record(scan.finish(), actor_id).await
    }

    /// Check the window `[start_index, start_index + page_size)`
    ///
    /// Window leaves are diffed against the committed leaf hashes, and the
    /// root at the window's end is rebuilt and compared with root history.
    pub async fn incremental_check(
        &self,
        ledger_id: LedgerId,
        start_index: u64,
        page_size: u64,
        actor_id: &str,
    ) -> Result<IntegrityCheckResult> {
        if page_size == 0 {
            return Err(Error::InvalidInput("page size must be positive".to_string()));
        }

        let (guard, info) = self.snapshot(ledger_id).await?;
        if start_index > info.leaf_count {
            return Err(Error::IndexOutOfRange {
                ledger_id,
                index: start_index,
                leaf_count: info.leaf_count,
            });
        }

        let end_index = start_index.saturating_add(page_size).min(info.leaf_count);
        let mut scan = Scan::new(
            ledger_id,
            CheckScope::Incremental {
                start_index,
                end_index,
            },
        );
        scan.stored_root = Some(info.root);

        let leaves = self.storage.leaves_in_range(&ledger_id, start_index, end_index)?;
        scan.check_contiguous(&leaves, start_index);

        let expected_len = end_index - start_index;
        if leaves.len() as u64 != expected_len {
            scan.issues.push(Issue::critical(
                None,
                format!("leaves[{}..{}]", start_index, end_index),
                expected_len,
                leaves.len(),
            ));
        }

        // Persisted window leaves against the hashes the ledger committed to
        let committed = guard.as_ref().map(|state| state.leaf_hashes());
        if let Some(committed) = committed {
            for leaf in &leaves {
                if let Some(hash) = committed.get(leaf.index as usize) {
                    if *hash != leaf.content_hash {
                        scan.issues.push(Issue::critical(
                            Some(leaf.index),
                            "leaf.content_hash",
                            hash,
                            leaf.content_hash,
                        ));
                    }
                }
            }
        }

        // Root at the window's end, rebuilt from the prefix plus the persisted window
        if end_index > start_index {
            let mut hashes: Vec<Digest> = match committed.and_then(|c| c.get(..start_index as usize)) {
                Some(prefix) => prefix.to_vec(),
                None => self
                    .storage
                    .leaves_in_range(&ledger_id, 0, start_index)?
                    .iter()
                    .map(|leaf| leaf.content_hash)
                    .collect(),
            };
            hashes.extend(leaves.iter().map(|leaf| leaf.content_hash));
            let recomputed = merkle_root(&hashes);
            scan.recomputed_root = Some(recomputed);

            let location = format!("roots[{}]", end_index);
            match self.storage.root_at(&ledger_id, end_index)? {
                Some(recorded) if recorded == recomputed => {}
                Some(recorded) => scan
                    .issues
                    .push(Issue::critical(None, location, recorded, recomputed)),
                None => scan
                    .issues
                    .push(Issue::critical(None, location, recomputed, "no recorded root")),
            }
        }

        let window: HashMap<u64, Digest> = leaves
            .iter()
            .map(|leaf| (leaf.index, leaf.content_hash))
            .collect();

        for proof in self.storage.proofs_in_range(&ledger_id, start_index, end_index)? {
            if !scan.check_proof_path(&proof, window.get(&proof.leaf_index)) {
                continue;
            }

            match self.storage.root_at(&ledger_id, proof.tree_size)? {
                Some(recorded) if recorded == proof.root_at_generation => {}
                Some(recorded) => scan.issues.push(Issue::critical(
                    Some(proof.leaf_index),
                    format!("proof:{}.root_at_generation", proof.id),
                    recorded,
                    proof.root_at_generation,
                )),
                None => scan.issues.push(Issue::critical(
                    Some(proof.leaf_index),
                    format!("roots[{}]", proof.tree_size),
                    proof.root_at_generation,
                    "no recorded root",
                )),
            }
        }
        drop(guard);

        scan.next_index = (end_index < info.leaf_count).then_some(end_index);
        self.record(scan.finish(), actor_id).await
    }

    /// Run the check named by `scope`
    pub async fn check(
        &self,
        ledger_id: LedgerId,
        scope: CheckScope,
        actor_id: &str,
    ) -> Result<IntegrityCheckResult> {
        match scope {
            CheckScope::Full => self.full_check(ledger_id, actor_id).await,
            CheckScope::Incremental {
                start_index,
                end_index,
            } => {
                if end_index <= start_index {
                    return Err(Error::InvalidInput(format!(
                        "empty window [{}, {})",
                        start_index, end_index
                    )));
                }
                self.incremental_check(ledger_id, start_index, end_index - start_index, actor_id)
                    .await
            }
            CheckScope::RootConsistency => self
                .root_consistency(ledger_id, actor_id)
                .await
                .map(|(_, result)| result),
            CheckScope::DataConsistency => self.check_data_consistency(ledger_id, actor_id).await,
        }
    }

    /// Rebuild the root from persisted leaves and diff it against the header
    pub async fn check_root_consistency(
        &self,
        ledger_id: LedgerId,
        actor_id: &str,
    ) -> Result<RootConsistency> {
        self.root_consistency(ledger_id, actor_id)
            .await
            .map(|(consistency, _)| consistency)
    }

    async fn root_consistency(
        &self,
        ledger_id: LedgerId,
        actor_id: &str,
    ) -> Result<(RootConsistency, IntegrityCheckResult)> {
        let (guard, info) = self.snapshot(ledger_id).await?;
        let mut scan = Scan::new(ledger_id, CheckScope::RootConsistency);

        let leaves = self.storage.all_leaves(&ledger_id)?;
        drop(guard);
        scan.leaves_checked = leaves.len() as u64;

        let hashes: Vec<Digest> = leaves.iter().map(|leaf| leaf.content_hash).collect();
        let recomputed = merkle_root(&hashes);
        scan.stored_root = Some(info.root);
        scan.recomputed_root = Some(recomputed);

        let consistent = recomputed == info.root;
        let detail = if consistent {
            format!("Root {} matches {} persisted leaves", info.root, leaves.len())
        } else {
            scan.issues
                .push(Issue::critical(None, "ledger.root", info.root, recomputed));
            format!(
                "Stored root {} but {} persisted leaves recompute to {}",
                info.root,
                leaves.len(),
                recomputed
            )
        };

        let result = self.record(scan.finish(), actor_id).await?;
        let consistency = RootConsistency {
            consistent,
            score: if consistent { 1.0 } else { 0.0 },
            detail,
            check_id: result.id,
        };
        Ok((consistency, result))
    }

    /// Report duplicate content hashes and leaves no proof was ever issued for
    pub async fn check_data_consistency(
        &self,
        ledger_id: LedgerId,
        actor_id: &str,
    ) -> Result<IntegrityCheckResult> {
        let (guard, _) = self.snapshot(ledger_id).await?;
        let mut scan = Scan::new(ledger_id, CheckScope::DataConsistency);

        let leaves = self.storage.all_leaves(&ledger_id)?;
        let proofs = self.storage.all_proofs(&ledger_id)?;
        drop(guard);

        scan.leaves_checked = leaves.len() as u64;
        scan.proofs_checked = proofs.len() as u64;

        let mut first_seen: HashMap<Digest, u64> = HashMap::new();
        for leaf in &leaves {
            if let Some(first) = first_seen.get(&leaf.content_hash) {
                scan.issues.push(Issue::warning(
                    Some(leaf.index),
                    "leaf.content_hash",
                    "unique content hash",
                    format!("duplicate of leaf {}", first),
                ));
            } else {
                first_seen.insert(leaf.content_hash, leaf.index);
            }
        }

        let proven: HashSet<u64> = proofs.iter().map(|proof| proof.leaf_index).collect();
        for leaf in leaves.iter().filter(|leaf| !proven.contains(&leaf.index)) {
            scan.issues.push(Issue::warning(
                Some(leaf.index),
                "leaf.proofs",
                "at least one proof",
                "orphaned",
            ));
        }

        self.record(scan.finish(), actor_id).await
    }

    /// Most recent results of a ledger, newest first
    pub fn list_results(&self, ledger_id: LedgerId, limit: usize) -> Result<Vec<IntegrityCheckResult>> {
        let mut results = self.storage.integrity_results(&ledger_id)?;
        results.reverse();
        results.truncate(limit);
        Ok(results)
    }

    /// Persist, count, audit and escalate a finished check
    async fn record(&self, result: IntegrityCheckResult, actor_id: &str) -> Result<IntegrityCheckResult> {
        self.storage.put_integrity_result(&result)?;

        let failed = result.status == CheckStatus::Failure;
        self.metrics.record_integrity_check(failed);

        let severity = match result.status {
            CheckStatus::Success => AuditSeverity::Info,
            CheckStatus::Warning => AuditSeverity::Warning,
            CheckStatus::Failure => AuditSeverity::Critical,
        };

        let mut record = AuditRecord::new(
            OperationType::IntegrityCheck,
            EntityType::IntegrityCheck,
            result.id,
            actor_id,
        )
        .after(result.status.as_str())
        .severity(severity)
        .detail("ledger_id", result.ledger_id)
        .detail("scope", result.scope.as_str())
        .detail("issues", result.issues.len())
        .detail("leaves_checked", result.leaves_checked)
        .detail("proofs_checked", result.proofs_checked);

        if let Some(issue) = result.critical_issues().next() {
            record = record
                .detail("first_location", &issue.location)
                .detail("expected", &issue.expected)
                .detail("actual", &issue.actual);
            if let Some(leaf_index) = issue.leaf_index {
                record = record.detail("leaf_index", leaf_index);
            }
        }

        self.audit.log(record).await?;

        if failed {
            tracing::error!(
                ledger_id = %result.ledger_id,
                check_id = %result.id,
                scope = result.scope.as_str(),
                issues = result.issues.len(),
                "Integrity check failed"
            );
        } else {
            tracing::debug!(
                ledger_id = %result.ledger_id,
                scope = result.scope.as_str(),
                status = result.status.as_str(),
                "Integrity check completed"
            );
        }

        Ok(result)
    }

    /// One incremental page per ledger, advancing `cursors`
    pub async fn scan_once(&self, cursors: &mut HashMap<LedgerId, u64>) -> Result<usize> {
        let mut checked = 0;

        for info in self.ledger.list_ledgers()? {
            let cursor = cursors.get(&info.id).copied().unwrap_or(0);
            match self
                .incremental_check(info.id, cursor, self.config.page_size, SCANNER_ACTOR)
                .await
            {
                Ok(result) => {
                    cursors.insert(info.id, result.next_index.unwrap_or(0));
                    checked += 1;
                }
                Err(Error::IndexOutOfRange { .. }) => {
                    cursors.insert(info.id, 0);
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(ledger_id = %info.id, "Scan deferred: {}", e);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(checked)
    }

    /// Run [`scan_once`](Self::scan_once) every `scan_interval_secs` until `shutdown` flips
    pub fn spawn_scanner(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(self.config.scan_interval_secs));
            let mut cursors = HashMap::new();

            tracing::info!(
                interval_secs = self.config.scan_interval_secs,
                page_size = self.config.page_size,
                "Integrity scanner started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.scan_once(&mut cursors).await {
                            tracing::error!("Integrity scan aborted: {}", e);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            tracing::info!("Integrity scanner stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash_bytes;
    use crate::types::{ProofStep, Side};
    use crate::Config;
    use tempfile::TempDir;

    struct Fixture {
        checker: Arc<IntegrityChecker>,
        ledger: Arc<LedgerCore>,
        storage: Arc<Storage>,
        audit: Arc<AuditTrail>,
        _temp: TempDir,
    }

    async fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp.path().to_path_buf();
        config.integrity.page_size = 2;

        let storage = Arc::new(Storage::open(&config).unwrap());
        let metrics = Metrics::new().unwrap();
        let audit = Arc::new(AuditTrail::open(storage.clone(), &config.audit, metrics.clone()).unwrap());
        let ledger = Arc::new(
            LedgerCore::open(storage.clone(), audit.clone(), config.ledger.clone(), metrics.clone())
                .await
                .unwrap(),
        );
        let checker = Arc::new(IntegrityChecker::new(
            ledger.clone(),
            storage.clone(),
            audit.clone(),
            config.integrity.clone(),
            metrics,
        ));

        Fixture {
            checker,
            ledger,
            storage,
            audit,
            _temp: temp,
        }
    }

    async fn ledger_with(f: &Fixture, labels: &[&str]) -> LedgerId {
        let info = f.ledger.create_ledger("devices", "alice").await.unwrap();
        for label in labels {
            f.ledger
                .append_leaf(info.id, &hash_bytes(label.as_bytes()).to_hex(), label, "alice")
                .await
                .unwrap();
        }
        info.id
    }

    #[tokio::test]
    async fn test_untouched_ledger_passes() {
        let f = fixture().await;
        let ledger_id = ledger_with(&f, &["a", "b", "c"]).await;
        for index in 0..3 {
            f.ledger.generate_proof(ledger_id, index, "alice").await.unwrap();
        }
        // Proofs pinned to an older root stay valid
        f.ledger
            .append_leaf(ledger_id, &hash_bytes(b"d").to_hex(), "d", "alice")
            .await
            .unwrap();

        let result = f.checker.full_check(ledger_id, "auditor").await.unwrap();
        assert_eq!(result.status, CheckStatus::Success);
        assert!(result.issues.is_empty());
        assert_eq!(result.leaves_checked, 4);
        assert_eq!(result.proofs_checked, 3);
        assert_eq!(result.stored_root, result.recomputed_root);
    }

    #[tokio::test]
    async fn test_empty_ledger_warns() {
        let f = fixture().await;
        let ledger_id = ledger_with(&f, &[]).await;

        let result = f.checker.full_check(ledger_id, "auditor").await.unwrap();
        assert_eq!(result.status, CheckStatus::Warning);
        assert!(result.issues.is_empty());
    }

    #[tokio::test]
    async fn test_corrupted_proof_fails_at_its_leaf() {
        let f = fixture().await;
        let ledger_id = ledger_with(&f, &["a", "b", "c", "d"]).await;
        f.ledger.generate_proof(ledger_id, 0, "alice").await.unwrap();
        let mut proof = f.ledger.generate_proof(ledger_id, 2, "alice").await.unwrap();

        proof.path[0] = ProofStep {
            hash: hash_bytes(b"forged"),
            side: Side::Right,
        };
        f.storage.put_proof(&proof).unwrap();

        let result = f.checker.full_check(ledger_id, "auditor").await.unwrap();
        assert_eq!(result.status, CheckStatus::Failure);
        let critical: Vec<_> = result.critical_issues().collect();
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].leaf_index, Some(2));

        let (_, head_hash) = f.audit.head().await.unwrap();
        let head = f.storage.audit_head().unwrap().unwrap();
        assert_eq!(head.entry_hash, head_hash);
        assert_eq!(head.severity, AuditSeverity::Critical);
        assert_eq!(head.details.get("leaf_index").map(String::as_str), Some("2"));
    }

    #[tokio::test]
    async fn test_forged_header_root_fails() {
        let f = fixture().await;
        let ledger_id = ledger_with(&f, &["a", "b"]).await;

        let mut forged = f.storage.get_ledger(&ledger_id).unwrap().unwrap();
        forged.root = hash_bytes(b"not the root");
        f.storage.create_ledger(&forged).unwrap();

        let full = f.checker.full_check(ledger_id, "auditor").await.unwrap();
        assert_eq!(full.status, CheckStatus::Failure);
        assert_eq!(full.issues[0].location, "ledger.root");

        let consistency = f.checker.check_root_consistency(ledger_id, "auditor").await.unwrap();
        assert!(!consistency.consistent);
        assert_eq!(consistency.score, 0.0);
    }

    #[tokio::test]
    async fn test_incremental_cursor() {
        let f = fixture().await;
        let ledger_id = ledger_with(&f, &["a", "b", "c", "d", "e"]).await;
        f.ledger.generate_proof(ledger_id, 3, "alice").await.unwrap();

        let first = f.checker.incremental_check(ledger_id, 0, 2, "auditor").await.unwrap();
        assert_eq!(first.next_index, Some(2));
        assert_eq!(first.leaves_checked, 2);

        let second = f.checker.incremental_check(ledger_id, 2, 2, "auditor").await.unwrap();
        assert_eq!(second.next_index, Some(4));
        assert_eq!(second.proofs_checked, 1);
        assert_eq!(second.status, CheckStatus::Success);

        let last = f.checker.incremental_check(ledger_id, 4, 2, "auditor").await.unwrap();
        assert_eq!(last.next_index, None);
        assert_eq!(
            last.scope,
            CheckScope::Incremental {
                start_index: 4,
                end_index: 5
            }
        );

        assert!(matches!(
            f.checker.incremental_check(ledger_id, 9, 2, "auditor").await,
            Err(Error::IndexOutOfRange { .. })
        ));
    }

    #[tokio::test]
    async fn test_incremental_catches_rewritten_leaf() {
        let f = fixture().await;
        let ledger_id = ledger_with(&f, &["a", "b", "c", "d", "e"]).await;
        // Only proof sits outside the window
        f.ledger.generate_proof(ledger_id, 4, "alice").await.unwrap();

        let header = f.storage.get_ledger(&ledger_id).unwrap().unwrap();
        let mut leaf = f.storage.get_leaf(&ledger_id, 2).unwrap().unwrap();
        leaf.content_hash = hash_bytes(b"rewritten");
        f.storage.append_leaf_atomic(&leaf, &header).unwrap();

        let window = f.checker.incremental_check(ledger_id, 2, 2, "auditor").await.unwrap();
        assert_eq!(window.proofs_checked, 0);
        assert_eq!(window.status, CheckStatus::Failure);
        let locations: Vec<_> = window.critical_issues().map(|i| i.location.as_str()).collect();
        assert_eq!(locations, vec!["leaf.content_hash", "roots[4]"]);
        assert_eq!(window.issues[0].leaf_index, Some(2));

        // Windows before the rewrite stay clean
        let earlier = f.checker.incremental_check(ledger_id, 0, 2, "auditor").await.unwrap();
        assert_eq!(earlier.status, CheckStatus::Success);
    }

    #[tokio::test]
    async fn test_data_consistency_findings() {
        let f = fixture().await;
        let ledger_id = ledger_with(&f, &["a", "b", "a"]).await;
        f.ledger.generate_proof(ledger_id, 0, "alice").await.unwrap();

        let result = f.checker.check_data_consistency(ledger_id, "auditor").await.unwrap();
        assert_eq!(result.status, CheckStatus::Warning);

        let duplicates: Vec<_> = result
            .issues
            .iter()
            .filter(|issue| issue.location == "leaf.content_hash")
            .collect();
        assert_eq!(duplicates.len(), 1);
        assert_eq!(duplicates[0].leaf_index, Some(2));

        let orphans: Vec<_> = result
            .issues
            .iter()
            .filter(|issue| issue.location == "leaf.proofs")
            .filter_map(|issue| issue.leaf_index)
            .collect();
        assert_eq!(orphans, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_results_are_persisted() {
        let f = fixture().await;
        let ledger_id = ledger_with(&f, &["a"]).await;

        let first = f.checker.full_check(ledger_id, "auditor").await.unwrap();
        let consistency = f.checker.check_root_consistency(ledger_id, "auditor").await.unwrap();
        assert!(consistency.consistent);
        assert_eq!(consistency.score, 1.0);

        let results = f.checker.list_results(ledger_id, 10).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, consistency.check_id);
        assert_eq!(results[1].id, first.id);
        assert_eq!(f.checker.list_results(ledger_id, 1).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_scan_once_wraps_cursor() {
        let f = fixture().await;
        let ledger_id = ledger_with(&f, &["a", "b", "c"]).await;
        let mut cursors = HashMap::new();

        assert_eq!(f.checker.scan_once(&mut cursors).await.unwrap(), 1);
        assert_eq!(cursors[&ledger_id], 2);

        f.checker.scan_once(&mut cursors).await.unwrap();
        assert_eq!(cursors[&ledger_id], 0);
    }

    #[tokio::test]
    async fn test_scanner_stops_on_shutdown() {
        let f = fixture().await;
        ledger_with(&f, &["a"]).await;
        let (tx, rx) = watch::channel(false);

        let handle = f.checker.clone().spawn_scanner(rx);
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
