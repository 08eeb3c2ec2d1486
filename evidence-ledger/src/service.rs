//! Evidence ledger service
//!
//! [`EvidenceLedger`] wires storage, the audit trail, the ledger core,
//! sealing and integrity checking into one handle and exposes the
//! operations collaborators call.

use crate::{
    audit::{AuditEntry, AuditFilter, AuditRecord, AuditTrail, ChainVerification, EntryVerification},
    config::Config,
    crypto::{KeyPair, KeyRing, PublicKey, SealSigner},
    integrity::{CheckScope, IntegrityCheckResult, IntegrityChecker, RootConsistency},
    ledger::LedgerCore,
    metrics::Metrics,
    sealing::{Seal, SealVerification, SealingService, Snapshot},
    storage::Storage,
    types::{AppendReceipt, Digest, LedgerId, LedgerInfo, Leaf, Proof},
    Error, Result,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Tamper-evident ledger service
pub struct EvidenceLedger {
    config: Config,
    storage: Arc<Storage>,
    audit: Arc<AuditTrail>,
    ledger: Arc<LedgerCore>,
    sealing: Arc<SealingService>,
    integrity: Arc<IntegrityChecker>,
    metrics: Metrics,
}

impl EvidenceLedger {
    /// Open the service with keys from `config.sealing`
    ///
    /// Loads the signing key named by `signing_key_file` and registers every
    /// entry of `verifier_keys`, so seals signed before a rotation still verify.
    pub async fn open(config: Config) -> Result<Self> {
        let mut keys = KeyRing::new();
        for (key_id, public_key) in &config.sealing.verifier_keys {
            keys.add_verifier(PublicKey::from_hex(key_id.clone(), public_key)?);
            tracing::info!(key_id = %key_id, "Verifier key registered");
        }

        match &config.sealing.signing_key_file {
            Some(path) => {
                let signer = KeyPair::from_seed_file(config.sealing.key_id.clone(), path)?;
                tracing::info!(key_id = %config.sealing.key_id, "Signing key loaded");
                keys.install_signer(signer);
            }
            None => {
                tracing::warn!("No signing key configured, seal creation disabled");
            }
        }

        Self::open_with_keys(config, keys).await
    }

    /// Open the service with an injected key ring
    pub async fn open_with_keys(config: Config, keys: KeyRing) -> Result<Self> {
        config.validate()?;

        let metrics = Metrics::new()
            .map_err(|e| Error::Config(format!("Failed to register metrics: {}", e)))?;
        let storage = Arc::new(Storage::open(&config)?);
        let audit = Arc::new(AuditTrail::open(
            storage.clone(),
            &config.audit,
            metrics.clone(),
        )?);
        let ledger = Arc::new(
            LedgerCore::open(
                storage.clone(),
                audit.clone(),
                config.ledger.clone(),
                metrics.clone(),
            )
            .await?,
        );
        let sealing = Arc::new(SealingService::new(
            ledger.clone(),
            storage.clone(),
            audit.clone(),
            keys,
            config.sealing.clone(),
            metrics.clone(),
        ));
        let integrity = Arc::new(IntegrityChecker::new(
            ledger.clone(),
            storage.clone(),
            audit.clone(),
            config.integrity.clone(),
            metrics.clone(),
        ));

        tracing::info!(
            service = %config.service_name,
            data_dir = %config.data_dir.display(),
            "Evidence ledger opened"
        );

        Ok(Self {
            config,
            storage,
            audit,
            ledger,
            sealing,
            integrity,
            metrics,
        })
    }

    // Ledger core

    /// Create an empty ledger
    pub async fn create_ledger(&self, name: &str, actor_id: &str) -> Result<LedgerInfo> {
        self.ledger.create_ledger(name, actor_id).await
    }

    /// Append a content commitment; seals automatically when configured
    pub async fn append_leaf(
        &self,
        ledger_id: LedgerId,
        content_hash: &str,
        content_ref: &str,
        actor_id: &str,
    ) -> Result<AppendReceipt> {
        let receipt = self
            .ledger
            .append_leaf(ledger_id, content_hash, content_ref, actor_id)
            .await?;

        // The append stands even when the automatic seal does not
        if let Err(e) = self.sealing.maybe_seal(ledger_id, actor_id).await {
            tracing::warn!(ledger_id = %ledger_id, "Automatic seal failed: {}", e);
        }

        Ok(receipt)
    }

    /// Current root
    pub async fn get_root(&self, ledger_id: LedgerId) -> Result<Digest> {
        self.ledger.get_root(ledger_id).await
    }

    /// Current header
    pub async fn ledger_info(&self, ledger_id: LedgerId) -> Result<LedgerInfo> {
        self.ledger.ledger_info(ledger_id).await
    }

    /// All ledgers
    pub fn list_ledgers(&self) -> Result<Vec<LedgerInfo>> {
        self.ledger.list_ledgers()
    }

    /// Leaf by ordinal
    pub async fn get_leaf(&self, ledger_id: LedgerId, index: u64) -> Result<Leaf> {
        self.ledger.get_leaf(ledger_id, index).await
    }

    /// Root recorded at `leaf_count` leaves
    pub async fn root_at(&self, ledger_id: LedgerId, leaf_count: u64) -> Result<Digest> {
        self.ledger.root_at(ledger_id, leaf_count).await
    }

    /// Membership proof pinned to the current root
    pub async fn generate_proof(
        &self,
        ledger_id: LedgerId,
        leaf_index: u64,
        actor_id: &str,
    ) -> Result<Proof> {
        self.ledger.generate_proof(ledger_id, leaf_index, actor_id).await
    }

    /// Stored proof by ID
    pub fn get_proof(&self, proof_id: Uuid) -> Result<Proof> {
        self.ledger.get_proof(proof_id)
    }

    /// Check a proof against its pinned root
    pub fn verify_proof(leaf_hash: &Digest, proof: &Proof) -> bool {
        LedgerCore::verify_proof(leaf_hash, proof)
    }

    // Sealing

    /// Seal the ledger's current state
    pub async fn create_seal(&self, ledger_id: LedgerId, reason: &str, sealed_by: &str) -> Result<Seal> {
        self.sealing.create_seal(ledger_id, reason, sealed_by).await
    }

    /// Verify a seal as of now
    pub async fn verify_seal(&self, seal_id: Uuid, actor_id: &str) -> Result<SealVerification> {
        self.sealing.verify_seal(seal_id, actor_id).await
    }

    /// Verify a seal as of `at`
    pub async fn verify_seal_at(
        &self,
        seal_id: Uuid,
        at: DateTime<Utc>,
        actor_id: &str,
    ) -> Result<SealVerification> {
        self.sealing.verify_seal_at(seal_id, at, actor_id).await
    }

    /// Revoke a seal (idempotent)
    pub async fn revoke_seal(&self, seal_id: Uuid, reason: &str, actor_id: &str) -> Result<Seal> {
        self.sealing.revoke_seal(seal_id, reason, actor_id).await
    }

    /// Seal by ID
    pub fn get_seal(&self, seal_id: Uuid) -> Result<Seal> {
        self.sealing.get_seal(seal_id)
    }

    /// Seals of a ledger
    pub fn list_seals(&self, ledger_id: LedgerId) -> Result<Vec<Seal>> {
        self.sealing.list_seals(ledger_id)
    }

    /// Leaf set captured by a seal
    pub fn get_snapshot(&self, seal_id: Uuid) -> Result<Snapshot> {
        self.sealing.get_snapshot(seal_id)
    }

    /// Rotate the signing key
    pub fn install_signer<S: SealSigner + 'static>(&self, signer: S) {
        self.sealing.install_signer(signer)
    }

    // Integrity

    /// Run the check named by `scope`
    pub async fn check_integrity(
        &self,
        ledger_id: LedgerId,
        scope: CheckScope,
        actor_id: &str,
    ) -> Result<IntegrityCheckResult> {
        self.integrity.check(ledger_id, scope, actor_id).await
    }

    /// Full check
    pub async fn full_check(&self, ledger_id: LedgerId, actor_id: &str) -> Result<IntegrityCheckResult> {
        self.integrity.full_check(ledger_id, actor_id).await
    }

    /// Incremental check over one page
    pub async fn incremental_check(
        &self,
        ledger_id: LedgerId,
        start_index: u64,
        page_size: u64,
        actor_id: &str,
    ) -> Result<IntegrityCheckResult> {
        self.integrity
            .incremental_check(ledger_id, start_index, page_size, actor_id)
            .await
    }

    /// Stored root against persisted leaves
    pub async fn check_root_consistency(
        &self,
        ledger_id: LedgerId,
        actor_id: &str,
    ) -> Result<RootConsistency> {
        self.integrity.check_root_consistency(ledger_id, actor_id).await
    }

    /// Duplicate and orphaned leaves
    pub async fn check_data_consistency(
        &self,
        ledger_id: LedgerId,
        actor_id: &str,
    ) -> Result<IntegrityCheckResult> {
        self.integrity.check_data_consistency(ledger_id, actor_id).await
    }

    /// Recent check results, newest first
    pub fn list_check_results(&self, ledger_id: LedgerId, limit: usize) -> Result<Vec<IntegrityCheckResult>> {
        self.integrity.list_results(ledger_id, limit)
    }

    /// Start the background scanner if enabled
    pub fn spawn_scanner(&self, shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        if !self.config.integrity.background_scan {
            return None;
        }
        Some(self.integrity.clone().spawn_scanner(shutdown))
    }

    // Audit trail

    /// Record an operation performed outside the ledger
    pub async fn log_operation(&self, record: AuditRecord) -> Result<AuditEntry> {
        self.audit.log(record).await
    }

    /// Audit entry by ID
    pub fn get_audit_entry(&self, entry_id: Uuid) -> Result<AuditEntry> {
        self.audit.get_entry(entry_id)
    }

    /// Verify one audit entry and everything before it
    pub async fn verify_entry_integrity(
        &self,
        entry_id: Uuid,
        actor_id: &str,
    ) -> Result<EntryVerification> {
        self.audit.verify_entry_integrity(entry_id, actor_id).await
    }

    /// Verify the whole audit chain
    pub async fn verify_audit_chain(&self, actor_id: &str) -> Result<ChainVerification> {
        self.audit.verify_chain(actor_id).await
    }

    /// Filtered audit entries
    pub async fn query_trail(
        &self,
        filter: &AuditFilter,
        limit: usize,
        actor_id: &str,
    ) -> Result<Vec<AuditEntry>> {
        self.audit.query(filter, limit, actor_id).await
    }

    /// Move entries past retention to the archive
    pub async fn archive_audit(&self, actor_id: &str) -> Result<usize> {
        self.audit.archive(Utc::now(), actor_id).await
    }

    // Accessors

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Prometheus metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Underlying store
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Stop the audit writer
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Evidence ledger shutting down");
        self.audit.shutdown().await
    }
}
