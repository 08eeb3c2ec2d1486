//! Sealing service
//!
//! A seal is a signed, time-scoped snapshot of a ledger's root and leaf
//! count. It lets an external verifier check a point-in-time state
//! without trusting the live ledger.
//!
//! # Signing
//!
//! ```text
//! canonical        = "ledger_id:<id>|leaf_count:<n>|root:<hex>|timestamp:<rfc3339>"
//! ledger_state_hash = SHA-256(canonical)
//! signature         = sign(ledger_state_hash)
//! ```
//!
//! Signing keys come from an injected [`KeyRing`]. No key means no seal:
//! creation fails closed with [`Error::SigningUnavailable`].
//!
//! # Lifecycle
//!
//! `Active -> Revoked` is the only stored transition. `Expired` is derived
//! from `valid_until` at read time.

use crate::{
    audit::{AuditRecord, AuditSeverity, AuditTrail, EntityType, OperationType},
    config::SealingConfig,
    crypto::{hash_bytes, KeyRing, SealSigner},
    ledger::{LedgerCore, LedgerState},
    merkle::merkle_root,
    metrics::Metrics,
    storage::Storage,
    types::{Digest, LedgerId, Signature},
    Error, Result,
};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Reason recorded on seals taken by [`SealingService::maybe_seal`]
const AUTO_SEAL_REASON: &str = "automatic";

/// Stored seal status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SealStatus {
    /// Valid within its window
    Active,
    /// Explicitly revoked
    Revoked,
    /// Past `valid_until` (derived, never stored)
    Expired,
}

impl SealStatus {
    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            SealStatus::Active => "active",
            SealStatus::Revoked => "revoked",
            SealStatus::Expired => "expired",
        }
    }
}

/// Signed point-in-time state of a ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seal {
    /// Seal ID (UUIDv7)
    pub id: Uuid,

    /// Sealed ledger
    pub ledger_id: LedgerId,

    /// Leaf count at seal time
    pub leaf_count_at_seal: u64,

    /// Root at seal time
    pub root_at_seal: Digest,

    /// SHA-256 of the canonical state string
    pub ledger_state_hash: Digest,

    /// Signature over `ledger_state_hash`
    pub signature: Signature,

    /// Key that produced the signature
    pub signer_key_id: String,

    /// Hex public key of the signer at seal time
    pub public_key: String,

    /// Why the seal was taken
    pub reason: String,

    /// Who requested it
    pub sealed_by: String,

    /// Creation time (the canonical timestamp)
    pub created_at: DateTime<Utc>,

    /// Start of the validity window
    pub valid_from: DateTime<Utc>,

    /// End of the validity window
    pub valid_until: DateTime<Utc>,

    /// Stored status (`Active` or `Revoked`)
    pub status: SealStatus,

    /// When it was revoked
    pub revoked_at: Option<DateTime<Utc>>,

    /// Why it was revoked
    pub revocation_reason: Option<String>,
}

impl Seal {
    /// Canonical state string the signature commits to
    pub fn canonical(&self) -> String {
        canonical_state(
            &self.ledger_id,
            self.leaf_count_at_seal,
            &self.root_at_seal,
            &self.created_at,
        )
    }

    /// Status as of `now`
    pub fn effective_status(&self, now: DateTime<Utc>) -> SealStatus {
        match self.status {
            SealStatus::Revoked => SealStatus::Revoked,
            _ if now > self.valid_until => SealStatus::Expired,
            _ => SealStatus::Active,
        }
    }
}

/// Canonical `key:value|...` form of a ledger state
pub fn canonical_state(
    ledger_id: &LedgerId,
    leaf_count: u64,
    root: &Digest,
    timestamp: &DateTime<Utc>,
) -> String {
    format!(
        "ledger_id:{}|leaf_count:{}|root:{}|timestamp:{}",
        ledger_id,
        leaf_count,
        root,
        timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
    )
}

/// One leaf as captured by a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct SnapshotLeaf {
    pub index: u64,
    pub content_hash: Digest,
    pub content_ref: String,
}

/// Leaf set of a ledger at seal time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Owning seal
    pub seal_id: Uuid,
    /// Sealed ledger
    pub ledger_id: LedgerId,
    /// Leaf count at seal time
    pub leaf_count: u64,
    /// Leaves in ordinal order
    pub leaves: Vec<SnapshotLeaf>,
}

impl Snapshot {
    /// Root recomputed from the captured leaves
    pub fn root(&self) -> Digest {
        let hashes: Vec<Digest> = self.leaves.iter().map(|l| l.content_hash).collect();
        merkle_root(&hashes)
    }
}

/// Outcome of a seal verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealVerification {
    /// Every check passed
    pub valid: bool,
    /// Why it passed or the first check that failed
    pub reason: String,
}

impl SealVerification {
    fn reject(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: reason.into(),
        }
    }
}

/// Creates, verifies and revokes seals
pub struct SealingService {
    ledger: Arc<LedgerCore>,
    storage: Arc<Storage>,
    audit: Arc<AuditTrail>,
    keys: RwLock<KeyRing>,
    /// Serializes status transitions
    revocations: Mutex<()>,
    config: SealingConfig,
    metrics: Metrics,
}

impl SealingService {
    /// Create service
    pub fn new(
        ledger: Arc<LedgerCore>,
        storage: Arc<Storage>,
        audit: Arc<AuditTrail>,
        keys: KeyRing,
        config: SealingConfig,
        metrics: Metrics,
    ) -> Self {
        Self {
            ledger,
            storage,
            audit,
            keys: RwLock::new(keys),
            revocations: Mutex::new(()),
            config,
            metrics,
        }
    }

    /// Make `signer` the active key; earlier keys keep verifying
    pub fn install_signer<S: SealSigner + 'static>(&self, signer: S) {
        tracing::info!(key_id = signer.key_id(), "Signing key installed");
        self.keys.write().install_signer(signer);
    }

    /// Seal the ledger's current state
    pub async fn create_seal(
        &self,
        ledger_id: LedgerId,
        reason: &str,
        sealed_by: &str,
    ) -> Result<Seal> {
        let result = self
            .ledger
            .with_retry(move || self.try_create_seal(ledger_id, reason, sealed_by))
            .await;

        if let Err(e) = &result {
            self.audit_failed_seal(ledger_id, reason, sealed_by, e).await;
        }
        result
    }

    async fn audit_failed_seal(
        &self,
        ledger_id: LedgerId,
        reason: &str,
        sealed_by: &str,
        error: &Error,
    ) {
        tracing::warn!(ledger_id = %ledger_id, "Seal not created: {}", error);
        if let Err(audit_err) = self
            .audit
            .log(
                AuditRecord::new(OperationType::CreateSeal, EntityType::Ledger, ledger_id, sealed_by)
                    .detail("reason", reason)
                    .failed(error),
            )
            .await
        {
            tracing::error!("Failed to audit failed seal: {}", audit_err);
        }
    }

    fn active_signer(&self) -> Result<Arc<dyn SealSigner>> {
        self.keys
            .read()
            .active_signer()
            .cloned()
            .ok_or_else(|| Error::SigningUnavailable("no active signing key".to_string()))
    }

    async fn try_create_seal(
        &self,
        ledger_id: LedgerId,
        reason: &str,
        sealed_by: &str,
    ) -> Result<Seal> {
        let signer = self.active_signer()?;

        // Same exclusivity as append: {leaf_count, root} cannot move underneath us
        let state = self.ledger.exclusive(ledger_id).await?;
        self.seal_locked(&state, signer.as_ref(), reason, sealed_by).await
    }

    /// Seal only if still due once the exclusive section is held
    async fn try_auto_seal(&self, ledger_id: LedgerId, actor_id: &str) -> Result<Option<Seal>> {
        let signer = self.active_signer()?;
        let state = self.ledger.exclusive(ledger_id).await?;

        // Concurrent appends crossing the same threshold serialize here
        let last_sealed = self.last_sealed(ledger_id)?;
        if !self.should_seal(state.info().leaf_count, last_sealed) {
            return Ok(None);
        }

        self.seal_locked(&state, signer.as_ref(), AUTO_SEAL_REASON, actor_id)
            .await
            .map(Some)
    }

    /// Sign and persist the state held by `state`; caller holds the exclusive section
    async fn seal_locked(
        &self,
        state: &LedgerState,
        signer: &dyn SealSigner,
        reason: &str,
        sealed_by: &str,
    ) -> Result<Seal> {
        let info = state.info().clone();
        let ledger_id = info.id;

        if info.is_empty() {
            return Err(Error::LedgerEmpty(ledger_id));
        }

        let leaves = self.storage.leaves_in_range(&ledger_id, 0, info.leaf_count)?;
        if leaves.len() as u64 != info.leaf_count {
            return Err(Error::IntegrityViolation(format!(
                "ledger {}: header records {} leaves, {} readable",
                ledger_id,
                info.leaf_count,
                leaves.len()
            )));
        }

        let created_at = Utc::now();
        let ledger_state_hash =
            hash_bytes(canonical_state(&ledger_id, info.leaf_count, &info.root, &created_at).as_bytes());
        let signature = signer.sign(&ledger_state_hash)?;

        let seal = Seal {
            id: Uuid::now_v7(),
            ledger_id,
            leaf_count_at_seal: info.leaf_count,
            root_at_seal: info.root,
            ledger_state_hash,
            signature,
            signer_key_id: signer.key_id().to_string(),
            public_key: hex::encode(signer.public_key()),
            reason: reason.to_string(),
            sealed_by: sealed_by.to_string(),
            created_at,
            valid_from: created_at,
            valid_until: created_at + Duration::days(self.config.validity_days),
            status: SealStatus::Active,
            revoked_at: None,
            revocation_reason: None,
        };

        let snapshot = Snapshot {
            seal_id: seal.id,
            ledger_id,
            leaf_count: info.leaf_count,
            leaves: leaves
                .into_iter()
                .map(|leaf| SnapshotLeaf {
                    index: leaf.index,
                    content_hash: leaf.content_hash,
                    content_ref: leaf.content_ref,
                })
                .collect(),
        };

        self.storage.put_seal_with_snapshot(&seal, &snapshot)?;

        self.audit
            .log(
                AuditRecord::new(OperationType::CreateSeal, EntityType::Seal, seal.id, sealed_by)
                    .after(SealStatus::Active.as_str())
                    .detail("ledger_id", ledger_id)
                    .detail("leaf_count", seal.leaf_count_at_seal)
                    .detail("root", seal.root_at_seal)
                    .detail("signer_key_id", &seal.signer_key_id)
                    .detail("reason", reason),
            )
            .await?;

        self.metrics.record_seal();

        tracing::info!(
            seal_id = %seal.id,
            ledger_id = %ledger_id,
            leaf_count = seal.leaf_count_at_seal,
            root = %seal.root_at_seal,
            "Seal created"
        );

        Ok(seal)
    }

    /// Verify a seal as of now
    pub async fn verify_seal(&self, seal_id: Uuid, actor_id: &str) -> Result<SealVerification> {
        self.verify_seal_at(seal_id, Utc::now(), actor_id).await
    }

    /// Verify a seal as of `now`
    ///
    /// Returns `valid = false` with a specific reason for every mismatch;
    /// only a missing seal is an error.
    pub async fn verify_seal_at(
        &self,
        seal_id: Uuid,
        now: DateTime<Utc>,
        actor_id: &str,
    ) -> Result<SealVerification> {
        let seal = self.get_seal(seal_id)?;
        let verification = self.check_seal(&seal, now)?;

        let severity = if verification.valid {
            AuditSeverity::Debug
        } else {
            AuditSeverity::Warning
        };
        self.audit
            .log(
                AuditRecord::new(OperationType::VerifySeal, EntityType::Seal, seal_id, actor_id)
                    .before(seal.effective_status(now).as_str())
                    .after(if verification.valid { "valid" } else { "invalid" })
                    .severity(severity)
                    .detail("reason", &verification.reason),
            )
            .await?;

        if !verification.valid {
            tracing::warn!(seal_id = %seal_id, reason = %verification.reason, "Seal rejected");
        }

        Ok(verification)
    }

    fn check_seal(&self, seal: &Seal, now: DateTime<Utc>) -> Result<SealVerification> {
        if seal.status == SealStatus::Revoked {
            let at = seal
                .revoked_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "unknown time".to_string());
            return Ok(SealVerification::reject(format!(
                "Seal revoked at {}: {}",
                at,
                seal.revocation_reason.as_deref().unwrap_or("no reason given")
            )));
        }

        if now < seal.valid_from {
            return Ok(SealVerification::reject(format!(
                "Seal not valid before {}",
                seal.valid_from.to_rfc3339()
            )));
        }

        if now > seal.valid_until {
            return Ok(SealVerification::reject(format!(
                "Seal expired at {}",
                seal.valid_until.to_rfc3339()
            )));
        }

        let recomputed = hash_bytes(seal.canonical().as_bytes());
        if recomputed != seal.ledger_state_hash {
            return Ok(SealVerification::reject(format!(
                "Ledger state hash mismatch: expected {}, stored {}",
                recomputed, seal.ledger_state_hash
            )));
        }

        let signature_ok = match self.keys.read().verifier(&seal.signer_key_id) {
            Some(verifier) => verifier.verify(&seal.ledger_state_hash, &seal.signature),
            None => {
                return Ok(SealVerification::reject(format!(
                    "Unknown signing key: {}",
                    seal.signer_key_id
                )))
            }
        };
        if !signature_ok {
            return Ok(SealVerification::reject(format!(
                "Signature does not verify under key {}",
                seal.signer_key_id
            )));
        }

        let snapshot = match self.storage.get_snapshot(seal.id)? {
            Some(snapshot) => snapshot,
            None => return Ok(SealVerification::reject("Snapshot missing")),
        };

        if snapshot.leaf_count != seal.leaf_count_at_seal
            || snapshot.leaves.len() as u64 != seal.leaf_count_at_seal
        {
            return Ok(SealVerification::reject(format!(
                "Snapshot holds {} leaves, seal records {}",
                snapshot.leaves.len(),
                seal.leaf_count_at_seal
            )));
        }

        if let Some((position, leaf)) = snapshot
            .leaves
            .iter()
            .enumerate()
            .find(|(position, leaf)| leaf.index != *position as u64)
        {
            return Ok(SealVerification::reject(format!(
                "Snapshot leaf at position {} has index {}",
                position, leaf.index
            )));
        }

        let snapshot_root = snapshot.root();
        if snapshot_root != seal.root_at_seal {
            return Ok(SealVerification::reject(format!(
                "Snapshot root mismatch: expected {}, recomputed {}",
                seal.root_at_seal, snapshot_root
            )));
        }

        Ok(SealVerification {
            valid: true,
            reason: format!(
                "Seal valid: {} leaves, root {}, signed by {}",
                seal.leaf_count_at_seal, seal.root_at_seal, seal.signer_key_id
            ),
        })
    }

    /// Revoke a seal; revoking a revoked seal is a no-op
    pub async fn revoke_seal(&self, seal_id: Uuid, reason: &str, actor_id: &str) -> Result<Seal> {
        let _transition = self.revocations.lock().await;
        let mut seal = self.get_seal(seal_id)?;

        if seal.status == SealStatus::Revoked {
            tracing::debug!(seal_id = %seal_id, "Seal already revoked");
            self.audit
                .log(
                    AuditRecord::new(OperationType::RevokeSeal, EntityType::Seal, seal_id, actor_id)
                        .before(SealStatus::Revoked.as_str())
                        .after(SealStatus::Revoked.as_str())
                        .severity(AuditSeverity::Debug)
                        .detail("noop", true),
                )
                .await?;
            return Ok(seal);
        }

        let now = Utc::now();
        let before = seal.effective_status(now);
        seal.status = SealStatus::Revoked;
        seal.revoked_at = Some(now);
        seal.revocation_reason = Some(reason.to_string());
        self.storage.update_seal(&seal)?;

        self.audit
            .log(
                AuditRecord::new(OperationType::RevokeSeal, EntityType::Seal, seal_id, actor_id)
                    .before(before.as_str())
                    .after(SealStatus::Revoked.as_str())
                    .severity(AuditSeverity::Warning)
                    .detail("reason", reason),
            )
            .await?;

        tracing::info!(seal_id = %seal_id, reason, "Seal revoked");
        Ok(seal)
    }

    /// Seal by ID
    pub fn get_seal(&self, seal_id: Uuid) -> Result<Seal> {
        self.storage
            .get_seal(seal_id)?
            .ok_or(Error::SealNotFound(seal_id))
    }

    /// Seals of a ledger, oldest first
    pub fn list_seals(&self, ledger_id: LedgerId) -> Result<Vec<Seal>> {
        self.storage.seals_for_ledger(&ledger_id)
    }

    /// Leaf set captured by a seal
    pub fn get_snapshot(&self, seal_id: Uuid) -> Result<Snapshot> {
        self.storage
            .get_snapshot(seal_id)?
            .ok_or(Error::SealNotFound(seal_id))
    }

    /// Whether `leaf_count` is far enough past the last seal to seal again
    pub fn should_seal(&self, leaf_count: u64, last_sealed: u64) -> bool {
        self.config.auto_seal_every > 0
            && leaf_count > 0
            && leaf_count >= last_sealed + self.config.auto_seal_every
    }

    fn last_sealed(&self, ledger_id: LedgerId) -> Result<u64> {
        Ok(self
            .list_seals(ledger_id)?
            .iter()
            .map(|seal| seal.leaf_count_at_seal)
            .max()
            .unwrap_or(0))
    }

    /// Seal automatically once `auto_seal_every` leaves accumulated
    pub async fn maybe_seal(&self, ledger_id: LedgerId, actor_id: &str) -> Result<Option<Seal>> {
        if self.config.auto_seal_every == 0 {
            return Ok(None);
        }

        // Unlocked pre-check keeps appends below the threshold off the exclusive section
        let leaf_count = self.ledger.ledger_info(ledger_id).await?.leaf_count;
        if !self.should_seal(leaf_count, self.last_sealed(ledger_id)?) {
            return Ok(None);
        }

        let result = self
            .ledger
            .with_retry(move || self.try_auto_seal(ledger_id, actor_id))
            .await;

        if let Err(e) = &result {
            self.audit_failed_seal(ledger_id, AUTO_SEAL_REASON, actor_id, e).await;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{hash_bytes, KeyPair};
    use crate::Config;
    use tempfile::TempDir;

    struct Fixture {
        sealing: SealingService,
        ledger: Arc<LedgerCore>,
        storage: Arc<Storage>,
        _temp: TempDir,
    }

    async fn fixture(keys: KeyRing, auto_seal_every: u64) -> Fixture {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp.path().to_path_buf();
        config.sealing.auto_seal_every = auto_seal_every;

        let storage = Arc::new(Storage::open(&config).unwrap());
        let metrics = Metrics::new().unwrap();
        let audit = Arc::new(AuditTrail::open(storage.clone(), &config.audit, metrics.clone()).unwrap());
        let ledger = Arc::new(
            LedgerCore::open(storage.clone(), audit.clone(), config.ledger.clone(), metrics.clone())
                .await
                .unwrap(),
        );
        let sealing = SealingService::new(
            ledger.clone(),
            storage.clone(),
            audit,
            keys,
            config.sealing.clone(),
            metrics,
        );

        Fixture {
            sealing,
            ledger,
            storage,
            _temp: temp,
        }
    }

    fn signing_keys() -> KeyRing {
        KeyRing::with_signer(KeyPair::from_seed("seal-key-1", &[7u8; 32]))
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
    async fn test_create_and_verify_seal() {
        let f = fixture(signing_keys(), 0).await;
        let ledger_id = ledger_with(&f, &["a", "b", "c"]).await;

        let seal = f.sealing.create_seal(ledger_id, "quarterly", "bob").await.unwrap();
        assert_eq!(seal.leaf_count_at_seal, 3);
        assert_eq!(seal.root_at_seal, f.ledger.get_root(ledger_id).await.unwrap());
        assert_eq!(seal.valid_until - seal.valid_from, Duration::days(365));
        assert_eq!(seal.ledger_state_hash, hash_bytes(seal.canonical().as_bytes()));

        let verification = f.sealing.verify_seal(seal.id, "auditor").await.unwrap();
        assert!(verification.valid, "{}", verification.reason);

        let snapshot = f.sealing.get_snapshot(seal.id).unwrap();
        assert_eq!(snapshot.leaves.len(), 3);
        assert_eq!(snapshot.leaves[1].content_ref, "b");
        assert_eq!(snapshot.root(), seal.root_at_seal);
    }

    #[tokio::test]
    async fn test_seal_requires_leaves_and_key() {
        let f = fixture(signing_keys(), 0).await;
        let empty = ledger_with(&f, &[]).await;
        assert!(matches!(
            f.sealing.create_seal(empty, "r", "bob").await,
            Err(Error::LedgerEmpty(_))
        ));

        let unkeyed = fixture(KeyRing::new(), 0).await;
        let ledger_id = ledger_with(&unkeyed, &["a"]).await;
        assert!(matches!(
            unkeyed.sealing.create_seal(ledger_id, "r", "bob").await,
            Err(Error::SigningUnavailable(_))
        ));
        // Fails closed: nothing persisted
        assert!(unkeyed.sealing.list_seals(ledger_id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expired_and_not_yet_valid() {
        let f = fixture(signing_keys(), 0).await;
        let ledger_id = ledger_with(&f, &["a"]).await;
        let seal = f.sealing.create_seal(ledger_id, "r", "bob").await.unwrap();

        let after_window = seal.valid_until + Duration::seconds(1);
        let expired = f.sealing.verify_seal_at(seal.id, after_window, "auditor").await.unwrap();
        assert!(!expired.valid);
        assert!(expired.reason.contains("expired"));
        assert_eq!(seal.effective_status(after_window), SealStatus::Expired);

        let before_window = seal.valid_from - Duration::seconds(1);
        let early = f.sealing.verify_seal_at(seal.id, before_window, "auditor").await.unwrap();
        assert!(!early.valid);
    }

    #[tokio::test]
    async fn test_revocation_is_idempotent() {
        let f = fixture(signing_keys(), 0).await;
        let ledger_id = ledger_with(&f, &["a"]).await;
        let seal = f.sealing.create_seal(ledger_id, "r", "bob").await.unwrap();

        let revoked = f.sealing.revoke_seal(seal.id, "key compromise", "carol").await.unwrap();
        assert_eq!(revoked.status, SealStatus::Revoked);
        let revoked_at = revoked.revoked_at.unwrap();

        let again = f.sealing.revoke_seal(seal.id, "second attempt", "carol").await.unwrap();
        assert_eq!(again.revoked_at, Some(revoked_at));
        assert_eq!(again.revocation_reason.as_deref(), Some("key compromise"));

        let verification = f.sealing.verify_seal(seal.id, "auditor").await.unwrap();
        assert!(!verification.valid);
        assert!(verification.reason.contains("revoked"));

        assert!(matches!(
            f.sealing.revoke_seal(Uuid::now_v7(), "r", "carol").await,
            Err(Error::SealNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_tampered_seal_rejected() {
        let f = fixture(signing_keys(), 0).await;
        let ledger_id = ledger_with(&f, &["a", "b"]).await;
        let seal = f.sealing.create_seal(ledger_id, "r", "bob").await.unwrap();

        let mut forged = seal.clone();
        forged.leaf_count_at_seal = 1;
        f.storage.update_seal(&forged).unwrap();

        let verification = f.sealing.verify_seal(seal.id, "auditor").await.unwrap();
        assert!(!verification.valid);
        assert!(verification.reason.contains("state hash mismatch"));
    }

    #[tokio::test]
    async fn test_rotated_key_still_verifies() {
        let f = fixture(signing_keys(), 0).await;
        let ledger_id = ledger_with(&f, &["a"]).await;
        let old_seal = f.sealing.create_seal(ledger_id, "r", "bob").await.unwrap();

        f.sealing
            .install_signer(KeyPair::from_seed("seal-key-2", &[8u8; 32]));
        f.ledger
            .append_leaf(ledger_id, &hash_bytes(b"b").to_hex(), "b", "alice")
            .await
            .unwrap();
        let new_seal = f.sealing.create_seal(ledger_id, "r", "bob").await.unwrap();

        assert_eq!(new_seal.signer_key_id, "seal-key-2");
        assert!(f.sealing.verify_seal(old_seal.id, "auditor").await.unwrap().valid);
        assert!(f.sealing.verify_seal(new_seal.id, "auditor").await.unwrap().valid);
        assert_eq!(f.sealing.list_seals(ledger_id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_maybe_seal_interval() {
        let f = fixture(signing_keys(), 2).await;
        let ledger_id = ledger_with(&f, &["a"]).await;

        assert!(f.sealing.maybe_seal(ledger_id, "scheduler").await.unwrap().is_none());

        f.ledger
            .append_leaf(ledger_id, &hash_bytes(b"b").to_hex(), "b", "alice")
            .await
            .unwrap();
        let seal = f.sealing.maybe_seal(ledger_id, "scheduler").await.unwrap().unwrap();
        assert_eq!(seal.leaf_count_at_seal, 2);
        assert_eq!(seal.reason, "automatic");

        // Nothing new since the last seal
        assert!(f.sealing.maybe_seal(ledger_id, "scheduler").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_threshold_crossings_seal_once() {
        let f = Arc::new(fixture(signing_keys(), 2).await);
        let ledger_id = ledger_with(&f, &["a"]).await;

        // Both appends cross the threshold
        let tasks: Vec<_> = ["b", "c"]
            .into_iter()
            .map(|label| {
                let f = f.clone();
                tokio::spawn(async move {
                    f.ledger
                        .append_leaf(ledger_id, &hash_bytes(label.as_bytes()).to_hex(), label, "alice")
                        .await
                        .unwrap();
                    f.sealing.maybe_seal(ledger_id, "scheduler").await.unwrap()
                })
            })
            .collect();

        let mut sealed = 0;
        for task in tasks {
            if task.await.unwrap().is_some() {
                sealed += 1;
            }
        }
        assert_eq!(sealed, 1);
        assert_eq!(f.sealing.list_seals(ledger_id).unwrap().len(), 1);

        for label in ["d", "e"] {
            f.ledger
                .append_leaf(ledger_id, &hash_bytes(label.as_bytes()).to_hex(), label, "alice")
                .await
                .unwrap();
        }

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let f = f.clone();
                tokio::spawn(async move { f.sealing.maybe_seal(ledger_id, "scheduler").await.unwrap() })
            })
            .collect();
        let mut sealed = 0;
        for task in tasks {
            if task.await.unwrap().is_some() {
                sealed += 1;
            }
        }
        assert_eq!(sealed, 1);
        assert_eq!(f.sealing.list_seals(ledger_id).unwrap().len(), 2);
    }
}
