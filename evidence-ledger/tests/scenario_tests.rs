//! End-to-end scenarios through the service facade

use chrono::Duration;
use evidence_ledger::{
    audit::{AuditFilter, EntityType, OperationType},
    crypto::{hash_bytes, hash_pair, KeyPair, KeyRing},
    integrity::{CheckScope, CheckStatus},
    Config, Digest, EvidenceLedger, LedgerId, ProofStep, Side,
};
use tempfile::TempDir;

async fn open_service() -> (EvidenceLedger, TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.data_dir = temp_dir.path().to_path_buf();
    config.integrity.background_scan = false;

    let keys = KeyRing::with_signer(KeyPair::from_seed("seal-key-1", &[42u8; 32]));
    let service = EvidenceLedger::open_with_keys(config, keys).await.unwrap();
    (service, temp_dir)
}

async fn ledger_with(service: &EvidenceLedger, labels: &[&str]) -> LedgerId {
    let info = service.create_ledger("enrollment", "enroller").await.unwrap();
    for label in labels {
        service
            .append_leaf(info.id, &hash_bytes(label.as_bytes()).to_hex(), label, "enroller")
            .await
            .unwrap();
    }
    info.id
}

#[tokio::test]
async fn three_leaf_root_pairs_lone_node_with_itself() {
    let (service, _temp) = open_service().await;
    let ledger_id = ledger_with(&service, &["a", "b", "c"]).await;

    let (ha, hb, hc) = (hash_bytes(b"a"), hash_bytes(b"b"), hash_bytes(b"c"));
    let expected = hash_pair(&hash_pair(&ha, &hb), &hash_pair(&hc, &hc));
    assert_eq!(service.get_root(ledger_id).await.unwrap(), expected);

    let info = service.ledger_info(ledger_id).await.unwrap();
    assert_eq!(info.leaf_count, 3);
    assert_eq!(info.height, 2);

    let proof = service.generate_proof(ledger_id, 2, "verifier").await.unwrap();
    assert_eq!(
        proof.path,
        vec![
            ProofStep {
                hash: hc,
                side: Side::Right
            },
            ProofStep {
                hash: hash_pair(&ha, &hb),
                side: Side::Left
            },
        ]
    );
    assert_eq!(proof.root_at_generation, expected);
    assert!(evidence_ledger::verify_proof(&hc, &proof));

    // Wire form: hex digests, ordered steps with side tags
    let json = serde_json::to_value(&proof).unwrap();
    assert_eq!(json["root_at_generation"], expected.to_hex());
    assert_eq!(json["path"][1]["side"], "left");
}

#[tokio::test]
async fn seal_stays_valid_after_append() {
    let (service, _temp) = open_service().await;
    let ledger_id = ledger_with(&service, &["a", "b", "c"]).await;

    let seal = service.create_seal(ledger_id, "quarterly", "notary").await.unwrap();
    let sealed_root = seal.root_at_seal;

    service
        .append_leaf(ledger_id, &hash_bytes(b"d").to_hex(), "d", "enroller")
        .await
        .unwrap();

    let verification = service.verify_seal(seal.id, "verifier").await.unwrap();
    assert!(verification.valid, "{}", verification.reason);

    let info = service.ledger_info(ledger_id).await.unwrap();
    assert_eq!(info.leaf_count, 4);
    assert_ne!(info.root, sealed_root);
    assert_eq!(service.root_at(ledger_id, 3).await.unwrap(), sealed_root);
}

#[tokio::test]
async fn expired_and_revoked_seals_report_invalid() {
    let (service, _temp) = open_service().await;
    let ledger_id = ledger_with(&service, &["a"]).await;

    let expiring = service.create_seal(ledger_id, "r", "notary").await.unwrap();
    let later = expiring.valid_until + Duration::days(1);
    let expired = service.verify_seal_at(expiring.id, later, "verifier").await.unwrap();
    assert!(!expired.valid);

    let revocable = service.create_seal(ledger_id, "r", "notary").await.unwrap();
    service.revoke_seal(revocable.id, "superseded", "notary").await.unwrap();
    service.revoke_seal(revocable.id, "superseded", "notary").await.unwrap();
    let revoked = service.verify_seal(revocable.id, "verifier").await.unwrap();
    assert!(!revoked.valid);
    assert!(revoked.reason.contains("superseded"));
}

#[tokio::test]
async fn corrupted_proof_fails_full_check_at_its_leaf() {
    let (service, _temp) = open_service().await;
    let ledger_id = ledger_with(&service, &["a", "b", "c", "d", "e"]).await;
    for index in 0..5 {
        service.generate_proof(ledger_id, index, "verifier").await.unwrap();
    }

    let clean = service.full_check(ledger_id, "auditor").await.unwrap();
    assert_eq!(clean.status, CheckStatus::Success);
    assert!(clean.issues.is_empty());

    let mut proof = service
        .storage()
        .proofs_in_range(&ledger_id, 3, 4)
        .unwrap()
        .remove(0);
    proof.root_at_generation = Digest::from_bytes([0xAB; 32]);
    service.storage().put_proof(&proof).unwrap();

    let result = service
        .check_integrity(ledger_id, CheckScope::Full, "auditor")
        .await
        .unwrap();
    assert_eq!(result.status, CheckStatus::Failure);
    let leaf_indices: Vec<_> = result.critical_issues().map(|i| i.leaf_index).collect();
    assert_eq!(leaf_indices, vec![Some(3)]);

    // The failure is on the record
    let escalations = service
        .query_trail(
            &AuditFilter {
                operation_type: Some(OperationType::IntegrityCheck),
                ..AuditFilter::default()
            },
            10,
            "auditor",
        )
        .await
        .unwrap();
    assert_eq!(escalations.len(), 2);
    assert_eq!(escalations[1].status_after.as_deref(), Some("failure"));
    assert_eq!(service.list_check_results(ledger_id, 10).unwrap().len(), 2);
}

#[tokio::test]
async fn audit_tamper_propagates_down_the_chain() {
    let (service, _temp) = open_service().await;
    let ledger_id = ledger_with(&service, &["a", "b", "c"]).await;
    service.generate_proof(ledger_id, 1, "verifier").await.unwrap();

    let entries = service
        .query_trail(&AuditFilter::default(), 100, "auditor")
        .await
        .unwrap();
    let kinds: Vec<_> = entries.iter().map(|e| e.entity_type).collect();
    assert_eq!(
        kinds,
        vec![
            EntityType::Ledger,
            EntityType::Leaf,
            EntityType::Leaf,
            EntityType::Leaf,
            EntityType::Proof,
        ]
    );

    let chain = service.verify_audit_chain("auditor").await.unwrap();
    assert!(chain.valid);

    let mut tampered = entries[1].clone();
    tampered.actor_id = "mallory".to_string();
    service.storage().put_audit_entry(&tampered).unwrap();

    assert!(service.verify_entry_integrity(entries[0].id, "auditor").await.unwrap().valid);
    for entry in &entries[1..] {
        let verification = service.verify_entry_integrity(entry.id, "auditor").await.unwrap();
        assert!(!verification.valid, "entry {} should be invalid", entry.sequence);
    }

    let chain = service.verify_audit_chain("auditor").await.unwrap();
    assert!(!chain.valid);
    assert_eq!(chain.first_broken_sequence, Some(entries[1].sequence));
}
