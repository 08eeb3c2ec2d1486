//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `ledgers` - Ledger headers (key: ledger_id)
//! - `leaves` - Append-only leaves (key: ledger_id || index)
//! - `roots` - Root history (key: ledger_id || leaf_count)
//! - `proofs` - Generated proofs (key: ledger_id || leaf_index || proof_id)
//! - `seals` - Seals (key: seal_id)
//! - `snapshots` - Leaf set at seal time (key: seal_id)
//! - `integrity` - Integrity check results (key: ledger_id || check_id)
//! - `audit` - Live audit chain (key: sequence)
//! - `audit_archive` - Audit entries past retention (key: sequence)
//! - `indices` - Secondary indices for fast lookups
//!
//! All integers in keys are big-endian so iteration order is ordinal order.

use crate::{
    audit::AuditEntry,
    error::{Error, Result},
    integrity::IntegrityCheckResult,
    sealing::{Seal, Snapshot},
    types::{Digest, LedgerId, LedgerInfo, Leaf, Proof},
    Config,
};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, DBCompressionType, Direction, IteratorMode, Options,
    WriteBatch, DB,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use uuid::Uuid;

/// Column family names
const CF_LEDGERS: &str = "ledgers";
const CF_LEAVES: &str = "leaves";
const CF_ROOTS: &str = "roots";
const CF_PROOFS: &str = "proofs";
const CF_SEALS: &str = "seals";
const CF_SNAPSHOTS: &str = "snapshots";
const CF_INTEGRITY: &str = "integrity";
const CF_AUDIT: &str = "audit";
const CF_AUDIT_ARCHIVE: &str = "audit_archive";
const CF_INDICES: &str = "indices";

/// Index key tags
const IDX_LEDGER_SEAL: u8 = 0x01;
const IDX_AUDIT_ENTRY: u8 = 0x02;
const IDX_PROOF: u8 = 0x03;

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<DB>,
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        // Create directory if not exists
        std::fs::create_dir_all(path)?;

        // Database options
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        // Tuning from config
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_target_file_size_base(config.rocksdb.target_file_size_mb * 1024 * 1024);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_LEDGERS, Self::cf_options_hot()),
            ColumnFamilyDescriptor::new(CF_LEAVES, Self::cf_options_hot()),
            ColumnFamilyDescriptor::new(CF_ROOTS, Self::cf_options_hot()),
            ColumnFamilyDescriptor::new(CF_PROOFS, Self::cf_options_hot()),
            ColumnFamilyDescriptor::new(CF_SEALS, Self::cf_options_hot()),
            ColumnFamilyDescriptor::new(CF_SNAPSHOTS, Self::cf_options_cold()),
            ColumnFamilyDescriptor::new(CF_INTEGRITY, Self::cf_options_cold()),
            ColumnFamilyDescriptor::new(CF_AUDIT, Self::cf_options_hot()),
            ColumnFamilyDescriptor::new(CF_AUDIT_ARCHIVE, Self::cf_options_cold()),
            ColumnFamilyDescriptor::new(CF_INDICES, Self::cf_options_indices()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened RocksDB");

        Ok(Self { db: Arc::new(db) })
    }

    // Column family options

    fn cf_options_hot() -> Options {
        let mut opts = Options::default();
        // Frequently read, use LZ4 for speed
        opts.set_compression_type(DBCompressionType::Lz4);
        opts
    }

    fn cf_options_cold() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(DBCompressionType::Zstd);
        opts.set_bottommost_compression_type(DBCompressionType::Zstd);
        opts
    }

    fn cf_options_indices() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(DBCompressionType::Lz4);
        // Indices benefit from bloom filters
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false); // 10 bits per key
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    // Helpers

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn get_value<T: DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf_handle(cf_name)?;
        match self.db.get_cf(cf, key)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Visit values whose key starts with `prefix`, beginning at `start`
    fn scan_prefix<T, F>(&self, cf_name: &str, prefix: &[u8], start: &[u8], mut visit: F) -> Result<()>
    where
        T: DeserializeOwned,
        F: FnMut(&[u8], T) -> Result<bool>,
    {
        let cf = self.cf_handle(cf_name)?;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(start, Direction::Forward));

        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            if !visit(&key, bincode::deserialize(&value)?)? {
                break;
            }
        }

        Ok(())
    }

    fn ordinal_key(ledger_id: &LedgerId, ordinal: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(ledger_id.as_bytes());
        key.extend_from_slice(&ordinal.to_be_bytes());
        key
    }

    fn proof_key(proof: &Proof) -> Vec<u8> {
        let mut key = Self::ordinal_key(&proof.ledger_id, proof.leaf_index);
        key.extend_from_slice(proof.id.as_bytes());
        key
    }

    fn index_key(tag: u8, parts: &[&[u8]]) -> Vec<u8> {
        let mut key = vec![tag];
        for part in parts {
            key.extend_from_slice(part);
        }
        key
    }

    // Ledger operations

    /// Persist a new, empty ledger with its zero-leaf root record
    pub fn create_ledger(&self, info: &LedgerInfo) -> Result<()> {
        let mut batch = WriteBatch::default();

        let cf_ledgers = self.cf_handle(CF_LEDGERS)?;
        batch.put_cf(cf_ledgers, info.id.as_bytes().as_slice(), bincode::serialize(info)?);

        let cf_roots = self.cf_handle(CF_ROOTS)?;
        batch.put_cf(
            cf_roots,
            Self::ordinal_key(&info.id, info.leaf_count),
            bincode::serialize(&info.root)?,
        );

        self.db.write(batch)?;
        Ok(())
    }

    /// Get ledger header
    pub fn get_ledger(&self, ledger_id: &LedgerId) -> Result<Option<LedgerInfo>> {
        self.get_value(CF_LEDGERS, ledger_id.as_bytes())
    }

    /// All ledger headers, oldest first
    pub fn list_ledgers(&self) -> Result<Vec<LedgerInfo>> {
        let mut ledgers = Vec::new();
        self.scan_prefix(CF_LEDGERS, &[], &[], |_, info: LedgerInfo| {
            ledgers.push(info);
            Ok(true)
        })?;
        Ok(ledgers)
    }

    /// Append leaf with header update and root history (atomic)
    pub fn append_leaf_atomic(&self, leaf: &Leaf, info: &LedgerInfo) -> Result<()> {
        let mut batch = WriteBatch::default();

        // 1. Leaf
        let cf_leaves = self.cf_handle(CF_LEAVES)?;
        batch.put_cf(
            cf_leaves,
            Self::ordinal_key(&leaf.ledger_id, leaf.index),
            bincode::serialize(leaf)?,
        );

        // 2. Header
        let cf_ledgers = self.cf_handle(CF_LEDGERS)?;
        batch.put_cf(cf_ledgers, info.id.as_bytes().as_slice(), bincode::serialize(info)?);

        // 3. Root history
        let cf_roots = self.cf_handle(CF_ROOTS)?;
        batch.put_cf(
            cf_roots,
            Self::ordinal_key(&info.id, info.leaf_count),
            bincode::serialize(&info.root)?,
        );

        // Atomic commit
        self.db.write(batch)?;

        tracing::debug!(
            ledger_id = %leaf.ledger_id,
            leaf_index = leaf.index,
            "Leaf persisted"
        );

        Ok(())
    }

    /// Get leaf by ordinal
    pub fn get_leaf(&self, ledger_id: &LedgerId, index: u64) -> Result<Option<Leaf>> {
        self.get_value(CF_LEAVES, &Self::ordinal_key(ledger_id, index))
    }

    /// Leaves with `start <= index < end`, in ordinal order
    pub fn leaves_in_range(&self, ledger_id: &LedgerId, start: u64, end: u64) -> Result<Vec<Leaf>> {
        let mut leaves = Vec::new();
        self.scan_prefix(
            CF_LEAVES,
            ledger_id.as_bytes().as_slice(),
            &Self::ordinal_key(ledger_id, start),
            |_, leaf: Leaf| {
                if leaf.index >= end {
                    return Ok(false);
                }
                leaves.push(leaf);
                Ok(true)
            },
        )?;
        Ok(leaves)
    }

    /// Every persisted leaf of a ledger
    pub fn all_leaves(&self, ledger_id: &LedgerId) -> Result<Vec<Leaf>> {
        self.leaves_in_range(ledger_id, 0, u64::MAX)
    }

    /// Root recorded when the ledger held `leaf_count` leaves
    pub fn root_at(&self, ledger_id: &LedgerId, leaf_count: u64) -> Result<Option<Digest>> {
        self.get_value(CF_ROOTS, &Self::ordinal_key(ledger_id, leaf_count))
    }

    // Proof operations

    /// Persist a generated proof
    pub fn put_proof(&self, proof: &Proof) -> Result<()> {
        let key = Self::proof_key(proof);
        let mut batch = WriteBatch::default();

        let cf_proofs = self.cf_handle(CF_PROOFS)?;
        batch.put_cf(cf_proofs, &key, bincode::serialize(proof)?);

        let cf_indices = self.cf_handle(CF_INDICES)?;
        batch.put_cf(
            cf_indices,
            Self::index_key(IDX_PROOF, &[proof.id.as_bytes().as_slice()]),
            &key,
        );

        self.db.write(batch)?;
        Ok(())
    }

    /// Get proof by ID
    pub fn get_proof(&self, proof_id: Uuid) -> Result<Option<Proof>> {
        let cf_indices = self.cf_handle(CF_INDICES)?;
        let index_key = Self::index_key(IDX_PROOF, &[proof_id.as_bytes().as_slice()]);
        match self.db.get_cf(cf_indices, index_key)? {
            Some(proof_key) => self.get_value(CF_PROOFS, &proof_key),
            None => Ok(None),
        }
    }

    /// Proofs for leaves with `start <= leaf_index < end`
    pub fn proofs_in_range(&self, ledger_id: &LedgerId, start: u64, end: u64) -> Result<Vec<Proof>> {
        let mut proofs = Vec::new();
        self.scan_prefix(
            CF_PROOFS,
            ledger_id.as_bytes().as_slice(),
            &Self::ordinal_key(ledger_id, start),
            |_, proof: Proof| {
                if proof.leaf_index >= end {
                    return Ok(false);
                }
                proofs.push(proof);
                Ok(true)
            },
        )?;
        Ok(proofs)
    }

    /// Every stored proof of a ledger, by leaf index
    pub fn all_proofs(&self, ledger_id: &LedgerId) -> Result<Vec<Proof>> {
        self.proofs_in_range(ledger_id, 0, u64::MAX)
    }

    // Seal operations

    /// Persist seal with its snapshot and ledger index (atomic)
    pub fn put_seal_with_snapshot(&self, seal: &Seal, snapshot: &Snapshot) -> Result<()> {
        let mut batch = WriteBatch::default();

        let cf_seals = self.cf_handle(CF_SEALS)?;
        batch.put_cf(cf_seals, seal.id.as_bytes().as_slice(), bincode::serialize(seal)?);

        let cf_snapshots = self.cf_handle(CF_SNAPSHOTS)?;
        batch.put_cf(cf_snapshots, seal.id.as_bytes().as_slice(), bincode::serialize(snapshot)?);

        let cf_indices = self.cf_handle(CF_INDICES)?;
        batch.put_cf(
            cf_indices,
            Self::index_key(IDX_LEDGER_SEAL, &[seal.ledger_id.as_bytes().as_slice(), seal.id.as_bytes().as_slice()]),
            b"",
        );

        self.db.write(batch)?;
        Ok(())
    }

    /// Overwrite a seal record (status transitions)
    pub fn update_seal(&self, seal: &Seal) -> Result<()> {
        let cf = self.cf_handle(CF_SEALS)?;
        self.db
            .put_cf(cf, seal.id.as_bytes().as_slice(), bincode::serialize(seal)?)?;
        Ok(())
    }

    /// Get seal by ID
    pub fn get_seal(&self, seal_id: Uuid) -> Result<Option<Seal>> {
        self.get_value(CF_SEALS, seal_id.as_bytes())
    }

    /// Get snapshot by seal ID
    pub fn get_snapshot(&self, seal_id: Uuid) -> Result<Option<Snapshot>> {
        self.get_value(CF_SNAPSHOTS, seal_id.as_bytes())
    }

    /// Seals of a ledger, oldest first
    pub fn seals_for_ledger(&self, ledger_id: &LedgerId) -> Result<Vec<Seal>> {
        let cf_indices = self.cf_handle(CF_INDICES)?;
        let prefix = Self::index_key(IDX_LEDGER_SEAL, &[ledger_id.as_bytes().as_slice()]);

        let mut seal_ids = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf_indices, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let id_bytes: [u8; 16] = key[prefix.len()..]
                .try_into()
                .map_err(|_| Error::Storage("Malformed seal index key".to_string()))?;
            seal_ids.push(Uuid::from_bytes(id_bytes));
        }

        let mut seals = Vec::with_capacity(seal_ids.len());
        for seal_id in seal_ids {
            let seal = self
                .get_seal(seal_id)?
                .ok_or_else(|| Error::Storage(format!("Seal index references missing seal {}", seal_id)))?;
            seals.push(seal);
        }
        Ok(seals)
    }

    // Integrity results

    /// Persist an integrity check result
    pub fn put_integrity_result(&self, result: &IntegrityCheckResult) -> Result<()> {
        let cf = self.cf_handle(CF_INTEGRITY)?;
        let mut key = result.ledger_id.as_bytes().to_vec();
        key.extend_from_slice(result.id.as_bytes());
        self.db.put_cf(cf, key, bincode::serialize(result)?)?;
        Ok(())
    }

    /// Integrity results of a ledger, oldest first
    pub fn integrity_results(&self, ledger_id: &LedgerId) -> Result<Vec<IntegrityCheckResult>> {
        let mut results = Vec::new();
        self.scan_prefix(
            CF_INTEGRITY,
            ledger_id.as_bytes().as_slice(),
            ledger_id.as_bytes().as_slice(),
            |_, result: IntegrityCheckResult| {
                results.push(result);
                Ok(true)
            },
        )?;
        Ok(results)
    }

    // Audit chain

    /// Write an audit entry and its id index
    ///
    /// Only the audit actor appends to the chain; this is also the raw
    /// write used by forensic tooling.
    pub fn put_audit_entry(&self, entry: &AuditEntry) -> Result<()> {
        let mut batch = WriteBatch::default();

        let cf_audit = self.cf_handle(CF_AUDIT)?;
        batch.put_cf(
            cf_audit,
            entry.sequence.to_be_bytes(),
            bincode::serialize(entry)?,
        );

        let cf_indices = self.cf_handle(CF_INDICES)?;
        batch.put_cf(
            cf_indices,
            Self::index_key(IDX_AUDIT_ENTRY, &[entry.id.as_bytes().as_slice()]),
            entry.sequence.to_be_bytes(),
        );

        self.db.write(batch)?;
        Ok(())
    }

    /// Audit entry by sequence, live or archived
    pub fn get_audit_entry(&self, sequence: u64) -> Result<Option<AuditEntry>> {
        let key = sequence.to_be_bytes();
        match self.get_value(CF_AUDIT, &key)? {
            Some(entry) => Ok(Some(entry)),
            None => self.get_value(CF_AUDIT_ARCHIVE, &key),
        }
    }

    /// Sequence of an audit entry by ID
    pub fn audit_sequence(&self, entry_id: Uuid) -> Result<Option<u64>> {
        let cf_indices = self.cf_handle(CF_INDICES)?;
        let key = Self::index_key(IDX_AUDIT_ENTRY, &[entry_id.as_bytes().as_slice()]);
        match self.db.get_cf(cf_indices, key)? {
            Some(bytes) => {
                let seq: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Storage("Malformed audit index value".to_string()))?;
                Ok(Some(u64::from_be_bytes(seq)))
            }
            None => Ok(None),
        }
    }

    /// Most recent audit entry
    pub fn audit_head(&self) -> Result<Option<AuditEntry>> {
        for cf_name in [CF_AUDIT, CF_AUDIT_ARCHIVE] {
            let cf = self.cf_handle(cf_name)?;
            if let Some(item) = self.db.iterator_cf(cf, IteratorMode::End).next() {
                let (_, value) = item?;
                return Ok(Some(bincode::deserialize(&value)?));
            }
        }
        Ok(None)
    }

    /// Visit audit entries in chain order until `visit` returns false
    pub fn scan_audit<F>(&self, include_archived: bool, mut visit: F) -> Result<()>
    where
        F: FnMut(AuditEntry) -> Result<bool>,
    {
        let mut stopped = false;

        if include_archived {
            self.scan_prefix(CF_AUDIT_ARCHIVE, &[], &[], |_, entry: AuditEntry| {
                let more = visit(entry)?;
                stopped = !more;
                Ok(more)
            })?;
        }
        if !stopped {
            self.scan_prefix(CF_AUDIT, &[], &[], |_, entry: AuditEntry| visit(entry))?;
        }
        Ok(())
    }

    /// Move entries from the live chain to the archive (atomic)
    pub fn archive_audit_entries(&self, entries: &[AuditEntry]) -> Result<()> {
        let cf_audit = self.cf_handle(CF_AUDIT)?;
        let cf_archive = self.cf_handle(CF_AUDIT_ARCHIVE)?;

        let mut batch = WriteBatch::default();
        for entry in entries {
            let key = entry.sequence.to_be_bytes();
            batch.put_cf(cf_archive, key, bincode::serialize(entry)?);
            batch.delete_cf(cf_audit, key);
        }

        self.db.write(batch)?;

        tracing::info!(count = entries.len(), "Audit entries archived");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash_bytes;
    use crate::merkle::merkle_root;
    use chrono::Utc;
    use tempfile::TempDir;

    fn test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        (Storage::open(&config).unwrap(), temp_dir)
    }

    fn append(storage: &Storage, info: &mut LedgerInfo, label: &str) -> Leaf {
        let leaf = Leaf {
            ledger_id: info.id,
            index: info.leaf_count,
            content_hash: hash_bytes(label.as_bytes()),
            content_ref: label.to_string(),
            appended_at: Utc::now(),
        };
        let mut hashes: Vec<Digest> = storage
            .all_leaves(&info.id)
            .unwrap()
            .iter()
            .map(|l| l.content_hash)
            .collect();
        hashes.push(leaf.content_hash);
        info.leaf_count += 1;
        info.root = merkle_root(&hashes);
        storage.append_leaf_atomic(&leaf, info).unwrap();
        leaf
    }

    #[test]
    fn test_storage_open() {
        let (storage, _temp) = test_storage();
        assert!(storage.db.cf_handle(CF_LEAVES).is_some());
        assert!(storage.db.cf_handle(CF_AUDIT_ARCHIVE).is_some());
    }

    #[test]
    fn test_create_and_list_ledgers() {
        let (storage, _temp) = test_storage();
        let a = LedgerInfo::empty("a");
        let b = LedgerInfo::empty("b");
        storage.create_ledger(&a).unwrap();
        storage.create_ledger(&b).unwrap();

        assert_eq!(storage.get_ledger(&a.id).unwrap().unwrap().name, "a");
        assert_eq!(storage.list_ledgers().unwrap().len(), 2);
        assert_eq!(storage.root_at(&a.id, 0).unwrap(), Some(Digest::ZERO));
        assert!(storage.get_ledger(&LedgerId::new()).unwrap().is_none());
    }

    #[test]
    fn test_atomic_append_records_root_history() {
        let (storage, _temp) = test_storage();
        let mut info = LedgerInfo::empty("devices");
        storage.create_ledger(&info).unwrap();

        append(&storage, &mut info, "a");
        let root_after_one = info.root;
        append(&storage, &mut info, "b");

        let stored = storage.get_ledger(&info.id).unwrap().unwrap();
        assert_eq!(stored.leaf_count, 2);
        assert_eq!(stored.root, info.root);
        assert_eq!(storage.root_at(&info.id, 1).unwrap(), Some(root_after_one));
        assert_eq!(storage.root_at(&info.id, 2).unwrap(), Some(info.root));
    }

    #[test]
    fn test_leaf_ranges_stay_within_ledger() {
        let (storage, _temp) = test_storage();
        let mut first = LedgerInfo::empty("first");
        let mut second = LedgerInfo::empty("second");
        storage.create_ledger(&first).unwrap();
        storage.create_ledger(&second).unwrap();

        for i in 0..5 {
            append(&storage, &mut first, &format!("f{}", i));
        }
        append(&storage, &mut second, "s0");

        let window = storage.leaves_in_range(&first.id, 1, 3).unwrap();
        assert_eq!(window.iter().map(|l| l.index).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(storage.all_leaves(&first.id).unwrap().len(), 5);
        assert_eq!(storage.all_leaves(&second.id).unwrap().len(), 1);
        assert!(storage.get_leaf(&first.id, 9).unwrap().is_none());
    }

    #[test]
    fn test_proof_lookup() {
        let (storage, _temp) = test_storage();
        let ledger_id = LedgerId::new();
        let proof = Proof {
            id: Uuid::now_v7(),
            ledger_id,
            leaf_index: 3,
            tree_size: 4,
            path: vec![],
            root_at_generation: hash_bytes(b"root"),
            generated_at: Utc::now(),
        };
        storage.put_proof(&proof).unwrap();

        assert_eq!(storage.get_proof(proof.id).unwrap(), Some(proof.clone()));
        assert_eq!(storage.proofs_in_range(&ledger_id, 0, 3).unwrap().len(), 0);
        assert_eq!(storage.proofs_in_range(&ledger_id, 3, 4).unwrap().len(), 1);
        assert!(storage.get_proof(Uuid::now_v7()).unwrap().is_none());
    }
}
