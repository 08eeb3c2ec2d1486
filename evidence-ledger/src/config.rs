//! Configuration for the ledger

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Emit logs as JSON lines
    pub log_json: bool,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Append path configuration
    pub ledger: LedgerConfig,

    /// Sealing configuration
    pub sealing: SealingConfig,

    /// Integrity scanning configuration
    pub integrity: IntegrityConfig,

    /// Audit trail configuration
    pub audit: AuditConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/evidence-ledger"),
            service_name: "evidence-ledger".to_string(),
            log_json: false,
            rocksdb: RocksDBConfig::default(),
            ledger: LedgerConfig::default(),
            sealing: SealingConfig::default(),
            integrity: IntegrityConfig::default(),
            audit: AuditConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Target file size (MB)
    pub target_file_size_mb: u64,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 4,
            target_file_size_mb: 64,
            max_background_jobs: 4,
            enable_statistics: false,
        }
    }
}

/// Append path configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// How long to wait for the per-ledger exclusive section (milliseconds)
    pub lock_timeout_ms: u64,

    /// Retries after a concurrency conflict
    pub max_retries: u32,

    /// Initial backoff between retries (milliseconds, doubled each attempt)
    pub retry_backoff_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 5_000,
            max_retries: 3,
            retry_backoff_ms: 10,
        }
    }
}

/// Sealing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SealingConfig {
    /// Seal validity window (days)
    pub validity_days: i64,

    /// Seal automatically every N new leaves (0 = disabled)
    pub auto_seal_every: u64,

    /// File holding the hex-encoded Ed25519 seed
    pub signing_key_file: Option<PathBuf>,

    /// Key identifier recorded on seals
    pub key_id: String,

    /// Retired keys that still verify older seals (key id -> hex public key)
    pub verifier_keys: BTreeMap<String, String>,
}

impl Default for SealingConfig {
    fn default() -> Self {
        Self {
            validity_days: 365,
            auto_seal_every: 0,
            signing_key_file: None,
            key_id: "seal-key-1".to_string(),
            verifier_keys: BTreeMap::new(),
        }
    }
}

/// Integrity scanning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrityConfig {
    /// Leaves per incremental check
    pub page_size: u64,

    /// Seconds between background scan rounds
    pub scan_interval_secs: u64,

    /// Run the background scanner
    pub background_scan: bool,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            page_size: 1_000,
            scan_interval_secs: 60,
            background_scan: true,
        }
    }
}

/// Audit trail configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Entries older than this move to the archive (7 years)
    pub retention_days: i64,

    /// Audit actor mailbox capacity
    pub mailbox_capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            retention_days: 2555,
            mailbox_capacity: 1_024,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("LEDGER_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(value) = std::env::var("LEDGER_LOG_JSON") {
            config.log_json = parse_env("LEDGER_LOG_JSON", &value)?;
        }

        if let Ok(value) = std::env::var("LEDGER_LOCK_TIMEOUT_MS") {
            config.ledger.lock_timeout_ms = parse_env("LEDGER_LOCK_TIMEOUT_MS", &value)?;
        }

        if let Ok(value) = std::env::var("LEDGER_SEAL_VALIDITY_DAYS") {
            config.sealing.validity_days = parse_env("LEDGER_SEAL_VALIDITY_DAYS", &value)?;
        }

        if let Ok(value) = std::env::var("LEDGER_AUTO_SEAL_EVERY") {
            config.sealing.auto_seal_every = parse_env("LEDGER_AUTO_SEAL_EVERY", &value)?;
        }

        if let Ok(path) = std::env::var("LEDGER_SIGNING_KEY_FILE") {
            config.sealing.signing_key_file = Some(PathBuf::from(path));
        }

        if let Ok(key_id) = std::env::var("LEDGER_SIGNING_KEY_ID") {
            config.sealing.key_id = key_id;
        }

        // Comma-separated `key_id=hex` pairs
        if let Ok(value) = std::env::var("LEDGER_VERIFIER_KEYS") {
            config.sealing.verifier_keys = parse_verifier_keys(&value)?;
        }

        if let Ok(value) = std::env::var("LEDGER_SCAN_INTERVAL_SECS") {
            config.integrity.scan_interval_secs = parse_env("LEDGER_SCAN_INTERVAL_SECS", &value)?;
        }

        if let Ok(value) = std::env::var("LEDGER_AUDIT_RETENTION_DAYS") {
            config.audit.retention_days = parse_env("LEDGER_AUDIT_RETENTION_DAYS", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the ledger cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.sealing.validity_days <= 0 {
            return Err(crate::Error::Config(
                "sealing.validity_days must be positive".to_string(),
            ));
        }
        if self.integrity.page_size == 0 {
            return Err(crate::Error::Config(
                "integrity.page_size must be positive".to_string(),
            ));
        }
        if self.integrity.scan_interval_secs == 0 {
            return Err(crate::Error::Config(
                "integrity.scan_interval_secs must be positive".to_string(),
            ));
        }
        for (key_id, public_key) in &self.sealing.verifier_keys {
            if key_id.is_empty() || public_key.trim().len() != 64 {
                return Err(crate::Error::Config(format!(
                    "sealing.verifier_keys.{} must be 64 hex characters",
                    key_id
                )));
            }
        }
        if self.audit.retention_days <= 0 {
            return Err(crate::Error::Config(
                "audit.retention_days must be positive".to_string(),
            ));
        }
        if self.audit.mailbox_capacity == 0 {
            return Err(crate::Error::Config(
                "audit.mailbox_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> crate::Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| crate::Error::Config(format!("Invalid {}: {}", name, e)))
}

fn parse_verifier_keys(value: &str) -> crate::Result<BTreeMap<String, String>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            pair.split_once('=')
                .map(|(key_id, key)| (key_id.trim().to_string(), key.trim().to_string()))
                .ok_or_else(|| {
                    crate::Error::Config(format!("Invalid LEDGER_VERIFIER_KEYS entry: {}", pair))
                })
        })
        .collect()
}
