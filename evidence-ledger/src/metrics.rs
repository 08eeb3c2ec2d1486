//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring the ledger.
//! Each instance owns its registry, so several ledgers can live in one
//! process (and one test binary) without colliding registrations.
//!
//! # Metrics
//!
//! - `ledger_leaves_appended_total` - Total number of leaves appended
//! - `ledger_append_duration_seconds` - Histogram of append latencies
//! - `ledger_proofs_generated_total` - Total number of proofs generated
//! - `ledger_seals_created_total` - Total number of seals created
//! - `ledger_integrity_checks_total` - Total number of integrity checks run
//! - `ledger_integrity_failures_total` - Integrity checks ending in failure
//! - `ledger_audit_entries_total` - Audit entries appended to the chain
//! - `ledger_concurrency_conflicts_total` - Exclusive sections not acquired in time

use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Total leaves appended
    pub leaves_appended: IntCounter,

    /// Append duration histogram
    pub append_duration: Histogram,

    /// Total proofs generated
    pub proofs_generated: IntCounter,

    /// Total seals created
    pub seals_created: IntCounter,

    /// Total integrity checks
    pub integrity_checks: IntCounter,

    /// Integrity checks with status Failure
    pub integrity_failures: IntCounter,

    /// Audit entries written
    pub audit_entries: IntCounter,

    /// Lock acquisition timeouts
    pub concurrency_conflicts: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let leaves_appended = counter(
            &registry,
            "ledger_leaves_appended_total",
            "Total number of leaves appended",
        )?;

        let append_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ledger_append_duration_seconds",
                "Histogram of append latencies",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
        )?;
        registry.register(Box::new(append_duration.clone()))?;

        let proofs_generated = counter(
            &registry,
            "ledger_proofs_generated_total",
            "Total number of proofs generated",
        )?;

        let seals_created = counter(
            &registry,
            "ledger_seals_created_total",
            "Total number of seals created",
        )?;

        let integrity_checks = counter(
            &registry,
            "ledger_integrity_checks_total",
            "Total number of integrity checks run",
        )?;

        let integrity_failures = counter(
            &registry,
            "ledger_integrity_failures_total",
            "Integrity checks that ended in failure",
        )?;

        let audit_entries = counter(
            &registry,
            "ledger_audit_entries_total",
            "Audit entries appended to the chain",
        )?;

        let concurrency_conflicts = counter(
            &registry,
            "ledger_concurrency_conflicts_total",
            "Per-ledger exclusive sections not acquired in time",
        )?;

        Ok(Self {
            leaves_appended,
            append_duration,
            proofs_generated,
            seals_created,
            integrity_checks,
            integrity_failures,
            audit_entries,
            concurrency_conflicts,
            registry,
        })
    }

    /// Record leaf append
    pub fn record_append(&self, duration_seconds: f64) {
        self.leaves_appended.inc();
        self.append_duration.observe(duration_seconds);
    }

    /// Record proof generation
    pub fn record_proof(&self) {
        self.proofs_generated.inc();
    }

    /// Record seal creation
    pub fn record_seal(&self) {
        self.seals_created.inc();
    }

    /// Record an integrity check and whether it failed
    pub fn record_integrity_check(&self, failed: bool) {
        self.integrity_checks.inc();
        if failed {
            self.integrity_failures.inc();
        }
    }

    /// Record audit entry
    pub fn record_audit_entry(&self) {
        self.audit_entries.inc();
    }

    /// Record lock timeout
    pub fn record_conflict(&self) {
        self.concurrency_conflicts.inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}
