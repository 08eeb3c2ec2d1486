//! Single-writer actor for the audit chain
//!
//! The chain head `(next_sequence, head_hash)` is owned by exactly one
//! task. Every component that records an operation sends the record to
//! the actor's mailbox; the actor links it to the head, persists it and
//! only then advances the head. Two entries can therefore never claim
//! the same sequence or the same predecessor.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │   LedgerCore / SealingService / IntegrityChecker      │
//! └─────────────────────┬─────────────────────────────────┘
//!                       │ AuditHandle (Clone)
//!                       │ mpsc::channel (bounded)
//!                       ▼
//! ┌───────────────────────────────────────────────────────┐
//! │              AuditActor (Single Task)                 │
//! │   head: (next_sequence, head_hash)                    │
//! │   record → entry → Storage::put_audit_entry()         │
//! └───────────────────────────────────────────────────────┘
//! ```

use crate::audit::{AuditEntry, AuditRecord};
use crate::metrics::Metrics;
use crate::storage::Storage;
use crate::types::Digest;
use crate::{Error, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Message sent to the audit actor
pub enum AuditMessage {
    /// Append a record to the chain
    #[allow(missing_docs)]
    Append {
        record: AuditRecord,
        response: oneshot::Sender<Result<AuditEntry>>,
    },

    /// Read the current head
    #[allow(missing_docs)]
    Head {
        response: oneshot::Sender<(u64, Digest)>,
    },

    /// Shutdown actor; acknowledged once its storage handle is released
    #[allow(missing_docs)]
    Shutdown { done: oneshot::Sender<()> },
}

/// Actor that owns the chain head
pub struct AuditActor {
    /// Storage backend
    storage: Arc<Storage>,

    /// Mailbox for incoming messages
    mailbox: mpsc::Receiver<AuditMessage>,

    /// Sequence the next entry receives
    next_sequence: u64,

    /// Hash of the last persisted entry
    head_hash: Digest,

    metrics: Metrics,
}

impl AuditActor {
    /// Create actor, resuming from the last persisted entry
    pub fn new(
        storage: Arc<Storage>,
        mailbox: mpsc::Receiver<AuditMessage>,
        metrics: Metrics,
    ) -> Result<Self> {
        let (next_sequence, head_hash) = match storage.audit_head()? {
            Some(head) => (head.sequence + 1, head.entry_hash),
            None => (0, Digest::ZERO),
        };

        tracing::info!(next_sequence, head = %head_hash, "Audit chain resumed");

        Ok(Self {
            storage,
            mailbox,
            next_sequence,
            head_hash,
            metrics,
        })
    }

    /// Run the actor event loop
    pub async fn run(mut self) {
        let mut done = None;
        while let Some(msg) = self.mailbox.recv().await {
            match msg {
                AuditMessage::Append { record, response } => {
                    let result = self.append(record);
                    if let Err(e) = &result {
                        tracing::error!("Error appending audit entry: {}", e);
                    }
                    let _ = response.send(result);
                }

                AuditMessage::Head { response } => {
                    let _ = response.send((self.next_sequence, self.head_hash));
                }

                AuditMessage::Shutdown { done: ack } => {
                    done = Some(ack);
                    break;
                }
            }
        }

        tracing::info!(next_sequence = self.next_sequence, "Audit actor stopped");
        drop(self);
        if let Some(ack) = done {
            let _ = ack.send(());
        }
    }

    /// Link, persist, then advance the head
    fn append(&mut self, record: AuditRecord) -> Result<AuditEntry> {
        let entry = record.into_entry(self.next_sequence, self.head_hash)?;

        self.storage.put_audit_entry(&entry)?;

        self.next_sequence += 1;
        self.head_hash = entry.entry_hash;
        self.metrics.record_audit_entry();

        tracing::debug!(
            sequence = entry.sequence,
            operation = entry.operation_type.as_str(),
            entity_id = %entry.entity_id,
            "Audit entry appended"
        );

        Ok(entry)
    }
}

/// Handle for sending messages to the actor
#[derive(Clone)]
pub struct AuditHandle {
    sender: mpsc::Sender<AuditMessage>,
}

impl AuditHandle {
    /// Create new handle
    pub fn new(sender: mpsc::Sender<AuditMessage>) -> Self {
        Self { sender }
    }

    /// Append a record
    pub async fn append(&self, record: AuditRecord) -> Result<AuditEntry> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(AuditMessage::Append {
                record,
                response: tx,
            })
            .await
            .map_err(|_| Error::Concurrency("Audit mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Current `(next_sequence, head_hash)`
    pub async fn head(&self) -> Result<(u64, Digest)> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(AuditMessage::Head { response: tx })
            .await
            .map_err(|_| Error::Concurrency("Audit mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))
    }

    /// Shutdown actor and wait until it has stopped
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(AuditMessage::Shutdown { done: tx })
            .await
            .map_err(|_| Error::Concurrency("Audit mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))
    }
}

/// Spawn the audit actor
pub fn spawn_audit_actor(
    storage: Arc<Storage>,
    mailbox_capacity: usize,
    metrics: Metrics,
) -> Result<AuditHandle> {
    let (tx, rx) = mpsc::channel(mailbox_capacity); // Bounded channel for backpressure
    let actor = AuditActor::new(storage, rx, metrics)?;

    tokio::spawn(async move {
        actor.run().await;
    });

    Ok(AuditHandle::new(tx))
}
