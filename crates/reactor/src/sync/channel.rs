use crate::sync::mailbox::Mailbox;
use crate::types::{RemoteFilter, SyncEnvelope, SyncOperation};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Poll output: what the peer should apply, plus how far we have applied
/// the peer's own stream
pub struct PollOutcome {
    pub envelopes: Vec<SyncEnvelope>,
    pub ack_ordinal: u64,
}

/// Per-remote mailbox pair plus ack bookkeeping
///
/// `outbox` holds batches awaiting delivery to the peer; `inbox` holds
/// batches received from the peer until every job they produced settles.
/// `ack_ordinal` is the highest peer ordinal fully applied locally and
/// only ever advances.
pub struct SyncChannel {
    pub id: String,
    pub name: String,
    pub collection_id: String,
    pub filter: RemoteFilter,
    pub inbox: Mailbox<SyncOperation>,
    pub outbox: Mailbox<SyncOperation>,
    ack_ordinal: AtomicU64,
    received_latest: AtomicU64,
    push_failures: AtomicU32,
}

impl SyncChannel {
    pub fn new(id: String, name: String, collection_id: String, filter: RemoteFilter) -> Arc<Self> {
        Arc::new(Self {
            id,
            name,
            collection_id,
            filter,
            inbox: Mailbox::new(),
            outbox: Mailbox::new(),
            ack_ordinal: AtomicU64::new(0),
            received_latest: AtomicU64::new(0),
            push_failures: AtomicU32::new(0),
        })
    }

    /// Answer a peer's poll
    ///
    /// Drops outbox batches the peer has fully acknowledged, then returns
    /// the remaining batches it has not yet seen, ordered by the timestamp
    /// of their first operation.
    pub fn handle_poll(&self, outbox_ack: u64, outbox_latest: u64) -> PollOutcome {
        let acked: Vec<String> = self
            .outbox
            .items()
            .into_iter()
            .filter(|op| op.max_ordinal() <= outbox_ack)
            .map(|op| op.id)
            .collect();
        if !acked.is_empty() {
            debug!(
                "Channel {}: trimming {} acked outbox batches",
                self.id,
                acked.len()
            );
            self.outbox.remove(&acked);
        }

        let mut pending: Vec<SyncOperation> = self
            .outbox
            .items()
            .into_iter()
            .filter(|op| op.max_ordinal() > outbox_latest)
            .collect();
        pending.sort_by_key(|op| op.first_timestamp());

        PollOutcome {
            envelopes: pending.into_iter().map(|op| self.to_envelope(op)).collect(),
            ack_ordinal: self.ack_ordinal.load(Ordering::SeqCst),
        }
    }

    /// Wrap an outbox batch for the wire; the batch's job id becomes the
    /// envelope key so the peer can mirror our dependency graph
    pub fn to_envelope(&self, op: SyncOperation) -> SyncEnvelope {
        SyncEnvelope {
            key: op.job_id,
            depends_on: op.job_dependencies,
            channel_id: self.id.clone(),
            document_id: op.document_id,
            scopes: op.scopes,
            branch: op.branch,
            operations: op.operations,
        }
    }

    /// Raise the applied-ordinal watermark; never moves backwards
    pub fn advance_ack(&self, ordinal: u64) {
        self.ack_ordinal.fetch_max(ordinal, Ordering::SeqCst);
    }

    pub fn ack_ordinal(&self) -> u64 {
        self.ack_ordinal.load(Ordering::SeqCst)
    }

    /// Track the highest peer ordinal we have seen, applied or not
    pub fn note_received(&self, ordinal: u64) {
        self.received_latest.fetch_max(ordinal, Ordering::SeqCst);
    }

    pub fn received_latest(&self) -> u64 {
        self.received_latest.load(Ordering::SeqCst)
    }

    /// Count a failed push; returns the running total
    pub fn record_push_failure(&self) -> u32 {
        self.push_failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn reset_push_failures(&self) {
        self.push_failures.store(0, Ordering::SeqCst);
    }
}
