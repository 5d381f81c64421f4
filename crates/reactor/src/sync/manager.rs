use crate::config::SyncConfig;
use crate::events::{Event, EventBus, EventKind, FailureKind, SubscriptionId};
use crate::index::{IndexError, OperationIndex};
use crate::queue::JobQueue;
use crate::sync::channel::{PollOutcome, SyncChannel};
use crate::sync::utils::{batch_operations_by_document, filter_operations};
use crate::transport::client::SyncClient;
use crate::transport::TransportError;
use crate::types::{
    AbortSignal, DeadLetter, DeadLetterCategory, DeadLetterLog, IndexEntry, Job, Paging,
    RemoteFilter, SyncEnvelope, SyncOperation,
};
use crate::writer::{CollectionRegistry, CollectionSpec};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("remote '{0}' is already registered")]
    DuplicateRemote(String),
    #[error("unknown remote '{0}'")]
    UnknownRemote(String),
    #[error("unknown channel '{0}'")]
    UnknownChannel(String),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A registered sync partner
///
/// `address` is present for remotes this node initiates traffic to; a
/// passive remote (created by an inbound touch) has none and is driven
/// entirely by the peer's polls and pushes.
pub struct Remote {
    pub name: String,
    pub address: Option<String>,
    pub channel: Arc<SyncChannel>,
}

/// Jobs still outstanding for one received batch
struct InboundTracking {
    remote_name: String,
    /// Envelope key; other batches may name it as a dependency
    batch_key: String,
    document_id: String,
    branch: String,
    operation_count: usize,
    max_ordinal: u64,
    outstanding: HashSet<String>,
    failed: Option<FailedJob>,
}

/// First failure recorded for a batch
struct FailedJob {
    job_id: String,
    error: String,
    /// The handler already dead-lettered this failure at its source
    already_lettered: bool,
}

/// Fans committed operations out to remote outboxes and turns received
/// envelopes into local jobs
///
/// A batch received from a peer is acknowledged only once every job it
/// produced has settled; any terminal job failure dead-letters the whole
/// batch instead of acknowledging it.
pub struct SyncManager {
    node_name: String,
    config: SyncConfig,
    index: Arc<dyn OperationIndex>,
    queue: Arc<JobQueue>,
    events: Arc<EventBus>,
    dead_letters: Arc<DeadLetterLog>,
    collections: Arc<CollectionRegistry>,
    max_retries: u32,
    remotes: RwLock<HashMap<String, Arc<Remote>>>,
    /// Channel id to remote name; carries aliases picked up from
    /// re-touches so either side's channel id resolves
    channels: RwLock<HashMap<String, String>>,
    inbound: Mutex<HashMap<String, InboundTracking>>,
    job_to_sync_op: Mutex<HashMap<String, String>>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    shutdown: AtomicBool,
}

impl SyncManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_name: String,
        config: SyncConfig,
        index: Arc<dyn OperationIndex>,
        queue: Arc<JobQueue>,
        events: Arc<EventBus>,
        dead_letters: Arc<DeadLetterLog>,
        collections: Arc<CollectionRegistry>,
        max_retries: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_name,
            config,
            index,
            queue,
            events,
            dead_letters,
            collections,
            max_retries,
            remotes: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
            inbound: Mutex::new(HashMap::new()),
            job_to_sync_op: Mutex::new(HashMap::new()),
            pumps: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Subscribe to write and job-settlement events
    pub fn start(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let written = self
            .events
            .subscribe(EventKind::OperationsWritten, move |event| {
                let manager = Arc::clone(&manager);
                async move {
                    if let Event::OperationsWritten {
                        entries,
                        source_remote,
                    } = event
                    {
                        manager.handle_operations_written(entries, &source_remote);
                    }
                    Ok(())
                }
            });

        let manager = Arc::clone(self);
        let completed = self
            .events
            .subscribe(EventKind::JobCompleted, move |event| {
                let manager = Arc::clone(&manager);
                async move {
                    if let Event::JobCompleted { result } = event {
                        manager.handle_job_settled(&result.job_id, true, "", false);
                    }
                    Ok(())
                }
            });

        let manager = Arc::clone(self);
        let failed = self.events.subscribe(EventKind::JobFailed, move |event| {
            let manager = Arc::clone(&manager);
            async move {
                if let Event::JobFailed {
                    job_id,
                    error,
                    will_retry: false,
                    kind,
                } = event
                {
                    // An abort is a shutdown, not a verdict on the batch;
                    // the batch stays in the inbox for the next run
                    if kind != FailureKind::Aborted {
                        manager.handle_job_settled(
                            &job_id,
                            false,
                            &error,
                            kind == FailureKind::Terminal,
                        );
                    }
                }
                Ok(())
            }
        });

        let mut subs = self.subscriptions.lock().unwrap();
        subs.push(written);
        subs.push(completed);
        subs.push(failed);
        info!("Sync manager started on node '{}'", self.node_name);
    }

    /// Register a remote this node actively syncs with
    ///
    /// Creates the remote's collection, backfills membership and outbox
    /// from existing index history, touches the peer, and starts the push
    /// and poll pumps.
    pub async fn add_remote(
        self: &Arc<Self>,
        name: &str,
        address: &str,
        filter: RemoteFilter,
    ) -> Result<(), ChannelError> {
        // A passive remote created by an inbound touch is upgraded in
        // place, reusing its channel id so both directions share one
        // channel; an already-active remote is a caller error
        let existing = self.remotes.read().unwrap().get(name).cloned();
        let (remote, fresh) = match existing {
            Some(remote) if remote.address.is_some() => {
                return Err(ChannelError::DuplicateRemote(name.to_string()));
            }
            Some(passive) => {
                let upgraded = Arc::new(Remote {
                    name: passive.name.clone(),
                    address: Some(address.to_string()),
                    channel: Arc::clone(&passive.channel),
                });
                self.remotes
                    .write()
                    .unwrap()
                    .insert(name.to_string(), Arc::clone(&upgraded));
                (upgraded, false)
            }
            None => {
                let channel_id = uuid::Uuid::new_v4().to_string();
                let remote = self.register_remote(
                    name,
                    Some(address.to_string()),
                    channel_id,
                    filter.clone(),
                )?;
                (remote, true)
            }
        };

        // How far we have applied the peer's stream; the peer trims its
        // backfill to what we are missing
        let since = self.index.latest_timestamp_from(name)?.unwrap_or(0);
        let client = SyncClient::new(address.to_string());
        let peer_since = client
            .touch_channel(&remote.channel.id, &self.node_name, &filter, since)
            .await?;

        // A passive remote's outbox was already seeded when the peer
        // touched us; seeding it again would duplicate batches
        if fresh {
            self.backfill_outbox(&remote.channel, peer_since);
        }

        self.spawn_pumps(Arc::clone(&remote));
        info!("Added remote '{}' at {}", name, address);
        Ok(())
    }

    /// Handle an inbound touch: create a passive remote on first contact,
    /// otherwise confirm the existing channel and clear its failure count
    ///
    /// `since` is the toucher's watermark of our stream; backfill skips
    /// everything it already holds. Returns our watermark of the
    /// toucher's stream in exchange.
    pub fn touch_channel(
        self: &Arc<Self>,
        channel_id: &str,
        peer_name: &str,
        filter: RemoteFilter,
        since: i64,
    ) -> Result<i64, ChannelError> {
        let known = self.remotes.read().unwrap().contains_key(peer_name);
        if known {
            let remote = self.remote(peer_name).ok_or_else(|| {
                ChannelError::UnknownRemote(peer_name.to_string())
            })?;
            remote.channel.reset_push_failures();
            self.channels
                .write()
                .unwrap()
                .insert(channel_id.to_string(), peer_name.to_string());
            debug!("Re-touched channel {} for '{}'", channel_id, peer_name);
        } else {
            let remote =
                self.register_remote(peer_name, None, channel_id.to_string(), filter)?;
            self.backfill_outbox(&remote.channel, since);
            info!("Touched into passive remote '{}'", peer_name);
        }

        Ok(self.index.latest_timestamp_from(peer_name)?.unwrap_or(0))
    }

    /// Shared registration path for active and passive remotes
    fn register_remote(
        self: &Arc<Self>,
        name: &str,
        address: Option<String>,
        channel_id: String,
        filter: RemoteFilter,
    ) -> Result<Arc<Remote>, ChannelError> {
        let collection_id = format!("remote.{}", name);
        let channel = SyncChannel::new(
            channel_id,
            name.to_string(),
            collection_id.clone(),
            filter.clone(),
        );

        // Future writes join the collection through the writer
        self.collections.register(CollectionSpec {
            id: collection_id.clone(),
            filter: filter.clone(),
        });

        // Existing documents join it now
        let mut txn = self.index.begin();
        txn.create_collection(&collection_id);
        for document_id in self.index.document_ids()? {
            if filter.document_id.is_empty() || filter.document_id.contains(&document_id) {
                txn.add_to_collection(&collection_id, &document_id);
            }
        }
        self.index.commit(txn, &AbortSignal::never())?;

        let remote = Arc::new(Remote {
            name: name.to_string(),
            address,
            channel,
        });
        self.remotes
            .write()
            .unwrap()
            .insert(name.to_string(), Arc::clone(&remote));
        self.channels
            .write()
            .unwrap()
            .insert(remote.channel.id.clone(), name.to_string());
        Ok(remote)
    }

    /// Seed a fresh channel's outbox with collection history newer than
    /// `since`, the peer's watermark of our stream
    ///
    /// A failure here dead-letters as an outbox error instead of failing
    /// the registration; live traffic still flows through the channel.
    fn backfill_outbox(&self, channel: &SyncChannel, since: i64) {
        if let Err(e) = self.stage_history(channel, since) {
            warn!("Backfill for remote '{}' failed: {}", channel.name, e);
            self.dead_letters.add(DeadLetter {
                document_id: String::new(),
                job_id: String::new(),
                branch: String::new(),
                operation_count: 0,
                error: format!("backfill for remote '{}' failed: {}", channel.name, e),
                category: DeadLetterCategory::OutboxError,
            });
        }
    }

    fn stage_history(&self, channel: &SyncChannel, since: i64) -> Result<(), ChannelError> {
        let mut paging = Paging::default();
        loop {
            let page = self.index.find(&channel.collection_id, None, paging)?;
            let next_cursor = page.next_cursor;
            let mut filtered = filter_operations(page.items, &channel.filter);
            // Skip what the peer already holds, and never echo its own
            // operations back at it
            filtered.retain(|entry| {
                entry.operation.timestamp_utc_ms > since && entry.source_remote != channel.name
            });
            if !filtered.is_empty() {
                channel
                    .outbox
                    .add(self.batches_to_sync_ops(filtered, &channel.name));
            }
            match next_cursor {
                Some(cursor) => paging.cursor = cursor,
                None => break,
            }
        }
        Ok(())
    }

    /// Fan a committed write out to every remote except where it came from
    fn handle_operations_written(&self, entries: Vec<IndexEntry>, source_remote: &str) {
        let remotes: Vec<Arc<Remote>> = self.remotes.read().unwrap().values().cloned().collect();

        for remote in remotes {
            if remote.name == source_remote {
                continue;
            }
            let filtered = filter_operations(entries.clone(), &remote.channel.filter);
            if filtered.is_empty() {
                continue;
            }
            let sync_ops = self.batches_to_sync_ops(filtered, &remote.name);
            debug!(
                "Queuing {} outbound batch(es) for remote '{}'",
                sync_ops.len(),
                remote.name
            );
            remote.channel.outbox.add(sync_ops);
        }
    }

    /// Split entries into per-document batches, chaining batches of the
    /// same document so receivers can preserve intra-document order
    fn batches_to_sync_ops(&self, entries: Vec<IndexEntry>, remote_name: &str) -> Vec<SyncOperation> {
        let mut last_job_for_document: HashMap<String, String> = HashMap::new();
        batch_operations_by_document(entries)
            .into_iter()
            .map(|batch| {
                let job_id = uuid::Uuid::new_v4().to_string();
                let depends_on = last_job_for_document
                    .insert(batch.document_id.clone(), job_id.clone())
                    .map(|prev| vec![prev])
                    .unwrap_or_default();
                SyncOperation {
                    id: uuid::Uuid::new_v4().to_string(),
                    job_id,
                    job_dependencies: depends_on,
                    remote_name: remote_name.to_string(),
                    document_id: batch.document_id,
                    scopes: vec![batch.scope],
                    branch: batch.branch,
                    operations: batch.operations,
                }
            })
            .collect()
    }

    /// Answer a peer's poll on one of our channels
    pub fn handle_poll(
        &self,
        channel_id: &str,
        outbox_ack: u64,
        outbox_latest: u64,
    ) -> Result<PollOutcome, ChannelError> {
        let remote = self.remote_by_channel(channel_id)?;
        Ok(remote.channel.handle_poll(outbox_ack, outbox_latest))
    }

    /// Turn pushed envelopes into inbox entries and queued jobs
    ///
    /// Dependencies naming a key absent from this push are dropped rather
    /// than left dangling. The batch stays in the inbox until every job it
    /// produced settles.
    pub async fn accept_envelopes(
        &self,
        channel_id: &str,
        mut envelopes: Vec<SyncEnvelope>,
    ) -> Result<(), ChannelError> {
        let remote = self.remote_by_channel(channel_id)?;
        envelopes.sort_by_key(|e| e.first_timestamp());

        let present_keys: HashSet<String> = envelopes.iter().map(|e| e.key.clone()).collect();
        let mut jobs: Vec<Job> = Vec::new();

        for envelope in envelopes {
            remote.channel.note_received(envelope.max_ordinal());
            let max_ordinal = envelope.max_ordinal();
            let depends_on: Vec<String> = envelope
                .depends_on
                .into_iter()
                .filter(|key| present_keys.contains(key))
                .collect();

            for batch in batch_operations_by_document(envelope.operations) {
                let sync_op = SyncOperation {
                    id: uuid::Uuid::new_v4().to_string(),
                    job_id: envelope.key.clone(),
                    job_dependencies: depends_on.clone(),
                    remote_name: remote.name.clone(),
                    document_id: batch.document_id.clone(),
                    scopes: vec![batch.scope.clone()],
                    branch: batch.branch.clone(),
                    operations: batch.operations.clone(),
                };

                let mut batch_jobs = Vec::new();
                for entry in batch.operations {
                    let mut job =
                        Job::for_operation(entry.operation, &remote.name, self.max_retries);
                    job.sync_op_id = Some(sync_op.id.clone());
                    // The queue defers these jobs until every named batch
                    // key has settled
                    job.depends_on = depends_on.clone();
                    batch_jobs.push(job);
                }

                {
                    let mut inbound = self.inbound.lock().unwrap();
                    let mut job_map = self.job_to_sync_op.lock().unwrap();
                    for job in &batch_jobs {
                        job_map.insert(job.id.clone(), sync_op.id.clone());
                    }
                    inbound.insert(
                        sync_op.id.clone(),
                        InboundTracking {
                            remote_name: remote.name.clone(),
                            batch_key: envelope.key.clone(),
                            document_id: batch.document_id.clone(),
                            branch: batch.branch.clone(),
                            operation_count: batch_jobs.len(),
                            max_ordinal,
                            outstanding: batch_jobs.iter().map(|j| j.id.clone()).collect(),
                            failed: None,
                        },
                    );
                }

                remote.channel.inbox.add(vec![sync_op]);
                jobs.extend(batch_jobs);
            }
        }

        for job in jobs {
            self.queue.enqueue(job).await;
        }
        Ok(())
    }

    /// Settle one job against its originating batch; the last settlement
    /// acknowledges or dead-letters the whole batch
    ///
    /// `already_lettered` marks failures the handler dead-lettered at the
    /// source, so the batch is dropped without a second letter.
    fn handle_job_settled(&self, job_id: &str, success: bool, error: &str, already_lettered: bool) {
        let sync_op_id = match self.job_to_sync_op.lock().unwrap().remove(job_id) {
            Some(id) => id,
            None => return, // locally originated job
        };

        let done = {
            let mut inbound = self.inbound.lock().unwrap();
            let tracking = match inbound.get_mut(&sync_op_id) {
                Some(t) => t,
                None => return,
            };
            tracking.outstanding.remove(job_id);
            if !success && tracking.failed.is_none() {
                tracking.failed = Some(FailedJob {
                    job_id: job_id.to_string(),
                    error: error.to_string(),
                    already_lettered,
                });
            }
            if tracking.outstanding.is_empty() {
                inbound.remove(&sync_op_id)
            } else {
                None
            }
        };

        let Some(tracking) = done else { return };

        // Batches that depend on this one become runnable either way; a
        // dead batch must not wedge the work queued behind it
        self.queue.mark_settled(&tracking.batch_key);

        let Some(remote) = self.remotes.read().unwrap().get(&tracking.remote_name).cloned()
        else {
            return;
        };

        match tracking.failed {
            None => {
                remote.channel.advance_ack(tracking.max_ordinal);
                remote.channel.inbox.remove(&[sync_op_id]);
            }
            Some(failed) => {
                if !failed.already_lettered {
                    self.dead_letters.add(DeadLetter {
                        document_id: tracking.document_id,
                        job_id: failed.job_id,
                        branch: tracking.branch,
                        operation_count: tracking.operation_count,
                        error: failed.error,
                        category: DeadLetterCategory::InboxError,
                    });
                }
                remote.channel.inbox.remove(&[sync_op_id]);
            }
        }
    }

    fn spawn_pumps(self: &Arc<Self>, remote: Arc<Remote>) {
        let manager = Arc::clone(self);
        let push_remote = Arc::clone(&remote);
        let push = tokio::spawn(async move {
            manager.push_pump(push_remote).await;
        });

        let manager = Arc::clone(self);
        let poll = tokio::spawn(async move {
            manager.poll_pump(remote).await;
        });

        let mut pumps = self.pumps.lock().unwrap();
        pumps.push(push);
        pumps.push(poll);
    }

    /// Periodically push pending outbox batches to the peer
    async fn push_pump(&self, remote: Arc<Remote>) {
        let Some(address) = remote.address.clone() else {
            return;
        };
        let client = SyncClient::new(address);
        let interval = Duration::from_millis(self.config.push_interval_ms);

        while self.pump_alive(&remote.name) {
            tokio::time::sleep(interval).await;

            let mut pending = remote.channel.outbox.items();
            if pending.is_empty() {
                continue;
            }
            pending.sort_by_key(|op| op.first_timestamp());
            let ids: Vec<String> = pending.iter().map(|op| op.id.clone()).collect();
            let envelopes: Vec<SyncEnvelope> = pending
                .iter()
                .cloned()
                .map(|op| remote.channel.to_envelope(op))
                .collect();

            match client
                .push_sync_envelopes(&remote.channel.id, envelopes)
                .await
            {
                Ok(()) => {
                    remote.channel.outbox.remove(&ids);
                    remote.channel.reset_push_failures();
                }
                Err(e) => {
                    let failures = remote.channel.record_push_failure();
                    warn!(
                        "Push to '{}' failed ({}/{}): {}",
                        remote.name, failures, self.config.push_max_failures, e
                    );
                    if failures >= self.config.push_max_failures {
                        for op in pending {
                            self.dead_letters.add(DeadLetter {
                                document_id: op.document_id.clone(),
                                job_id: op.job_id.clone(),
                                branch: op.branch.clone(),
                                operation_count: op.operations.len(),
                                error: e.to_string(),
                                category: DeadLetterCategory::RemotePushError,
                            });
                        }
                        remote.channel.outbox.remove(&ids);
                        remote.channel.reset_push_failures();
                    }
                }
            }
        }
    }

    /// Periodically poll the peer for its pending batches
    async fn poll_pump(&self, remote: Arc<Remote>) {
        let Some(address) = remote.address.clone() else {
            return;
        };
        let client = SyncClient::new(address);
        let interval = Duration::from_millis(self.config.poll_interval_ms);

        while self.pump_alive(&remote.name) {
            tokio::time::sleep(interval).await;

            let response = client
                .poll_sync_envelopes(
                    &remote.channel.id,
                    remote.channel.ack_ordinal(),
                    remote.channel.received_latest(),
                )
                .await;

            match response {
                Ok(poll) => {
                    // The peer's ack covers our stream; trim our outbox
                    let acked: Vec<String> = remote
                        .channel
                        .outbox
                        .items()
                        .into_iter()
                        .filter(|op| op.max_ordinal() <= poll.ack_ordinal)
                        .map(|op| op.id)
                        .collect();
                    if !acked.is_empty() {
                        remote.channel.outbox.remove(&acked);
                    }
                    if !poll.envelopes.is_empty() {
                        if let Err(e) = self
                            .accept_envelopes(&remote.channel.id, poll.envelopes)
                            .await
                        {
                            warn!("Failed to accept poll from '{}': {}", remote.name, e);
                        }
                    }
                }
                Err(e) => {
                    debug!("Poll of '{}' failed: {}", remote.name, e);
                }
            }
        }
    }

    fn pump_alive(&self, remote_name: &str) -> bool {
        !self.shutdown.load(Ordering::SeqCst)
            && self.remotes.read().unwrap().contains_key(remote_name)
    }

    fn remote_by_channel(&self, channel_id: &str) -> Result<Arc<Remote>, ChannelError> {
        let name = self
            .channels
            .read()
            .unwrap()
            .get(channel_id)
            .cloned()
            .ok_or_else(|| ChannelError::UnknownChannel(channel_id.to_string()))?;
        self.remotes
            .read()
            .unwrap()
            .get(&name)
            .cloned()
            .ok_or_else(|| ChannelError::UnknownChannel(channel_id.to_string()))
    }

    pub fn remote(&self, name: &str) -> Option<Arc<Remote>> {
        self.remotes.read().unwrap().get(name).cloned()
    }

    pub fn list_remotes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.remotes.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn remove_remote(&self, name: &str) -> Result<(), ChannelError> {
        match self.remotes.write().unwrap().remove(name) {
            Some(_) => {
                self.channels
                    .write()
                    .unwrap()
                    .retain(|_, remote_name| remote_name != name);
                info!("Removed remote '{}'", name);
                Ok(())
            }
            None => Err(ChannelError::UnknownRemote(name.to_string())),
        }
    }

    /// Stop pumps and drop event subscriptions
    pub async fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for sub in self.subscriptions.lock().unwrap().drain(..) {
            self.events.unsubscribe(sub);
        }
        let pumps: Vec<JoinHandle<()>> = self.pumps.lock().unwrap().drain(..).collect();
        for pump in pumps {
            pump.abort();
        }
        info!("Sync manager stopped");
    }
}
