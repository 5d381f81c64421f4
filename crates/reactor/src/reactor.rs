use crate::config::Config;
use crate::events::{Event, EventBus, EventKind, HandlerError, SubscriptionId};
use crate::executor::{ExecutorError, ExecutorStats, ExecutorStatus, JobExecutor};
use crate::index::{IndexError, OperationIndex, SqliteIndex};
use crate::queue::JobQueue;
use crate::sync::{ChannelError, SyncManager};
use crate::transport::{SyncListener, SyncService};
use crate::types::{
    DeadLetter, DeadLetterLog, IndexEntry, Job, Operation, PagedResult, Paging, RemoteFilter,
    ViewFilter,
};
use crate::writer::{CollectionRegistry, OperationReducer, OperationWriter};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum ReactorError {
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where a submitted operation currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

/// Owns and wires every subsystem: event bus, queue, executor, index,
/// writer, sync manager, and the sync listener
///
/// All cross-subsystem state hangs off this struct; two reactors in one
/// process share nothing.
pub struct Reactor {
    config: Config,
    events: Arc<EventBus>,
    queue: Arc<JobQueue>,
    executor: Arc<JobExecutor>,
    index: Arc<SqliteIndex>,
    sync: Arc<SyncManager>,
    dead_letters: Arc<DeadLetterLog>,
    statuses: Arc<Mutex<HashMap<String, JobStatus>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    status_subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl Reactor {
    pub fn new(
        config: Config,
        reducer: Arc<dyn OperationReducer>,
    ) -> Result<Arc<Self>, ReactorError> {
        let events = Arc::new(EventBus::new());
        let dead_letters = Arc::new(DeadLetterLog::new());
        let queue = Arc::new(JobQueue::new(Arc::clone(&events)));
        let index = Arc::new(SqliteIndex::open(&config.server.db_path, &config.storage)?);
        let collections = Arc::new(CollectionRegistry::new());

        let writer = OperationWriter::new(
            Arc::clone(&index) as Arc<dyn OperationIndex>,
            reducer,
            Arc::clone(&events),
            Arc::clone(&collections),
            Arc::clone(&dead_letters),
            config.sync.reshuffle_threshold,
            config.sync.reshuffle_max_attempts,
        );

        let executor = Arc::new(JobExecutor::new(
            config.executor.clone(),
            Arc::clone(&queue),
            Arc::clone(&events),
            Arc::new(writer),
            Arc::clone(&dead_letters),
        ));

        let sync = SyncManager::new(
            config.server.node_name.clone(),
            config.sync.clone(),
            Arc::clone(&index) as Arc<dyn OperationIndex>,
            Arc::clone(&queue),
            Arc::clone(&events),
            Arc::clone(&dead_letters),
            collections,
            config.executor.max_retries,
        );

        let reactor = Arc::new(Self {
            config,
            events,
            queue,
            executor,
            index,
            sync,
            dead_letters,
            statuses: Arc::new(Mutex::new(HashMap::new())),
            listener: Mutex::new(None),
            status_subscriptions: Mutex::new(Vec::new()),
        });
        reactor.track_statuses();
        Ok(reactor)
    }

    /// Keep the per-job status map current from lifecycle events
    fn track_statuses(self: &Arc<Self>) {
        let statuses = Arc::clone(&self.statuses);
        let started = self.events.subscribe(EventKind::JobStarted, move |event| {
            let statuses = Arc::clone(&statuses);
            async move {
                if let Event::JobStarted { job_id } = event {
                    statuses.lock().unwrap().insert(job_id, JobStatus::Running);
                }
                Ok(())
            }
        });

        let statuses = Arc::clone(&self.statuses);
        let completed = self
            .events
            .subscribe(EventKind::JobCompleted, move |event| {
                let statuses = Arc::clone(&statuses);
                async move {
                    if let Event::JobCompleted { result } = event {
                        statuses
                            .lock()
                            .unwrap()
                            .insert(result.job_id, JobStatus::Completed);
                    }
                    Ok(())
                }
            });

        let statuses = Arc::clone(&self.statuses);
        let failed = self.events.subscribe(EventKind::JobFailed, move |event| {
            let statuses = Arc::clone(&statuses);
            async move {
                if let Event::JobFailed {
                    job_id,
                    will_retry: false,
                    ..
                } = event
                {
                    statuses.lock().unwrap().insert(job_id, JobStatus::Failed);
                }
                Ok(())
            }
        });

        let mut subs = self.status_subscriptions.lock().unwrap();
        subs.push(started);
        subs.push(completed);
        subs.push(failed);
    }

    /// Start the executor, sync manager, and sync listener
    pub async fn start(self: &Arc<Self>) -> Result<(), ReactorError> {
        self.executor.start().await?;
        self.sync.start();

        let service = Arc::new(SyncService::new(Arc::clone(&self.sync)));
        let bind_addr = self.config.server.sync_addr.clone();
        let handle = tokio::spawn(async move {
            let listener = SyncListener::new(service);
            if let Err(e) = listener.run(&bind_addr).await {
                error!("Sync listener failed: {}", e);
            }
        });
        *self.listener.lock().unwrap() = Some(handle);

        info!(
            "Reactor '{}' started, syncing on {}",
            self.config.server.node_name, self.config.server.sync_addr
        );
        Ok(())
    }

    /// Stop everything; graceful waits for in-flight jobs to finish
    pub async fn stop(&self, graceful: bool) {
        if let Some(handle) = self.listener.lock().unwrap().take() {
            handle.abort();
        }
        self.sync.stop().await;
        self.executor.stop(graceful).await;
        for sub in self.status_subscriptions.lock().unwrap().drain(..) {
            self.events.unsubscribe(sub);
        }
        info!("Reactor '{}' stopped", self.config.server.node_name);
    }

    /// Submit a local operation for execution; returns the job id
    pub async fn enqueue_operation(&self, operation: Operation) -> String {
        let job = Job::for_operation(operation, "", self.config.executor.max_retries);
        let job_id = job.id.clone();
        self.statuses
            .lock()
            .unwrap()
            .insert(job_id.clone(), JobStatus::Queued);
        self.queue.enqueue(job).await;
        job_id
    }

    pub fn job_status(&self, job_id: &str) -> Option<JobStatus> {
        self.statuses.lock().unwrap().get(job_id).copied()
    }

    pub fn subscribe<F, Fut>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.events.subscribe(kind, handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.events.unsubscribe(id);
    }

    pub async fn add_remote(
        &self,
        name: &str,
        address: &str,
        filter: RemoteFilter,
    ) -> Result<(), ReactorError> {
        self.sync.add_remote(name, address, filter).await?;
        Ok(())
    }

    pub fn remove_remote(&self, name: &str) -> Result<(), ReactorError> {
        self.sync.remove_remote(name)?;
        Ok(())
    }

    pub fn find(
        &self,
        collection_id: &str,
        view: Option<&ViewFilter>,
        paging: Paging,
    ) -> Result<PagedResult<IndexEntry>, ReactorError> {
        Ok(self.index.find(collection_id, view, paging)?)
    }

    pub fn latest_timestamp(&self, collection_id: &str) -> Result<Option<i64>, ReactorError> {
        Ok(self.index.latest_timestamp(collection_id)?)
    }

    pub fn executor_status(&self) -> ExecutorStatus {
        self.executor.status()
    }

    pub fn executor_stats(&self) -> ExecutorStats {
        self.executor.stats()
    }

    pub fn pause_executor(&self) {
        self.executor.pause();
    }

    pub fn resume_executor(&self) {
        self.executor.resume();
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.list()
    }

    pub fn queue_size(&self) -> usize {
        self.queue.total_size()
    }

    pub fn node_name(&self) -> &str {
        &self.config.server.node_name
    }
}
