use crate::events::{Event, EventBus};
use crate::executor::{JobError, JobHandler};
use crate::index::{IndexError, OperationIndex};
use crate::types::{
    AbortSignal, DeadLetter, DeadLetterCategory, DeadLetterLog, IndexEntry, Job, Operation,
    RemoteFilter,
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
#[error("reducer failed: {0}")]
pub struct ReducerError(pub String);

/// Applies an operation's action to materialized document state
///
/// The core treats document state as opaque; reducers live outside it.
#[async_trait]
pub trait OperationReducer: Send + Sync {
    async fn apply(&self, operation: &Operation) -> Result<(), ReducerError>;
}

/// Reducer that accepts everything; index-only deployments
pub struct NoopReducer;

#[async_trait]
impl OperationReducer for NoopReducer {
    async fn apply(&self, _operation: &Operation) -> Result<(), ReducerError> {
        Ok(())
    }
}

/// A collection plus the filter deciding which operations belong to it
#[derive(Debug, Clone)]
pub struct CollectionSpec {
    pub id: String,
    pub filter: RemoteFilter,
}

/// Registered collections, consulted on every write to decide membership
#[derive(Debug, Default)]
pub struct CollectionRegistry {
    specs: Mutex<Vec<CollectionSpec>>,
}

impl CollectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, spec: CollectionSpec) {
        let mut specs = self.specs.lock().unwrap();
        if specs.iter().any(|s| s.id == spec.id) {
            return;
        }
        specs.push(spec);
    }

    /// Collection ids whose filter matches the operation
    pub fn matching(&self, operation: &Operation) -> Vec<String> {
        self.specs
            .lock()
            .unwrap()
            .iter()
            .filter(|spec| spec.filter.matches(operation))
            .map(|spec| spec.id.clone())
            .collect()
    }
}

// Wait between divergence re-checks so concurrent commits can settle
const RESHUFFLE_BACKOFF: Duration = Duration::from_millis(10);

/// Job handler that applies one operation: reducer first, then an atomic
/// index commit, then an `OperationsWritten` event
///
/// Remote-sourced operations are checked for divergence before the write:
/// if more conflicting operations than `reshuffle_threshold` have landed
/// since the operation's timestamp, the write is re-attempted, and after
/// `reshuffle_max_attempts` the operation is dead-lettered instead of
/// retried further.
pub struct OperationWriter {
    index: Arc<dyn OperationIndex>,
    reducer: Arc<dyn OperationReducer>,
    events: Arc<EventBus>,
    collections: Arc<CollectionRegistry>,
    dead_letters: Arc<DeadLetterLog>,
    reshuffle_threshold: usize,
    reshuffle_max_attempts: u32,
}

impl OperationWriter {
    pub fn new(
        index: Arc<dyn OperationIndex>,
        reducer: Arc<dyn OperationReducer>,
        events: Arc<EventBus>,
        collections: Arc<CollectionRegistry>,
        dead_letters: Arc<DeadLetterLog>,
        reshuffle_threshold: usize,
        reshuffle_max_attempts: u32,
    ) -> Self {
        Self {
            index,
            reducer,
            events,
            collections,
            dead_letters,
            reshuffle_threshold,
            reshuffle_max_attempts,
        }
    }

    fn index_error(err: IndexError) -> JobError {
        match err {
            IndexError::Aborted => JobError::Aborted,
            other => JobError::Failed(other.to_string()),
        }
    }

    /// Rebase a remote operation against local history, giving up past
    /// `reshuffle_max_attempts`
    async fn reshuffle(&self, job: &Job, operation: &mut Operation) -> Result<(), JobError> {
        let mut attempts = 0u32;
        loop {
            let conflicts = self
                .index
                .conflicts_since(
                    &operation.document_id,
                    &operation.scope,
                    &operation.branch,
                    operation.timestamp_utc_ms,
                    self.reshuffle_threshold + 1,
                )
                .map_err(Self::index_error)?;

            if conflicts.len() <= self.reshuffle_threshold {
                // Slot the operation after whatever landed concurrently
                if let Some(last) = conflicts.last() {
                    if operation.index <= last.operation.index {
                        operation.index = last.operation.index + 1;
                    }
                }
                return Ok(());
            }

            attempts += 1;
            if attempts > self.reshuffle_max_attempts {
                let error = format!(
                    "document diverged by more than {} operations after {} reshuffle attempts",
                    self.reshuffle_threshold, self.reshuffle_max_attempts
                );
                self.dead_letters.add(DeadLetter {
                    document_id: job.document_id.clone(),
                    job_id: job.id.clone(),
                    branch: job.branch.clone(),
                    operation_count: 1,
                    error: error.clone(),
                    category: DeadLetterCategory::ExcessiveReshuffle,
                });
                return Err(JobError::Terminal(error));
            }

            debug!(
                "Reshuffle attempt {} for document {} on job {}",
                attempts, job.document_id, job.id
            );
            tokio::time::sleep(RESHUFFLE_BACKOFF).await;
        }
    }
}

#[async_trait]
impl JobHandler for OperationWriter {
    async fn run(&self, job: &Job, abort: AbortSignal) -> Result<(), JobError> {
        if abort.is_aborted() {
            return Err(JobError::Aborted);
        }

        self.reducer
            .apply(&job.operation)
            .await
            .map_err(|e| JobError::Failed(e.to_string()))?;

        let mut operation = job.operation.clone();
        if !job.source_remote.is_empty() {
            self.reshuffle(job, &mut operation).await?;
        }

        let member_of = self.collections.matching(&operation);
        let mut txn = self.index.begin();
        for collection_id in &member_of {
            txn.create_collection(collection_id);
        }
        txn.write(vec![operation.clone()], &job.source_remote);
        for collection_id in &member_of {
            txn.add_to_collection(collection_id, &operation.document_id);
        }

        let ordinals = self
            .index
            .commit(txn, &abort)
            .map_err(Self::index_error)?;

        let entries: Vec<IndexEntry> = ordinals
            .into_iter()
            .map(|ordinal| IndexEntry {
                ordinal,
                source_remote: job.source_remote.clone(),
                operation: operation.clone(),
            })
            .collect();

        if let Err(e) = self
            .events
            .emit(Event::OperationsWritten {
                entries,
                source_remote: job.source_remote.clone(),
            })
            .await
        {
            warn!("OperationsWritten listeners failed: {}", e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::index::SqliteIndex;
    use crate::types::test_support::test_operation;

    fn registry_with(id: &str, filter: RemoteFilter) -> Arc<CollectionRegistry> {
        let registry = Arc::new(CollectionRegistry::new());
        registry.register(CollectionSpec {
            id: id.to_string(),
            filter,
        });
        registry
    }

    fn writer(
        index: Arc<dyn OperationIndex>,
        collections: Arc<CollectionRegistry>,
        dead_letters: Arc<DeadLetterLog>,
        events: Arc<EventBus>,
        threshold: usize,
    ) -> OperationWriter {
        OperationWriter::new(
            index,
            Arc::new(NoopReducer),
            events,
            collections,
            dead_letters,
            threshold,
            2,
        )
    }

    fn open_index() -> (Arc<SqliteIndex>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let index =
            SqliteIndex::open(dir.path().join("index.db"), &StorageConfig::default()).unwrap();
        (Arc::new(index), dir)
    }

    #[test]
    fn test_registry_deduplicates_and_matches() {
        let registry = CollectionRegistry::new();
        registry.register(CollectionSpec {
            id: "remote.a".to_string(),
            filter: RemoteFilter::default(),
        });
        registry.register(CollectionSpec {
            id: "remote.a".to_string(),
            filter: RemoteFilter::default(),
        });
        registry.register(CollectionSpec {
            id: "remote.b".to_string(),
            filter: RemoteFilter {
                document_id: vec!["doc-2".to_string()],
                ..Default::default()
            },
        });

        let op = test_operation("doc-1", 0, 100);
        assert_eq!(registry.matching(&op), vec!["remote.a"]);
    }

    #[tokio::test]
    async fn test_write_commits_and_emits() {
        let (index, _dir) = open_index();
        let events = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_clone = Arc::clone(&seen);
        events.subscribe(crate::events::EventKind::OperationsWritten, move |event| {
            let seen = Arc::clone(&seen_clone);
            async move {
                if let Event::OperationsWritten { entries, .. } = event {
                    seen.lock()
                        .unwrap()
                        .extend(entries.into_iter().map(|e| e.ordinal));
                }
                Ok(())
            }
        });

        let writer = writer(
            Arc::clone(&index) as Arc<dyn OperationIndex>,
            registry_with("remote.peer", RemoteFilter::default()),
            Arc::new(DeadLetterLog::new()),
            events,
            1000,
        );

        let job = Job::for_operation(test_operation("doc-1", 0, 100), "", 3);
        writer.run(&job, AbortSignal::never()).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1]);
        let page = index
            .find("remote.peer", None, Default::default())
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].operation.document_id, "doc-1");
    }

    #[tokio::test]
    async fn test_excessive_divergence_dead_letters() {
        let (index, _dir) = open_index();
        let events = Arc::new(EventBus::new());
        let dead_letters = Arc::new(DeadLetterLog::new());
        let collections = registry_with("remote.peer", RemoteFilter::default());

        // Seed local history newer than the incoming operation
        let seed = writer(
            Arc::clone(&index) as Arc<dyn OperationIndex>,
            Arc::clone(&collections),
            Arc::clone(&dead_letters),
            Arc::clone(&events),
            0,
        );
        for i in 0..2 {
            let job = Job::for_operation(test_operation("doc-1", i, 500 + i as i64), "", 3);
            seed.run(&job, AbortSignal::never()).await.unwrap();
        }

        // Threshold 0 means any newer conflict is excessive
        let sink = writer(
            Arc::clone(&index) as Arc<dyn OperationIndex>,
            collections,
            Arc::clone(&dead_letters),
            events,
            0,
        );
        let stale = Job::for_operation(test_operation("doc-1", 0, 100), "peer", 3);
        let err = sink.run(&stale, AbortSignal::never()).await.unwrap_err();

        assert!(matches!(err, JobError::Terminal(_)));
        assert_eq!(dead_letters.len(), 1);
        assert_eq!(
            dead_letters.list()[0].category,
            DeadLetterCategory::ExcessiveReshuffle
        );
    }

    #[tokio::test]
    async fn test_remote_operation_rebases_behind_local_history() {
        let (index, _dir) = open_index();
        let events = Arc::new(EventBus::new());
        let collections = registry_with("remote.peer", RemoteFilter::default());
        let dead_letters = Arc::new(DeadLetterLog::new());

        let local = writer(
            Arc::clone(&index) as Arc<dyn OperationIndex>,
            Arc::clone(&collections),
            Arc::clone(&dead_letters),
            Arc::clone(&events),
            1000,
        );
        let job = Job::for_operation(test_operation("doc-1", 0, 500), "", 3);
        local.run(&job, AbortSignal::never()).await.unwrap();

        // Remote op at the same log position but older timestamp
        let remote_job = Job::for_operation(test_operation("doc-1", 0, 100), "peer", 3);
        local.run(&remote_job, AbortSignal::never()).await.unwrap();

        let page = index
            .find("remote.peer", None, Default::default())
            .unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[1].operation.index, 1);
        assert!(dead_letters.is_empty());
    }

    #[tokio::test]
    async fn test_aborted_before_start() {
        let (index, _dir) = open_index();
        let writer = writer(
            Arc::clone(&index) as Arc<dyn OperationIndex>,
            Arc::new(CollectionRegistry::new()),
            Arc::new(DeadLetterLog::new()),
            Arc::new(EventBus::new()),
            1000,
        );

        let (handle, signal) = crate::types::abort_pair();
        handle.abort();

        let job = Job::for_operation(test_operation("doc-1", 0, 100), "", 3);
        let err = writer.run(&job, signal).await.unwrap_err();
        assert!(matches!(err, JobError::Aborted));
    }
}
