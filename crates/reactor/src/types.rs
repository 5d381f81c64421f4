use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{LazyLock, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;

/// Current wall-clock time as UTC epoch milliseconds
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// The mutation payload carried by an operation
///
/// `input` is an opaque JSON document interpreted by the external reducer
/// for the document type; the core never looks inside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    pub kind: String,
    pub input: serde_json::Value,
    pub timestamp_utc_ms: i64,
    pub scope: String,
}

/// One immutable, ordered mutation request against a document
///
/// `index` is the position within the document's per-scope log. `skip`
/// marks how many prior operations this one supersedes. `hash` is a
/// content digest used to detect divergence between replicas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    pub document_id: String,
    pub document_type: String,
    pub branch: String,
    pub scope: String,
    pub index: u64,
    pub skip: u64,
    pub timestamp_utc_ms: i64,
    pub hash: String,
    pub action: Action,
}

/// Durable record of one operation plus its assigned global ordinal
///
/// `source_remote` is empty for locally originated operations, otherwise
/// the name of the peer the operation arrived from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub ordinal: u64,
    pub source_remote: String,
    pub operation: Operation,
}

/// A unit of executor work wrapping exactly one operation
///
/// Mutated only by the executor (`retry_count`). `sync_op_id` ties jobs
/// that came in over sync back to the batch that produced them so terminal
/// failures stay traceable. `depends_on` names job ids that must settle
/// before this job may be dequeued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub document_id: String,
    pub scope: String,
    pub branch: String,
    pub operation: Operation,
    pub source_remote: String,
    pub created_at_ms: i64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub sync_op_id: Option<String>,
    pub depends_on: Vec<String>,
}

impl Job {
    /// Wrap an operation for execution; `source_remote` is empty for
    /// locally submitted operations.
    pub fn for_operation(operation: Operation, source_remote: &str, max_retries: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            document_id: operation.document_id.clone(),
            scope: operation.scope.clone(),
            branch: operation.branch.clone(),
            operation,
            source_remote: source_remote.to_string(),
            created_at_ms: now_ms(),
            retry_count: 0,
            max_retries,
            sync_op_id: None,
            depends_on: Vec::new(),
        }
    }
}

/// Terminal outcome of one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub success: bool,
    pub duration_ms: u64,
    pub completed_at_ms: i64,
    pub error: Option<String>,
}

/// One batch unit exchanged between reactors
///
/// `job_dependencies` lets a receiver defer applying a batch until the
/// batches named by `job_id` have been acknowledged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    pub id: String,
    pub job_id: String,
    pub job_dependencies: Vec<String>,
    pub remote_name: String,
    pub document_id: String,
    pub scopes: Vec<String>,
    pub branch: String,
    pub operations: Vec<IndexEntry>,
}

impl SyncOperation {
    /// Timestamp of the first contained operation, used for oldest-batch
    /// ordering. Empty batches sort first.
    pub fn first_timestamp(&self) -> i64 {
        self.operations
            .first()
            .map(|e| e.operation.timestamp_utc_ms)
            .unwrap_or(i64::MIN)
    }

    /// Highest contained ordinal, used for ack-based outbox trimming.
    pub fn max_ordinal(&self) -> u64 {
        self.operations.iter().map(|e| e.ordinal).max().unwrap_or(0)
    }
}

/// A batch of operations plus routing metadata, as sent on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEnvelope {
    pub key: String,
    pub depends_on: Vec<String>,
    pub channel_id: String,
    pub document_id: String,
    pub scopes: Vec<String>,
    pub branch: String,
    pub operations: Vec<IndexEntry>,
}

impl SyncEnvelope {
    pub fn first_timestamp(&self) -> i64 {
        self.operations
            .first()
            .map(|e| e.operation.timestamp_utc_ms)
            .unwrap_or(i64::MIN)
    }

    pub fn max_ordinal(&self) -> u64 {
        self.operations.iter().map(|e| e.ordinal).max().unwrap_or(0)
    }
}

/// Why an operation was permanently given up on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeadLetterCategory {
    ExcessiveReshuffle,
    JobRetryExhausted,
    RemotePushError,
    OutboxError,
    InboxError,
}

impl fmt::Display for DeadLetterCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeadLetterCategory::ExcessiveReshuffle => "excessive-reshuffle",
            DeadLetterCategory::JobRetryExhausted => "job-retry-exhausted",
            DeadLetterCategory::RemotePushError => "remote-push-error",
            DeadLetterCategory::OutboxError => "outbox-error",
            DeadLetterCategory::InboxError => "inbox-error",
        };
        write!(f, "{}", s)
    }
}

/// Terminal failure record requiring operator intervention
///
/// Never auto-retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub document_id: String,
    pub job_id: String,
    pub branch: String,
    pub operation_count: usize,
    pub error: String,
    pub category: DeadLetterCategory,
}

/// Append-only, shared list of dead letters
#[derive(Debug, Default)]
pub struct DeadLetterLog {
    entries: Mutex<Vec<DeadLetter>>,
}

impl DeadLetterLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, letter: DeadLetter) {
        tracing::warn!(
            "Dead letter for document={} job={} category={}: {}",
            letter.document_id,
            letter.job_id,
            letter.category,
            letter.error
        );
        self.entries.lock().unwrap().push(letter);
    }

    pub fn list(&self) -> Vec<DeadLetter> {
        self.entries.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Which operations a remote partner wants to see
///
/// An empty list (or empty branch string) matches everything on that axis.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RemoteFilter {
    pub document_id: Vec<String>,
    pub scope: Vec<String>,
    pub branch: String,
}

impl RemoteFilter {
    pub fn matches(&self, op: &Operation) -> bool {
        if !self.document_id.is_empty() && !self.document_id.contains(&op.document_id) {
            return false;
        }
        if !self.scope.is_empty() && !self.scope.contains(&op.scope) {
            return false;
        }
        if !self.branch.is_empty() && self.branch != op.branch {
            return false;
        }
        true
    }
}

/// Branch/scope narrowing for index reads
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewFilter {
    pub branch: Option<String>,
    pub scope: Option<String>,
}

/// Cursor-based page request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Paging {
    pub cursor: u64,
    pub limit: usize,
}

impl Default for Paging {
    fn default() -> Self {
        Self {
            cursor: 0,
            limit: 100,
        }
    }
}

/// One page of results plus the cursor for the next page, if any
#[derive(Debug, Clone, PartialEq)]
pub struct PagedResult<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<u64>,
}

/// Create a linked abort handle/signal pair
///
/// The handle side flips the signal exactly once; signals are cheap to
/// clone and hand to every task participating in the cancellable work.
pub fn abort_pair() -> (AbortHandle, AbortSignal) {
    let (tx, rx) = watch::channel(false);
    (AbortHandle { tx }, AbortSignal { rx })
}

#[derive(Debug)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

impl AbortHandle {
    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    /// A signal that can never fire
    pub fn never() -> Self {
        // One process-wide sender keeps the channel open for every clone
        static NEVER: LazyLock<watch::Sender<bool>> = LazyLock::new(|| watch::channel(false).0);
        Self {
            rx: NEVER.subscribe(),
        }
    }

    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when the handle fires. Pends forever on a dropped handle.
    pub async fn aborted(&mut self) {
        if self.rx.wait_for(|aborted| *aborted).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
