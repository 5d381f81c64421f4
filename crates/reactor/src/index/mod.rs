mod sqlite;

pub use sqlite::SqliteIndex;

use crate::types::{AbortSignal, IndexEntry, Operation, PagedResult, Paging, ViewFilter};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("operation aborted")]
    Aborted,
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("invalid action payload: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Debug)]
struct StagedMembership {
    collection_id: String,
    document_id: String,
    /// Position in the staged operation list whose assigned ordinal
    /// becomes this row's `joined_ordinal`; 0 when nothing was staged yet
    op_position: usize,
}

#[derive(Debug)]
struct StagedOperation {
    operation: Operation,
    source_remote: String,
}

/// In-memory staging for one atomic index commit
///
/// Nothing touches the backend until `commit`. Independent transactions
/// share no state.
#[derive(Debug, Default)]
pub struct IndexTransaction {
    collections: Vec<String>,
    memberships: Vec<StagedMembership>,
    operations: Vec<StagedOperation>,
}

impl IndexTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a collection for creation. Committing an already existing
    /// collection is a no-op, not an error.
    pub fn create_collection(&mut self, collection_id: &str) {
        self.collections.push(collection_id.to_string());
    }

    /// Queue a membership row tying `document_id` to the collection as of
    /// the most recently staged operation
    pub fn add_to_collection(&mut self, collection_id: &str, document_id: &str) {
        self.memberships.push(StagedMembership {
            collection_id: collection_id.to_string(),
            document_id: document_id.to_string(),
            op_position: self.operations.len().saturating_sub(1),
        });
    }

    /// Queue operations for insertion; ordinals are assigned at commit
    pub fn write(&mut self, operations: Vec<Operation>, source_remote: &str) {
        for operation in operations {
            self.operations.push(StagedOperation {
                operation,
                source_remote: source_remote.to_string(),
            });
        }
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty() && self.memberships.is_empty() && self.operations.is_empty()
    }

    pub fn operation_count(&self) -> usize {
        self.operations.len()
    }
}

/// Transactional store of operations grouped into collections
///
/// The backend transaction inside `commit` is the sole authority for
/// ordinal assignment; no ordinal is ever computed outside a commit.
pub trait OperationIndex: Send + Sync {
    fn begin(&self) -> IndexTransaction {
        IndexTransaction::new()
    }

    /// Atomically persist everything staged; returns the assigned ordinals
    /// in staging order. Checks `abort` before opening the backend
    /// transaction and fails fast with `IndexError::Aborted`.
    fn commit(&self, txn: IndexTransaction, abort: &AbortSignal) -> Result<Vec<u64>, IndexError>;

    /// Page through a collection's operations in ascending ordinal order,
    /// starting after `paging.cursor`; `next_cursor` is present only when
    /// rows remain beyond the page
    fn find(
        &self,
        collection_id: &str,
        view: Option<&ViewFilter>,
        paging: Paging,
    ) -> Result<PagedResult<IndexEntry>, IndexError>;

    /// Timestamp of the most recently committed operation in a collection,
    /// `None` when empty
    fn latest_timestamp(&self, collection_id: &str) -> Result<Option<i64>, IndexError>;

    /// Timestamp of the newest operation received from `source_remote`,
    /// `None` when nothing from that remote has been committed. Used to
    /// tell a peer how far its stream has been applied here.
    fn latest_timestamp_from(&self, source_remote: &str) -> Result<Option<i64>, IndexError>;

    /// Committed operations for a document log newer than `since_ts`,
    /// oldest first, capped at `limit`. Backs divergence detection.
    fn conflicts_since(
        &self,
        document_id: &str,
        scope: &str,
        branch: &str,
        since_ts: i64,
        limit: usize,
    ) -> Result<Vec<IndexEntry>, IndexError>;

    /// Distinct document ids present in the index; used to backfill
    /// collection membership when a remote is added late
    fn document_ids(&self) -> Result<Vec<String>, IndexError>;
}
