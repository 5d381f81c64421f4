use crate::config::StorageConfig;
use crate::index::{IndexError, IndexTransaction, OperationIndex};
use crate::types::{AbortSignal, Action, IndexEntry, Operation, PagedResult, Paging, ViewFilter};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, Row, params};
use std::path::Path;
use tracing::debug;

pub type DbPool = Pool<SqliteConnectionManager>;

/// SQLite implementation of the operation index
///
/// Ordinals are `INTEGER PRIMARY KEY AUTOINCREMENT` rowids, assigned by the
/// insert inside `commit` and read back via `last_insert_rowid`.
pub struct SqliteIndex {
    pool: DbPool,
}

impl SqliteIndex {
    pub fn open<P: AsRef<Path>>(path: P, config: &StorageConfig) -> Result<Self, IndexError> {
        let cache_size = config.sqlite_cache_size;
        let busy_timeout = config.sqlite_busy_timeout;
        let path_ref = path.as_ref();

        // Initialize schema with a single connection first
        {
            let conn = Connection::open(path_ref)?;
            conn.pragma_update(None, "cache_size", cache_size)?;
            conn.pragma_update(None, "busy_timeout", busy_timeout)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;

            Self::create_schema(&conn)?;
        }

        // Now create the pool - schema already exists
        let manager = SqliteConnectionManager::file(path_ref).with_init(move |conn| {
            conn.pragma_update(None, "cache_size", cache_size)?;
            conn.pragma_update(None, "busy_timeout", busy_timeout)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            Ok(())
        });

        let pool = Pool::builder()
            .max_size(5)
            .min_idle(Some(1))
            .build(manager)?;

        Ok(SqliteIndex { pool })
    }

    fn create_schema(conn: &Connection) -> Result<(), IndexError> {
        conn.execute_batch(
            r#"
            -- Named groupings of documents sharing a sync scope
            CREATE TABLE IF NOT EXISTS collections (
                id TEXT PRIMARY KEY
            );

            -- One row per committed operation; ordinal is the global
            -- monotonic insertion order
            CREATE TABLE IF NOT EXISTS operations (
                ordinal INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL,
                document_id TEXT NOT NULL,
                document_type TEXT NOT NULL,
                branch TEXT NOT NULL,
                scope TEXT NOT NULL,
                source_remote TEXT NOT NULL,
                op_index INTEGER NOT NULL,
                skip INTEGER NOT NULL,
                timestamp_utc_ms INTEGER NOT NULL,
                hash TEXT NOT NULL,
                action TEXT NOT NULL
            );

            -- Append-only membership intervals; an open interval has
            -- left_ordinal NULL
            CREATE TABLE IF NOT EXISTS collection_members (
                collection_id TEXT NOT NULL,
                document_id TEXT NOT NULL,
                joined_ordinal INTEGER NOT NULL,
                left_ordinal INTEGER,
                FOREIGN KEY (collection_id) REFERENCES collections(id)
            );

            CREATE INDEX IF NOT EXISTS idx_operations_log
                ON operations(document_id, scope, branch, timestamp_utc_ms);
            CREATE INDEX IF NOT EXISTS idx_members_collection
                ON collection_members(collection_id, document_id);
            "#,
        )?;

        Ok(())
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<(IndexEntry, String)> {
        let action_json: String = row.get(11)?;
        let entry = IndexEntry {
            ordinal: row.get::<_, i64>(0)? as u64,
            source_remote: row.get(6)?,
            operation: Operation {
                id: row.get(1)?,
                document_id: row.get(2)?,
                document_type: row.get(3)?,
                branch: row.get(4)?,
                scope: row.get(5)?,
                index: row.get::<_, i64>(7)? as u64,
                skip: row.get::<_, i64>(8)? as u64,
                timestamp_utc_ms: row.get(9)?,
                hash: row.get(10)?,
                // Placeholder until the JSON column is decoded by the caller
                action: Action {
                    id: String::new(),
                    kind: String::new(),
                    input: serde_json::Value::Null,
                    timestamp_utc_ms: 0,
                    scope: String::new(),
                },
            },
        };
        Ok((entry, action_json))
    }

    fn decode_rows(rows: Vec<(IndexEntry, String)>) -> Result<Vec<IndexEntry>, IndexError> {
        rows.into_iter()
            .map(|(mut entry, action_json)| {
                entry.operation.action = serde_json::from_str(&action_json)?;
                Ok(entry)
            })
            .collect()
    }
}

const ENTRY_COLUMNS: &str = "o.ordinal, o.id, o.document_id, o.document_type, o.branch, \
     o.scope, o.source_remote, o.op_index, o.skip, o.timestamp_utc_ms, o.hash, o.action";

impl OperationIndex for SqliteIndex {
    fn commit(&self, txn: IndexTransaction, abort: &AbortSignal) -> Result<Vec<u64>, IndexError> {
        // Fail fast before any backend work; no partial transactions after
        // cancellation
        if abort.is_aborted() {
            return Err(IndexError::Aborted);
        }

        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        for collection_id in &txn.collections {
            tx.execute(
                "INSERT OR IGNORE INTO collections (id) VALUES (?1)",
                [collection_id],
            )?;
        }

        let mut ordinals = Vec::with_capacity(txn.operations.len());
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO operations
                    (id, document_id, document_type, branch, scope,
                     source_remote, op_index, skip, timestamp_utc_ms, hash, action)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                "#,
            )?;
            for staged in &txn.operations {
                let op = &staged.operation;
                let action_json = serde_json::to_string(&op.action)?;
                stmt.execute(params![
                    op.id,
                    op.document_id,
                    op.document_type,
                    op.branch,
                    op.scope,
                    staged.source_remote,
                    op.index as i64,
                    op.skip as i64,
                    op.timestamp_utc_ms,
                    op.hash,
                    action_json,
                ])?;
                ordinals.push(tx.last_insert_rowid() as u64);
            }
        }

        for membership in &txn.memberships {
            let joined_ordinal = ordinals
                .get(membership.op_position)
                .copied()
                .unwrap_or(0) as i64;
            // Only open a new interval when the document has no open one;
            // intervals for the same document never overlap
            tx.execute(
                r#"
                INSERT INTO collection_members (collection_id, document_id, joined_ordinal)
                SELECT ?1, ?2, ?3
                WHERE NOT EXISTS (
                    SELECT 1 FROM collection_members
                    WHERE collection_id = ?1
                      AND document_id = ?2
                      AND left_ordinal IS NULL
                )
                "#,
                params![
                    membership.collection_id,
                    membership.document_id,
                    joined_ordinal
                ],
            )?;
        }

        tx.commit()?;
        debug!(
            "Committed {} operation(s), ordinals {:?}",
            ordinals.len(),
            ordinals
        );
        Ok(ordinals)
    }

    fn find(
        &self,
        collection_id: &str,
        view: Option<&ViewFilter>,
        paging: Paging,
    ) -> Result<PagedResult<IndexEntry>, IndexError> {
        let conn = self.pool.get()?;

        let branch = view.and_then(|v| v.branch.clone());
        let scope = view.and_then(|v| v.scope.clone());

        let sql = format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM operations o
            WHERE EXISTS (
                SELECT 1 FROM collection_members m
                WHERE m.collection_id = ?1 AND m.document_id = o.document_id
            )
              AND o.ordinal > ?2
              AND (?3 IS NULL OR o.branch = ?3)
              AND (?4 IS NULL OR o.scope = ?4)
            ORDER BY o.ordinal ASC
            LIMIT ?5
            "#
        );

        // Request one row beyond the page to learn whether more remain
        let peek_limit = (paging.limit + 1) as i64;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![collection_id, paging.cursor as i64, branch, scope, peek_limit],
            Self::entry_from_row,
        )?;

        let mut raw = Vec::new();
        for row in rows {
            raw.push(row?);
        }
        let mut items = Self::decode_rows(raw)?;

        let next_cursor = if items.len() > paging.limit {
            items.truncate(paging.limit);
            items.last().map(|e| e.ordinal)
        } else {
            None
        };

        Ok(PagedResult { items, next_cursor })
    }

    fn latest_timestamp(&self, collection_id: &str) -> Result<Option<i64>, IndexError> {
        let conn = self.pool.get()?;

        let mut stmt = conn.prepare(
            r#"
            SELECT o.timestamp_utc_ms
            FROM operations o
            WHERE EXISTS (
                SELECT 1 FROM collection_members m
                WHERE m.collection_id = ?1 AND m.document_id = o.document_id
            )
            ORDER BY o.ordinal DESC
            LIMIT 1
            "#,
        )?;

        let mut rows = stmt.query([collection_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    fn latest_timestamp_from(&self, source_remote: &str) -> Result<Option<i64>, IndexError> {
        let conn = self.pool.get()?;
        let mut stmt =
            conn.prepare("SELECT MAX(timestamp_utc_ms) FROM operations WHERE source_remote = ?1")?;
        let ts: Option<i64> = stmt.query_row([source_remote], |row| row.get(0))?;
        Ok(ts)
    }

    fn conflicts_since(
        &self,
        document_id: &str,
        scope: &str,
        branch: &str,
        since_ts: i64,
        limit: usize,
    ) -> Result<Vec<IndexEntry>, IndexError> {
        let conn = self.pool.get()?;

        let sql = format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM operations o
            WHERE o.document_id = ?1
              AND o.scope = ?2
              AND o.branch = ?3
              AND o.timestamp_utc_ms > ?4
            ORDER BY o.ordinal ASC
            LIMIT ?5
            "#
        );

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![document_id, scope, branch, since_ts, limit as i64],
            Self::entry_from_row,
        )?;

        let mut raw = Vec::new();
        for row in rows {
            raw.push(row?);
        }
        Self::decode_rows(raw)
    }

    fn document_ids(&self) -> Result<Vec<String>, IndexError> {
        let conn = self.pool.get()?;
        let mut stmt =
            conn.prepare("SELECT DISTINCT document_id FROM operations ORDER BY document_id")?;
        let rows = stmt.query_map([], |row| row.get(0))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }
}
