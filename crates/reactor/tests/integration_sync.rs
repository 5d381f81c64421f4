use async_trait::async_trait;
use reactor::executor::{JobError, JobExecutor, JobHandler};
use reactor::types::{AbortSignal, DeadLetterCategory, DeadLetterLog, IndexEntry, Job};
use reactor::writer::{CollectionRegistry, NoopReducer, OperationWriter};
use reactor::{
    EventBus, ExecutorConfig, JobQueue, OperationIndex, RemoteFilter, SqliteIndex, StorageConfig,
    SyncConfig, SyncEnvelope, SyncListener, SyncManager, SyncService,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::sleep;

fn test_operation(document_id: &str, index: u64, ts: i64) -> reactor::Operation {
    reactor::Operation {
        id: format!("op-{}-{}", document_id, index),
        document_id: document_id.to_string(),
        document_type: "note".to_string(),
        branch: "main".to_string(),
        scope: "document".to_string(),
        index,
        skip: 0,
        timestamp_utc_ms: ts,
        hash: format!("hash-{}", index),
        action: reactor::Action {
            id: format!("action-{}-{}", document_id, index),
            kind: "SET_TITLE".to_string(),
            input: serde_json::json!({ "title": "t" }),
            timestamp_utc_ms: ts,
            scope: "document".to_string(),
        },
    }
}

fn test_entry(document_id: &str, index: u64, ordinal: u64, ts: i64) -> IndexEntry {
    IndexEntry {
        ordinal,
        source_remote: String::new(),
        operation: test_operation(document_id, index, ts),
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {}", what);
}

struct Node {
    queue: Arc<JobQueue>,
    index: Arc<SqliteIndex>,
    executor: Arc<JobExecutor>,
    sync: Arc<SyncManager>,
    dead_letters: Arc<DeadLetterLog>,
    _temp: TempDir,
}

impl Node {
    /// Wire a full node by hand and start everything but the listener
    async fn build(
        name: &str,
        handler: Option<Arc<dyn JobHandler>>,
        max_retries: u32,
        reshuffle_threshold: usize,
    ) -> Node {
        let temp = TempDir::new().unwrap();
        let events = Arc::new(EventBus::new());
        let dead_letters = Arc::new(DeadLetterLog::new());
        let queue = Arc::new(JobQueue::new(Arc::clone(&events)));
        let storage_config = StorageConfig {
            sqlite_cache_size: 1000,
            sqlite_busy_timeout: 5000,
        };
        let index =
            Arc::new(SqliteIndex::open(temp.path().join("node.db"), &storage_config).unwrap());
        let collections = Arc::new(CollectionRegistry::new());

        let handler: Arc<dyn JobHandler> = handler.unwrap_or_else(|| {
            Arc::new(OperationWriter::new(
                Arc::clone(&index) as Arc<dyn OperationIndex>,
                Arc::new(NoopReducer),
                Arc::clone(&events),
                Arc::clone(&collections),
                Arc::clone(&dead_letters),
                reshuffle_threshold,
                3,
            ))
        });

        let executor_config = ExecutorConfig {
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 10,
            ..Default::default()
        };
        let executor = Arc::new(JobExecutor::new(
            executor_config,
            Arc::clone(&queue),
            Arc::clone(&events),
            handler,
            Arc::clone(&dead_letters),
        ));

        let sync_config = SyncConfig {
            poll_interval_ms: 50,
            push_interval_ms: 20,
            ..Default::default()
        };
        let sync = SyncManager::new(
            name.to_string(),
            sync_config,
            Arc::clone(&index) as Arc<dyn OperationIndex>,
            Arc::clone(&queue),
            Arc::clone(&events),
            Arc::clone(&dead_letters),
            collections,
            max_retries,
        );

        executor.start().await.unwrap();
        sync.start();

        Node {
            queue,
            index,
            executor,
            sync,
            dead_letters,
            _temp: temp,
        }
    }

    async fn start(name: &str, addr: &str) -> Node {
        let node = Self::build(name, None, 3, 1000).await;
        let service = Arc::new(SyncService::new(Arc::clone(&node.sync)));
        let addr = addr.to_string();
        tokio::spawn(async move {
            let listener = SyncListener::new(service);
            if let Err(e) = listener.run(&addr).await {
                tracing::error!("Listener error: {}", e);
            }
        });
        // Give the listener a moment to bind
        sleep(Duration::from_millis(50)).await;
        node
    }

    async fn submit(&self, document_id: &str, index: u64, ts: i64) {
        self.queue
            .enqueue(Job::for_operation(test_operation(document_id, index, ts), "", 3))
            .await;
    }

    async fn shutdown(&self) {
        self.sync.stop().await;
        self.executor.stop(true).await;
    }
}

#[tokio::test]
async fn test_two_node_sync_over_tcp() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let node_a = Node::start("node-a", "127.0.0.1:17911").await;
    let node_b = Node::start("node-b", "127.0.0.1:17912").await;

    node_a
        .sync
        .add_remote("node-b", "127.0.0.1:17912", RemoteFilter::default())
        .await
        .unwrap();

    // A's write reaches B
    node_a.submit("doc-1", 0, 100).await;
    let b_index = Arc::clone(&node_b.index);
    wait_until("doc-1 replicated to node-b", || {
        b_index
            .find("remote.node-a", None, Default::default())
            .unwrap()
            .items
            .iter()
            .any(|e| e.operation.document_id == "doc-1")
    })
    .await;

    // B's write reaches A over the same channel, via A's poll
    node_b.submit("doc-2", 0, 200).await;
    let a_index = Arc::clone(&node_a.index);
    wait_until("doc-2 replicated to node-a", || {
        a_index
            .find("remote.node-b", None, Default::default())
            .unwrap()
            .items
            .iter()
            .any(|e| e.operation.document_id == "doc-2")
    })
    .await;

    // Replicated entries carry their origin
    let received = node_b
        .index
        .find("remote.node-a", None, Default::default())
        .unwrap();
    let doc1 = received
        .items
        .iter()
        .find(|e| e.operation.document_id == "doc-1")
        .unwrap();
    assert_eq!(doc1.source_remote, "node-a");

    // Acks drain both outboxes
    let a_remote = node_a.sync.remote("node-b").unwrap();
    let b_remote = node_b.sync.remote("node-a").unwrap();
    wait_until("node-a outbox drained", || a_remote.channel.outbox.is_empty()).await;
    wait_until("node-b outbox drained", || b_remote.channel.outbox.is_empty()).await;
    wait_until("node-b inbox drained", || b_remote.channel.inbox.is_empty()).await;

    assert!(node_a.dead_letters.is_empty());
    assert!(node_b.dead_letters.is_empty());

    node_a.shutdown().await;
    node_b.shutdown().await;
}

#[tokio::test]
async fn test_backfill_reaches_late_remote() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let node_a = Node::start("node-a", "127.0.0.1:17913").await;
    let node_b = Node::start("node-b", "127.0.0.1:17914").await;

    // History exists before the remote does
    for i in 0..3 {
        node_a.submit("doc-1", i, 100 + i as i64).await;
    }
    let a_executor = Arc::clone(&node_a.executor);
    wait_until("local history applied", || {
        a_executor.status().succeeded == 3
    })
    .await;

    node_a
        .sync
        .add_remote("node-b", "127.0.0.1:17914", RemoteFilter::default())
        .await
        .unwrap();

    let b_index = Arc::clone(&node_b.index);
    wait_until("backfilled history replicated", || {
        b_index
            .find("remote.node-a", None, Default::default())
            .unwrap()
            .items
            .len()
            == 3
    })
    .await;

    assert!(node_b.dead_letters.is_empty());
    node_a.shutdown().await;
    node_b.shutdown().await;
}

#[tokio::test]
async fn test_dangling_dependencies_dropped() {
    // No listener and no running executor; inspect the inbox directly
    let node = Node::build("node-a", None, 3, 1000).await;
    node.executor.stop(true).await;

    node.sync
        .touch_channel("chan-77", "node-b", RemoteFilter::default(), 0)
        .unwrap();

    let envelope = SyncEnvelope {
        key: "job-1".to_string(),
        depends_on: vec!["ghost".to_string()],
        channel_id: "chan-77".to_string(),
        document_id: "doc-1".to_string(),
        scopes: vec!["document".to_string()],
        branch: "main".to_string(),
        operations: vec![test_entry("doc-1", 0, 1, 100)],
    };
    node.sync
        .accept_envelopes("chan-77", vec![envelope])
        .await
        .unwrap();

    let remote = node.sync.remote("node-b").unwrap();
    let inbox = remote.channel.inbox.items();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].job_id, "job-1");
    assert!(inbox[0].job_dependencies.is_empty());
    assert_eq!(node.queue.total_size(), 1);
}

#[tokio::test]
async fn test_unknown_channel_rejected() {
    let node = Node::build("node-a", None, 3, 1000).await;
    let err = node
        .sync
        .accept_envelopes("no-such-channel", Vec::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no-such-channel"));
    node.shutdown().await;
}

struct AlwaysFails;

#[async_trait]
impl JobHandler for AlwaysFails {
    async fn run(&self, _job: &Job, _abort: AbortSignal) -> Result<(), JobError> {
        Err(JobError::Failed("cannot apply".to_string()))
    }
}

#[tokio::test]
async fn test_failed_batch_dead_letters_as_inbox_error() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    // max_retries 0 so each job settles on its first attempt
    let node = Node::build("node-a", Some(Arc::new(AlwaysFails)), 0, 1000).await;

    node.sync
        .touch_channel("chan-88", "node-b", RemoteFilter::default(), 0)
        .unwrap();

    let envelope = SyncEnvelope {
        key: "job-1".to_string(),
        depends_on: Vec::new(),
        channel_id: "chan-88".to_string(),
        document_id: "doc-1".to_string(),
        scopes: vec!["document".to_string()],
        branch: "main".to_string(),
        operations: vec![
            test_entry("doc-1", 0, 1, 100),
            test_entry("doc-1", 1, 2, 110),
        ],
    };
    node.sync
        .accept_envelopes("chan-88", vec![envelope])
        .await
        .unwrap();

    let dead_letters = Arc::clone(&node.dead_letters);
    wait_until("batch dead-lettered", || !dead_letters.is_empty()).await;

    let letters = node.dead_letters.list();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].category, DeadLetterCategory::InboxError);
    assert_eq!(letters[0].document_id, "doc-1");
    assert_eq!(letters[0].operation_count, 2);

    // The failed batch is removed from the inbox, not acknowledged
    let remote = node.sync.remote("node-b").unwrap();
    wait_until("inbox cleared", || remote.channel.inbox.is_empty()).await;
    assert_eq!(remote.channel.ack_ordinal(), 0);

    node.shutdown().await;
}

#[tokio::test]
async fn test_reshuffle_exhaustion_letters_batch_exactly_once() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    // Threshold 0 makes any newer local history excessive divergence
    let node = Node::build("node-a", None, 3, 0).await;

    node.submit("doc-1", 0, 500).await;
    node.submit("doc-1", 1, 501).await;
    let executor = Arc::clone(&node.executor);
    wait_until("local history applied", || executor.status().succeeded == 2).await;

    node.sync
        .touch_channel("chan-99", "node-b", RemoteFilter::default(), 0)
        .unwrap();

    // A stale inbound operation that cannot be rebased
    let envelope = SyncEnvelope {
        key: "job-1".to_string(),
        depends_on: Vec::new(),
        channel_id: "chan-99".to_string(),
        document_id: "doc-1".to_string(),
        scopes: vec!["document".to_string()],
        branch: "main".to_string(),
        operations: vec![test_entry("doc-1", 0, 1, 100)],
    };
    node.sync
        .accept_envelopes("chan-99", vec![envelope])
        .await
        .unwrap();

    let dead_letters = Arc::clone(&node.dead_letters);
    wait_until("divergence dead-lettered", || !dead_letters.is_empty()).await;
    // Let any erroneous second letter land before counting
    sleep(Duration::from_millis(100)).await;

    let letters = node.dead_letters.list();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].category, DeadLetterCategory::ExcessiveReshuffle);

    let remote = node.sync.remote("node-b").unwrap();
    wait_until("inbox cleared", || remote.channel.inbox.is_empty()).await;
    assert_eq!(remote.channel.ack_ordinal(), 0);

    node.shutdown().await;
}

#[tokio::test]
async fn test_touch_backfill_skips_history_peer_holds() {
    let node = Node::build("node-a", None, 3, 1000).await;

    for i in 0..3 {
        node.submit("doc-1", i, 100 + 10 * i as i64).await;
    }
    let executor = Arc::clone(&node.executor);
    wait_until("local history applied", || executor.status().succeeded == 3).await;

    // The toucher reports it already holds our stream up to ts 110
    node.sync
        .touch_channel("chan-55", "node-b", RemoteFilter::default(), 110)
        .unwrap();

    let remote = node.sync.remote("node-b").unwrap();
    let staged: Vec<i64> = remote
        .channel
        .outbox
        .items()
        .iter()
        .flat_map(|op| op.operations.iter().map(|e| e.operation.timestamp_utc_ms))
        .collect();
    assert_eq!(staged, vec![120]);

    node.shutdown().await;
}

#[tokio::test]
async fn test_peer_restart_does_not_redeliver_history() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let node_a = Node::start("node-a", "127.0.0.1:17915").await;
    let node_b = Node::start("node-b", "127.0.0.1:17916").await;

    for i in 0..3 {
        node_a.submit("doc-1", i, 100 + 10 * i as i64).await;
    }
    let a_executor = Arc::clone(&node_a.executor);
    wait_until("local history applied", || {
        a_executor.status().succeeded == 3
    })
    .await;

    // B already holds the first two operations from an earlier session
    let mut txn = node_b.index.begin();
    txn.write(
        vec![
            test_operation("doc-1", 0, 100),
            test_operation("doc-1", 1, 110),
        ],
        "node-a",
    );
    node_b.index.commit(txn, &AbortSignal::never()).unwrap();

    node_a
        .sync
        .add_remote("node-b", "127.0.0.1:17916", RemoteFilter::default())
        .await
        .unwrap();

    let b_index = Arc::clone(&node_b.index);
    wait_until("missing operation replicated", || {
        b_index
            .find("remote.node-a", None, Default::default())
            .unwrap()
            .items
            .len()
            == 3
    })
    .await;

    // Give the pumps time to misbehave, then recount
    sleep(Duration::from_millis(300)).await;
    let items = node_b
        .index
        .find("remote.node-a", None, Default::default())
        .unwrap()
        .items;
    assert_eq!(items.len(), 3);

    assert!(node_a.dead_letters.is_empty());
    assert!(node_b.dead_letters.is_empty());

    node_a.shutdown().await;
    node_b.shutdown().await;
}

struct BlocksUntilAborted;

#[async_trait]
impl JobHandler for BlocksUntilAborted {
    async fn run(&self, _job: &Job, mut abort: AbortSignal) -> Result<(), JobError> {
        tokio::select! {
            _ = abort.aborted() => Err(JobError::Aborted),
            _ = sleep(Duration::from_secs(30)) => Ok(()),
        }
    }
}

#[tokio::test]
async fn test_abort_leaves_inbound_batch_in_inbox() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let node = Node::build("node-a", Some(Arc::new(BlocksUntilAborted)), 3, 1000).await;

    node.sync
        .touch_channel("chan-66", "node-b", RemoteFilter::default(), 0)
        .unwrap();

    let envelope = SyncEnvelope {
        key: "job-1".to_string(),
        depends_on: Vec::new(),
        channel_id: "chan-66".to_string(),
        document_id: "doc-1".to_string(),
        scopes: vec!["document".to_string()],
        branch: "main".to_string(),
        operations: vec![test_entry("doc-1", 0, 1, 100)],
    };
    node.sync
        .accept_envelopes("chan-66", vec![envelope])
        .await
        .unwrap();

    let executor = Arc::clone(&node.executor);
    wait_until("job picked up", || executor.status().active_jobs == 1).await;
    node.executor.stop(false).await;

    // A shutdown is not a verdict: no dead letter, no ack, and the batch
    // stays in the inbox for the next run
    let remote = node.sync.remote("node-b").unwrap();
    assert_eq!(remote.channel.inbox.len(), 1);
    assert_eq!(remote.channel.ack_ordinal(), 0);
    assert!(node.dead_letters.is_empty());

    node.sync.stop().await;
}
