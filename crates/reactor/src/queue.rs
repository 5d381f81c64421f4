use crate::events::{Event, EventBus};
use crate::types::Job;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

/// Pending operation-application jobs, keyed by document, scope and branch
///
/// Jobs for one document run serially: while a document has a job in
/// flight, `dequeue` skips every sub-queue for that document until
/// `settle` releases it. A job naming `depends_on` ids is held back until
/// each named id has settled. Enqueue emits `JobAvailable` so idle
/// executors wake without polling.
pub struct JobQueue {
    inner: Mutex<QueueInner>,
    events: Arc<EventBus>,
}

#[derive(Clone, PartialEq, Eq)]
struct QueueKey {
    document_id: String,
    scope: String,
    branch: String,
}

impl QueueKey {
    fn of(job: &Job) -> Self {
        Self {
            document_id: job.document_id.clone(),
            scope: job.scope.clone(),
            branch: job.branch.clone(),
        }
    }
}

struct SubQueue {
    key: QueueKey,
    jobs: VecDeque<Job>,
}

#[derive(Default)]
struct QueueInner {
    // Vec keeps scan order deterministic: sub-queues are visited in the
    // order their first job arrived
    queues: Vec<SubQueue>,
    executing_documents: HashMap<String, usize>,
    settled: HashSet<String>,
}

impl JobQueue {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            events,
        }
    }

    pub async fn enqueue(&self, job: Job) {
        debug!("Enqueuing job {} for document {}", job.id, job.document_id);
        {
            let mut inner = self.inner.lock().unwrap();
            let key = QueueKey::of(&job);
            match inner.queues.iter().position(|sub| sub.key == key) {
                Some(i) => inner.queues[i].jobs.push_back(job),
                None => inner.queues.push(SubQueue {
                    key,
                    jobs: VecDeque::from([job]),
                }),
            }
        }

        // Handler failures are the listeners' problem, not the producer's
        if let Err(e) = self.events.emit(Event::JobAvailable).await {
            trace!("JobAvailable listeners failed: {}", e);
        }
    }

    /// Pull the next runnable job and mark its document as executing
    ///
    /// Scans sub-queues in arrival order, skipping any whose document has
    /// a job in flight, and within a sub-queue picks the first job whose
    /// dependencies have all settled. Returns `None` when nothing is
    /// runnable, even if jobs remain queued.
    pub fn dequeue(&self) -> Option<Job> {
        let mut inner = self.inner.lock().unwrap();

        let mut found: Option<(usize, usize)> = None;
        'scan: for (qi, sub) in inner.queues.iter().enumerate() {
            if inner.executing_documents.contains_key(&sub.key.document_id) {
                continue;
            }
            for (ji, job) in sub.jobs.iter().enumerate() {
                if job.depends_on.iter().all(|dep| inner.settled.contains(dep)) {
                    found = Some((qi, ji));
                    break 'scan;
                }
            }
        }

        let (qi, ji) = found?;
        let job = inner.queues[qi].jobs.remove(ji)?;
        if inner.queues[qi].jobs.is_empty() {
            inner.queues.remove(qi);
        }
        *inner
            .executing_documents
            .entry(job.document_id.clone())
            .or_insert(0) += 1;
        Some(job)
    }

    /// Release a finished job's document and record its id for dependents
    ///
    /// Called once per dequeued job, whether it succeeded or failed, so a
    /// dead job never wedges the work queued behind it.
    pub fn settle(&self, job_id: &str, document_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(in_flight) = inner.executing_documents.get_mut(document_id) {
            *in_flight -= 1;
            if *in_flight == 0 {
                inner.executing_documents.remove(document_id);
            }
        }
        inner.settled.insert(job_id.to_string());
    }

    /// Record an externally tracked id as settled, unblocking any job
    /// that depends on it
    pub fn mark_settled(&self, id: &str) {
        self.inner.lock().unwrap().settled.insert(id.to_string());
    }

    pub fn total_size(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.queues.iter().map(|sub| sub.jobs.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::types::test_support::test_operation;

    fn test_job(document_id: &str, index: u64) -> Job {
        Job::for_operation(test_operation(document_id, index, 100), "", 3)
    }

    #[tokio::test]
    async fn test_same_document_jobs_run_one_at_a_time() {
        let queue = JobQueue::new(Arc::new(EventBus::new()));

        queue.enqueue(test_job("doc-1", 0)).await;
        queue.enqueue(test_job("doc-1", 1)).await;
        queue.enqueue(test_job("doc-2", 0)).await;
        assert_eq!(queue.total_size(), 3);

        let first = queue.dequeue().unwrap();
        assert_eq!(first.document_id, "doc-1");
        assert_eq!(first.operation.index, 0);

        // doc-1 has a job in flight, so doc-2 goes next
        let second = queue.dequeue().unwrap();
        assert_eq!(second.document_id, "doc-2");

        // Everything left belongs to busy documents
        assert!(queue.dequeue().is_none());
        assert_eq!(queue.total_size(), 1);

        queue.settle(&first.id, &first.document_id);
        let third = queue.dequeue().unwrap();
        assert_eq!(third.document_id, "doc-1");
        assert_eq!(third.operation.index, 1);
    }

    #[tokio::test]
    async fn test_dependencies_gate_dequeue() {
        let queue = JobQueue::new(Arc::new(EventBus::new()));

        let mut blocked = test_job("doc-1", 0);
        blocked.depends_on = vec!["batch-1".to_string()];
        queue.enqueue(blocked.clone()).await;

        assert!(queue.dequeue().is_none());

        queue.mark_settled("batch-1");
        assert_eq!(queue.dequeue().unwrap().id, blocked.id);
    }

    #[tokio::test]
    async fn test_settled_job_unblocks_dependents() {
        let queue = JobQueue::new(Arc::new(EventBus::new()));

        let upstream = test_job("doc-1", 0);
        let mut downstream = test_job("doc-2", 0);
        downstream.depends_on = vec![upstream.id.clone()];
        queue.enqueue(upstream.clone()).await;
        queue.enqueue(downstream.clone()).await;

        let first = queue.dequeue().unwrap();
        assert_eq!(first.id, upstream.id);
        assert!(queue.dequeue().is_none());

        queue.settle(&upstream.id, &upstream.document_id);
        assert_eq!(queue.dequeue().unwrap().id, downstream.id);
    }

    #[tokio::test]
    async fn test_enqueue_emits_job_available() {
        let events = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(0u32));

        let seen_clone = Arc::clone(&seen);
        events.subscribe(EventKind::JobAvailable, move |_| {
            let seen = Arc::clone(&seen_clone);
            async move {
                *seen.lock().unwrap() += 1;
                Ok(())
            }
        });

        let queue = JobQueue::new(Arc::clone(&events));
        queue.enqueue(test_job("doc-1", 0)).await;
        queue.enqueue(test_job("doc-1", 1)).await;

        assert_eq!(*seen.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_pulls_never_duplicate() {
        let queue = Arc::new(JobQueue::new(Arc::new(EventBus::new())));
        for i in 0..100 {
            queue.enqueue(test_job(&format!("doc-{}", i), 0)).await;
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                let mut pulled = Vec::new();
                while let Some(job) = queue.dequeue() {
                    pulled.push(job.document_id.clone());
                }
                pulled
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort_unstable();
        let mut expected: Vec<String> = (0..100).map(|i| format!("doc-{}", i)).collect();
        expected.sort_unstable();
        assert_eq!(all, expected);
    }
}
