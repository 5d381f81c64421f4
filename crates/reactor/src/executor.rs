use crate::config::ExecutorConfig;
use crate::events::{Event, EventBus, EventKind, FailureKind, SubscriptionId};
use crate::queue::JobQueue;
use crate::types::{
    AbortHandle, AbortSignal, DeadLetter, DeadLetterCategory, DeadLetterLog, Job, JobResult,
    abort_pair, now_ms,
};
use async_trait::async_trait;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("executor is already running")]
    AlreadyRunning,
}

/// Failure of a single job attempt
#[derive(Debug, Error)]
pub enum JobError {
    #[error("job timed out after {0} ms")]
    TimedOut(u64),
    #[error("job aborted")]
    Aborted,
    /// Not retryable; the handler has already recorded the failure
    #[error("{0}")]
    Terminal(String),
    #[error("{0}")]
    Failed(String),
}

/// The work performed for one job attempt
///
/// Implementations apply the wrapped operation (reducer plus index write).
/// A handler that observes the abort signal must return `JobError::Aborted`
/// rather than succeed.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job: &Job, abort: AbortSignal) -> Result<(), JobError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorStatus {
    pub running: bool,
    pub active_jobs: usize,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub uptime_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorStats {
    pub status: ExecutorStatus,
    pub avg_execution_time_ms: f64,
    pub success_rate: f64,
    pub jobs_per_second: f64,
    pub queue_backlog: usize,
}

// Rolling window size for execution-time stats
const STATS_WINDOW: usize = 1000;

struct ExecutorShared {
    running: AtomicBool,
    paused: AtomicBool,
    active: AtomicUsize,
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    durations: Mutex<VecDeque<u64>>,
    started_at: Mutex<Option<Instant>>,
    wake: Notify,
    resume: Notify,
    drained: Notify,
}

/// Pulls jobs from the queue and applies them with bounded concurrency,
/// retry with exponential backoff and jitter, and a per-attempt timeout
///
/// Jobs are retried in place, never re-enqueued at the tail; exhausting
/// `max_retries` dead-letters the job.
pub struct JobExecutor {
    config: ExecutorConfig,
    queue: Arc<JobQueue>,
    events: Arc<EventBus>,
    handler: Arc<dyn JobHandler>,
    dead_letters: Arc<DeadLetterLog>,
    semaphore: Arc<Semaphore>,
    shared: Arc<ExecutorShared>,
    abort: Mutex<Option<AbortHandle>>,
    wake_subscription: Mutex<Option<SubscriptionId>>,
}

impl JobExecutor {
    pub fn new(
        config: ExecutorConfig,
        queue: Arc<JobQueue>,
        events: Arc<EventBus>,
        handler: Arc<dyn JobHandler>,
        dead_letters: Arc<DeadLetterLog>,
    ) -> Self {
        let permits = config.max_concurrency.max(1);
        Self {
            config,
            queue,
            events,
            handler,
            dead_letters,
            semaphore: Arc::new(Semaphore::new(permits)),
            shared: Arc::new(ExecutorShared {
                running: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                active: AtomicUsize::new(0),
                processed: AtomicU64::new(0),
                succeeded: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                durations: Mutex::new(VecDeque::with_capacity(STATS_WINDOW)),
                started_at: Mutex::new(None),
                wake: Notify::new(),
                resume: Notify::new(),
                drained: Notify::new(),
            }),
            abort: Mutex::new(None),
            wake_subscription: Mutex::new(None),
        }
    }

    /// Begin pulling jobs, up to `max_concurrency` at a time
    pub async fn start(self: &Arc<Self>) -> Result<(), ExecutorError> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(ExecutorError::AlreadyRunning);
        }

        *self.shared.started_at.lock().unwrap() = Some(Instant::now());

        let (handle, _signal) = abort_pair();
        *self.abort.lock().unwrap() = Some(handle);

        // Wake the supervisor when the queue signals a new job
        let shared = Arc::clone(&self.shared);
        let sub = self.events.subscribe(EventKind::JobAvailable, move |_| {
            let shared = Arc::clone(&shared);
            async move {
                shared.wake.notify_one();
                Ok(())
            }
        });
        *self.wake_subscription.lock().unwrap() = Some(sub);

        if let Err(e) = self.events.emit(Event::ExecutorStarted).await {
            warn!("ExecutorStarted listeners failed: {}", e);
        }

        let executor = Arc::clone(self);
        tokio::spawn(async move {
            executor.supervise().await;
        });

        info!(
            "Executor started (max_concurrency={})",
            self.config.max_concurrency
        );
        Ok(())
    }

    async fn supervise(self: Arc<Self>) {
        while self.shared.running.load(Ordering::SeqCst) {
            if self.shared.paused.load(Ordering::SeqCst) {
                // Re-check the running flag periodically while paused
                let _ = tokio::time::timeout(
                    Duration::from_millis(50),
                    self.shared.resume.notified(),
                )
                .await;
                continue;
            }

            let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            if !self.shared.running.load(Ordering::SeqCst) {
                break;
            }

            match self.queue.dequeue() {
                Some(job) => {
                    self.shared.active.fetch_add(1, Ordering::SeqCst);
                    let executor = Arc::clone(&self);
                    tokio::spawn(async move {
                        let job_id = job.id.clone();
                        let document_id = job.document_id.clone();
                        executor.run_job(job).await;
                        // Release the document so queued work behind this
                        // job becomes runnable, then wake the supervisor
                        executor.queue.settle(&job_id, &document_id);
                        executor.shared.wake.notify_one();
                        drop(permit);
                        if executor.shared.active.fetch_sub(1, Ordering::SeqCst) == 1 {
                            executor.shared.drained.notify_waiters();
                        }
                    });
                }
                None => {
                    drop(permit);
                    let _ = tokio::time::timeout(
                        Duration::from_millis(100),
                        self.shared.wake.notified(),
                    )
                    .await;
                }
            }
        }
        debug!("Executor supervisor exited");
    }

    /// One attempt: timeout-bounded handler run plus lifecycle events
    pub async fn execute_job(&self, job: &Job) -> JobResult {
        self.attempt(job).await.0
    }

    async fn attempt(&self, job: &Job) -> (JobResult, Option<JobError>) {
        if let Err(e) = self
            .events
            .emit(Event::JobStarted {
                job_id: job.id.clone(),
            })
            .await
        {
            warn!("JobStarted listeners failed: {}", e);
        }

        let started = Instant::now();
        let mut abort = self.abort_signal();
        let timeout_ms = self.config.job_timeout_ms;

        let outcome = tokio::select! {
            res = tokio::time::timeout(
                Duration::from_millis(timeout_ms),
                self.handler.run(job, abort.clone()),
            ) => match res {
                Ok(inner) => inner,
                Err(_) => Err(JobError::TimedOut(timeout_ms)),
            },
            _ = abort.aborted() => Err(JobError::Aborted),
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(()) => {
                let result = JobResult {
                    job_id: job.id.clone(),
                    success: true,
                    duration_ms,
                    completed_at_ms: now_ms(),
                    error: None,
                };
                if let Err(e) = self
                    .events
                    .emit(Event::JobCompleted {
                        result: result.clone(),
                    })
                    .await
                {
                    warn!("JobCompleted listeners failed: {}", e);
                }
                (result, None)
            }
            Err(err) => {
                let kind = match &err {
                    JobError::Aborted => FailureKind::Aborted,
                    JobError::Terminal(_) => FailureKind::Terminal,
                    JobError::TimedOut(_) | JobError::Failed(_) => FailureKind::Retryable,
                };
                let will_retry =
                    kind == FailureKind::Retryable && job.retry_count < job.max_retries;
                if let Err(e) = self
                    .events
                    .emit(Event::JobFailed {
                        job_id: job.id.clone(),
                        error: err.to_string(),
                        will_retry,
                        kind,
                    })
                    .await
                {
                    warn!("JobFailed listeners failed: {}", e);
                }
                let result = JobResult {
                    job_id: job.id.clone(),
                    success: false,
                    duration_ms,
                    completed_at_ms: now_ms(),
                    error: Some(err.to_string()),
                };
                (result, Some(err))
            }
        }
    }

    /// Retry loop for one job; terminal failure dead-letters it
    async fn run_job(&self, job: Job) {
        let mut job = job;
        loop {
            let (result, err) = self.attempt(&job).await;

            if result.success {
                self.record_terminal(true, result.duration_ms);
                return;
            }

            let error = result.error.unwrap_or_default();
            let aborted = matches!(err, Some(JobError::Aborted));
            let terminal = matches!(err, Some(JobError::Terminal(_)));

            if aborted || terminal || job.retry_count >= job.max_retries {
                self.record_terminal(false, result.duration_ms);
                // Aborted jobs are not failures of the job itself; terminal
                // errors were already dead-lettered by the handler; jobs
                // tied to a sync batch are dead-lettered per batch by the
                // sync manager instead
                if !aborted && !terminal && job.sync_op_id.is_none() {
                    self.dead_letters.add(DeadLetter {
                        document_id: job.document_id.clone(),
                        job_id: job.id.clone(),
                        branch: job.branch.clone(),
                        operation_count: 1,
                        error,
                        category: DeadLetterCategory::JobRetryExhausted,
                    });
                }
                return;
            }

            job.retry_count += 1;
            let delay = self.backoff_delay(job.retry_count);
            debug!(
                "Job {} attempt {} failed, retrying in {:?}: {}",
                job.id, job.retry_count, delay, error
            );

            let mut abort = self.abort_signal();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = abort.aborted() => {
                    self.record_terminal(false, result.duration_ms);
                    return;
                }
            }
        }
    }

    /// Exponential backoff from `retry_base_delay_ms`, capped at
    /// `retry_max_delay_ms`, with up to 10% jitter
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let base = self
            .config
            .retry_base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.config.retry_max_delay_ms);
        let jitter = (base as f64 * rand::thread_rng().gen_range(0.0..0.1)) as u64;
        Duration::from_millis(base + jitter)
    }

    fn record_terminal(&self, success: bool, duration_ms: u64) {
        self.shared.processed.fetch_add(1, Ordering::SeqCst);
        if success {
            self.shared.succeeded.fetch_add(1, Ordering::SeqCst);
        } else {
            self.shared.failed.fetch_add(1, Ordering::SeqCst);
        }
        let mut durations = self.shared.durations.lock().unwrap();
        if durations.len() == STATS_WINDOW {
            durations.pop_front();
        }
        durations.push_back(duration_ms);
    }

    fn abort_signal(&self) -> AbortSignal {
        self.abort
            .lock()
            .unwrap()
            .as_ref()
            .map(|h| h.signal())
            .unwrap_or_else(AbortSignal::never)
    }

    /// Stop pulling jobs; graceful waits for in-flight work, otherwise
    /// in-flight jobs observe the abort signal and fail with "aborted"
    pub async fn stop(&self, graceful: bool) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shared.wake.notify_waiters();

        if let Some(sub) = self.wake_subscription.lock().unwrap().take() {
            self.events.unsubscribe(sub);
        }

        if !graceful {
            if let Some(handle) = self.abort.lock().unwrap().as_ref() {
                handle.abort();
            }
        }

        while self.shared.active.load(Ordering::SeqCst) > 0 {
            let _ = tokio::time::timeout(
                Duration::from_millis(50),
                self.shared.drained.notified(),
            )
            .await;
        }

        *self.abort.lock().unwrap() = None;

        if let Err(e) = self.events.emit(Event::ExecutorStopped).await {
            warn!("ExecutorStopped listeners failed: {}", e);
        }
        info!("Executor stopped (graceful={})", graceful);
    }

    /// Stop pulling without discarding in-flight work; queued jobs stay put
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
        debug!("Executor paused");
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::SeqCst);
        self.shared.resume.notify_waiters();
        self.shared.wake.notify_waiters();
        debug!("Executor resumed");
    }

    pub fn status(&self) -> ExecutorStatus {
        let uptime_ms = self
            .shared
            .started_at
            .lock()
            .unwrap()
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);
        ExecutorStatus {
            running: self.shared.running.load(Ordering::SeqCst),
            active_jobs: self.shared.active.load(Ordering::SeqCst),
            processed: self.shared.processed.load(Ordering::SeqCst),
            succeeded: self.shared.succeeded.load(Ordering::SeqCst),
            failed: self.shared.failed.load(Ordering::SeqCst),
            uptime_ms,
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        let status = self.status();
        let durations = self.shared.durations.lock().unwrap();
        let avg_execution_time_ms = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<u64>() as f64 / durations.len() as f64
        };
        let success_rate = if status.processed == 0 {
            0.0
        } else {
            status.succeeded as f64 / status.processed as f64
        };
        let jobs_per_second = if status.uptime_ms == 0 {
            0.0
        } else {
            status.processed as f64 / (status.uptime_ms as f64 / 1000.0)
        };
        ExecutorStats {
            avg_execution_time_ms,
            success_rate,
            jobs_per_second,
            queue_backlog: self.queue.total_size(),
            status,
        }
    }

    pub fn dead_letters(&self) -> Arc<DeadLetterLog> {
        Arc::clone(&self.dead_letters)
    }
}
