//! Broadcast queue manager
//!
//! One worker loop drains a FIFO of broadcast ids, so at most one
//! broadcast is processed at a time system-wide. Each job runs under a
//! hard wall-clock timeout; a failed or timed-out job goes back to the
//! tail until its attempts are exhausted, then the collaborator is told
//! to mark it permanently failed. A health check watches for a
//! processing flag stuck on without forward progress and force-resets
//! it, so one wedged broadcast can never stall the queue forever.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Collaborator the queue drives; persistence lives behind it
#[async_trait]
pub trait BroadcastProcessor: Send + Sync {
    /// Run one broadcast to completion
    async fn process(&self, id: u64) -> anyhow::Result<()>;

    /// Record that a broadcast is permanently failed
    async fn mark_failed(&self, id: u64, reason: &str);
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Wall-clock cap on one processing attempt
    pub job_timeout: Duration,
    /// Total attempts before a job is marked failed
    pub max_attempts: u32,
    /// Pause between jobs
    pub inter_job_delay: Duration,
    /// How often the stuck-state check runs
    pub health_check_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            job_timeout: Duration::from_secs(300),
            max_attempts: 3,
            inter_job_delay: Duration::from_secs(3),
            health_check_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Job {
    id: u64,
    attempt: u32,
}

struct QueueState {
    jobs: VecDeque<Job>,
    processing: bool,
    /// Last time the worker made forward progress, for the health check
    last_progress: Instant,
}

/// Single-flight broadcast queue
pub struct BroadcastQueue {
    config: QueueConfig,
    processor: Arc<dyn BroadcastProcessor>,
    state: Mutex<QueueState>,
    wakeup: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BroadcastQueue {
    pub fn new(config: QueueConfig, processor: Arc<dyn BroadcastProcessor>) -> Arc<Self> {
        Arc::new(Self {
            config,
            processor,
            state: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                processing: false,
                last_progress: Instant::now(),
            }),
            wakeup: Notify::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the worker and health-check loops
    pub fn start(self: &Arc<Self>) {
        let worker = tokio::spawn(worker_loop(self.clone()));
        let health = tokio::spawn(health_loop(self.clone()));
        self.tasks.lock().extend([worker, health]);
    }

    /// Append a broadcast to the tail of the queue
    pub fn enqueue(&self, id: u64) {
        self.state.lock().jobs.push_back(Job { id, attempt: 1 });
        debug!("broadcast {} queued", id);
        self.wakeup.notify_one();
    }

    /// Jobs waiting, not counting one currently processing
    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().jobs.is_empty()
    }

    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn next_job(&self) -> Option<Job> {
        let mut state = self.state.lock();
        let job = state.jobs.pop_front()?;
        state.processing = true;
        state.last_progress = Instant::now();
        Some(job)
    }

    fn finish_job(&self) {
        let mut state = self.state.lock();
        state.processing = false;
        state.last_progress = Instant::now();
    }

    async fn run_job(&self, job: Job) {
        info!(
            "processing broadcast {} (attempt {}/{})",
            job.id, job.attempt, self.config.max_attempts
        );
        let result = tokio::time::timeout(self.config.job_timeout, self.processor.process(job.id)).await;

        let reason = match result {
            Ok(Ok(())) => {
                info!("broadcast {} completed", job.id);
                self.finish_job();
                return;
            }
            Ok(Err(e)) => format!("{:#}", e),
            Err(_) => format!("timed out after {:?}", self.config.job_timeout),
        };

        if job.attempt < self.config.max_attempts {
            warn!(
                "broadcast {} attempt {} failed ({}), requeueing",
                job.id, job.attempt, reason
            );
            self.state.lock().jobs.push_back(Job {
                id: job.id,
                attempt: job.attempt + 1,
            });
        } else {
            warn!(
                "broadcast {} failed on final attempt {}: {}",
                job.id, job.attempt, reason
            );
            self.processor.mark_failed(job.id, &reason).await;
        }
        self.finish_job();
    }
}

async fn worker_loop(queue: Arc<BroadcastQueue>) {
    loop {
        let Some(job) = queue.next_job() else {
            queue.wakeup.notified().await;
            continue;
        };
        queue.run_job(job).await;
        tokio::time::sleep(queue.config.inter_job_delay).await;
    }
}

/// Force-resets a processing flag stuck on with no forward progress for
/// twice the job timeout, then kicks the worker back awake.
async fn health_loop(queue: Arc<BroadcastQueue>) {
    let stall_limit = queue.config.job_timeout * 2;
    let mut ticker = tokio::time::interval(queue.config.health_check_interval);
    loop {
        ticker.tick().await;
        let stuck = {
            let mut state = queue.state.lock();
            if state.processing && state.last_progress.elapsed() > stall_limit {
                state.processing = false;
                state.last_progress = Instant::now();
                true
            } else {
                false
            }
        };
        if stuck {
            warn!(
                "queue processing flag stuck for over {:?}, force-reset",
                stall_limit
            );
            queue.wakeup.notify_one();
        }
    }
}
