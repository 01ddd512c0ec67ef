//! Follow-up work emitted after a committed checkpoint.
//!
//! ```text
//! checkpoint commit ──► PageEvents (broadcast PageUpdated)
//!                  └──► JobQueue ──► worker ──► BacklinkIndexer
//!                        keyed by page id       retried with exponential backoff
//! ```
//!
//! Neither path blocks the checkpoint: events are fire-and-forget and jobs
//! run on a background task.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::storage::{PageRecord, StoreError};

const EVENT_CAPACITY: usize = 256;

/// Notifications for the surrounding application.
#[derive(Debug, Clone, PartialEq)]
pub enum PageEvent {
    /// Page content changed; carries the refreshed row.
    PageUpdated { page: PageRecord },
}

/// Broadcast bus for [`PageEvent`]s.
#[derive(Clone)]
pub struct PageEvents {
    sender: broadcast::Sender<PageEvent>,
}

impl PageEvents {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PageEvent> {
        self.sender.subscribe()
    }

    /// Publish to current subscribers; returns how many received it.
    pub fn publish(&self, event: PageEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }
}

impl Default for PageEvents {
    fn default() -> Self {
        Self::new()
    }
}

/// Recompute the backlinks of one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BacklinkJob {
    pub page_id: Uuid,
    pub workspace_id: Uuid,
    pub mentioned_page_ids: Vec<Uuid>,
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("indexing failed: {0}")]
    Failed(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Consumer of backlink jobs.
#[async_trait]
pub trait BacklinkIndexer: Send + Sync {
    async fn index(&self, job: &BacklinkJob) -> Result<(), IndexError>;
}

/// Exponential backoff for failed jobs.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Job queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobStats {
    pub enqueued: u64,
    pub completed: u64,
    pub failed: u64,
    pub retries: u64,
}

#[derive(Default)]
struct Pending {
    order: VecDeque<Uuid>,
    jobs: HashMap<Uuid, BacklinkJob>,
}

struct Shared {
    pending: Mutex<Pending>,
    notify: Notify,
    closed: AtomicBool,
    enqueued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
}

/// Background queue of backlink jobs.
///
/// A job enqueued while an older job for the same page is still waiting
/// replaces it.
pub struct JobQueue {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl JobQueue {
    /// Start the worker task.
    pub fn start(indexer: Arc<dyn BacklinkIndexer>, policy: RetryPolicy) -> Self {
        let shared = Arc::new(Shared {
            pending: Mutex::new(Pending::default()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            enqueued: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        });
        let worker = tokio::spawn(run_worker(shared.clone(), indexer, policy));
        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub async fn enqueue(&self, job: BacklinkJob) {
        {
            let mut pending = self.shared.pending.lock().await;
            if pending.jobs.insert(job.page_id, job.clone()).is_none() {
                pending.order.push_back(job.page_id);
            }
        }
        self.shared.enqueued.fetch_add(1, Ordering::Relaxed);
        self.shared.notify.notify_one();
    }

    /// Jobs waiting to be picked up.
    pub async fn pending(&self) -> usize {
        self.shared.pending.lock().await.order.len()
    }

    pub fn stats(&self) -> JobStats {
        JobStats {
            enqueued: self.shared.enqueued.load(Ordering::Relaxed),
            completed: self.shared.completed.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
            retries: self.shared.retries.load(Ordering::Relaxed),
        }
    }

    /// Finish queued jobs and stop the worker.
    pub async fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_one();
        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(e) = worker.await {
                log::error!("Backlink worker ended abnormally: {e}");
            }
        }
    }
}

async fn run_worker(shared: Arc<Shared>, indexer: Arc<dyn BacklinkIndexer>, policy: RetryPolicy) {
    loop {
        let next = {
            let mut pending = shared.pending.lock().await;
            match pending.order.pop_front() {
                Some(page_id) => pending.jobs.remove(&page_id),
                None => None,
            }
        };

        match next {
            Some(job) => process(&shared, indexer.as_ref(), &policy, &job).await,
            None if shared.closed.load(Ordering::SeqCst) => break,
            None => shared.notify.notified().await,
        }
    }
    log::debug!("Backlink worker stopped");
}

async fn process(
    shared: &Shared,
    indexer: &dyn BacklinkIndexer,
    policy: &RetryPolicy,
    job: &BacklinkJob,
) {
    let mut attempt = 1;
    loop {
        match indexer.index(job).await {
            Ok(()) => {
                shared.completed.fetch_add(1, Ordering::Relaxed);
                log::trace!("Indexed backlinks of page {}", job.page_id);
                return;
            }
            Err(e) if attempt < policy.max_attempts => {
                let delay = policy.delay(attempt);
                log::warn!(
                    "Backlink job for page {} failed (attempt {attempt}/{}), retrying in {delay:?}: {e}",
                    job.page_id,
                    policy.max_attempts
                );
                shared.retries.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                shared.failed.fetch_add(1, Ordering::Relaxed);
                log::error!(
                    "Backlink job for page {} abandoned after {attempt} attempts: {e}",
                    job.page_id
                );
                return;
            }
        }
    }
}
