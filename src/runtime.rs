//! Reconciliation driver.
//!
//! Each resource kind gets a [`WorkQueue`] of object names and a [`Driver`]
//! running a fixed pool of workers against it. A key is handed to at most one
//! worker at a time: adding a key that is queued is a no-op, and adding a key
//! that is being processed marks it dirty so it is queued again once the
//! worker calls [`WorkQueue::done`]. Delayed adds of one key share a single
//! timer that fires at the earliest requested time.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use futures::future::join_all;
use tokio::{sync::Notify, time::Instant};
use tracing::{debug, info, warn};

use crate::{Error, Metrics};

/// What to do with a key after it was handled successfully.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Handle the key again after `duration`.
    pub fn requeue(duration: Duration) -> Self {
        Self {
            requeue_after: Some(duration),
        }
    }

    /// Wait for the next watch event.
    pub fn await_change() -> Self {
        Self {
            requeue_after: None,
        }
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// Per-key exponential backoff applied to failed keys.
#[derive(Clone, Copy, Debug)]
pub struct RateLimit {
    pub base: Duration,
    pub max: Duration,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5),
            max: Duration::from_secs(1000),
        }
    }
}

impl RateLimit {
    fn delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .map_or(self.max, |d| d.min(self.max))
    }
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    waiting: HashMap<String, Instant>,
    shutting_down: bool,
}

struct Inner {
    state: Mutex<QueueState>,
    notify: Notify,
    rate_limit: RateLimit,
}

/// Deduplicating, delaying and rate limited queue of object names.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new(RateLimit::default())
    }
}

impl WorkQueue {
    pub fn new(rate_limit: RateLimit) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::default(),
                notify: Notify::new(),
                rate_limit,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues `key` unless it is already waiting. Ignored after shutdown.
    pub fn add(&self, key: &str) {
        let mut state = self.state();
        if state.shutting_down || state.dirty.contains(key) {
            return;
        }
        state.dirty.insert(key.to_string());
        if !state.processing.contains(key) {
            state.queue.push_back(key.to_string());
            self.inner.notify.notify_one();
        }
    }

    /// Queues `key` once `delay` has elapsed.
    ///
    /// A key has at most one pending timer. A later deadline than the pending
    /// one is dropped, an earlier one replaces it.
    pub fn add_after(&self, key: &str, delay: Duration) {
        if delay.is_zero() {
            return self.add(key);
        }
        let due = Instant::now() + delay;
        {
            let mut state = self.state();
            if state.shutting_down {
                return;
            }
            match state.waiting.get(key) {
                Some(pending) if *pending <= due => return,
                _ => {
                    state.waiting.insert(key.to_string(), due);
                }
            }
        }

        let queue = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep_until(due).await;
            let fire = {
                let mut state = queue.state();
                if state.waiting.get(&key) == Some(&due) {
                    state.waiting.remove(&key);
                    true
                } else {
                    false
                }
            };
            if fire {
                queue.add(&key);
            }
        });
    }

    /// Queues `key` after its backoff delay, which doubles with every failure.
    pub fn add_rate_limited(&self, key: &str) {
        let delay = {
            let mut state = self.state();
            let failures = state.failures.entry(key.to_string()).or_default();
            *failures += 1;
            self.inner.rate_limit.delay(*failures)
        };
        self.add_after(key, delay);
    }

    /// Clears the backoff state of `key`.
    pub fn forget(&self, key: &str) {
        self.state().failures.remove(key);
    }

    /// Number of failures recorded for `key` since it was last forgotten.
    pub fn requeues(&self, key: &str) -> u32 {
        self.state().failures.get(key).copied().unwrap_or_default()
    }

    /// Waits for the next key. Returns `None` once the queue is shut down and
    /// drained.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Marks `key` as processed, queueing it again if it was added meanwhile.
    pub fn done(&self, key: &str) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_string());
            self.inner.notify.notify_one();
        }
    }

    /// Number of keys waiting to be processed.
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys waiting and keys handed out but not yet done, read together.
    pub fn outstanding(&self) -> (usize, usize) {
        let state = self.state();
        (state.queue.len(), state.processing.len())
    }

    pub fn shut_down(&self) {
        self.state().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }
}

/// Worker pool for one resource kind.
#[derive(Clone)]
pub struct Driver {
    name: &'static str,
    queue: WorkQueue,
    running: Arc<AtomicUsize>,
    shutdown_poll: Duration,
    metrics: Metrics,
}

impl Driver {
    pub fn new(name: &'static str, queue: WorkQueue, shutdown_poll: Duration, metrics: Metrics) -> Self {
        Self {
            name,
            queue,
            running: Arc::default(),
            shutdown_poll,
            metrics,
        }
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn enqueue(&self, key: &str) {
        self.queue.add(key);
    }

    /// Workers currently inside the handler.
    pub fn running_workers(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Runs `workers` workers until the queue is shut down and drained.
    ///
    /// A failed key is queued again with backoff, a successful one has its
    /// backoff reset and is queued again if the handler asked for it.
    pub async fn run<F, Fut>(&self, workers: usize, handler: F)
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Action, Error>> + Send + 'static,
    {
        info!(controller = self.name, workers, "Starting workers");
        let handler = Arc::new(handler);

        let handles = (0..workers).map(|_| {
            let driver = self.clone();
            let handler = handler.clone();
            tokio::spawn(async move { driver.work(handler.as_ref()).await })
        });

        for result in join_all(handles).await {
            if let Err(err) = result {
                warn!(controller = self.name, "Worker stopped abnormally: {err}");
            }
        }
        info!(controller = self.name, "All workers stopped");
    }

    async fn work<F, Fut>(&self, handler: &F)
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<Action, Error>>,
    {
        while let Some(key) = self.queue.get().await {
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.metrics.set_running_workers(self.name, running);

            let result = {
                let _timer = self.metrics.count_and_measure(self.name);
                handler(key.clone()).await
            };

            match result {
                Ok(action) => {
                    self.queue.forget(&key);
                    if let Some(delay) = action.requeue_after() {
                        self.queue.add_after(&key, delay);
                    }
                }
                Err(err) => {
                    warn!(controller = self.name, key, "Reconcile failed: {err}");
                    self.metrics.reconcile_failure(self.name, &err);
                    self.queue.add_rate_limited(&key);
                }
            }
            self.queue.done(&key);

            let running = self.running.fetch_sub(1, Ordering::SeqCst) - 1;
            self.metrics.set_running_workers(self.name, running);
        }
    }

    /// Stops intake and waits until no key is queued or handed out.
    ///
    /// Completion is polled every `shutdown_poll`.
    pub async fn shutdown(&self) {
        self.queue.shut_down();
        loop {
            let (queued, processing) = self.queue.outstanding();
            if queued == 0 && processing == 0 {
                break;
            }
            debug!(controller = self.name, queued, processing, "Waiting for workers to drain");
            tokio::time::sleep(self.shutdown_poll).await;
        }
        info!(controller = self.name, "Shut down");
    }
}
