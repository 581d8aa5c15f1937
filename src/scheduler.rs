//! A single-worker task queue with id-based coalescing and delays.
//!
//! Tasks run strictly one at a time, in FIFO order, on one dedicated worker
//! task. Pushing an id that is already waiting replaces its action instead
//! of queueing a second run, which is what lets the dispatcher coalesce a
//! burst of commit notifications into one drain.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

/// A unit of scheduled work.
pub type Action = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// An action keyed by id, optionally delayed.
pub struct Task {
    pub id: String,
    pub delay: Option<Duration>,
    action: Action,
}

impl Task {
    /// An undelayed task. Pushing another task under `id` coalesces with it.
    pub fn new(id: impl Into<String>, action: impl Future<Output = ()> + Send + 'static) -> Self {
        Self {
            id: id.into(),
            delay: None,
            action: Box::pin(action),
        }
    }

    /// Arm a timer instead of enqueueing immediately.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

/// Configuration for [`Scheduler`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use eventfold_kernel::SchedulerConfig;
///
/// let config = SchedulerConfig::default();
/// assert_eq!(config.stop_timeout, Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How long [`Scheduler::stop`] lets the worker drain the queue before
    /// clearing whatever is left.
    ///
    /// Default: 5 seconds.
    pub stop_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(5),
        }
    }
}

/// Lifecycle: `Stopped -> Running -> Stopping -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerStatus {
    Stopped,
    Running,
    Stopping,
}

struct Queue {
    tasks: VecDeque<(String, Action)>,
    /// Pending delayed pushes, by id, with the generation that armed them.
    timers: HashMap<String, (u64, JoinHandle<()>)>,
    generation: u64,
    running: bool,
    status: SchedulerStatus,
}

impl Queue {
    fn is_idle(&self) -> bool {
        self.tasks.is_empty() && !self.running
    }
}

struct Inner {
    config: SchedulerConfig,
    queue: Mutex<Queue>,
    wake: Notify,
    idle: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn publish_idle(&self, queue: &Queue) {
        let idle = queue.is_idle();
        self.idle.send_if_modified(|current| {
            let changed = *current != idle;
            *current = idle;
            changed
        });
    }

    /// Append `action`, or replace the action already waiting under `id`.
    fn enqueue(&self, queue: &mut Queue, id: String, action: Action) {
        match queue.tasks.iter_mut().find(|(queued, _)| *queued == id) {
            Some(slot) => slot.1 = action,
            None => queue.tasks.push_back((id, action)),
        }
        self.publish_idle(queue);
        self.wake.notify_one();
    }

    /// Timer expiry: enqueue unless a later push superseded this timer.
    fn fire(&self, id: String, generation: u64, action: Action) {
        let mut queue = self.queue.lock();
        if queue.timers.get(&id).is_some_and(|(g, _)| *g == generation) {
            queue.timers.remove(&id);
            self.enqueue(&mut queue, id, action);
        }
    }
}

/// Sequential task queue with one dedicated worker.
///
/// `Clone` is cheap: all state is `Arc`-wrapped.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Create a stopped scheduler.
    ///
    /// # Arguments
    ///
    /// * `config` - Stop timeout; see [`SchedulerConfig`].
    pub fn new(config: SchedulerConfig) -> Self {
        let (idle, _) = watch::channel(true);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                queue: Mutex::new(Queue {
                    tasks: VecDeque::new(),
                    timers: HashMap::new(),
                    generation: 0,
                    running: false,
                    status: SchedulerStatus::Stopped,
                }),
                wake: Notify::new(),
                idle,
                shutdown,
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn status(&self) -> SchedulerStatus {
        self.inner.queue.lock().status
    }

    /// Spawn the worker. A no-op unless stopped.
    ///
    /// Must be called within a Tokio runtime.
    pub fn start(&self) {
        {
            let mut queue = self.inner.queue.lock();
            if queue.status != SchedulerStatus::Stopped {
                return;
            }
            queue.status = SchedulerStatus::Running;
        }
        self.inner.shutdown.send_replace(false);
        let worker = tokio::spawn(run(Arc::clone(&self.inner)));
        *self.inner.worker.lock() = Some(worker);
        tracing::info!("scheduler started");
    }

    /// Queue `task`, coalescing with anything already waiting under its id.
    ///
    /// - Delayed: arms a timer, aborting any timer pending for the id.
    /// - Undelayed: cancels any pending timer for the id, then enqueues. If
    ///   the id is already queued its action is replaced in place.
    ///
    /// Tasks pushed while stopped run once the scheduler starts. Tasks
    /// pushed while stopping are dropped.
    ///
    /// Must be called within a Tokio runtime.
    pub fn push(&self, task: Task) {
        let Task { id, delay, action } = task;
        let mut queue = self.inner.queue.lock();
        if queue.status == SchedulerStatus::Stopping {
            tracing::debug!(task = %id, "scheduler stopping; dropping task");
            return;
        }
        if let Some((_, timer)) = queue.timers.remove(&id) {
            timer.abort();
        }
        match delay {
            Some(delay) => {
                queue.generation += 1;
                let generation = queue.generation;
                let inner = Arc::clone(&self.inner);
                let timer_id = id.clone();
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    inner.fire(timer_id, generation, action);
                });
                queue.timers.insert(id, (generation, timer));
            }
            None => self.inner.enqueue(&mut queue, id, action),
        }
    }

    /// Wait until no task is queued or running.
    ///
    /// Pending timers do not count. Never resolves while tasks are queued
    /// on a stopped scheduler.
    pub async fn idle(&self) {
        let mut idle = self.inner.idle.subscribe();
        // The sender lives as long as `self`.
        let _ = idle.wait_for(|idle| *idle).await;
    }

    /// Drain the queue, then stop the worker.
    ///
    /// Pending timers are aborted at once and new pushes are refused. The
    /// worker keeps running queued tasks for up to
    /// [`SchedulerConfig::stop_timeout`]; after that the queue is cleared.
    /// The in-flight action is never aborted.
    pub async fn stop(&self) {
        {
            let mut queue = self.inner.queue.lock();
            if queue.status != SchedulerStatus::Running {
                return;
            }
            queue.status = SchedulerStatus::Stopping;
            for (_, (_, timer)) in queue.timers.drain() {
                timer.abort();
            }
        }
        self.inner.shutdown.send_replace(true);

        let worker = self.inner.worker.lock().take();
        if let Some(mut worker) = worker {
            let timeout = self.inner.config.stop_timeout;
            match tokio::time::timeout(timeout, &mut worker).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "scheduler worker failed"),
                Err(_) => {
                    // The action runs in its own task and survives this.
                    worker.abort();
                    tracing::warn!(?timeout, "queue outlived the stop timeout");
                }
            }
        }

        let mut queue = self.inner.queue.lock();
        let dropped = queue.tasks.len();
        queue.tasks.clear();
        queue.running = false;
        queue.status = SchedulerStatus::Stopped;
        self.inner.publish_idle(&queue);
        tracing::info!(dropped, "scheduler stopped");
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

/// Worker loop: pop, run to completion, repeat. Exits once shut down and
/// the queue is empty.
async fn run(inner: Arc<Inner>) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        let next = {
            let mut queue = inner.queue.lock();
            let next = queue.tasks.pop_front();
            if next.is_some() {
                queue.running = true;
            }
            next
        };

        match next {
            Some((id, action)) => {
                if let Err(e) = tokio::spawn(action).await {
                    tracing::error!(task = %id, error = %e, "scheduled task panicked");
                }
                let mut queue = inner.queue.lock();
                queue.running = false;
                inner.publish_idle(&queue);
            }
            None if *shutdown.borrow_and_update() => break,
            None => {
                tokio::select! {
                    _ = inner.wake.notified() => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
}
