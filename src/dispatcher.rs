//! Background delivery of committed events to every consumer.
//!
//! The dispatcher listens to the kernel's commit notifications and, after a
//! short debounce, drains each consumer's store subscription: poll a lease,
//! hand each event to [`Kernel::event`], ack. All drains run on one
//! [`Scheduler`] under a single task id, so bursts of commits coalesce and
//! no two drains ever overlap.
//!
//! A failing event stops its consumer's cycle without an ack. The lease then
//! expires and the same events are redelivered on a later drain.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::kernel::Kernel;
use crate::registry::Consumer;
use crate::scheduler::{Scheduler, SchedulerConfig, Task};

/// Scheduler id shared by every drain request.
const DRAIN: &str = "drain";

/// Configuration for [`Dispatcher`].
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum events per lease.
    ///
    /// Default: 100.
    pub limit: usize,

    /// How long a lease stays exclusive before it can be re-polled.
    ///
    /// Default: 5 seconds.
    pub lease_timeout: Duration,

    /// Delay between a commit notification and the drain it triggers.
    ///
    /// Default: 10 milliseconds.
    pub debounce: Duration,

    pub scheduler: SchedulerConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            limit: 100,
            lease_timeout: Duration::from_secs(5),
            debounce: Duration::from_millis(10),
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// Runs one drain cycle over every consumer.
#[derive(Clone)]
struct Drainer {
    kernel: Kernel,
    config: DispatcherConfig,
    scheduler: Scheduler,
}

impl Drainer {
    fn schedule(&self, delay: Option<Duration>) {
        let drainer = self.clone();
        let mut task = Task::new(DRAIN, async move { drainer.drain_all().await });
        if let Some(delay) = delay {
            task = task.with_delay(delay);
        }
        self.scheduler.push(task);
    }

    async fn drain_all(&self) {
        let mut failed = false;
        for consumer in self.kernel.consumers() {
            failed |= !self.drain(consumer).await;
        }
        if failed {
            // Leased events come back once the lease expires.
            self.schedule(Some(self.config.lease_timeout));
        }
    }

    /// Lease and deliver batches until `consumer` is caught up.
    ///
    /// Returns `false` if the cycle stopped on a failure.
    async fn drain(&self, consumer: &Consumer) -> bool {
        let store = self.kernel.store();
        let name = consumer.name.as_str();
        loop {
            let lease = match store
                .poll(
                    name,
                    &consumer.names,
                    self.config.limit,
                    self.config.lease_timeout,
                )
                .await
            {
                Ok(Some(lease)) => lease,
                Ok(None) => return true,
                Err(e) => {
                    tracing::error!(consumer = name, error = %e, "poll failed");
                    return false;
                }
            };

            for event in &lease.events {
                if let Err(e) = self.kernel.event(name, event).await {
                    tracing::error!(
                        consumer = name,
                        id = event.id,
                        event = %event.name,
                        error = %e,
                        "event delivery failed; leaving lease to expire"
                    );
                    return false;
                }
            }

            let delivered = lease.events.len();
            match store.ack(&lease, None).await {
                Ok(true) => {
                    tracing::debug!(consumer = name, delivered, "batch acknowledged");
                }
                Ok(false) => {
                    tracing::warn!(consumer = name, "lease expired before ack");
                    return false;
                }
                Err(e) => {
                    tracing::error!(consumer = name, error = %e, "ack failed");
                    return false;
                }
            }
            if delivered < self.config.limit {
                return true;
            }
        }
    }
}

struct Listener {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Delivers committed events to consumers in the background.
///
/// `Clone` is cheap; clones share the same scheduler and listener.
///
/// # Examples
///
/// ```no_run
/// use eventfold_kernel::{Dispatcher, DispatcherConfig, Kernel};
///
/// # async fn run(kernel: Kernel) {
/// let dispatcher = Dispatcher::new(kernel, DispatcherConfig::default());
/// dispatcher.start();
/// // ... commands ...
/// dispatcher.drain().await;
/// dispatcher.stop().await;
/// # }
/// ```
#[derive(Clone)]
pub struct Dispatcher {
    drainer: Drainer,
    listener: Arc<Mutex<Option<Listener>>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.drainer.config)
            .field("scheduler", &self.drainer.scheduler)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Create a stopped dispatcher over `kernel`'s consumers.
    ///
    /// Call [`start`](Dispatcher::start) to follow commits, or
    /// [`drain`](Dispatcher::drain) to deliver once.
    pub fn new(kernel: Kernel, config: DispatcherConfig) -> Self {
        let scheduler = Scheduler::new(config.scheduler.clone());
        Self {
            drainer: Drainer {
                kernel,
                config,
                scheduler,
            },
            listener: Arc::new(Mutex::new(None)),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.drainer.scheduler
    }

    /// Start the scheduler and listen for commits.
    ///
    /// Each notification schedules a drain after the debounce delay.
    /// Calling `start` again while running is a no-op.
    ///
    /// Must be called within a Tokio runtime.
    pub fn start(&self) {
        self.drainer.scheduler.start();
        let mut listener = self.listener.lock();
        if listener.is_some() {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let mut commits = BroadcastStream::new(self.drainer.kernel.subscribe());
        let drainer = self.drainer.clone();
        let task = tokio::spawn(async move {
            let debounce = Some(drainer.config.debounce);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    item = commits.next() => match item {
                        Some(Ok(_)) => drainer.schedule(debounce),
                        Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                            // Positions live in the store; a drain catches up.
                            tracing::warn!(skipped, "commit notifications lagged");
                            drainer.schedule(debounce);
                        }
                        None => break,
                    },
                }
            }
        });
        *listener = Some(Listener { shutdown_tx, task });
        tracing::info!(
            consumers = self.drainer.kernel.consumers().len(),
            "dispatcher started"
        );
    }

    /// Force a drain now and wait until the scheduler is idle.
    ///
    /// Starts the scheduler if needed, but not the listener.
    pub async fn drain(&self) {
        self.drainer.scheduler.start();
        self.drainer.schedule(None);
        self.drainer.scheduler.idle().await;
    }

    /// Stop listening, then stop the scheduler.
    pub async fn stop(&self) {
        let listener = self.listener.lock().take();
        if let Some(Listener { shutdown_tx, task }) = listener {
            let _ = shutdown_tx.send(true);
            if let Err(e) = task.await {
                tracing::error!(error = %e, "commit listener failed");
            }
        }
        self.drainer.scheduler.stop().await;
        tracing::info!("dispatcher stopped");
    }
}
