use std::borrow::Cow;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use busvane_stats::{RateComputer, RateReport, StatsStore, StoreSnapshot};
use busvane_transport::BusClient;
use futures_util::FutureExt;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Timing knobs for the watcher loop.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Interval between reconcile/rate passes. The rate window equals this
    /// interval; the stock 1 s makes window counts read directly as Hz.
    pub tick_interval: Duration,
    /// How long shutdown waits for an in-flight pass before aborting it.
    pub shutdown_grace: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl WatcherConfig {
    /// Defaults with a `BUSVANE_TICK_MS` override when set and non-empty.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(ms) = std::env::var("BUSVANE_TICK_MS")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .and_then(|s| s.trim().parse::<u64>().ok())
        {
            cfg.tick_interval = Duration::from_millis(ms.max(10));
        }
        cfg
    }
}

/// Background task handle carrying a name for shutdown logs.
#[derive(Debug)]
pub struct TaskHandle {
    name: Cow<'static, str>,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    pub fn new(name: impl Into<Cow<'static, str>>, handle: JoinHandle<()>) -> Self {
        Self {
            name: name.into(),
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Wait up to `grace` for the task to finish, then abort it.
    pub async fn shutdown_with_grace(self, grace: Duration) {
        let Self { name, mut handle } = self;
        if grace.is_zero() {
            handle.abort();
            if let Err(err) = handle.await {
                debug!(task = %name, ?err, "task join after abort failed");
            }
            return;
        }
        let sleeper = tokio::time::sleep(grace);
        tokio::pin!(sleeper);
        tokio::select! {
            res = &mut handle => {
                if let Err(err) = res {
                    debug!(task = %name, ?err, "task exited with error");
                }
            }
            _ = &mut sleeper => {
                handle.abort();
                if let Err(err) = handle.await {
                    debug!(task = %name, ?err, "task join after abort failed");
                }
            }
        }
    }
}

/// Spawn a background loop that restarts on panic with exponential
/// backoff, so a transient bug in one pass cannot kill the loop for good.
pub fn spawn_supervised<F, Fut>(name: impl Into<Cow<'static, str>>, mut factory: F) -> TaskHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let name_cow = name.into();
    let task_name = name_cow.clone();
    let handle = tokio::spawn(async move {
        let mut backoff_ms: u64 = 200;
        loop {
            let result = std::panic::AssertUnwindSafe(factory()).catch_unwind().await;
            match result {
                Ok(()) => {
                    debug!(task = %task_name, "supervised task completed");
                    break;
                }
                Err(_) => {
                    error!(task = %task_name, backoff_ms, "supervised task panicked; restarting");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = backoff_ms.saturating_mul(2).min(10_000);
                }
            }
        }
    });
    TaskHandle::new(name_cow, handle)
}

/// Owns the periodic reconcile/rate loop over one bus.
///
/// Each tick runs a reconcile pass and then a rate pass; presenters pull
/// [`snapshot`](Self::snapshot) and [`latest_report`](Self::latest_report)
/// between ticks. [`shutdown`](Self::shutdown) stops the loop, lets an
/// in-flight pass finish, then unsubscribes every tracked topic exactly
/// once and clears the store.
pub struct TopicWatcher {
    store: Arc<StatsStore>,
    rates: Arc<RateComputer>,
    reconciler: Arc<Mutex<crate::TopicReconciler>>,
    stop_flag: Arc<AtomicBool>,
    stop: Arc<Notify>,
    grace: Duration,
    task: Option<TaskHandle>,
}

impl TopicWatcher {
    pub fn spawn(bus: Arc<dyn BusClient>, config: WatcherConfig) -> Self {
        let store = Arc::new(StatsStore::new());
        let rates = Arc::new(RateComputer::new());
        let reconciler = Arc::new(Mutex::new(crate::TopicReconciler::new(bus, store.clone())));
        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(Notify::new());

        let loop_store = store.clone();
        let loop_rates = rates.clone();
        let loop_reconciler = reconciler.clone();
        let loop_stop_flag = stop_flag.clone();
        let loop_stop = stop.clone();
        let tick_interval = config.tick_interval;
        let task = spawn_supervised("topic_watcher.tick_loop", move || {
            let store = loop_store.clone();
            let rates = loop_rates.clone();
            let reconciler = loop_reconciler.clone();
            let stop_flag = loop_stop_flag.clone();
            let stop = loop_stop.clone();
            async move {
                if stop_flag.load(Ordering::SeqCst) {
                    return;
                }
                let mut tick = interval(tick_interval);
                tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = tick.tick() => {}
                        _ = stop.notified() => {}
                    }
                    if stop_flag.load(Ordering::SeqCst) {
                        break;
                    }
                    match reconciler.lock().await.reconcile().await {
                        Ok(outcome) => {
                            if outcome.changed() {
                                debug!(
                                    added = outcome.added,
                                    removed = outcome.removed,
                                    subscribe_failures = outcome.subscribe_failures,
                                    unsubscribe_failures = outcome.unsubscribe_failures,
                                    "reconciled topic set"
                                );
                            }
                            rates.tick(&store);
                        }
                        Err(err) => {
                            warn!(error = %err, "topic listing failed; skipping this pass");
                        }
                    }
                }
            }
        });

        Self {
            store,
            rates,
            reconciler,
            stop_flag,
            stop,
            grace: config.shutdown_grace,
            task: Some(task),
        }
    }

    pub fn store(&self) -> Arc<StatsStore> {
        self.store.clone()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.store.snapshot()
    }

    pub fn latest_report(&self) -> RateReport {
        self.rates.latest()
    }

    /// Stop the tick loop and release every subscription. After this
    /// returns the store is empty and each tracked topic saw exactly one
    /// unsubscribe call.
    pub async fn shutdown(mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        self.stop.notify_one();
        if let Some(task) = self.task.take() {
            task.shutdown_with_grace(self.grace).await;
        }
        let mut reconciler = self.reconciler.lock().await;
        reconciler.shutdown().await;
        info!("topic watcher stopped");
    }
}

impl Drop for TopicWatcher {
    fn drop(&mut self) {
        // Dropping without shutdown still stops the loop; subscriptions
        // are only torn down by an explicit shutdown.
        if let Some(task) = self.task.take() {
            self.stop_flag.store(true, Ordering::SeqCst);
            self.stop.notify_one();
            task.abort();
        }
    }
}
