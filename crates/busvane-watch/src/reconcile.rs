use std::collections::HashSet;
use std::sync::Arc;

use busvane_stats::StatsStore;
use busvane_transport::{BusClient, Delivery, Handler, TransportError};
use tracing::warn;

/// Counts from one reconcile pass, for logs and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub added: usize,
    pub removed: usize,
    pub subscribe_failures: usize,
    pub unsubscribe_failures: usize,
}

impl ReconcileOutcome {
    pub fn changed(&self) -> bool {
        *self != Self::default()
    }
}

/// Keeps subscriptions and stats-store membership in step with the bus's
/// live topic listing. One instance is driven by the watcher's timer;
/// nothing here is fatal, subscription failures degrade to retries.
pub struct TopicReconciler {
    bus: Arc<dyn BusClient>,
    store: Arc<StatsStore>,
    handler: Handler,
    /// Topics known as of the last pass, in discovery order.
    previous: Vec<String>,
}

impl TopicReconciler {
    pub fn new(bus: Arc<dyn BusClient>, store: Arc<StatsStore>) -> Self {
        let handler_store = store.clone();
        let handler: Handler = Arc::new(move |delivery: Delivery| {
            handler_store.record(&delivery.topic, delivery.byte_size as u64);
        });
        Self {
            bus,
            store,
            handler,
            previous: Vec::new(),
        }
    }

    /// One pass: list the live topics, unsubscribe what disappeared, then
    /// subscribe what appeared. Removals always run before additions.
    ///
    /// A failed subscribe leaves its topic out of the remembered set so
    /// the next pass retries it. A failed unsubscribe is logged and the
    /// stats entry is dropped regardless (best-effort cleanup). Only a
    /// listing failure aborts the pass, leaving all state untouched.
    pub async fn reconcile(&mut self) -> Result<ReconcileOutcome, TransportError> {
        let listed = self.bus.list_topics().await?;
        let live: HashSet<&str> = listed.iter().map(String::as_str).collect();
        let known: HashSet<&str> = self.previous.iter().map(String::as_str).collect();

        let mut outcome = ReconcileOutcome::default();

        let removed: Vec<String> = self
            .previous
            .iter()
            .filter(|topic| !live.contains(topic.as_str()))
            .cloned()
            .collect();
        for topic in &removed {
            if !self.bus.unsubscribe(topic).await {
                outcome.unsubscribe_failures += 1;
                warn!(topic = %topic, "unsubscribe failed; dropping stats entry anyway");
            }
            self.store.remove(topic);
            outcome.removed += 1;
        }

        let mut failed: HashSet<String> = HashSet::new();
        for topic in &listed {
            if known.contains(topic.as_str()) {
                continue;
            }
            if self.bus.subscribe(topic, self.handler.clone()).await {
                self.store.create(topic);
                outcome.added += 1;
            } else {
                outcome.subscribe_failures += 1;
                warn!(topic = %topic, "subscribe failed; retrying next cycle");
                failed.insert(topic.clone());
            }
        }

        // Topics whose subscribe failed stay out of the remembered set so
        // they count as additions again next pass.
        self.previous = listed
            .into_iter()
            .filter(|topic| !failed.contains(topic))
            .collect();
        Ok(outcome)
    }

    /// Unsubscribe every tracked topic exactly once and clear the store.
    /// After this returns no subscription or stats entry remains.
    pub async fn shutdown(&mut self) {
        for topic in self.store.topics() {
            if !self.bus.unsubscribe(&topic).await {
                warn!(topic = %topic, "unsubscribe failed during shutdown");
            }
        }
        self.store.clear();
        self.previous.clear();
    }

    pub fn previous_topics(&self) -> &[String] {
        &self.previous
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use busvane_transport::MemoryBus;
    use tokio::sync::Mutex;

    fn setup(bus: &MemoryBus) -> (TopicReconciler, Arc<StatsStore>) {
        let store = Arc::new(StatsStore::new());
        let reconciler = TopicReconciler::new(Arc::new(bus.clone()), store.clone());
        (reconciler, store)
    }

    #[tokio::test]
    async fn first_pass_subscribes_every_listed_topic() {
        let bus = MemoryBus::new();
        bus.set_topics(["/pose", "/scan"]).await;
        let (mut reconciler, store) = setup(&bus);

        let outcome = reconciler.reconcile().await.expect("listing");
        assert_eq!(outcome.added, 2);
        assert_eq!(outcome.removed, 0);
        assert_eq!(outcome.subscribe_failures, 0);
        assert_eq!(store.topics(), ["/pose", "/scan"]);
        assert_eq!(bus.active_subscriptions().await, ["/pose", "/scan"]);
        assert_eq!(reconciler.previous_topics(), ["/pose", "/scan"]);
    }

    #[tokio::test]
    async fn unchanged_listing_causes_no_churn() {
        let bus = MemoryBus::new();
        bus.set_topics(["/pose", "/scan"]).await;
        let (mut reconciler, store) = setup(&bus);

        reconciler.reconcile().await.expect("listing");
        let second = reconciler.reconcile().await.expect("listing");
        assert!(!second.changed());
        assert_eq!(bus.subscribe_calls("/pose").await, 1);
        assert_eq!(bus.subscribe_calls("/scan").await, 1);
        assert_eq!(bus.unsubscribe_calls("/pose").await, 0);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn store_tracks_the_latest_listing() {
        let bus = MemoryBus::new();
        bus.set_topics(["/a", "/b"]).await;
        let (mut reconciler, store) = setup(&bus);
        reconciler.reconcile().await.expect("listing");

        bus.remove_topic("/a").await;
        bus.add_topic("/c").await;
        let outcome = reconciler.reconcile().await.expect("listing");
        assert_eq!(outcome.removed, 1);
        assert_eq!(outcome.added, 1);
        assert_eq!(store.topics(), ["/b", "/c"]);
        assert_eq!(bus.unsubscribe_calls("/a").await, 1);
        assert_eq!(bus.active_subscriptions().await, ["/b", "/c"]);
    }

    #[tokio::test]
    async fn failed_subscribe_is_skipped_then_retried() {
        let bus = MemoryBus::new();
        bus.set_topics(["/good", "/flaky"]).await;
        bus.deny_subscribe("/flaky", true).await;
        let (mut reconciler, store) = setup(&bus);

        let first = reconciler.reconcile().await.expect("listing");
        assert_eq!(first.added, 1);
        assert_eq!(first.subscribe_failures, 1);
        assert!(!store.contains("/flaky"));
        assert_eq!(reconciler.previous_topics(), ["/good"]);

        // Still failing: retried every pass, never tracked.
        reconciler.reconcile().await.expect("listing");
        assert_eq!(bus.subscribe_calls("/flaky").await, 2);
        assert!(!store.contains("/flaky"));

        bus.deny_subscribe("/flaky", false).await;
        let healed = reconciler.reconcile().await.expect("listing");
        assert_eq!(healed.added, 1);
        assert!(store.contains("/flaky"));
        assert_eq!(bus.subscribe_calls("/good").await, 1);
    }

    #[tokio::test]
    async fn failed_unsubscribe_still_drops_the_stats_entry() {
        let bus = MemoryBus::new();
        bus.set_topics(["/leaky"]).await;
        let (mut reconciler, store) = setup(&bus);
        reconciler.reconcile().await.expect("listing");

        bus.deny_unsubscribe("/leaky", true).await;
        bus.remove_topic("/leaky").await;
        let outcome = reconciler.reconcile().await.expect("listing");
        assert_eq!(outcome.removed, 1);
        assert_eq!(outcome.unsubscribe_failures, 1);
        assert!(store.is_empty());
        // The subscription itself may leak; that is accepted best-effort.
        assert_eq!(bus.active_subscriptions().await, ["/leaky"]);
    }

    #[tokio::test]
    async fn listing_failure_leaves_all_state_untouched() {
        let bus = MemoryBus::new();
        bus.set_topics(["/pose"]).await;
        let (mut reconciler, store) = setup(&bus);
        reconciler.reconcile().await.expect("listing");

        bus.set_fail_listing(true);
        assert!(reconciler.reconcile().await.is_err());
        assert_eq!(reconciler.previous_topics(), ["/pose"]);
        assert_eq!(store.topics(), ["/pose"]);
        assert_eq!(bus.subscribe_calls("/pose").await, 1);
    }

    #[tokio::test]
    async fn deliveries_flow_into_the_store() {
        let bus = MemoryBus::new();
        bus.set_topics(["/pose"]).await;
        let (mut reconciler, store) = setup(&bus);
        reconciler.reconcile().await.expect("listing");

        for _ in 0..3 {
            assert!(bus.publish("/pose", 48).await);
        }
        // Unsubscribing drains the forwarder, so the records are in.
        assert!(bus.unsubscribe("/pose").await);
        let stats = store.get("/pose").expect("tracked");
        assert_eq!(stats.total_messages, 3);
        assert_eq!(stats.window_bytes, 144);
    }

    #[tokio::test]
    async fn shutdown_unsubscribes_everything_and_clears() {
        let bus = MemoryBus::new();
        bus.set_topics(["/a", "/b"]).await;
        let (mut reconciler, store) = setup(&bus);
        reconciler.reconcile().await.expect("listing");

        reconciler.shutdown().await;
        assert!(store.is_empty());
        assert!(reconciler.previous_topics().is_empty());
        assert_eq!(bus.unsubscribe_calls("/a").await, 1);
        assert_eq!(bus.unsubscribe_calls("/b").await, 1);
        assert!(bus.active_subscriptions().await.is_empty());
    }

    /// Bus double that records call order, for the removals-first contract.
    struct OrderedBus {
        topics: Mutex<Vec<String>>,
        log: Mutex<Vec<String>>,
    }

    impl OrderedBus {
        fn new() -> Self {
            Self {
                topics: Mutex::new(Vec::new()),
                log: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl BusClient for OrderedBus {
        async fn list_topics(&self) -> Result<Vec<String>, TransportError> {
            Ok(self.topics.lock().await.clone())
        }

        async fn subscribe(&self, topic: &str, _handler: Handler) -> bool {
            self.log.lock().await.push(format!("subscribe {topic}"));
            true
        }

        async fn unsubscribe(&self, topic: &str) -> bool {
            self.log.lock().await.push(format!("unsubscribe {topic}"));
            true
        }
    }

    #[tokio::test]
    async fn removals_run_before_additions() {
        let bus = Arc::new(OrderedBus::new());
        *bus.topics.lock().await = vec!["/old".into()];
        let store = Arc::new(StatsStore::new());
        let mut reconciler = TopicReconciler::new(bus.clone(), store);
        reconciler.reconcile().await.expect("listing");

        *bus.topics.lock().await = vec!["/new".into()];
        reconciler.reconcile().await.expect("listing");

        let log = bus.log.lock().await.clone();
        assert_eq!(log, ["subscribe /old", "unsubscribe /old", "subscribe /new"]);
    }
}
