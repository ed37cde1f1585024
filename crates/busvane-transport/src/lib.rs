use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::warn;

/// One message as the engine sees it: which topic it arrived on, how big
/// the payload was, and when it arrived.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub byte_size: usize,
    pub arrival: DateTime<Utc>,
}

/// Callback invoked once per delivered message, on an arbitrary task.
/// Within one topic deliveries arrive in publish order.
pub type Handler = Arc<dyn Fn(Delivery) + Send + Sync>;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("topic listing failed: {0}")]
    ListFailed(String),
    #[error("bus closed")]
    Closed,
}

/// The pub/sub operations the engine needs from a transport.
///
/// `subscribe` and `unsubscribe` report failure as `false`; callers log it
/// and either retry on the next reconcile cycle (subscribe) or move on
/// (unsubscribe is best-effort). Neither failure is fatal.
#[async_trait]
pub trait BusClient: Send + Sync {
    /// Topics currently offered by the bus. Order carries no meaning.
    async fn list_topics(&self) -> Result<Vec<String>, TransportError>;
    /// Attach `handler` to `topic`. `false` when the bus refuses.
    async fn subscribe(&self, topic: &str, handler: Handler) -> bool;
    /// Detach from `topic`. `false` when the bus refuses or the topic was
    /// not subscribed.
    async fn unsubscribe(&self, topic: &str) -> bool;
}

struct Subscription {
    tx: mpsc::UnboundedSender<Delivery>,
    forwarder: JoinHandle<()>,
}

struct MemoryBusInner {
    /// Listing in insertion order; tests rely on deterministic iteration.
    topics: Mutex<Vec<String>>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    deny_subscribe: Mutex<HashSet<String>>,
    deny_unsubscribe: Mutex<HashSet<String>>,
    fail_listing: AtomicBool,
    subscribe_calls: Mutex<BTreeMap<String, u64>>,
    unsubscribe_calls: Mutex<BTreeMap<String, u64>>,
    dropped: AtomicU64,
}

/// In-memory bus for single-process tests and demos.
///
/// Each subscription gets its own channel and forwarder task, so delivery
/// is FIFO within a topic and concurrent across topics. Failure injection
/// (`deny_subscribe`, `deny_unsubscribe`, `set_fail_listing`) and
/// per-topic call counters back the reconciler's error-path tests.
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<MemoryBusInner>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryBusInner {
                topics: Mutex::new(Vec::new()),
                subscriptions: Mutex::new(HashMap::new()),
                deny_subscribe: Mutex::new(HashSet::new()),
                deny_unsubscribe: Mutex::new(HashSet::new()),
                fail_listing: AtomicBool::new(false),
                subscribe_calls: Mutex::new(BTreeMap::new()),
                unsubscribe_calls: Mutex::new(BTreeMap::new()),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Replace the advertised topic listing.
    pub async fn set_topics<I, S>(&self, topics: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut listing = self.inner.topics.lock().await;
        *listing = topics.into_iter().map(Into::into).collect();
    }

    pub async fn add_topic(&self, topic: &str) {
        let mut listing = self.inner.topics.lock().await;
        if !listing.iter().any(|t| t == topic) {
            listing.push(topic.to_string());
        }
    }

    pub async fn remove_topic(&self, topic: &str) {
        let mut listing = self.inner.topics.lock().await;
        listing.retain(|t| t != topic);
    }

    /// Deliver one synthetic message of `byte_size` bytes. Returns true
    /// when a live subscription accepted it; otherwise the message is
    /// counted as dropped.
    pub async fn publish(&self, topic: &str, byte_size: usize) -> bool {
        let delivery = Delivery {
            topic: topic.to_string(),
            byte_size,
            arrival: Utc::now(),
        };
        let delivered = {
            let subs = self.inner.subscriptions.lock().await;
            match subs.get(topic) {
                Some(sub) => sub.tx.send(delivery).is_ok(),
                None => false,
            }
        };
        if !delivered {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        }
        delivered
    }

    /// Make future `subscribe(topic)` calls fail while set.
    pub async fn deny_subscribe(&self, topic: &str, deny: bool) {
        let mut denied = self.inner.deny_subscribe.lock().await;
        if deny {
            denied.insert(topic.to_string());
        } else {
            denied.remove(topic);
        }
    }

    /// Make future `unsubscribe(topic)` calls fail while set.
    pub async fn deny_unsubscribe(&self, topic: &str, deny: bool) {
        let mut denied = self.inner.deny_unsubscribe.lock().await;
        if deny {
            denied.insert(topic.to_string());
        } else {
            denied.remove(topic);
        }
    }

    /// Make `list_topics` error while set.
    pub fn set_fail_listing(&self, fail: bool) {
        self.inner.fail_listing.store(fail, Ordering::SeqCst);
    }

    pub async fn subscribe_calls(&self, topic: &str) -> u64 {
        let calls = self.inner.subscribe_calls.lock().await;
        calls.get(topic).copied().unwrap_or(0)
    }

    pub async fn unsubscribe_calls(&self, topic: &str) -> u64 {
        let calls = self.inner.unsubscribe_calls.lock().await;
        calls.get(topic).copied().unwrap_or(0)
    }

    /// Messages published with no live subscription.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Currently subscribed topics, sorted.
    pub async fn active_subscriptions(&self) -> Vec<String> {
        let subs = self.inner.subscriptions.lock().await;
        let mut names: Vec<String> = subs.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BusClient for MemoryBus {
    async fn list_topics(&self) -> Result<Vec<String>, TransportError> {
        if self.inner.fail_listing.load(Ordering::SeqCst) {
            return Err(TransportError::ListFailed("listing disabled".into()));
        }
        Ok(self.inner.topics.lock().await.clone())
    }

    async fn subscribe(&self, topic: &str, handler: Handler) -> bool {
        {
            let mut calls = self.inner.subscribe_calls.lock().await;
            *calls.entry(topic.to_string()).or_default() += 1;
        }
        if self.inner.deny_subscribe.lock().await.contains(topic) {
            return false;
        }
        let mut subs = self.inner.subscriptions.lock().await;
        if subs.contains_key(topic) {
            warn!(topic = %topic, "rejecting duplicate subscription");
            return false;
        }
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        let forwarder = tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                handler(delivery);
            }
        });
        subs.insert(topic.to_string(), Subscription { tx, forwarder });
        true
    }

    async fn unsubscribe(&self, topic: &str) -> bool {
        {
            let mut calls = self.inner.unsubscribe_calls.lock().await;
            *calls.entry(topic.to_string()).or_default() += 1;
        }
        if self.inner.deny_unsubscribe.lock().await.contains(topic) {
            return false;
        }
        let taken = {
            let mut subs = self.inner.subscriptions.lock().await;
            subs.remove(topic)
        };
        match taken {
            Some(sub) => {
                // Closing the channel lets the forwarder drain in-flight
                // deliveries before it exits.
                drop(sub.tx);
                let _ = sub.forwarder.await;
                true
            }
            None => false,
        }
    }
}
