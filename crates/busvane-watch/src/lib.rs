mod reconcile;
mod watcher;

pub use reconcile::{ReconcileOutcome, TopicReconciler};
pub use watcher::{spawn_supervised, TaskHandle, TopicWatcher, WatcherConfig};
