//! configmaster debounce: keyed countdowns owned by a single task.
//!
//! Every mutation of the pending-key table (arm, reset, expiry) happens on the
//! debouncer's own task, fed through one channel, so at most one countdown is
//! live per key without any locking. Expired keys are handed to the settle
//! handler on a freshly spawned task and never block the loop.

#![forbid(unsafe_code)]

use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, info};

/// Receives a key once its countdown has run out without further resets.
#[async_trait::async_trait]
pub trait Settle<K>: Send + Sync + 'static {
    async fn settle(&self, key: K);
}

#[derive(Debug, thiserror::Error)]
#[error("debouncer {0} is no longer running")]
pub struct Closed(pub &'static str);

/// Outcome of arming a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Arm {
    Started,
    Reset,
}

/// Pending countdowns keyed by `K`, one slot per key.
pub(crate) struct Timers<K> {
    queue: DelayQueue<K>,
    slots: FxHashMap<K, delay_queue::Key>,
    delay: Duration,
}

impl<K> Timers<K>
where
    K: Eq + Hash + Clone,
{
    fn new(delay: Duration) -> Self {
        Self { queue: DelayQueue::new(), slots: FxHashMap::default(), delay }
    }

    fn len(&self) -> usize { self.slots.len() }

    /// Start a countdown for `key`, or push its deadline back to a full delay if one is live.
    fn arm(&mut self, key: K) -> Arm {
        match self.slots.get(&key) {
            Some(slot) => {
                self.queue.reset(slot, self.delay);
                Arm::Reset
            }
            None => {
                let slot = self.queue.insert(key.clone(), self.delay);
                self.slots.insert(key, slot);
                Arm::Started
            }
        }
    }

    /// Next expired key, removed from the table. `None` when nothing is pending.
    async fn expired(&mut self) -> Option<K> {
        let entry = std::future::poll_fn(|cx| self.queue.poll_expired(cx)).await?;
        let key = entry.into_inner();
        self.slots.remove(&key);
        Some(key)
    }
}

/// Handle to a running debouncer. Cloning shares the same task.
pub struct Debouncer<K> {
    label: &'static str,
    tx: mpsc::UnboundedSender<K>,
}

impl<K> Clone for Debouncer<K> {
    fn clone(&self) -> Self {
        Self { label: self.label, tx: self.tx.clone() }
    }
}

impl<K> Debouncer<K>
where
    K: Eq + Hash + Clone + Display + Send + 'static,
{
    /// Spawn the owning task. It stops once every handle has been dropped;
    /// countdowns still pending at that point are discarded.
    pub fn spawn(label: &'static str, delay: Duration, handler: Arc<dyn Settle<K>>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel::<K>();
        let task = tokio::spawn(run(label, Timers::new(delay), rx, handler));
        (Self { label, tx }, task)
    }

    /// Record one sighting of `key`.
    pub fn notify(&self, key: K) -> Result<(), Closed> {
        self.tx.send(key).map_err(|_| Closed(self.label))
    }
}

async fn run<K>(label: &'static str, mut timers: Timers<K>, mut rx: mpsc::UnboundedReceiver<K>, handler: Arc<dyn Settle<K>>)
where
    K: Eq + Hash + Clone + Display + Send + 'static,
{
    loop {
        tokio::select! {
            maybe = rx.recv() => {
                match maybe {
                    Some(key) => match timers.arm(key.clone()) {
                        Arm::Started => info!(debouncer = label, key = %key, "starting countdown"),
                        Arm::Reset => info!(debouncer = label, key = %key, "resetting delay"),
                    },
                    None => {
                        debug!(debouncer = label, dropped = timers.len(), "all handles dropped; stopping debouncer");
                        break;
                    }
                }
            }
            Some(key) = timers.expired() => {
                debug!(debouncer = label, key = %key, "countdown expired");
                let handler = Arc::clone(&handler);
                tokio::spawn(async move { handler.settle(key).await });
            }
        }
    }
}
