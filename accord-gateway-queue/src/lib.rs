//! Arbiter for gateway session starts.
//!
//! The gateway permits one IDENTIFY per token every few seconds. When a bot
//! runs multiple shards, every shard that needs a fresh session must go
//! through a single serialiser so that two shards don't identify inside the
//! same window. This crate defines that serialiser as the [`SessionArbiter`]
//! trait, the unit of work it schedules as the [`ConnectNode`] trait, and a
//! local in-process implementation, [`LocalArbiter`].
//!
//! A node is appended when a shard is constructed or loses its session, and
//! is invoked exactly once by the arbiter. Multi-process deployments should
//! implement [`SessionArbiter`] against whatever broker coordinates their
//! processes; everything in the gateway crate only sees the trait.

#![deny(unsafe_code)]

use async_trait::async_trait;
use std::{
    collections::VecDeque,
    fmt::Debug,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};
use tokio::sync::Notify;

/// Minimum spacing between two session initialisations.
pub const IDENTIFY_DELAY: Duration = Duration::from_secs(5);

/// Why a node was appended to the arbiter.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeKind {
    /// First connection of a freshly constructed client.
    Start,
    /// Re-identify after a disconnect that invalidated the session.
    Reconnect,
}

/// A pending connection attempt owned by a gateway client.
///
/// The arbiter invokes [`run`] exactly once per appended node. When
/// `is_last` is `false` another node is waiting behind this one, and the
/// implementation must not return before its IDENTIFY has actually been
/// transmitted; otherwise the next node could identify inside the same
/// window.
///
/// [`run`]: ConnectNode::run
#[async_trait]
pub trait ConnectNode: Debug + Send + Sync {
    /// Whether this node is a first start or a re-identify.
    fn kind(&self) -> NodeKind;

    /// Shard the node belongs to, as `[id, total]`.
    fn shard(&self) -> [u64; 2];

    /// Perform the connection attempt.
    async fn run(&self, is_last: bool);
}

/// Serialiser of session initialisations across shards.
pub trait SessionArbiter: Debug + Send + Sync {
    /// Append a node, scheduling it behind all previously appended nodes.
    ///
    /// Returns `false` when the arbiter cannot accept work, in which case
    /// the caller should treat the connection attempt as failed.
    fn append(&self, node: Arc<dyn ConnectNode>) -> bool;

    /// Remove a pending node that has not been invoked yet.
    ///
    /// Removing a node that already ran, or was never appended, is a no-op.
    fn remove(&self, node: &Arc<dyn ConnectNode>);
}

#[derive(Debug, Default)]
struct LocalArbiterRef {
    pending: Mutex<VecDeque<Arc<dyn ConnectNode>>>,
    notify: Notify,
}

/// A local, in-process [`SessionArbiter`].
///
/// Appended nodes are invoked one at a time with [`IDENTIFY_DELAY`] between
/// invocations. This implementation must only be used when every shard of
/// the token lives in this process; shards identifying from multiple
/// processes need a shared broker.
#[derive(Clone, Debug)]
pub struct LocalArbiter(Arc<LocalArbiterRef>);

impl LocalArbiter {
    /// Create a new local arbiter and spawn its worker task.
    pub fn new() -> Self {
        let inner = Arc::new(LocalArbiterRef::default());

        tokio::spawn(worker(Arc::downgrade(&inner)));

        Self(inner)
    }
}

impl Default for LocalArbiter {
    fn default() -> Self {
        Self::new()
    }
}

async fn worker(inner: Weak<LocalArbiterRef>) {
    loop {
        let (node, is_last) = loop {
            let Some(inner) = inner.upgrade() else {
                return;
            };

            let next = {
                let mut pending = inner.pending.lock().expect("pending poisoned");
                pending.pop_front().map(|node| {
                    let is_last = pending.is_empty();
                    (node, is_last)
                })
            };

            if let Some(result) = next {
                break result;
            }

            // wake up periodically so a dropped arbiter lets the worker
            // exit instead of parking forever
            tokio::select! {
                _ = inner.notified() => {}
                _ = tokio::time::sleep(Duration::from_secs(30)) => {}
            }
        };

        tracing::debug!(shard = ?node.shard(), kind = ?node.kind(), "running connect node");
        node.run(is_last).await;

        tokio::time::sleep(IDENTIFY_DELAY).await;
    }
}

impl LocalArbiterRef {
    async fn notified(&self) {
        self.notify.notified().await;
    }
}

impl SessionArbiter for LocalArbiter {
    fn append(&self, node: Arc<dyn ConnectNode>) -> bool {
        self.0.pending.lock().expect("pending poisoned").push_back(node);
        self.0.notify.notify_one();

        true
    }

    fn remove(&self, node: &Arc<dyn ConnectNode>) {
        self.0
            .pending
            .lock()
            .expect("pending poisoned")
            .retain(|pending| !Arc::ptr_eq(pending, node));
    }
}

/// An arbiter that invokes nodes immediately.
///
/// Useful behind a proxy that performs its own identify pacing, and in
/// tests. Running multiple shards against the real gateway with this
/// arbiter **will** trip the session-start limit.
#[derive(Debug)]
pub struct InstantArbiter;

impl SessionArbiter for InstantArbiter {
    fn append(&self, node: Arc<dyn ConnectNode>) -> bool {
        tokio::spawn(async move { node.run(true).await });

        true
    }

    fn remove(&self, _node: &Arc<dyn ConnectNode>) {}
}
