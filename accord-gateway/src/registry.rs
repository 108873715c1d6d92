//! Handler registry routing DISPATCH events and the cache seams.
//!
//! The core never decodes event-specific entities. Dispatch frames are
//! routed by event name to a registered [`EventHandler`], which borrows
//! whatever caches it mutates; the gateway only owns the map of names to
//! handler capabilities.

use dashmap::DashMap;
use serde_json::Value;
use std::{error::Error, fmt::Debug, sync::Arc};

/// Number of dispatches between expirations of deferred cache lookups.
pub const DISPATCHES_PER_CACHE_TIMEOUT: u64 = 150;

/// A capability invoked for one named dispatch event.
///
/// Handlers receive the sequence of the frame and the raw `d` data and
/// perform all entity decoding and cache mutation themselves. An `Err`
/// return is absorbed at the dispatch boundary: it is logged together with
/// the raw JSON and surfaced as a lifecycle event, and never tears the
/// connection down.
pub trait EventHandler: Debug + Send + Sync {
    /// Handle one dispatched event.
    fn handle(&self, sequence: u64, data: &Value) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// Cache of deferred entity lookups, expired on a fixed dispatch cadence.
pub trait EventCache: Debug + Send + Sync {
    /// Expire deferred lookups older than the given sequence.
    fn timeout(&self, sequence: u64);

    /// Drop all deferred lookups.
    fn clear(&self);
}

/// An entity cache flushed when the session is invalidated.
pub trait EntityCache: Debug + Send + Sync {
    /// Drop all cached entities.
    fn invalidate(&self);
}

/// Map from event name to the handler responsible for it.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    handlers: DashMap<Box<str>, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an event name, replacing any previous one.
    pub fn register(&self, event_type: impl Into<Box<str>>, handler: Arc<dyn EventHandler>) {
        self.handlers.insert(event_type.into(), handler);
    }

    /// Look up the handler for an event name.
    pub fn get(&self, event_type: &str) -> Option<Arc<dyn EventHandler>> {
        self.handlers
            .get(event_type)
            .map(|entry| Arc::clone(entry.value()))
    }
}
