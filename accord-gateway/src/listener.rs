use crate::EventTypeFlags;
use dashmap::DashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

#[derive(Debug)]
pub struct Listener<T> {
    pub events: EventTypeFlags,
    pub tx: UnboundedSender<T>,
}

impl<T> Listener<T> {
    pub fn wants(&self, flag: EventTypeFlags) -> bool {
        self.events.contains(flag)
    }
}

#[derive(Debug)]
struct ListenersRef<T> {
    id: AtomicU64,
    listeners: DashMap<u64, Listener<T>>,
}

impl<T> Default for ListenersRef<T> {
    fn default() -> Self {
        Self {
            id: AtomicU64::new(0),
            listeners: DashMap::new(),
        }
    }
}

/// Registry of event listeners, cheap to clone and share across tasks.
#[derive(Clone, Debug)]
pub struct Listeners<T>(Arc<ListenersRef<T>>);

impl<T> Listeners<T> {
    pub fn add(&self, events: EventTypeFlags) -> UnboundedReceiver<T> {
        let id = self.0.id.fetch_add(1, Ordering::Release) + 1;
        let (tx, rx) = mpsc::unbounded_channel();

        self.0.listeners.insert(id, Listener { events, tx });

        rx
    }

    pub fn all(&self) -> &DashMap<u64, Listener<T>> {
        &self.0.listeners
    }

    pub fn len(&self) -> usize {
        self.0.listeners.len()
    }

    /// Union of the event types any listener wants.
    pub fn event_types(&self) -> EventTypeFlags {
        self.0
            .listeners
            .iter()
            .map(|listener| listener.events)
            .fold(EventTypeFlags::empty(), |acc, flags| acc | flags)
    }

    pub fn remove_all(&self) {
        self.0.listeners.clear();
    }
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self(Arc::new(ListenersRef::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::Listeners;
    use crate::{Event, EventTypeFlags};

    #[test]
    fn event_types_are_unioned() {
        let listeners: Listeners<Event> = Listeners::default();
        let _rx1 = listeners.add(EventTypeFlags::READY);
        let _rx2 = listeners.add(EventTypeFlags::SHUTDOWN | EventTypeFlags::RAW_PAYLOAD);

        let types = listeners.event_types();
        assert!(types.contains(EventTypeFlags::READY));
        assert!(types.contains(EventTypeFlags::RAW_PAYLOAD));
        assert!(!types.contains(EventTypeFlags::RESUMED));
    }

    #[test]
    fn remove_all_clears() {
        let listeners: Listeners<Event> = Listeners::default();
        let _rx = listeners.add(EventTypeFlags::default());
        assert_eq!(1, listeners.len());

        listeners.remove_all();
        assert_eq!(0, listeners.len());
    }
}
