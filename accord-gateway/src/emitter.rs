use crate::{
    event::{Event, Payload},
    listener::Listeners,
    EventTypeFlags,
};

/// Emitter over a map of listeners with some useful things on top to
/// abstract common operations.
#[derive(Clone, Debug)]
pub struct Emitter {
    listeners: Listeners<Event>,
}

impl Emitter {
    /// Create a new emitter for lifecycle events.
    pub fn new(listeners: Listeners<Event>) -> Self {
        Self { listeners }
    }

    /// Determine if any of the listeners want a certain event type.
    pub fn wants(&self, event_type: EventTypeFlags) -> bool {
        self.listeners.event_types().contains(event_type)
    }

    /// Send a raw frame to listeners that have subscribed to payloads.
    ///
    /// Raw payloads aren't subscribed to by default and must be opted in
    /// to. Only when a listener has subscribed are the input bytes cloned,
    /// so for most configurations this is a cheap check.
    pub fn bytes(&self, bytes: &[u8]) {
        if !self.wants(EventTypeFlags::RAW_PAYLOAD) {
            return;
        }

        self.send(EventTypeFlags::RAW_PAYLOAD, |_| {
            Event::Raw(Payload {
                bytes: bytes.to_vec(),
            })
        });
    }

    /// Send an event to listeners that have subscribed to its event type.
    pub fn event(&self, event: Event) {
        let event_type = event.flag();

        if !self.wants(event_type) {
            return;
        }

        let listener_count = self.listeners.len();
        let mut event = Some(event);

        self.send(event_type, |idx| {
            // Conditionally move the event out of its Option to avoid a
            // clone for the last listener.
            if idx == listener_count {
                event.take().unwrap()
            } else {
                event.clone().unwrap()
            }
        });
    }

    fn send(&self, event_type: EventTypeFlags, mut f: impl FnMut(usize) -> Event) {
        let mut idx = 0;

        self.listeners.all().retain(|_id, listener| {
            idx += 1;

            if !listener.wants(event_type) {
                return !listener.tx.is_closed();
            }

            listener.tx.send(f(idx)).is_ok()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::Emitter;
    use crate::{Event, EventTypeFlags, Listeners};

    #[test]
    fn bytes_only_sent_when_subscribed() {
        let listeners = Listeners::default();
        let mut rx = listeners.add(EventTypeFlags::RAW_PAYLOAD);
        let emitter = Emitter::new(listeners);

        emitter.bytes(&[1]);

        assert!(matches!(rx.try_recv(), Ok(Event::Raw(_))));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn event_removes_closed_channels() {
        let listeners = Listeners::default();
        listeners.add(EventTypeFlags::default());
        let emitter = Emitter::new(listeners.clone());

        emitter.event(Event::Resumed);

        assert!(listeners.all().is_empty());
    }

    #[test]
    fn event_sends_to_rxs() {
        let listeners = Listeners::default();
        let mut rx1 = listeners.add(EventTypeFlags::default());
        let mut rx2 = listeners.add(EventTypeFlags::default());
        let emitter = Emitter::new(listeners);

        emitter.event(Event::Resumed);

        assert!(matches!(rx1.try_recv(), Ok(Event::Resumed)));
        assert!(matches!(rx2.try_recv(), Ok(Event::Resumed)));

        // now check that they didn't receive the event twice
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn unwanted_event_not_sent() {
        let listeners = Listeners::default();
        let mut rx = listeners.add(EventTypeFlags::READY);
        let emitter = Emitter::new(listeners);

        emitter.event(Event::Resumed);

        assert!(rx.try_recv().is_err());
    }
}
