//! Lifecycle events emitted to listeners.

use bitflags::bitflags;

bitflags! {
    /// Bitflags of the event types a listener wants to receive.
    ///
    /// Raw payloads are not part of [`default`] and must be opted in to,
    /// since materialising them copies every inbound frame.
    ///
    /// [`default`]: EventTypeFlags::default
    pub struct EventTypeFlags: u64 {
        /// A websocket connection is being established.
        const CONNECTING = 1;
        /// An IDENTIFY is being sent.
        const IDENTIFYING = 1 << 1;
        /// A RESUME is being sent.
        const RESUMING = 1 << 2;
        /// A session finished initialising for the first time.
        const READY = 1 << 3;
        /// An existing session was resumed.
        const RESUMED = 1 << 4;
        /// A new session replaced an invalidated one.
        const RECONNECTED = 1 << 5;
        /// The connection dropped.
        const DISCONNECTED = 1 << 6;
        /// The client permanently stopped.
        const SHUTDOWN = 1 << 7;
        /// A raw inbound frame, emitted after handlers ran.
        const RAW_PAYLOAD = 1 << 8;
        /// A registered handler failed.
        const HANDLER_ERROR = 1 << 9;
    }
}

impl Default for EventTypeFlags {
    fn default() -> Self {
        Self::all() - Self::RAW_PAYLOAD
    }
}

/// A websocket connection to the gateway is being established.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Connecting {
    /// URL used to connect.
    pub gateway: String,
    /// Shard of the session, as `[id, total]`.
    pub shard: [u64; 2],
}

/// An IDENTIFY payload is being sent, starting a new session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Identifying {
    /// Shard of the session, as `[id, total]`.
    pub shard: [u64; 2],
}

/// A RESUME payload is being sent, re-attaching to a session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Resuming {
    /// Sequence the resume replays from.
    pub sequence: u64,
}

/// The session finished initialising for the first time.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionReady {
    /// ID of the established session.
    pub session_id: String,
}

/// The connection dropped; a recovery attempt may follow.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Disconnected {
    /// Close code, if a close frame was seen.
    pub code: Option<u16>,
    /// Close reason, if a close frame was seen.
    pub reason: Option<String>,
}

/// The client permanently stopped.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Shutdown {
    /// Raw close code the connection ended with.
    pub code: u16,
}

/// A raw inbound frame.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Payload {
    /// The complete JSON text of the frame.
    pub bytes: Vec<u8>,
}

/// A registered event handler returned an error.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HandlerError {
    /// Name of the dispatched event.
    pub event_type: String,
    /// Description of the failure.
    pub message: String,
}

/// Lifecycle event of a gateway client.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Event {
    /// A websocket connection is being established.
    Connecting(Connecting),
    /// An IDENTIFY is being sent.
    Identifying(Identifying),
    /// A RESUME is being sent.
    Resuming(Resuming),
    /// A session finished initialising for the first time.
    Ready(SessionReady),
    /// An existing session was resumed.
    Resumed,
    /// A new session replaced an invalidated one.
    Reconnected,
    /// The connection dropped.
    Disconnected(Disconnected),
    /// The client permanently stopped.
    Shutdown(Shutdown),
    /// A raw inbound frame.
    Raw(Payload),
    /// A registered handler failed.
    HandlerError(HandlerError),
}

impl Event {
    /// Flag identifying the event's type.
    pub const fn flag(&self) -> EventTypeFlags {
        match self {
            Self::Connecting(_) => EventTypeFlags::CONNECTING,
            Self::Identifying(_) => EventTypeFlags::IDENTIFYING,
            Self::Resuming(_) => EventTypeFlags::RESUMING,
            Self::Ready(_) => EventTypeFlags::READY,
            Self::Resumed => EventTypeFlags::RESUMED,
            Self::Reconnected => EventTypeFlags::RECONNECTED,
            Self::Disconnected(_) => EventTypeFlags::DISCONNECTED,
            Self::Shutdown(_) => EventTypeFlags::SHUTDOWN,
            Self::Raw(_) => EventTypeFlags::RAW_PAYLOAD,
            Self::HandlerError(_) => EventTypeFlags::HANDLER_ERROR,
        }
    }
}
