//! Connection stage of a [`GatewayClient`].
//!
//! [`GatewayClient`]: crate::GatewayClient

use std::fmt::{Display, Formatter, Result as FmtResult};

/// The current stage of the connection lifecycle.
///
/// Stages advance through a single updater on the session; every transition
/// wakes tasks waiting for a particular stage.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Stage {
    /// A websocket connection is being established.
    Connecting,
    /// The connection is open and an IDENTIFY is being sent.
    Identifying,
    /// Authentication was transmitted and the gateway's confirmation
    /// (READY or RESUMED) is outstanding.
    AwaitingLoginConfirmation,
    /// Authentication was confirmed but setup work driven by the READY
    /// payload is still running.
    LoadingSubsystems,
    /// The session is fully established.
    Connected,
    /// The connection dropped and no recovery has started yet.
    Disconnected,
    /// A resume is scheduled and the backoff delay is elapsing.
    WaitingToReconnect,
    /// A re-identify is queued with the session arbiter.
    ReconnectQueued,
    /// A connection attempt of a resume or re-identify is in flight.
    AttemptingToReconnect,
    /// The client was shut down, or closed on a fatal close code, and will
    /// not reconnect.
    Shutdown,
}

impl Stage {
    /// Whether the gateway has acknowledged authentication, meaning queued
    /// messages may be flushed.
    pub const fn is_authenticated(self) -> bool {
        matches!(self, Self::Connected | Self::LoadingSubsystems)
    }

    /// Whether the client has permanently stopped.
    pub const fn is_shutdown(self) -> bool {
        matches!(self, Self::Shutdown)
    }
}

impl Default for Stage {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(match self {
            Self::Connecting => "Connecting",
            Self::Identifying => "Identifying",
            Self::AwaitingLoginConfirmation => "AwaitingLoginConfirmation",
            Self::LoadingSubsystems => "LoadingSubsystems",
            Self::Connected => "Connected",
            Self::Disconnected => "Disconnected",
            Self::WaitingToReconnect => "WaitingToReconnect",
            Self::ReconnectQueued => "ReconnectQueued",
            Self::AttemptingToReconnect => "AttemptingToReconnect",
            Self::Shutdown => "Shutdown",
        })
    }
}
