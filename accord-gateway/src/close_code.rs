//! Close codes sent by the gateway when it tears a connection down.

use std::convert::TryFrom;

/// Gateway-defined close code of a server-initiated close.
///
/// Codes carry whether the session may be recovered by reconnecting; a code
/// absent from this table is treated as recoverable.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum CloseCode {
    /// An unspecified error occurred.
    UnknownError = 4000,
    /// An invalid opcode was sent.
    UnknownOpcode = 4001,
    /// An invalid payload was sent.
    DecodeError = 4002,
    /// A payload was sent prior to identifying.
    NotAuthenticated = 4003,
    /// An invalid token was sent when identifying.
    AuthenticationFailed = 4004,
    /// Multiple identify payloads were sent on one connection.
    AlreadyAuthenticated = 4005,
    /// An invalid sequence was sent for resuming.
    InvalidSequence = 4007,
    /// Too many payloads were sent in a certain amount of time.
    RateLimited = 4008,
    /// The session timed out.
    SessionTimeout = 4009,
    /// An invalid shard was sent when identifying.
    InvalidShard = 4010,
    /// Too many guilds were connected to; sharding is required.
    ShardingRequired = 4011,
}

impl CloseCode {
    /// Whether the connection may be re-established after this close.
    ///
    /// Every code in the table identifies a fault in how the session was
    /// set up or driven, so none of them permit reconnecting.
    pub const fn can_reconnect(self) -> bool {
        false
    }
}

/// Whether a raw close code allows a reconnect attempt.
///
/// Codes not covered by [`CloseCode`] are recoverable.
pub fn can_reconnect(code: u16) -> bool {
    CloseCode::try_from(code).map_or(true, CloseCode::can_reconnect)
}

impl TryFrom<u16> for CloseCode {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Ok(match value {
            4000 => Self::UnknownError,
            4001 => Self::UnknownOpcode,
            4002 => Self::DecodeError,
            4003 => Self::NotAuthenticated,
            4004 => Self::AuthenticationFailed,
            4005 => Self::AlreadyAuthenticated,
            4007 => Self::InvalidSequence,
            4008 => Self::RateLimited,
            4009 => Self::SessionTimeout,
            4010 => Self::InvalidShard,
            4011 => Self::ShardingRequired,
            other => return Err(other),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{can_reconnect, CloseCode};
    use static_assertions::assert_impl_all;
    use std::{convert::TryFrom, fmt::Debug};

    assert_impl_all!(CloseCode: Clone, Copy, Debug, Eq, PartialEq, Send, Sync);

    #[test]
    fn known_codes_are_fatal() {
        for code in [4000, 4001, 4002, 4003, 4004, 4005, 4007, 4008, 4009, 4010, 4011] {
            assert!(CloseCode::try_from(code).is_ok(), "{code} missing");
            assert!(!can_reconnect(code), "{code} must be fatal");
        }
    }

    #[test]
    fn unknown_codes_reconnect() {
        assert!(can_reconnect(1000));
        assert!(can_reconnect(1001));
        assert!(can_reconnect(1006));
        assert!(can_reconnect(4006));
        assert!(can_reconnect(4012));
    }
}
