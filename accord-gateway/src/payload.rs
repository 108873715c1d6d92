//! Wire payloads owned by the gateway core.
//!
//! Outbound payloads are small `op`/`d` envelopes serialised once and
//! written through the single socket writer. Inbound frames deserialize
//! into [`GatewayFrame`] with the event data kept raw; decoding the data is
//! the job of registered handlers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_repr::{Deserialize_repr, Serialize_repr};

/// Gateway opcodes in use by the core.
#[derive(Clone, Copy, Debug, Deserialize_repr, Eq, PartialEq, Serialize_repr)]
#[repr(u8)]
pub enum OpCode {
    /// An event was dispatched.
    Dispatch = 0,
    /// A heartbeat, sent periodically and echoed on request.
    Heartbeat = 1,
    /// Authentication starting a new session.
    Identify = 2,
    /// Join, move between, or leave voice channels.
    VoiceStateUpdate = 4,
    /// Re-attachment to an existing session.
    Resume = 6,
    /// The gateway asked for a reconnect.
    Reconnect = 7,
    /// Request of guild member chunks.
    RequestGuildMembers = 8,
    /// The session was invalidated.
    InvalidateSession = 9,
    /// First payload of a connection, carrying the heartbeat interval.
    Hello = 10,
    /// Acknowledgement of a heartbeat.
    HeartbeatAck = 11,
}

/// HEARTBEAT payload carrying the last seen sequence.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Heartbeat {
    /// Last sequence received from the gateway.
    pub d: u64,
    /// Opcode of the payload.
    pub op: OpCode,
}

impl Heartbeat {
    /// Create a heartbeat for the given sequence.
    pub const fn new(sequence: u64) -> Self {
        Self {
            d: sequence,
            op: OpCode::Heartbeat,
        }
    }
}

/// Client properties reported when identifying.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct IdentifyProperties {
    /// Operating system of the client.
    #[serde(rename = "$os")]
    pub os: String,
    /// Browser of the client.
    #[serde(rename = "$browser")]
    pub browser: String,
    /// Device of the client.
    #[serde(rename = "$device")]
    pub device: String,
    /// Domain the client was referred from.
    #[serde(rename = "$referring_domain")]
    pub referring_domain: String,
    /// Referrer of the client.
    #[serde(rename = "$referrer")]
    pub referrer: String,
}

impl IdentifyProperties {
    /// Create client properties to send when identifying.
    pub fn new(
        browser: impl Into<String>,
        device: impl Into<String>,
        os: impl Into<String>,
    ) -> Self {
        Self {
            browser: browser.into(),
            device: device.into(),
            os: os.into(),
            referring_domain: String::new(),
            referrer: String::new(),
        }
    }
}

/// Data of an IDENTIFY payload.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct IdentifyInfo {
    /// Authentication token.
    pub token: String,
    /// Client properties.
    pub properties: IdentifyProperties,
    /// Protocol version to speak.
    #[serde(rename = "v")]
    pub version: u64,
    /// Member count above which a guild's offline members are omitted.
    pub large_threshold: u64,
    /// Presence to assume on connect, passed through opaquely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<Value>,
    /// Shard of the session, as `[id, total]`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard: Option<[u64; 2]>,
}

/// IDENTIFY payload authenticating a new session.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Identify {
    /// Data of the payload.
    pub d: IdentifyInfo,
    /// Opcode of the payload.
    pub op: OpCode,
}

impl Identify {
    /// Create an identify payload.
    pub const fn new(info: IdentifyInfo) -> Self {
        Self {
            d: info,
            op: OpCode::Identify,
        }
    }
}

/// Data of a RESUME payload.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ResumeInfo {
    /// ID of the session to re-attach to.
    pub session_id: String,
    /// Authentication token.
    pub token: String,
    /// Last sequence received on the session.
    pub seq: u64,
}

/// RESUME payload re-attaching to an existing session.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Resume {
    /// Data of the payload.
    pub d: ResumeInfo,
    /// Opcode of the payload.
    pub op: OpCode,
}

impl Resume {
    /// Create a resume payload for a session.
    pub fn new(sequence: u64, session_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            d: ResumeInfo {
                session_id: session_id.into(),
                token: token.into(),
                seq: sequence,
            },
            op: OpCode::Resume,
        }
    }
}

/// Data of a VOICE_STATE_UPDATE payload.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VoiceStateUpdateInfo {
    /// Guild the update applies to.
    pub guild_id: u64,
    /// Channel to connect to, or `None` to disconnect.
    pub channel_id: Option<u64>,
    /// Whether the client is muted.
    pub self_mute: bool,
    /// Whether the client is deafened.
    pub self_deaf: bool,
}

/// VOICE_STATE_UPDATE payload requesting an audio connection change.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VoiceStateUpdate {
    /// Data of the payload.
    pub d: VoiceStateUpdateInfo,
    /// Opcode of the payload.
    pub op: OpCode,
}

impl VoiceStateUpdate {
    /// Create a voice state update for a guild.
    pub const fn new(guild_id: u64, channel_id: Option<u64>) -> Self {
        Self {
            d: VoiceStateUpdateInfo {
                guild_id,
                channel_id,
                self_mute: false,
                self_deaf: false,
            },
            op: OpCode::VoiceStateUpdate,
        }
    }
}

/// Raw inbound frame before event-specific decoding.
#[derive(Clone, Debug, Deserialize)]
pub struct GatewayFrame {
    /// Opcode of the frame.
    pub op: u8,
    /// Sequence, present on DISPATCH frames.
    #[serde(default)]
    pub s: Option<u64>,
    /// Event name, present on DISPATCH frames.
    #[serde(default)]
    pub t: Option<String>,
    /// Raw event data.
    #[serde(default)]
    pub d: Value,
}

#[cfg(test)]
mod tests {
    use super::{
        GatewayFrame, Heartbeat, Identify, IdentifyInfo, IdentifyProperties, OpCode, Resume,
        VoiceStateUpdate,
    };
    use serde_json::json;
    use static_assertions::assert_impl_all;
    use std::fmt::Debug;

    assert_impl_all!(Identify: Clone, Debug, PartialEq, Send, Sync);
    assert_impl_all!(Resume: Clone, Debug, Eq, PartialEq, Send, Sync);
    assert_impl_all!(GatewayFrame: Clone, Debug, Send, Sync);

    #[test]
    fn heartbeat_envelope() {
        let serialized = serde_json::to_string(&Heartbeat::new(42)).unwrap();

        assert_eq!(r#"{"d":42,"op":1}"#, serialized);
    }

    #[test]
    fn identify_round_trip() {
        let identify = Identify::new(IdentifyInfo {
            token: "a token".to_owned(),
            properties: IdentifyProperties::new("accord", "accord", "linux"),
            version: 6,
            large_threshold: 250,
            presence: Some(json!({"status": "online"})),
            shard: Some([2, 4]),
        });

        let serialized = serde_json::to_string(&identify).unwrap();
        let deserialized = serde_json::from_str::<Identify>(&serialized).unwrap();

        assert_eq!(identify, deserialized);
        assert!(serialized.contains(r#""$os":"linux""#));
        assert!(serialized.contains(r#""v":6"#));
    }

    #[test]
    fn resume_envelope() {
        let resume = Resume::new(42, "abc", "a token");
        let value = serde_json::to_value(&resume).unwrap();

        assert_eq!(
            json!({"d": {"session_id": "abc", "token": "a token", "seq": 42}, "op": 6}),
            value,
        );
    }

    #[test]
    fn voice_disconnect_serializes_null_channel() {
        let update = VoiceStateUpdate::new(1, None);
        let value = serde_json::to_value(update).unwrap();

        assert_eq!(
            json!({
                "d": {
                    "guild_id": 1,
                    "channel_id": null,
                    "self_mute": false,
                    "self_deaf": false,
                },
                "op": 4,
            }),
            value,
        );
    }

    #[test]
    fn frame_defaults() {
        let frame = serde_json::from_str::<GatewayFrame>(r#"{"op":11}"#).unwrap();

        assert_eq!(11, frame.op);
        assert!(frame.s.is_none());
        assert!(frame.t.is_none());
        assert!(frame.d.is_null());
        assert_eq!(OpCode::HeartbeatAck as u8, frame.op);
    }
}
