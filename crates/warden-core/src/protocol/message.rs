//! Text protocol messages.
//!
//! Wire shape: one JSON object per line, discriminated by a `"Type"` field
//! with snake_case values; payload fields are PascalCase. Decoding is
//! envelope-first: the discriminator is read from a minimal envelope, then
//! the full payload is decoded into the matching typed variant, so unknown
//! discriminators are never fatal and each payload validates independently.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Payloads
// =============================================================================

/// Server → agent greeting, sent once immediately after accept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HandshakePayload {
    pub server_id: String,
    /// UTC ISO-8601.
    pub timestamp: String,
    pub version: String,
}

/// Bidirectional liveness probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HeartbeatPayload {
    #[serde(default)]
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<String>,
}

/// Server reply to an agent heartbeat, echoing its sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HeartbeatResponsePayload {
    pub timestamp: String,
    pub sequence: String,
}

/// Agent self-description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SystemInfoPayload {
    #[serde(rename = "OS", default)]
    pub os: String,
    #[serde(default)]
    pub computer_name: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub agent_version: String,
}

/// Server → agent command envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CommandPayload {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
}

/// Agent → server command result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CommandResponsePayload {
    #[serde(default)]
    pub command_id: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub response: String,
}

/// Agent → server error report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ErrorPayload {
    #[serde(default)]
    pub error_message: String,
}

// =============================================================================
// Server-Originated Messages
// =============================================================================

/// Messages the server writes onto a text-framed session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum ServerMessage {
    #[serde(rename = "handshake")]
    Handshake(HandshakePayload),
    #[serde(rename = "heartbeat")]
    Heartbeat(HeartbeatPayload),
    #[serde(rename = "heartbeat_response")]
    HeartbeatResponse(HeartbeatResponsePayload),
    #[serde(rename = "command")]
    Command(CommandPayload),
}

impl ServerMessage {
    /// Encode without line framing, for embedding in a binary frame payload.
    pub fn to_json_bytes(&self) -> Result<bytes::Bytes> {
        serde_json::to_vec(self)
            .map(bytes::Bytes::from)
            .map_err(|e| Error::protocol(format!("serialization failed: {e}")))
    }
}

// =============================================================================
// Agent-Originated Messages
// =============================================================================

/// Messages the server reads from a text-framed session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentMessage {
    Heartbeat(HeartbeatPayload),
    SystemInfo(SystemInfoPayload),
    CommandResponse(CommandResponsePayload),
    Error(ErrorPayload),
    /// Unrecognized discriminator: logged and ignored by the session,
    /// never fatal.
    Unknown { kind: String },
}

/// Minimal envelope exposing only the discriminator.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "Type")]
    kind: String,
}

impl AgentMessage {
    /// Decode one complete JSON line into a typed message.
    pub fn decode(line: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(line)
            .map_err(|e| Error::protocol(format!("invalid message envelope: {e}")))?;

        let message = match envelope.kind.as_str() {
            "heartbeat" => AgentMessage::Heartbeat(decode_payload(line)?),
            "system_info" => AgentMessage::SystemInfo(decode_payload(line)?),
            "command_response" => AgentMessage::CommandResponse(decode_payload(line)?),
            "error" => AgentMessage::Error(decode_payload(line)?),
            _ => AgentMessage::Unknown {
                kind: envelope.kind,
            },
        };

        Ok(message)
    }
}

fn decode_payload<'a, T: Deserialize<'a>>(line: &'a str) -> Result<T> {
    serde_json::from_str(line).map_err(|e| Error::protocol(format!("invalid payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_heartbeat_with_sequence() {
        let msg = AgentMessage::decode(
            r#"{"Type":"heartbeat","Timestamp":"2024-05-01T12:00:00Z","Sequence":"7"}"#,
        )
        .unwrap();
        match msg {
            AgentMessage::Heartbeat(hb) => {
                assert_eq!(hb.timestamp, "2024-05-01T12:00:00Z");
                assert_eq!(hb.sequence.as_deref(), Some("7"));
            }
            other => panic!("expected heartbeat, got {other:?}"),
        }
    }

    #[test]
    fn decode_heartbeat_without_optional_fields() {
        let msg = AgentMessage::decode(r#"{"Type":"heartbeat"}"#).unwrap();
        match msg {
            AgentMessage::Heartbeat(hb) => {
                assert!(hb.timestamp.is_empty());
                assert!(hb.sequence.is_none());
            }
            other => panic!("expected heartbeat, got {other:?}"),
        }
    }

    #[test]
    fn decode_system_info_missing_fields_are_blank() {
        let msg =
            AgentMessage::decode(r#"{"Type":"system_info","OS":"Windows 10"}"#).unwrap();
        match msg {
            AgentMessage::SystemInfo(info) => {
                assert_eq!(info.os, "Windows 10");
                assert!(info.computer_name.is_empty());
                assert!(info.user_name.is_empty());
                assert!(info.agent_version.is_empty());
            }
            other => panic!("expected system_info, got {other:?}"),
        }
    }

    #[test]
    fn decode_command_response() {
        let msg = AgentMessage::decode(
            r#"{"Type":"command_response","CommandId":"01AB","Command":"whoami","Response":"alice"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            AgentMessage::CommandResponse(CommandResponsePayload {
                command_id: "01AB".into(),
                command: "whoami".into(),
                response: "alice".into(),
            })
        );
    }

    #[test]
    fn decode_unknown_type_is_not_an_error() {
        let msg = AgentMessage::decode(r#"{"Type":"telemetry","Foo":1}"#).unwrap();
        assert_eq!(
            msg,
            AgentMessage::Unknown {
                kind: "telemetry".into()
            }
        );
    }

    #[test]
    fn decode_missing_discriminator_fails() {
        assert!(AgentMessage::decode(r#"{"Foo":1}"#).is_err());
        assert!(AgentMessage::decode("not json").is_err());
    }

    #[test]
    fn server_message_wire_shape() {
        let msg = ServerMessage::Command(CommandPayload {
            command: "dir".into(),
            command_id: Some("C0FFEE00".into()),
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""Type":"command""#));
        assert!(json.contains(r#""Command":"dir""#));
        assert!(json.contains(r#""CommandId":"C0FFEE00""#));
    }

    #[test]
    fn handshake_fields_are_pascal_case() {
        let msg = ServerMessage::Handshake(HandshakePayload {
            server_id: "srv".into(),
            timestamp: "2024-05-01T12:00:00Z".into(),
            version: "1.0.0".into(),
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""Type":"handshake""#));
        assert!(json.contains(r#""ServerId":"srv""#));
        assert!(json.contains(r#""Timestamp":"2024-05-01T12:00:00Z""#));
        assert!(json.contains(r#""Version":"1.0.0""#));
    }

    #[test]
    fn heartbeat_omits_absent_sequence() {
        let msg = ServerMessage::Heartbeat(HeartbeatPayload {
            timestamp: "2024-05-01T12:00:00Z".into(),
            sequence: None,
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("Sequence"));
    }
}
