//! Ably protocol message shapes, action numbering, and flag constants.
//!
//! These types describe what flows through the [`Transport`](crate::Transport)
//! seam. They derive serde so a transport can pick JSON or MessagePack, but no
//! codec lives in this crate.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Protocol actions
// ---------------------------------------------------------------------------

/// Protocol message action, numbered as on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum Action {
    #[default]
    Heartbeat,
    Ack,
    Nack,
    Connect,
    Connected,
    Disconnect,
    Disconnected,
    Close,
    Closed,
    Error,
    Attach,
    Attached,
    Detach,
    Detached,
    Presence,
    Message,
    Sync,
    Auth,
    /// An action this engine does not know about; logged and ignored.
    Unknown(i32),
}

impl From<i32> for Action {
    fn from(value: i32) -> Self {
        match value {
            0 => Action::Heartbeat,
            1 => Action::Ack,
            2 => Action::Nack,
            3 => Action::Connect,
            4 => Action::Connected,
            5 => Action::Disconnect,
            6 => Action::Disconnected,
            7 => Action::Close,
            8 => Action::Closed,
            9 => Action::Error,
            10 => Action::Attach,
            11 => Action::Attached,
            12 => Action::Detach,
            13 => Action::Detached,
            14 => Action::Presence,
            15 => Action::Message,
            16 => Action::Sync,
            17 => Action::Auth,
            other => Action::Unknown(other),
        }
    }
}

impl From<Action> for i32 {
    fn from(action: Action) -> Self {
        match action {
            Action::Heartbeat => 0,
            Action::Ack => 1,
            Action::Nack => 2,
            Action::Connect => 3,
            Action::Connected => 4,
            Action::Disconnect => 5,
            Action::Disconnected => 6,
            Action::Close => 7,
            Action::Closed => 8,
            Action::Error => 9,
            Action::Attach => 10,
            Action::Attached => 11,
            Action::Detach => 12,
            Action::Detached => 13,
            Action::Presence => 14,
            Action::Message => 15,
            Action::Sync => 16,
            Action::Auth => 17,
            Action::Unknown(n) => n,
        }
    }
}

impl Action {
    /// Actions the server acknowledges with ACK/NACK.
    pub fn ack_required(self) -> bool {
        matches!(self, Action::Message | Action::Presence)
    }
}

pub mod error_code {
    pub const FAILED: i32 = 80000;
    pub const SUSPENDED: i32 = 80002;
    pub const DISCONNECTED: i32 = 80003;
    pub const TIMEOUT: i32 = 80014;
    pub const CONNECTION_CLOSED: i32 = 80017;
    pub const CHANNEL_OPERATION_FAILED: i32 = 90000;
    pub const CHANNEL_OPERATION_FAILED_INVALID_STATE: i32 = 90001;
    pub const CHANNEL_DETACHED: i32 = 90006;
    pub const CHANNEL_ATTACH_TIMEOUT: i32 = 90007;
    pub const PRESENCE_NO_CLIENT_ID: i32 = 91000;
    pub const PRESENCE_INVALID_CHANNEL_STATE: i32 = 91001;
}

pub mod flags {
    pub const HAS_PRESENCE: i32 = 1;
    pub const HAS_BACKLOG: i32 = 2;
    pub const RESUMED: i32 = 4;
    pub const ATTACH_RESUME: i32 = 1 << 5; // 32
}

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct ProtocolMessage {
    pub action: Action,
    pub id: Option<String>,
    pub channel: Option<String>,
    /// Attach resume point; on SYNC frames, the `<sequenceId>:<cursor>` pair.
    pub channel_serial: Option<String>,
    pub connection_id: Option<String>,
    pub connection_key: Option<String>,
    pub connection_details: Option<ConnectionDetails>,
    pub msg_serial: Option<i64>,
    pub count: Option<i64>,
    pub flags: Option<i32>,
    pub error: Option<ErrorInfo>,
    pub messages: Option<Vec<Message>>,
    pub presence: Option<Vec<PresenceMessage>>,
    pub timestamp: Option<i64>,
    pub params: Option<HashMap<String, String>>,
}

impl ProtocolMessage {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            ..Default::default()
        }
    }

    pub fn has_flag(&self, flag: i32) -> bool {
        self.flags.unwrap_or(0) & flag != 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionDetails {
    pub client_id: Option<String>,
    pub connection_key: Option<String>,
    /// Milliseconds.
    pub connection_state_ttl: Option<i64>,
    /// Milliseconds.
    pub max_idle_interval: Option<i64>,
    pub max_message_size: Option<i64>,
    pub server_id: Option<String>,
}

/// Error details carried by ERROR, DISCONNECTED, DETACHED and NACK frames, and
/// by every state change the engine emits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default, thiserror::Error)]
#[serde(default, rename_all = "camelCase")]
#[error("code={code}, {message}")]
pub struct ErrorInfo {
    pub code: i32,
    pub status_code: Option<i32>,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: i32, status_code: Option<i32>, message: impl Into<String>) -> Self {
        Self {
            code,
            status_code,
            message: message.into(),
        }
    }
}

pub(crate) fn error_or_unknown(error: Option<ErrorInfo>) -> ErrorInfo {
    error.unwrap_or_else(|| ErrorInfo {
        code: error_code::FAILED,
        status_code: None,
        message: "no error details from server".to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct Message {
    pub id: Option<String>,
    pub name: Option<String>,
    pub data: Option<serde_json::Value>,
    pub client_id: Option<String>,
    pub connection_id: Option<String>,
    pub timestamp: Option<i64>,
    pub encoding: Option<String>,
}

/// Presence action, numbered as on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum PresenceAction {
    #[default]
    Absent,
    Present,
    Enter,
    Leave,
    Update,
}

impl TryFrom<u8> for PresenceAction {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PresenceAction::Absent),
            1 => Ok(PresenceAction::Present),
            2 => Ok(PresenceAction::Enter),
            3 => Ok(PresenceAction::Leave),
            4 => Ok(PresenceAction::Update),
            other => Err(format!("unknown presence action {other}")),
        }
    }
}

impl From<PresenceAction> for u8 {
    fn from(action: PresenceAction) -> Self {
        match action {
            PresenceAction::Absent => 0,
            PresenceAction::Present => 1,
            PresenceAction::Enter => 2,
            PresenceAction::Leave => 3,
            PresenceAction::Update => 4,
        }
    }
}

impl fmt::Display for PresenceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PresenceAction::Absent => "absent",
            PresenceAction::Present => "present",
            PresenceAction::Enter => "enter",
            PresenceAction::Leave => "leave",
            PresenceAction::Update => "update",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct PresenceMessage {
    pub action: PresenceAction,
    /// `<connectionId>:<msgSerial>:<index>` for messages echoed from their
    /// origin connection.
    pub id: Option<String>,
    pub client_id: Option<String>,
    pub connection_id: Option<String>,
    pub data: Option<serde_json::Value>,
    /// Milliseconds since the epoch.
    pub timestamp: Option<i64>,
    pub encoding: Option<String>,
}

/// Components of a presence message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceId<'a> {
    pub connection_id: &'a str,
    pub msg_serial: i64,
    pub index: i64,
}

impl PresenceMessage {
    /// Key identifying a member within a channel's presence set.
    pub fn member_key(&self) -> String {
        format!(
            "{}:{}",
            self.client_id.as_deref().unwrap_or(""),
            self.connection_id.as_deref().unwrap_or("")
        )
    }

    /// Parse `id` as `<connectionId>:<msgSerial>:<index>`.
    pub fn parse_id(&self) -> Option<PresenceId<'_>> {
        let id = self.id.as_deref()?;
        let mut parts = id.rsplitn(3, ':');
        let index = parts.next()?.parse().ok()?;
        let msg_serial = parts.next()?.parse().ok()?;
        let connection_id = parts.next()?;
        Some(PresenceId {
            connection_id,
            msg_serial,
            index,
        })
    }

    /// A message whose id was not assigned by its origin connection (server
    /// generated leaves, REST-injected members) can only be ordered by
    /// timestamp.
    pub fn is_synthesized(&self) -> bool {
        match (self.parse_id(), self.connection_id.as_deref()) {
            (Some(parsed), Some(conn)) => parsed.connection_id != conn,
            _ => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Frame builders
// ---------------------------------------------------------------------------

pub fn build_attach_msg(
    channel: &str,
    params: Option<&HashMap<String, String>>,
    channel_serial: Option<&str>,
) -> ProtocolMessage {
    let (cs, f) = match channel_serial {
        Some(s) => (Some(s.to_string()), Some(flags::ATTACH_RESUME)),
        None => (None, None),
    };
    ProtocolMessage {
        action: Action::Attach,
        channel: Some(channel.to_string()),
        channel_serial: cs,
        flags: f,
        params: params.cloned(),
        ..Default::default()
    }
}

pub fn build_detach_msg(channel: &str) -> ProtocolMessage {
    ProtocolMessage {
        action: Action::Detach,
        channel: Some(channel.to_string()),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
