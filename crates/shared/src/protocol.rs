use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::{AccountId, MessageId, ThreadId, ThreadKind},
    error::{ApiError, SUCCESS_CODE},
};

/// Outer JSON shape of every HTTP response from the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(default)]
    pub error_code: i64,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

impl ResponseEnvelope {
    pub fn ok(data: Value) -> Self {
        Self {
            error_code: SUCCESS_CODE,
            error_message: String::new(),
            data: Some(data),
        }
    }

    pub fn rejected(error: ApiError) -> Self {
        Self {
            error_code: error.code,
            error_message: error.message,
            data: None,
        }
    }

    pub fn into_result(self) -> Result<Option<Value>, ApiError> {
        if self.error_code != SUCCESS_CODE {
            return Err(ApiError::new(self.error_code, self.error_message));
        }
        Ok(self.data.filter(|data| !data.is_null()))
    }
}

/// Decrypted body of an operation response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecryptedBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginInfo {
    pub uid: AccountId,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub session_key: String,
    #[serde(default)]
    pub service_map: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameCommand {
    Heartbeat,
    UserMessage,
    GroupMessage,
    GroupEvent,
    Presence,
    Reaction,
}

impl FrameCommand {
    pub const fn code(self) -> u16 {
        match self {
            Self::Heartbeat => 2,
            Self::UserMessage => 501,
            Self::GroupMessage => 521,
            Self::GroupEvent => 601,
            Self::Presence => 602,
            Self::Reaction => 612,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            2 => Some(Self::Heartbeat),
            501 => Some(Self::UserMessage),
            521 => Some(Self::GroupMessage),
            601 => Some(Self::GroupEvent),
            602 => Some(Self::Presence),
            612 => Some(Self::Reaction),
            _ => None,
        }
    }

    /// Name of the JSON array that batches this command's items.
    pub fn batch_field(self) -> Option<&'static str> {
        match self {
            Self::Heartbeat => None,
            Self::UserMessage | Self::GroupMessage => Some("msgs"),
            Self::GroupEvent => Some("controls"),
            Self::Presence => Some("statuses"),
            Self::Reaction => Some("reacts"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub cmd: u16,
    pub sub_cmd: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum FrameEncryption {
    #[default]
    Plain,
    Envelope,
}

impl From<FrameEncryption> for u8 {
    fn from(value: FrameEncryption) -> Self {
        match value {
            FrameEncryption::Plain => 0,
            FrameEncryption::Envelope => 1,
        }
    }
}

impl TryFrom<u8> for FrameEncryption {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Plain),
            1 => Ok(Self::Envelope),
            other => Err(format!("unsupported frame encryption mode {other}")),
        }
    }
}

/// JSON body following the binary frame header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameBody {
    #[serde(default)]
    pub encrypt: FrameEncryption,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingMessage {
    #[serde(default)]
    pub thread: ThreadKind,
    pub msg_id: MessageId,
    pub from: AccountId,
    pub to: ThreadId,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub ts: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub msg_id: MessageId,
    pub from: AccountId,
    pub to: ThreadId,
    pub icon: String,
    #[serde(default)]
    pub ts: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupChange {
    pub group_id: ThreadId,
    pub act: String,
    #[serde(default)]
    pub actor: Option<AccountId>,
    #[serde(default)]
    pub members: Vec<AccountId>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
    Away,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Presence {
    pub uid: AccountId,
    pub status: PresenceStatus,
    #[serde(default)]
    pub last_active: Option<i64>,
}

/// A decoded event from the realtime stream. `seq` is the stream's sequence
/// marker when the frame carried one.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    MessageReceived {
        seq: Option<u64>,
        message: IncomingMessage,
    },
    ReactionReceived {
        seq: Option<u64>,
        reaction: Reaction,
    },
    GroupStateChanged {
        seq: Option<u64>,
        change: GroupChange,
    },
    PresenceChanged {
        seq: Option<u64>,
        presence: Presence,
    },
    RawUnknown {
        seq: Option<u64>,
        cmd: Option<u16>,
        bytes: Vec<u8>,
    },
}

impl RemoteEvent {
    pub fn seq(&self) -> Option<u64> {
        match self {
            Self::MessageReceived { seq, .. }
            | Self::ReactionReceived { seq, .. }
            | Self::GroupStateChanged { seq, .. }
            | Self::PresenceChanged { seq, .. }
            | Self::RawUnknown { seq, .. } => *seq,
        }
    }

    pub fn is_raw_unknown(&self) -> bool {
        matches!(self, Self::RawUnknown { .. })
    }
}
