use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use shared::{
    domain::ThreadKind,
    protocol::{
        FrameBody, FrameCommand, FrameEncryption, FrameHeader, GroupChange, IncomingMessage,
        Presence, Reaction, RemoteEvent,
    },
};

use crate::{
    crypto::KeyMaterial,
    envelope::{decrypt_json, encrypt, EncryptedEnvelope},
    error::ClientError,
};

pub const FRAME_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 4;

/// Result of decoding one websocket frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    Events(Vec<RemoteEvent>),
    Heartbeat,
    /// The frame could not be decoded; `event` is its `RawUnknown` form.
    Undecodable { event: RemoteEvent, reason: String },
}

pub fn parse_header(bytes: &[u8]) -> Result<(FrameHeader, &[u8]), ClientError> {
    if bytes.len() < HEADER_LEN {
        return Err(ClientError::Protocol(format!(
            "frame of {} bytes is shorter than its header",
            bytes.len()
        )));
    }
    let header = FrameHeader {
        version: bytes[0],
        cmd: u16::from_le_bytes([bytes[1], bytes[2]]),
        sub_cmd: bytes[3],
    };
    Ok((header, &bytes[HEADER_LEN..]))
}

pub fn encode_frame(header: FrameHeader, body: &FrameBody) -> Result<Vec<u8>, ClientError> {
    let payload = serde_json::to_vec(body)
        .map_err(|err| ClientError::Protocol(format!("cannot serialize frame body: {err}")))?;
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.push(header.version);
    frame.extend_from_slice(&header.cmd.to_le_bytes());
    frame.push(header.sub_cmd);
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Builds an event frame for `cmd`; with a key the data travels as an envelope.
pub fn encode_event_frame(
    key: Option<&KeyMaterial>,
    cmd: u16,
    data: &Value,
) -> Result<Vec<u8>, ClientError> {
    let body = match key {
        Some(key) => FrameBody {
            encrypt: FrameEncryption::Envelope,
            data: Value::String(encrypt(key, &data.to_string())?.ciphertext),
        },
        None => FrameBody {
            encrypt: FrameEncryption::Plain,
            data: data.clone(),
        },
    };
    encode_frame(
        FrameHeader {
            version: FRAME_VERSION,
            cmd,
            sub_cmd: 0,
        },
        &body,
    )
}

pub fn encode_heartbeat(timestamp_ms: i64) -> Result<Vec<u8>, ClientError> {
    encode_frame(
        FrameHeader {
            version: FRAME_VERSION,
            cmd: FrameCommand::Heartbeat.code(),
            sub_cmd: 1,
        },
        &FrameBody {
            encrypt: FrameEncryption::Plain,
            data: json!({ "ts": timestamp_ms }),
        },
    )
}

pub fn decode_binary(key: &KeyMaterial, bytes: &[u8]) -> FrameOutcome {
    let (header, body) = match parse_header(bytes) {
        Ok(parsed) => parsed,
        Err(err) => return undecodable(None, bytes, err.to_string()),
    };

    let Some(command) = FrameCommand::from_code(header.cmd) else {
        return FrameOutcome::Events(vec![RemoteEvent::RawUnknown {
            seq: None,
            cmd: Some(header.cmd),
            bytes: bytes.to_vec(),
        }]);
    };
    if command == FrameCommand::Heartbeat {
        return FrameOutcome::Heartbeat;
    }

    match decode_events(key, command, body) {
        Ok(events) => FrameOutcome::Events(events),
        Err(err) => undecodable(Some(header.cmd), bytes, err.to_string()),
    }
}

/// The stream only speaks binary; text frames pass through untouched.
pub fn decode_text(text: &str) -> RemoteEvent {
    RemoteEvent::RawUnknown {
        seq: None,
        cmd: None,
        bytes: text.as_bytes().to_vec(),
    }
}

fn undecodable(cmd: Option<u16>, bytes: &[u8], reason: String) -> FrameOutcome {
    FrameOutcome::Undecodable {
        event: RemoteEvent::RawUnknown {
            seq: None,
            cmd,
            bytes: bytes.to_vec(),
        },
        reason,
    }
}

fn decode_events(
    key: &KeyMaterial,
    command: FrameCommand,
    body: &[u8],
) -> Result<Vec<RemoteEvent>, ClientError> {
    let body: FrameBody = serde_json::from_slice(body)
        .map_err(|err| ClientError::Protocol(format!("frame body is not valid json: {err}")))?;
    let data = match body.encrypt {
        FrameEncryption::Plain => body.data,
        FrameEncryption::Envelope => {
            let Value::String(ciphertext) = body.data else {
                return Err(ClientError::Protocol(
                    "encrypted frame data is not a string".to_string(),
                ));
            };
            decrypt_json::<Value>(key, &EncryptedEnvelope::from_wire(ciphertext))?
        }
    };

    let frame_seq = data.get("seq").and_then(Value::as_u64);
    let batch = command
        .batch_field()
        .and_then(|field| data.get(field))
        .cloned();
    let items = match batch {
        Some(Value::Array(items)) => items,
        Some(_) => {
            return Err(ClientError::Protocol(format!(
                "frame batch for command {} is not an array",
                command.code()
            )))
        }
        None => vec![data],
    };

    items
        .into_iter()
        .map(|item| {
            let seq = item.get("seq").and_then(Value::as_u64).or(frame_seq);
            decode_item(command, seq, item)
        })
        .collect()
}

fn decode_item(command: FrameCommand, seq: Option<u64>, item: Value) -> Result<RemoteEvent, ClientError> {
    let event = match command {
        FrameCommand::UserMessage | FrameCommand::GroupMessage => {
            let mut message: IncomingMessage = parse_item(command, item)?;
            message.thread = if command == FrameCommand::GroupMessage {
                ThreadKind::Group
            } else {
                ThreadKind::User
            };
            RemoteEvent::MessageReceived { seq, message }
        }
        FrameCommand::Reaction => RemoteEvent::ReactionReceived {
            seq,
            reaction: parse_item::<Reaction>(command, item)?,
        },
        FrameCommand::GroupEvent => RemoteEvent::GroupStateChanged {
            seq,
            change: parse_item::<GroupChange>(command, item)?,
        },
        FrameCommand::Presence => RemoteEvent::PresenceChanged {
            seq,
            presence: parse_item::<Presence>(command, item)?,
        },
        FrameCommand::Heartbeat => {
            return Err(ClientError::Protocol(
                "heartbeat frames carry no events".to_string(),
            ))
        }
    };
    Ok(event)
}

fn parse_item<T: DeserializeOwned>(command: FrameCommand, item: Value) -> Result<T, ClientError> {
    serde_json::from_value(item).map_err(|err| {
        ClientError::Protocol(format!(
            "malformed item for command {}: {err}",
            command.code()
        ))
    })
}

#[cfg(test)]
#[path = "tests/frame_tests.rs"]
mod tests;
