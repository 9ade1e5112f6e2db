// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The `{version, type, id, timestamp, payload}` envelope and its codec.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::DecodeError;
use crate::messages::Message;
use crate::types::MessageType;
use crate::validate;

pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Envelope exactly as it appears on the wire, before typing.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawFrame {
    version: String,
    #[serde(rename = "type")]
    kind: String,
    id: String,
    timestamp: i64,
    #[serde(default)]
    payload: Value,
}

/// A decoded (or authored) protocol frame.
///
/// Decoded frames keep the raw payload alongside the typed message so that
/// fan-out paths can forward peer frames verbatim, unknown optional fields
/// included. Authored frames have no raw payload; encoding them serializes
/// the typed struct, which strips anything the catalogue doesn't name.
#[derive(Debug, Clone)]
pub struct Frame {
    pub id: Uuid,
    pub timestamp: i64,
    pub message: Message,
    raw_payload: Option<Value>,
}

impl Frame {
    /// Author a new frame with a fresh id and the current timestamp.
    pub fn authored(message: Message) -> Self {
        Self { id: Uuid::new_v4(), timestamp: crate::epoch_ms(), message, raw_payload: None }
    }

    /// The payload as the peer sent it. `None` for authored frames.
    pub fn raw_payload(&self) -> Option<&Value> {
        self.raw_payload.as_ref()
    }

    /// Serialize from the typed message, stripping unknown fields.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        let raw = RawFrame {
            version: PROTOCOL_VERSION.to_owned(),
            kind: self.message.kind().as_str().to_owned(),
            id: self.id.to_string(),
            timestamp: self.timestamp,
            payload: self.message.to_payload()?,
        };
        serde_json::to_vec(&raw)
    }

    /// Serialize preserving the peer's raw payload when present.
    ///
    /// Used on pass-through paths (terminal output fan-out) so unknown
    /// optional fields survive; falls back to [`Frame::encode`] for
    /// authored frames.
    pub fn encode_forwarded(&self) -> Result<Vec<u8>, serde_json::Error> {
        let Some(ref payload) = self.raw_payload else {
            return self.encode();
        };
        let raw = RawFrame {
            version: PROTOCOL_VERSION.to_owned(),
            kind: self.message.kind().as_str().to_owned(),
            id: self.id.to_string(),
            timestamp: self.timestamp,
            payload: payload.clone(),
        };
        serde_json::to_vec(&raw)
    }

    /// Decode and validate one frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let raw: RawFrame = serde_json::from_slice(bytes)?;

        if raw.version != PROTOCOL_VERSION {
            return Err(DecodeError::VersionMismatch {
                found: raw.version,
                expected: PROTOCOL_VERSION,
            });
        }
        let id = Uuid::parse_str(&raw.id).map_err(|_| DecodeError::BadId(raw.id.clone()))?;
        if raw.timestamp <= 0 {
            return Err(DecodeError::BadTimestamp(raw.timestamp));
        }
        let kind =
            MessageType::from_name(&raw.kind).ok_or_else(|| DecodeError::UnknownType(raw.kind))?;

        let payload = if raw.payload.is_null() { Value::Object(Default::default()) } else { raw.payload };
        let message = Message::from_payload(kind, payload.clone())
            .map_err(|source| DecodeError::Schema { kind: kind.as_str(), source })?;
        validate::message(&message)?;

        Ok(Self { id, timestamp: raw.timestamp, message, raw_payload: Some(payload) })
    }
}

#[cfg(test)]
#[path = "frame_tests.rs"]
mod tests;
