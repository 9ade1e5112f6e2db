// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use thiserror::Error;

/// Why a frame failed to decode.
///
/// The server answers any of these with an `error{code:"PROTOCOL"}` frame;
/// the client logs a warning and drops the frame (unknown types especially
/// must not kill an otherwise healthy wrapper connection).
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported protocol version {found:?} (expected {expected:?})")]
    VersionMismatch { found: String, expected: &'static str },

    #[error("unknown message type {0:?}")]
    UnknownType(String),

    #[error("frame id {0:?} is not a UUID")]
    BadId(String),

    #[error("timestamp {0} is not positive")]
    BadTimestamp(i64),

    #[error("{kind} payload rejected: {reason}")]
    Invalid { kind: &'static str, reason: String },

    #[error("{kind} payload did not match schema: {source}")]
    Schema {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl DecodeError {
    /// True when the sender could plausibly retry with a corrected frame.
    pub fn recoverable(&self) -> bool {
        !matches!(self, Self::VersionMismatch { .. })
    }
}
