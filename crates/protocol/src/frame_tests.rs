// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde_json::json;
use uuid::Uuid;

use crate::error::DecodeError;
use crate::messages::{ErrorMessage, Message};
use crate::types::MessageType;

use super::{Frame, PROTOCOL_VERSION};

fn wire(kind: &str, payload: serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "version": PROTOCOL_VERSION,
        "type": kind,
        "id": Uuid::new_v4().to_string(),
        "timestamp": 1_700_000_000_000_i64,
        "payload": payload,
    }))
    .unwrap_or_default()
}

#[test]
fn round_trip_authored_frame() -> anyhow::Result<()> {
    let frame = Frame::authored(Message::Error(ErrorMessage {
        code: "PROTOCOL".to_owned(),
        message: "bad frame".to_owned(),
        recoverable: true,
    }));
    let bytes = frame.encode()?;
    let decoded = Frame::decode(&bytes)?;
    assert_eq!(decoded.id, frame.id);
    assert_eq!(decoded.timestamp, frame.timestamp);
    assert_eq!(decoded.message.kind(), MessageType::Error);
    Ok(())
}

#[test]
fn decode_rejects_version_mismatch() {
    let bytes = serde_json::to_vec(&json!({
        "version": "0.9.0",
        "type": "ping",
        "id": Uuid::new_v4().to_string(),
        "timestamp": 1_700_000_000_000_i64,
        "payload": {},
    }))
    .unwrap_or_default();
    assert!(matches!(Frame::decode(&bytes), Err(DecodeError::VersionMismatch { .. })));
}

#[test]
fn decode_rejects_unknown_type() -> anyhow::Result<()> {
    let bytes = wire("agent:levitate", json!({}));
    match Frame::decode(&bytes) {
        Err(DecodeError::UnknownType(name)) => assert_eq!(name, "agent:levitate"),
        other => anyhow::bail!("expected UnknownType, got {other:?}"),
    }
    Ok(())
}

#[test]
fn decode_rejects_non_uuid_id() {
    let bytes = serde_json::to_vec(&json!({
        "version": PROTOCOL_VERSION,
        "type": "ping",
        "id": "frame-1",
        "timestamp": 1_700_000_000_000_i64,
        "payload": {},
    }))
    .unwrap_or_default();
    assert!(matches!(Frame::decode(&bytes), Err(DecodeError::BadId(_))));
}

#[test]
fn decode_rejects_non_positive_timestamp() {
    let bytes = serde_json::to_vec(&json!({
        "version": PROTOCOL_VERSION,
        "type": "ping",
        "id": Uuid::new_v4().to_string(),
        "timestamp": 0,
        "payload": {},
    }))
    .unwrap_or_default();
    assert!(matches!(Frame::decode(&bytes), Err(DecodeError::BadTimestamp(0))));
}

#[test]
fn forwarding_preserves_unknown_optional_fields() -> anyhow::Result<()> {
    let command_id = Uuid::new_v4();
    let agent_id = Uuid::new_v4();
    let bytes = wire(
        "terminal:output",
        json!({
            "commandId": command_id.to_string(),
            "agentId": agent_id.to_string(),
            "data": "hi",
            "stream": "stdout",
            "sequence": 1,
            "vendorHint": "xterm-256color",
        }),
    );

    let decoded = Frame::decode(&bytes)?;
    let forwarded: serde_json::Value = serde_json::from_slice(&decoded.encode_forwarded()?)?;
    assert_eq!(forwarded["payload"]["vendorHint"], "xterm-256color");

    // Authored re-serialization strips the field the catalogue doesn't name.
    let reauthored: serde_json::Value = serde_json::from_slice(&decoded.encode()?)?;
    assert!(reauthored["payload"].get("vendorHint").is_none());
    Ok(())
}

proptest::proptest! {
    /// Any authored terminal:output within limits survives a round trip.
    #[test]
    fn terminal_output_round_trips(
        data in "[ -~]{0,512}",
        sequence in 1u64..1_000_000,
        is_blank: bool,
    ) {
        use crate::messages::TerminalOutput;
        use crate::types::StreamKind;

        let frame = Frame::authored(Message::TerminalOutput(TerminalOutput {
            command_id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
            data: data.clone(),
            stream: StreamKind::Stdout,
            sequence,
            ansi_codes: None,
            is_blank,
            is_binary: false,
        }));
        let bytes = frame.encode().map_err(|e| proptest::test_runner::TestCaseError::fail(e.to_string()))?;
        let decoded = Frame::decode(&bytes).map_err(|e| proptest::test_runner::TestCaseError::fail(e.to_string()))?;
        match decoded.message {
            Message::TerminalOutput(o) => {
                proptest::prop_assert_eq!(o.data, data);
                proptest::prop_assert_eq!(o.sequence, sequence);
                proptest::prop_assert_eq!(o.is_blank, is_blank);
            }
            other => proptest::prop_assert!(false, "wrong variant: {:?}", other.kind()),
        }
    }
}

#[test]
fn decode_defaults_missing_payload_to_empty_object() -> anyhow::Result<()> {
    let bytes = serde_json::to_vec(&json!({
        "version": PROTOCOL_VERSION,
        "type": "ping",
        "id": Uuid::new_v4().to_string(),
        "timestamp": 1_700_000_000_000_i64,
    }))
    .unwrap_or_default();
    let frame = Frame::decode(&bytes)?;
    assert_eq!(frame.message.kind(), MessageType::Ping);
    Ok(())
}
