//! Wire format for remote events
//!
//! Each message is one compact UTF-8 JSON object:
//!
//! ```text
//! {"type":2,"mainIndex":1,"subIndex":0,"ts":100}
//! ```
//!
//! `mainIndex`, `subIndex` and `ts` default to 0 when absent or null. `type` must be
//! one of the six known event codes.

use crate::domain::error::CodecError;
use crate::domain::models::{DeviceEvent, EventKind};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct WireEvent {
    #[serde(rename = "type")]
    kind: i64,
    #[serde(rename = "mainIndex", default)]
    main_index: Option<i32>,
    #[serde(rename = "subIndex", default)]
    sub_index: Option<i32>,
    #[serde(default)]
    ts: Option<i64>,
}

impl TryFrom<WireEvent> for DeviceEvent {
    type Error = CodecError;

    fn try_from(wire: WireEvent) -> Result<Self, Self::Error> {
        let kind = EventKind::from_code(wire.kind).ok_or(CodecError::UnknownKind(wire.kind))?;
        Ok(DeviceEvent::new(
            kind,
            wire.main_index.unwrap_or(0),
            wire.sub_index.unwrap_or(0),
            wire.ts.unwrap_or(0),
        ))
    }
}

impl From<&DeviceEvent> for WireEvent {
    fn from(event: &DeviceEvent) -> Self {
        Self {
            kind: event.kind.code(),
            main_index: Some(event.main_index),
            sub_index: Some(event.sub_index),
            ts: Some(event.timestamp),
        }
    }
}

/// True when `text` looks like one whole JSON object: it starts with `{` and
/// ends with `}`, ignoring surrounding whitespace and a trailing line break.
///
/// This is a framing check only, nested or concatenated objects are not
/// inspected.
pub fn is_complete(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.starts_with('{') && trimmed.ends_with('}')
}

/// Decode one complete message.
pub fn decode(text: &str) -> Result<DeviceEvent, CodecError> {
    let wire: WireEvent = serde_json::from_str(text.trim())?;
    wire.try_into()
}

/// Decode raw bytes as delivered by the transport.
pub fn decode_bytes(bytes: &[u8]) -> Result<DeviceEvent, CodecError> {
    let text = std::str::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)?;
    decode(text)
}

/// Encode an event in the compact wire form, without a line terminator.
pub fn encode(event: &DeviceEvent) -> String {
    // Serializing a struct of integers cannot fail
    serde_json::to_string(&WireEvent::from(event)).unwrap_or_default()
}
