//! JSON wire protocol for stroke synchronization.
//!
//! Every frame is a text WebSocket message carrying one envelope:
//! ```text
//! client → relay   { "type": "draw",  "data": { startX, startY, endX, endY, color, lineWidth } }
//!                  { "type": "clear", "data": {} }
//!
//! relay → client   same envelope + "sequence": 7, "originator": "<participant uuid>"
//! ```
//!
//! Decoding is two-staged: the envelope must parse (`DecodeError`,
//! `UnknownType`), then the payload must satisfy the field constraints
//! (`InvalidEvent`). Neither stage ever touches shared state.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Wire tag for stroke segments.
pub const DRAW_TYPE: &str = "draw";
/// Wire tag for canvas clears.
pub const CLEAR_TYPE: &str = "clear";

/// Opaque identifier assigned by the relay when a connection is admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(Uuid);

impl ParticipantId {
    /// Fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID (for tests and diagnostics).
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ParticipantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One straight-line draw command in canvas-local coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrokeSegment {
    pub start_x: f64,
    pub start_y: f64,
    pub end_x: f64,
    pub end_y: f64,
    /// Opaque color token, e.g. `#rrggbb`
    pub color: String,
    pub line_width: f64,
}

impl StrokeSegment {
    pub fn new(
        start: (f64, f64),
        end: (f64, f64),
        color: impl Into<String>,
        line_width: f64,
    ) -> Self {
        Self {
            start_x: start.0,
            start_y: start.1,
            end_x: end.0,
            end_y: end.1,
            color: color.into(),
            line_width,
        }
    }

    /// Check the field constraints: finite numbers, positive width, non-empty color.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let coords = [
            ("startX", self.start_x),
            ("startY", self.start_y),
            ("endX", self.end_x),
            ("endY", self.end_y),
        ];
        for (name, value) in coords {
            if !value.is_finite() {
                return Err(ProtocolError::InvalidEvent(format!("{name} is not finite")));
            }
        }
        if !self.line_width.is_finite() || self.line_width <= 0.0 {
            return Err(ProtocolError::InvalidEvent(format!(
                "lineWidth must be a positive number, got {}",
                self.line_width
            )));
        }
        if self.color.trim().is_empty() {
            return Err(ProtocolError::InvalidEvent("color is empty".into()));
        }
        Ok(())
    }
}

/// A drawing command before the relay has sequenced it.
#[derive(Debug, Clone, PartialEq)]
pub enum DrawingCommand {
    Draw(StrokeSegment),
    Clear,
}

impl DrawingCommand {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            Self::Draw(segment) => segment.validate(),
            Self::Clear => Ok(()),
        }
    }

    /// Wire `type` tag.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Self::Draw(_) => DRAW_TYPE,
            Self::Clear => CLEAR_TYPE,
        }
    }

    pub fn is_clear(&self) -> bool {
        matches!(self, Self::Clear)
    }
}

/// A sequenced entry of the stroke log; the unit of replay and fan-out.
///
/// Immutable once appended.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawingEvent {
    /// Position in the total order, starting at 1
    pub sequence: u64,
    pub originator: ParticipantId,
    pub command: DrawingCommand,
}

impl DrawingEvent {
    pub fn is_clear(&self) -> bool {
        self.command.is_clear()
    }
}

/// Payload of a `clear` envelope. Serializes as `{}`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct ClearData {}

#[derive(Serialize)]
#[serde(untagged)]
enum EnvelopeData<'a> {
    Draw(&'a StrokeSegment),
    Clear(ClearData),
}

impl<'a> From<&'a DrawingCommand> for EnvelopeData<'a> {
    fn from(command: &'a DrawingCommand) -> Self {
        match command {
            DrawingCommand::Draw(segment) => Self::Draw(segment),
            DrawingCommand::Clear => Self::Clear(ClearData {}),
        }
    }
}

#[derive(Serialize)]
struct OutboundEnvelope<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    data: EnvelopeData<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sequence: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    originator: Option<ParticipantId>,
}

/// Client-originated envelope. Anything besides `type` and `data` is skipped,
/// so relay-only fields a client makes up never fail the parse.
///
/// `data` stays raw until the `type` is known: its contents are payload, and
/// payload failures (including out-of-range numbers) are `InvalidEvent`.
#[derive(Deserialize)]
struct CommandEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<Box<RawValue>>,
}

/// Relay-originated envelope, as seen by clients.
#[derive(Deserialize)]
struct EventEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<Box<RawValue>>,
    #[serde(default)]
    sequence: Option<u64>,
    #[serde(default)]
    originator: Option<ParticipantId>,
}

fn parse_envelope<'de, T: Deserialize<'de>>(text: &'de str) -> Result<T, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::DecodeError(e.to_string()))
}

fn command_from(kind: String, data: Option<Box<RawValue>>) -> Result<DrawingCommand, ProtocolError> {
    let command = match kind.as_str() {
        DRAW_TYPE => {
            let raw = data.ok_or_else(|| ProtocolError::InvalidEvent("draw without data".into()))?;
            let segment: StrokeSegment = serde_json::from_str(raw.get())
                .map_err(|e| ProtocolError::InvalidEvent(e.to_string()))?;
            DrawingCommand::Draw(segment)
        }
        CLEAR_TYPE => {
            let data = match data {
                Some(raw) => serde_json::from_str(raw.get())
                    .map_err(|e| ProtocolError::InvalidEvent(e.to_string()))?,
                None => Value::Null,
            };
            match data {
                Value::Null | Value::Object(_) => DrawingCommand::Clear,
                other => {
                    return Err(ProtocolError::InvalidEvent(format!(
                        "clear data must be an object, got {other}"
                    )))
                }
            }
        }
        _ => return Err(ProtocolError::UnknownType(kind)),
    };
    command.validate()?;
    Ok(command)
}

/// Decode a client-originated frame into a validated command.
///
/// Any `sequence`/`originator` the client sent is ignored.
pub fn decode_command(text: &str) -> Result<DrawingCommand, ProtocolError> {
    let envelope: CommandEnvelope = parse_envelope(text)?;
    command_from(envelope.kind, envelope.data)
}

/// Decode a relay-originated frame (client side).
pub fn decode_event(text: &str) -> Result<DrawingEvent, ProtocolError> {
    let envelope: EventEnvelope = parse_envelope(text)?;
    let sequence = envelope
        .sequence
        .ok_or_else(|| ProtocolError::DecodeError("missing field `sequence`".into()))?;
    let originator = envelope
        .originator
        .ok_or_else(|| ProtocolError::DecodeError("missing field `originator`".into()))?;
    let command = command_from(envelope.kind, envelope.data)?;
    Ok(DrawingEvent {
        sequence,
        originator,
        command,
    })
}

/// Encode a command the way a client sends it (no relay-assigned fields).
pub fn encode_command(command: &DrawingCommand) -> Result<String, ProtocolError> {
    encode(command, None, None)
}

/// Encode a sequenced event for delivery to participants.
pub fn encode_event(event: &DrawingEvent) -> Result<String, ProtocolError> {
    encode_frame(event.sequence, event.originator, &event.command)
}

/// Encode the relay form of `command` without materializing a `DrawingEvent`.
pub fn encode_frame(
    sequence: u64,
    originator: ParticipantId,
    command: &DrawingCommand,
) -> Result<String, ProtocolError> {
    encode(command, Some(sequence), Some(originator))
}

fn encode(
    command: &DrawingCommand,
    sequence: Option<u64>,
    originator: Option<ParticipantId>,
) -> Result<String, ProtocolError> {
    let envelope = OutboundEnvelope {
        kind: command.type_tag(),
        data: command.into(),
        sequence,
        originator,
    };
    serde_json::to_string(&envelope).map_err(|e| ProtocolError::EncodeError(e.to_string()))
}

/// Wire codec errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    /// Frame is not a JSON envelope
    #[error("Decode error: {0}")]
    DecodeError(String),
    /// Envelope `type` is neither `draw` nor `clear`
    #[error("Unknown message type: {0}")]
    UnknownType(String),
    /// Envelope parsed but the payload violates a field constraint
    #[error("Invalid event: {0}")]
    InvalidEvent(String),
    #[error("Encode error: {0}")]
    EncodeError(String),
}

impl ProtocolError {
    /// True for envelope-level failures, false for payload validation failures.
    pub fn is_decode_error(&self) -> bool {
        matches!(self, Self::DecodeError(_) | Self::UnknownType(_))
    }
}
