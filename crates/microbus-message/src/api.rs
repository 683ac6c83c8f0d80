//! The typed operation catalog exchanged between channel and envelope.
//!
//! The wire carries a string operation name plus a serialization-safe `data`
//! payload; this module binds those pairs to closed enums per direction so
//! dispatch is an exhaustive `match` instead of an open-ended string lookup.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::association::Association;

/// Document content pushed to or read from the editor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditorContent {
    pub content: String,
    /// Path of the backing document, when the host has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl EditorContent {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            path: None,
        }
    }

    pub fn with_path(content: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            path: Some(path.into()),
        }
    }
}

/// Arguments carried by the `init` handshake request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditorInitArgs {
    /// Prefix under which the envelope resolves editor asset paths.
    pub resources_path_prefix: String,
    /// Extension of the document being edited (e.g. `bpmn`, `dmn`).
    pub file_extension: String,
}

/// Rectangle of a rendered element, for guided-tour overlay alignment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// A keyboard event forwarded from the channel into the sandboxed editor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelKeyboardEvent {
    /// DOM-style event type: `keydown` or `keyup`.
    #[serde(rename = "type")]
    pub event_type: String,
    pub key: String,
    pub alt_key: bool,
    pub ctrl_key: bool,
    pub shift_key: bool,
    pub meta_key: bool,
}

/// Requests the channel sends to the envelope. Each expects a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EnvelopeRequest {
    /// Handshake. Answered once the envelope has an editor ready to serve.
    #[serde(rename = "init", rename_all = "camelCase")]
    Init {
        association: Association,
        editor_init: EditorInitArgs,
    },
    /// Returns the current document content.
    #[serde(rename = "contentRequest")]
    Content,
    /// Returns a rendered preview (an SVG payload).
    #[serde(rename = "previewRequest")]
    Preview,
    /// Returns the rectangle of the element matching the selector.
    #[serde(rename = "guidedTourElementPositionRequest")]
    GuidedTourElementPosition(String),
}

impl EnvelopeRequest {
    pub fn op_name(&self) -> &'static str {
        match self {
            EnvelopeRequest::Init { .. } => "init",
            EnvelopeRequest::Content => "contentRequest",
            EnvelopeRequest::Preview => "previewRequest",
            EnvelopeRequest::GuidedTourElementPosition(_) => "guidedTourElementPositionRequest",
        }
    }

    const OP_NAMES: &'static [&'static str] = &[
        "init",
        "contentRequest",
        "previewRequest",
        "guidedTourElementPositionRequest",
    ];

    pub fn from_wire(op: &str, data: Option<&Value>) -> Result<Self, WireDecodeError> {
        decode_op(Self::OP_NAMES, op, data)
    }

    pub fn to_wire(&self) -> Result<(&'static str, Option<Value>), serde_json::Error> {
        Ok((self.op_name(), encode_op(self)?))
    }
}

/// Notifications the channel pushes into the envelope. Fire-and-forget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EnvelopeNotification {
    #[serde(rename = "contentChanged")]
    ContentChanged(EditorContent),
    #[serde(rename = "editorUndo")]
    EditorUndo,
    #[serde(rename = "editorRedo")]
    EditorRedo,
    #[serde(rename = "channelKeyboardEvent")]
    ChannelKeyboardEvent(ChannelKeyboardEvent),
    #[serde(rename = "localeChange")]
    LocaleChange(String),
}

impl EnvelopeNotification {
    pub fn op_name(&self) -> &'static str {
        match self {
            EnvelopeNotification::ContentChanged(_) => "contentChanged",
            EnvelopeNotification::EditorUndo => "editorUndo",
            EnvelopeNotification::EditorRedo => "editorRedo",
            EnvelopeNotification::ChannelKeyboardEvent(_) => "channelKeyboardEvent",
            EnvelopeNotification::LocaleChange(_) => "localeChange",
        }
    }

    const OP_NAMES: &'static [&'static str] = &[
        "contentChanged",
        "editorUndo",
        "editorRedo",
        "channelKeyboardEvent",
        "localeChange",
    ];

    pub fn from_wire(op: &str, data: Option<&Value>) -> Result<Self, WireDecodeError> {
        decode_op(Self::OP_NAMES, op, data)
    }

    pub fn to_wire(&self) -> Result<(&'static str, Option<Value>), serde_json::Error> {
        Ok((self.op_name(), encode_op(self)?))
    }
}

/// Notifications the envelope pushes back to the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ChannelNotification {
    /// The envelope finished rendering and is serving requests.
    #[serde(rename = "ready")]
    Ready,
    /// Applying pushed content failed; carries the editor's message.
    #[serde(rename = "setContentError")]
    SetContentError(String),
}

impl ChannelNotification {
    pub fn op_name(&self) -> &'static str {
        match self {
            ChannelNotification::Ready => "ready",
            ChannelNotification::SetContentError(_) => "setContentError",
        }
    }

    const OP_NAMES: &'static [&'static str] = &["ready", "setContentError"];

    pub fn from_wire(op: &str, data: Option<&Value>) -> Result<Self, WireDecodeError> {
        decode_op(Self::OP_NAMES, op, data)
    }

    pub fn to_wire(&self) -> Result<(&'static str, Option<Value>), serde_json::Error> {
        Ok((self.op_name(), encode_op(self)?))
    }
}

/// Why a wire `(type, data)` pair could not be bound to a typed operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireDecodeError {
    /// The operation name is not part of this direction's catalog.
    #[error("no such operation: '{0}'")]
    UnknownOperation(String),
    /// The operation is known but its payload does not fit.
    #[error("malformed payload for operation '{op}': {detail}")]
    MalformedPayload { op: String, detail: String },
}

fn decode_op<T: DeserializeOwned>(
    known: &'static [&'static str],
    op: &str,
    data: Option<&Value>,
) -> Result<T, WireDecodeError> {
    let mut wire = serde_json::Map::new();
    wire.insert("type".to_string(), Value::String(op.to_string()));
    if let Some(data) = data {
        wire.insert("data".to_string(), data.clone());
    }

    serde_json::from_value(Value::Object(wire)).map_err(|err| {
        if known.contains(&op) {
            WireDecodeError::MalformedPayload {
                op: op.to_string(),
                detail: err.to_string(),
            }
        } else {
            WireDecodeError::UnknownOperation(op.to_string())
        }
    })
}

fn encode_op<T: Serialize>(value: &T) -> Result<Option<Value>, serde_json::Error> {
    let wire = serde_json::to_value(value)?;
    Ok(wire.get("data").cloned())
}
