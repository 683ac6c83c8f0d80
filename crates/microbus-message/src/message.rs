use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a [`BusMessage`] is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Purpose {
    /// Expects exactly one matching [`Purpose::Response`].
    Request,
    /// Settles the request carrying the same `requestId`.
    Response,
    /// Fire-and-forget; no response is ever produced.
    Notification,
}

/// Serialized description of a failed remote handler.
///
/// Carries a message only, never a live error object: it must survive
/// whatever serialization the concrete transport applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFault {
    pub message: String,
}

impl RemoteFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The wire-level record exchanged on every call.
///
/// Wire format (JSON field names):
/// ```text
/// { "busId": "...", "purpose": "request" | "response" | "notification",
///   "type": "...", "requestId"?: "...", "data"?: ..., "error"?: {"message": "..."} }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusMessage {
    /// Logical session this message belongs to. Stable for the lifetime of
    /// one channel↔envelope pairing.
    pub bus_id: String,
    pub purpose: Purpose,
    /// Name of the remote operation being invoked.
    #[serde(rename = "type")]
    pub op: String,
    /// Correlates a response to its originating request. Present on
    /// requests and responses only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Operation arguments, or the resolved value of a response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Present on a response whose remote handler failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteFault>,
}

impl BusMessage {
    /// Build a request envelope.
    pub fn request(
        bus_id: impl Into<String>,
        op: impl Into<String>,
        request_id: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            bus_id: bus_id.into(),
            purpose: Purpose::Request,
            op: op.into(),
            request_id: Some(request_id.into()),
            data,
            error: None,
        }
    }

    /// Build a successful response envelope.
    pub fn response(
        bus_id: impl Into<String>,
        op: impl Into<String>,
        request_id: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            bus_id: bus_id.into(),
            purpose: Purpose::Response,
            op: op.into(),
            request_id: Some(request_id.into()),
            data,
            error: None,
        }
    }

    /// Build an error response envelope.
    pub fn error_response(
        bus_id: impl Into<String>,
        op: impl Into<String>,
        request_id: impl Into<String>,
        fault: RemoteFault,
    ) -> Self {
        Self {
            bus_id: bus_id.into(),
            purpose: Purpose::Response,
            op: op.into(),
            request_id: Some(request_id.into()),
            data: None,
            error: Some(fault),
        }
    }

    /// Build a notification envelope.
    pub fn notification(
        bus_id: impl Into<String>,
        op: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            bus_id: bus_id.into(),
            purpose: Purpose::Notification,
            op: op.into(),
            request_id: None,
            data,
            error: None,
        }
    }

    /// Serialize into the transport payload.
    pub fn encode(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Decode a transport payload.
    ///
    /// Returns `None`, never an error, on malformed or foreign payloads: the
    /// transport is shared with unrelated code on the page, so anything that
    /// is not a coherent bus message is simply not ours.
    pub fn decode(payload: &Value) -> Option<BusMessage> {
        let message: BusMessage = serde_json::from_value(payload.clone()).ok()?;

        // Coherence: correlated purposes carry a request id, notifications
        // must not; an error field only makes sense on a response.
        match message.purpose {
            Purpose::Request | Purpose::Response if message.request_id.is_none() => return None,
            Purpose::Notification if message.request_id.is_some() => return None,
            _ => {}
        }
        if message.error.is_some() && message.purpose != Purpose::Response {
            return None;
        }

        Some(message)
    }
}
