use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Result;

/// A payload delivered by a transport, tagged with the sender's origin.
///
/// The payload is an arbitrary serialization-safe value (the structured-clone
/// analog). The transport attaches the sender origin on delivery; receivers
/// must not trust any origin claim embedded inside the payload itself.
#[derive(Debug, Clone)]
pub struct TransportMessage {
    /// Origin of the sending side, as established by the hosting environment.
    pub origin: String,
    /// The serialized message body.
    pub payload: Value,
}

impl TransportMessage {
    /// Create a transport message.
    pub fn new(origin: impl Into<String>, payload: Value) -> Self {
        Self {
            origin: origin.into(),
            payload,
        }
    }
}

/// The minimal capability every hosting environment provides.
///
/// One physical transport may be shared by many independent bus pairings
/// (several webviews posting to one window), so `subscribe` may be called any
/// number of times: every subscriber observes every inbound message and is
/// responsible for discarding traffic that is not addressed to it.
pub trait MessageTransport: Send + Sync {
    /// Post a payload to the remote side. Fire-and-forget: delivery is
    /// asynchronous and there is no acknowledgement. The transport stamps the
    /// local origin on the delivered message.
    fn post(&self, payload: Value) -> Result<()>;

    /// Register a listener for inbound messages. Dropping the receiver
    /// detaches the listener.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportMessage>;
}
