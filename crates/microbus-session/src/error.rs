use std::time::Duration;

use microbus_message::Association;
use microbus_transport::TransportError;

/// Errors surfaced to whichever component issued a bus operation.
///
/// Kept cloneable so one teardown can reject every pending caller. Decode
/// failures of *foreign* traffic never appear here — those are dropped at the
/// router; [`BusError::Decode`] only covers payloads that were addressed to
/// us but do not fit the typed catalog. A remote handler that does not
/// implement the requested operation answers with an error response, so it
/// reaches the caller as [`BusError::Remote`], never as a local throw.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BusError {
    /// Transport-level failure while posting.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// No response arrived within the configured window.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The remote handler failed; carries the remote's description.
    #[error("remote handler failed: {0}")]
    Remote(String),

    /// Operation attempted before handshake completion or after it failed.
    #[error("session not ready")]
    NotReady,

    /// Operation attempted after the bus was torn down.
    #[error("bus closed")]
    Closed,

    /// A payload addressed to this bus does not fit the typed catalog.
    #[error("payload decode failed: {0}")]
    Decode(String),

    /// Another active pairing already owns the `(origin, busId)` key.
    #[error("association already in use: {0}")]
    AssociationInUse(Association),

    /// The bounded pending-request map is full; the remote peer is not
    /// answering fast enough (or at all).
    #[error("too many pending requests (limit {0})")]
    PendingLimit(usize),
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        BusError::Decode(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BusError>;
