//! Wire envelope format and association routing for the editor bus.
//!
//! This is the core value-add layer of microbus. Every message that crosses
//! the transport boundary is a [`BusMessage`]:
//! - a `busId` identifying the logical channel↔envelope pairing
//! - a `purpose` (request, response, notification)
//! - a string operation `type` plus its serialization-safe payload
//! - a `requestId` correlating responses to requests
//!
//! [`AssociationRegistry`] routes traffic on a shared physical transport to
//! the correct pairing by `(origin, busId)`, and the [`api`] module defines
//! the closed, typed operation catalog exchanged between channel and
//! envelope.

pub mod api;
pub mod association;
pub mod message;

pub use api::{
    ChannelKeyboardEvent, ChannelNotification, EditorContent, EditorInitArgs, EnvelopeNotification,
    EnvelopeRequest, Rect, WireDecodeError,
};
pub use association::{fresh_bus_id, Association, AssociationRegistry};
pub use message::{BusMessage, Purpose, RemoteFault};
