//! Session layer: turns the one-way transport into reliable bidirectional RPC.
//!
//! This is the "just works" layer of microbus. A [`BusClient`] owns one
//! `(origin, busId)` pairing on a shared transport: its router task filters
//! inbound traffic, the [`RequestCorrelator`] matches responses to pending
//! requests and enforces timeouts, and [`InitPoller`] drives the startup
//! handshake against an envelope that may not be listening yet.
//! [`EditorChannel`] wraps all of that in the typed channel-side surface the
//! embedding UI talks to.

pub mod channel;
pub mod client;
pub mod correlator;
pub mod error;
pub mod handshake;

pub use channel::{ChannelConfig, ChannelEvent, EditorChannel};
pub use client::{BusClient, BusClientConfig, InboundCall, Responder, SessionState};
pub use correlator::{PendingTicket, RequestCorrelator};
pub use error::{BusError, Result};
pub use handshake::{InitPoller, InitPollingConfig};
