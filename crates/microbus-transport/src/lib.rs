//! Host-agnostic message transport abstraction.
//!
//! Every hosting environment (iframe `postMessage`, extension webview
//! messaging, Electron IPC) exposes the same minimal capability: post a
//! serializable payload, and deliver inbound payloads to registered
//! listeners. This crate defines that capability as the [`MessageTransport`]
//! trait and provides an in-process [`loopback`] implementation used by tests
//! and the demo CLI.
//!
//! This is the lowest layer of microbus. Everything else builds on top of
//! the [`MessageTransport`] trait defined here.

pub mod error;
pub mod loopback;
pub mod traits;

pub use error::{Result, TransportError};
pub use loopback::LoopbackEndpoint;
pub use traits::{MessageTransport, TransportMessage};
