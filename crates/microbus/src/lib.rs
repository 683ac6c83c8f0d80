//! Reliable bidirectional RPC for embedded editors.
//!
//! microbus pairs an embedding host (the "channel") with a sandboxed editor
//! (the "envelope") over a one-way, post-only message transport, and layers
//! request/response correlation, an init handshake, and a typed operation
//! catalog on top.
//!
//! # Crate Structure
//!
//! - [`transport`] — One-way transport abstraction + in-process loopback
//! - [`message`] — Wire envelope format, associations, typed operation catalog
//! - [`session`] — Request correlator, bus client, handshake, channel façade
//! - [`envelope`] — Envelope host runtime and the editor capability trait

/// Re-export transport types.
pub mod transport {
    pub use microbus_transport::*;
}

/// Re-export wire-format types.
pub mod message {
    pub use microbus_message::*;
}

/// Re-export session types.
pub mod session {
    pub use microbus_session::*;
}

/// Re-export envelope-side types.
pub mod envelope {
    pub use microbus_envelope::*;
}
