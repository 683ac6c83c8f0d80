//! Envelope-side host runtime.
//!
//! The sandboxed side of a pairing: [`EnvelopeHost`] owns the single message
//! listener for its frame, waits for a channel's `init` offer, and from then
//! on serves the typed operation catalog by delegating to an [`Editor`]
//! implementation. The editor itself is an external collaborator behind a
//! small capability interface; the host never assumes a concrete editor
//! technology. [`TextEditor`] is the in-memory reference implementation used
//! by tests and the demo CLI.

pub mod editor;
pub mod host;

pub use editor::{Editor, TextEditor};
pub use host::{EnvelopeHandle, EnvelopeHost, EnvelopeHostConfig};
