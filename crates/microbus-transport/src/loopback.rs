use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{Result, TransportError};
use crate::traits::{MessageTransport, TransportMessage};

type ListenerList = Arc<Mutex<Vec<mpsc::UnboundedSender<TransportMessage>>>>;

/// One side of an in-process transport pair.
///
/// Models a `window`/`webview` message channel: posting on one endpoint
/// delivers to every listener subscribed on the peer endpoint, in post order.
/// Used by tests and the demo CLI; production hosts supply their own
/// [`MessageTransport`] implementation.
pub struct LoopbackEndpoint {
    origin: String,
    local: ListenerList,
    remote: ListenerList,
    closed: Arc<AtomicBool>,
}

impl LoopbackEndpoint {
    /// Create a connected endpoint pair with the given origins.
    pub fn pair(
        left_origin: impl Into<String>,
        right_origin: impl Into<String>,
    ) -> (LoopbackEndpoint, LoopbackEndpoint) {
        let left_listeners: ListenerList = Arc::new(Mutex::new(Vec::new()));
        let right_listeners: ListenerList = Arc::new(Mutex::new(Vec::new()));

        let left = LoopbackEndpoint {
            origin: left_origin.into(),
            local: left_listeners.clone(),
            remote: right_listeners.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        };
        let right = LoopbackEndpoint {
            origin: right_origin.into(),
            local: right_listeners,
            remote: left_listeners,
            closed: Arc::new(AtomicBool::new(false)),
        };
        (left, right)
    }

    /// The origin this endpoint stamps on posted messages.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Close this endpoint. Subsequent posts fail with
    /// [`TransportError::Closed`]; already-delivered messages stay queued.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Number of live listeners on this endpoint (tests only care).
    pub fn listener_count(&self) -> usize {
        let mut listeners = self.local.lock().expect("listener lock poisoned");
        listeners.retain(|tx| !tx.is_closed());
        listeners.len()
    }
}

impl MessageTransport for LoopbackEndpoint {
    fn post(&self, payload: Value) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let message = TransportMessage::new(self.origin.clone(), payload);
        let mut listeners = self.remote.lock().expect("listener lock poisoned");
        // Posting to a side with no listener attached yet is legal (a frame
        // that has not loaded); the message is simply lost, like postMessage.
        listeners.retain(|tx| tx.send(message.clone()).is_ok());
        trace!(
            origin = %self.origin,
            listeners = listeners.len(),
            "posted loopback message"
        );
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.local
            .lock()
            .expect("listener lock poisoned")
            .push(tx);
        rx
    }
}

impl std::fmt::Debug for LoopbackEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackEndpoint")
            .field("origin", &self.origin)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn delivers_to_peer_listeners_in_order() {
        let (channel, envelope) = LoopbackEndpoint::pair("vscode://host", "http://envelope");
        let mut rx = envelope.subscribe();

        channel.post(json!({"n": 1})).expect("post should succeed");
        channel.post(json!({"n": 2})).expect("post should succeed");

        let first = rx.recv().await.expect("first message should arrive");
        let second = rx.recv().await.expect("second message should arrive");
        assert_eq!(first.origin, "vscode://host");
        assert_eq!(first.payload, json!({"n": 1}));
        assert_eq!(second.payload, json!({"n": 2}));
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_message() {
        let (channel, envelope) = LoopbackEndpoint::pair("a", "b");
        let mut first = envelope.subscribe();
        let mut second = envelope.subscribe();

        channel.post(json!("shared")).expect("post should succeed");

        assert_eq!(
            first.recv().await.expect("first listener").payload,
            json!("shared")
        );
        assert_eq!(
            second.recv().await.expect("second listener").payload,
            json!("shared")
        );
    }

    #[tokio::test]
    async fn post_without_listeners_is_lost_not_an_error() {
        let (channel, envelope) = LoopbackEndpoint::pair("a", "b");
        channel.post(json!("void")).expect("post should succeed");

        let mut rx = envelope.subscribe();
        channel.post(json!("kept")).expect("post should succeed");
        assert_eq!(rx.recv().await.expect("later message").payload, json!("kept"));
    }

    #[tokio::test]
    async fn closed_endpoint_rejects_posts() {
        let (channel, _envelope) = LoopbackEndpoint::pair("a", "b");
        channel.close();
        assert_eq!(channel.post(json!("x")), Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn dropped_receivers_are_pruned() {
        let (channel, envelope) = LoopbackEndpoint::pair("a", "b");
        let rx = envelope.subscribe();
        drop(rx);
        let _kept = envelope.subscribe();

        channel.post(json!("x")).expect("post should succeed");
        assert_eq!(envelope.listener_count(), 1);
    }
}
