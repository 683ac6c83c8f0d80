use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use microbus_message::{Association, AssociationRegistry, BusMessage, Purpose, RemoteFault};
use microbus_transport::{MessageTransport, TransportMessage};

use crate::correlator::RequestCorrelator;
use crate::error::{BusError, Result};

/// Lifecycle of one bus pairing.
///
/// Owned exclusively by the bus client that created it; mutated only by the
/// init poller (or the envelope host) and by explicit close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    /// The channel is repeatedly offering `init` to the envelope.
    Polling,
    Ready,
    /// Handshake timed out; terminal except for close.
    Failed,
    Closed,
}

/// Behavior knobs for a bus client.
#[derive(Debug, Clone)]
pub struct BusClientConfig {
    /// Bound on concurrently pending requests. See
    /// [`RequestCorrelator::DEFAULT_MAX_PENDING`].
    pub max_pending: usize,
}

impl Default for BusClientConfig {
    fn default() -> Self {
        Self {
            max_pending: RequestCorrelator::DEFAULT_MAX_PENDING,
        }
    }
}

/// An inbound request or notification addressed to this bus.
#[derive(Debug)]
pub enum InboundCall {
    /// Must be answered; dropping the [`Responder`] unanswered sends an
    /// error response so the remote caller never hangs.
    Request {
        op: String,
        data: Option<Value>,
        responder: Responder,
    },
    Notification {
        op: String,
        data: Option<Value>,
    },
}

struct ClientInner {
    association: Association,
    transport: Arc<dyn MessageTransport>,
    registry: Arc<AssociationRegistry>,
    correlator: RequestCorrelator,
    state: Mutex<SessionState>,
    shutdown: CancellationToken,
}

impl ClientInner {
    fn is_closed(&self) -> bool {
        *self.state.lock().expect("state lock poisoned") == SessionState::Closed
    }

    fn close(&self) {
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }
        self.shutdown.cancel();
        self.correlator.cancel_all(BusError::Closed);
        // Late in-flight messages for this bus are dropped, not dispatched
        // into a torn-down handler table.
        self.registry.deregister(&self.association);
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.close();
    }
}

/// The RPC façade one side of a pairing uses to call the other.
///
/// Symmetric: the channel and the envelope each own one. A spawned router
/// task filters the shared transport down to this client's `(origin, busId)`
/// association, feeds responses to the correlator, and forwards requests and
/// notifications to the receiver returned at bind time. Cheap to clone.
#[derive(Clone)]
pub struct BusClient {
    inner: Arc<ClientInner>,
}

impl BusClient {
    /// Claim `association` on the registry and start routing.
    ///
    /// Fails with [`BusError::AssociationInUse`] if another active pairing
    /// owns the association. Returns the client plus the inbound call stream
    /// its owner must drain.
    pub fn bind(
        transport: Arc<dyn MessageTransport>,
        registry: Arc<AssociationRegistry>,
        association: Association,
        config: BusClientConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<InboundCall>)> {
        let subscription = transport.subscribe();
        Self::bind_to(transport, subscription, registry, association, config)
    }

    /// Like [`BusClient::bind`], but adopt an already-open transport
    /// subscription. The envelope host uses this: it owns the frame's single
    /// listener before any association exists.
    pub fn bind_to(
        transport: Arc<dyn MessageTransport>,
        subscription: mpsc::UnboundedReceiver<TransportMessage>,
        registry: Arc<AssociationRegistry>,
        association: Association,
        config: BusClientConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<InboundCall>)> {
        if !registry.register(association.clone()) {
            return Err(BusError::AssociationInUse(association));
        }

        let inner = Arc::new(ClientInner {
            association,
            transport,
            registry,
            correlator: RequestCorrelator::new(config.max_pending),
            state: Mutex::new(SessionState::Uninitialized),
            shutdown: CancellationToken::new(),
        });

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(route(inner.clone(), subscription, inbound_tx));

        Ok((Self { inner }, inbound_rx))
    }

    /// Send a request and suspend until its response arrives or `timeout`
    /// elapses. Concurrent requests interleave safely; responses match by
    /// request id, not arrival order.
    pub async fn request(
        &self,
        op: &str,
        data: Option<Value>,
        timeout: Duration,
    ) -> Result<Option<Value>> {
        self.ensure_open()?;
        let ticket = self.inner.correlator.register()?;
        let message = BusMessage::request(self.bus_id(), op, ticket.request_id(), data);
        self.inner.transport.post(message.encode()?)?;
        ticket.wait(timeout).await
    }

    /// Send a notification. Fire-and-forget: returns as soon as the envelope
    /// is handed to the transport.
    pub fn notify(&self, op: &str, data: Option<Value>) -> Result<()> {
        self.ensure_open()?;
        let message = BusMessage::notification(self.bus_id(), op, data);
        self.inner.transport.post(message.encode()?)?;
        Ok(())
    }

    /// Tear the pairing down: stop routing, reject all pending requests with
    /// [`BusError::Closed`], release the association. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock().expect("state lock poisoned")
    }

    /// Overwrite the session state. `Closed` is terminal and never
    /// overwritten (close wins every race against the init poller).
    pub fn set_state(&self, next: SessionState) {
        let mut state = self.inner.state.lock().expect("state lock poisoned");
        if *state != SessionState::Closed {
            *state = next;
        }
    }

    pub fn association(&self) -> &Association {
        &self.inner.association
    }

    pub fn bus_id(&self) -> &str {
        &self.inner.association.bus_id
    }

    /// Requests currently awaiting a response (diagnostics).
    pub fn pending_requests(&self) -> usize {
        self.inner.correlator.pending_len()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.is_closed() {
            return Err(BusError::Closed);
        }
        Ok(())
    }
}

impl std::fmt::Debug for BusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusClient")
            .field("association", &self.inner.association)
            .field("state", &self.state())
            .finish()
    }
}

/// Router task: the delivery callback of this pairing.
///
/// Never blocks on handler work — requests and notifications are handed off
/// to the owner's dispatch loop and the router returns to draining the
/// transport immediately.
async fn route(
    inner: Arc<ClientInner>,
    mut subscription: mpsc::UnboundedReceiver<TransportMessage>,
    inbound: mpsc::UnboundedSender<InboundCall>,
) {
    loop {
        let delivered = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            delivered = subscription.recv() => delivered,
        };
        let Some(TransportMessage { origin, payload }) = delivered else {
            // Transport went away underneath us.
            break;
        };

        // Malformed or foreign payloads are not ours to complain about; the
        // transport is shared with unrelated code on the page.
        let Some(message) = BusMessage::decode(&payload) else {
            trace!(%origin, "undecodable payload on shared transport, dropping");
            continue;
        };
        if !inner.association.matches(&origin, &message.bus_id)
            || !inner.registry.accepts(&origin, &message.bus_id)
        {
            trace!(
                %origin,
                bus_id = %message.bus_id,
                "message for another pairing, dropping"
            );
            continue;
        }

        match message.purpose {
            Purpose::Response => {
                // Decode guarantees responses carry a request id.
                if let Some(request_id) = message.request_id {
                    let reply = match message.error {
                        Some(fault) => Err(BusError::Remote(fault.message)),
                        None => Ok(message.data),
                    };
                    inner.correlator.complete(&request_id, reply);
                }
            }
            Purpose::Request => {
                if let Some(request_id) = message.request_id {
                    let responder = Responder {
                        inner: Some(ResponderInner {
                            client: inner.clone(),
                            op: message.op.clone(),
                            request_id,
                        }),
                    };
                    let call = InboundCall::Request {
                        op: message.op,
                        data: message.data,
                        responder,
                    };
                    if inbound.send(call).is_err() {
                        // Dispatcher is gone; the dropped responder already
                        // answered with an error response.
                        debug!("inbound request with no dispatcher attached");
                    }
                }
            }
            Purpose::Notification => {
                let call = InboundCall::Notification {
                    op: message.op,
                    data: message.data,
                };
                if inbound.send(call).is_err() {
                    debug!("inbound notification with no dispatcher attached, dropping");
                }
            }
        }
    }
}

struct ResponderInner {
    client: Arc<ClientInner>,
    op: String,
    request_id: String,
}

/// Reply handle for one inbound request.
///
/// Exactly one of [`Responder::resolve`] / [`Responder::reject`] is sent; if
/// the dispatcher drops the responder without answering, an error response
/// goes out instead, preserving the invariant that no request is ever left
/// unanswered.
#[derive(Debug)]
pub struct Responder {
    inner: Option<ResponderInner>,
}

impl Responder {
    /// Answer the request with a value.
    pub fn resolve(mut self, data: Option<Value>) {
        self.send(Ok(data));
    }

    /// Answer the request with a failure description.
    pub fn reject(mut self, message: impl Into<String>) {
        self.send(Err(message.into()));
    }

    fn send(&mut self, outcome: std::result::Result<Option<Value>, String>) {
        let Some(ResponderInner {
            client,
            op,
            request_id,
        }) = self.inner.take()
        else {
            return;
        };
        if client.is_closed() {
            // Tearing down; the remote's own timeout covers this.
            return;
        }

        let bus_id = &client.association.bus_id;
        let message = match outcome {
            Ok(data) => BusMessage::response(bus_id, &op, &request_id, data),
            Err(fault) => {
                BusMessage::error_response(bus_id, &op, &request_id, RemoteFault::new(fault))
            }
        };
        match message.encode() {
            Ok(payload) => {
                if let Err(err) = client.transport.post(payload) {
                    debug!(%err, op, request_id, "failed posting response");
                }
            }
            Err(err) => warn!(%err, op, request_id, "response payload failed to serialize"),
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if self.inner.is_some() {
            self.send(Err("request dropped without a response".to_string()));
        }
    }
}

impl std::fmt::Debug for ResponderInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("op", &self.op)
            .field("request_id", &self.request_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use microbus_transport::LoopbackEndpoint;

    use super::*;

    const CHANNEL_ORIGIN: &str = "vscode://host";
    const ENVELOPE_ORIGIN: &str = "http://envelope";

    struct Pairing {
        channel: BusClient,
        channel_inbound: mpsc::UnboundedReceiver<InboundCall>,
        envelope: BusClient,
        envelope_inbound: mpsc::UnboundedReceiver<InboundCall>,
    }

    /// Two symmetric clients over one loopback pair. The channel side filters
    /// by the envelope's origin and vice versa.
    fn pairing(bus_id: &str) -> Pairing {
        let (channel_end, envelope_end) = LoopbackEndpoint::pair(CHANNEL_ORIGIN, ENVELOPE_ORIGIN);
        let channel_registry = Arc::new(AssociationRegistry::new());
        let envelope_registry = Arc::new(AssociationRegistry::new());

        let (channel, channel_inbound) = BusClient::bind(
            Arc::new(channel_end),
            channel_registry,
            Association::new(ENVELOPE_ORIGIN, bus_id),
            BusClientConfig::default(),
        )
        .expect("channel bind should succeed");
        let (envelope, envelope_inbound) = BusClient::bind(
            Arc::new(envelope_end),
            envelope_registry,
            Association::new(CHANNEL_ORIGIN, bus_id),
            BusClientConfig::default(),
        )
        .expect("envelope bind should succeed");

        Pairing {
            channel,
            channel_inbound,
            envelope,
            envelope_inbound,
        }
    }

    /// Serve every inbound request on `rx` by echoing its data back.
    fn spawn_echo(mut rx: mpsc::UnboundedReceiver<InboundCall>) {
        tokio::spawn(async move {
            while let Some(call) = rx.recv().await {
                if let InboundCall::Request {
                    data, responder, ..
                } = call
                {
                    responder.resolve(data);
                }
            }
        });
    }

    #[tokio::test]
    async fn request_response_roundtrip() {
        let mut pairing = pairing("bus-rt");
        spawn_echo(pairing.envelope_inbound);

        let value = pairing
            .channel
            .request("contentRequest", Some(json!({"content": "X"})), Duration::from_secs(1))
            .await
            .expect("request should resolve");
        assert_eq!(value, Some(json!({"content": "X"})));

        // And symmetrically, envelope → channel.
        spawn_echo(std::mem::replace(
            &mut pairing.channel_inbound,
            mpsc::unbounded_channel().1,
        ));
        let value = pairing
            .envelope
            .request("ping", Some(json!(1)), Duration::from_secs(1))
            .await
            .expect("reverse request should resolve");
        assert_eq!(value, Some(json!(1)));
    }

    #[tokio::test]
    async fn rejected_request_surfaces_remote_message() {
        let pairing = pairing("bus-err");
        let mut envelope_inbound = pairing.envelope_inbound;
        tokio::spawn(async move {
            while let Some(call) = envelope_inbound.recv().await {
                if let InboundCall::Request { responder, .. } = call {
                    responder.reject("no preview for you");
                }
            }
        });

        let err = pairing
            .channel
            .request("previewRequest", None, Duration::from_secs(1))
            .await
            .expect_err("request must reject");
        assert_eq!(err, BusError::Remote("no preview for you".to_string()));
    }

    #[tokio::test]
    async fn dropped_responder_answers_with_error() {
        let pairing = pairing("bus-drop");
        let mut envelope_inbound = pairing.envelope_inbound;
        tokio::spawn(async move {
            while let Some(call) = envelope_inbound.recv().await {
                // Simulate a dispatcher that forgets to answer.
                drop(call);
            }
        });

        let err = pairing
            .channel
            .request("contentRequest", None, Duration::from_secs(1))
            .await
            .expect_err("request must reject");
        assert!(matches!(err, BusError::Remote(msg) if msg.contains("without a response")));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out() {
        let pairing = pairing("bus-timeout");
        // Envelope inbound deliberately never drained... but keep the
        // receiver alive so the responder is not dropped (which would answer).
        let _parked = pairing.envelope_inbound;

        let err = pairing
            .channel
            .request("contentRequest", None, Duration::from_millis(300))
            .await
            .expect_err("request must time out");
        assert_eq!(err, BusError::Timeout(Duration::from_millis(300)));
        assert_eq!(pairing.channel.pending_requests(), 0);
    }

    #[tokio::test]
    async fn foreign_bus_traffic_is_never_dispatched() {
        let (channel_end, envelope_end) = LoopbackEndpoint::pair(CHANNEL_ORIGIN, ENVELOPE_ORIGIN);
        let registry = Arc::new(AssociationRegistry::new());
        let (_client, mut channel_inbound) = BusClient::bind(
            Arc::new(channel_end),
            registry,
            Association::new(ENVELOPE_ORIGIN, "bus-mine"),
            BusClientConfig::default(),
        )
        .expect("bind should succeed");

        // Traffic for some other pairing sharing the same transport, then
        // traffic for ours. Only ours may be dispatched.
        let foreign = BusMessage::notification("bus-other", "contentChanged", None)
            .encode()
            .expect("encode should succeed");
        envelope_end.post(foreign).expect("post should succeed");
        let mine =
            BusMessage::notification("bus-mine", "contentChanged", Some(json!({"content": "C"})))
                .encode()
                .expect("encode should succeed");
        envelope_end.post(mine).expect("post should succeed");

        let call = channel_inbound.recv().await.expect("own traffic arrives");
        match call {
            InboundCall::Notification { op, data } => {
                assert_eq!(op, "contentChanged");
                assert_eq!(data, Some(json!({"content": "C"})));
            }
            other => panic!("unexpected call: {other:?}"),
        }
        assert!(
            channel_inbound.try_recv().is_err(),
            "foreign traffic must not be dispatched"
        );
    }

    #[tokio::test]
    async fn close_rejects_pending_and_drops_late_responses() {
        let pairing = pairing("bus-close");

        let first = {
            let client = pairing.channel.clone();
            tokio::spawn(async move {
                client
                    .request("contentRequest", None, Duration::from_secs(30))
                    .await
            })
        };
        let second = {
            let client = pairing.channel.clone();
            tokio::spawn(async move {
                client
                    .request("previewRequest", None, Duration::from_secs(30))
                    .await
            })
        };
        // Let both requests reach the wire.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        pairing.channel.close();
        assert_eq!(first.await.expect("task"), Err(BusError::Closed));
        assert_eq!(second.await.expect("task"), Err(BusError::Closed));
        assert_eq!(pairing.channel.state(), SessionState::Closed);

        // A response arriving after close is dropped without panicking.
        let mut envelope_inbound = pairing.envelope_inbound;
        tokio::task::yield_now().await;
        while let Ok(call) = envelope_inbound.try_recv() {
            if let InboundCall::Request { responder, .. } = call {
                responder.resolve(Some(json!("too late")));
            }
        }
        tokio::task::yield_now().await;

        // Operations after close reject immediately.
        assert_eq!(
            pairing.channel.notify("editorUndo", None),
            Err(BusError::Closed)
        );
    }

    #[tokio::test]
    async fn association_can_be_claimed_once() {
        let (channel_end, _envelope_end) = LoopbackEndpoint::pair(CHANNEL_ORIGIN, ENVELOPE_ORIGIN);
        let transport: Arc<dyn MessageTransport> = Arc::new(channel_end);
        let registry = Arc::new(AssociationRegistry::new());
        let association = Association::new(ENVELOPE_ORIGIN, "bus-dup");

        let (first, _rx) = BusClient::bind(
            transport.clone(),
            registry.clone(),
            association.clone(),
            BusClientConfig::default(),
        )
        .expect("first bind should succeed");

        let err = BusClient::bind(
            transport.clone(),
            registry.clone(),
            association.clone(),
            BusClientConfig::default(),
        )
        .expect_err("second bind must fail");
        assert_eq!(err, BusError::AssociationInUse(association.clone()));

        // Closing the first owner frees the association.
        first.close();
        let rebind = BusClient::bind(
            transport,
            registry,
            association,
            BusClientConfig::default(),
        );
        assert!(rebind.is_ok());
    }

    #[tokio::test]
    async fn interleaved_pairings_receive_only_their_own_responses() {
        let (channel_end, envelope_end) = LoopbackEndpoint::pair(CHANNEL_ORIGIN, ENVELOPE_ORIGIN);
        let channel_transport: Arc<dyn MessageTransport> = Arc::new(channel_end);
        let envelope_transport: Arc<dyn MessageTransport> = Arc::new(envelope_end);
        let channel_registry = Arc::new(AssociationRegistry::new());
        let envelope_registry = Arc::new(AssociationRegistry::new());

        let mut channels = Vec::new();
        for bus in ["bus-a", "bus-b"] {
            let (client, _inbound) = BusClient::bind(
                channel_transport.clone(),
                channel_registry.clone(),
                Association::new(ENVELOPE_ORIGIN, bus),
                BusClientConfig::default(),
            )
            .expect("channel bind should succeed");
            let (server, server_inbound) = BusClient::bind(
                envelope_transport.clone(),
                envelope_registry.clone(),
                Association::new(CHANNEL_ORIGIN, bus),
                BusClientConfig::default(),
            )
            .expect("envelope bind should succeed");

            // Each server echoes its bus id alongside the request payload.
            let bus_tag = bus.to_string();
            let mut rx = server_inbound;
            tokio::spawn(async move {
                while let Some(call) = rx.recv().await {
                    if let InboundCall::Request {
                        data, responder, ..
                    } = call
                    {
                        responder.resolve(Some(json!({"bus": bus_tag, "echo": data})));
                    }
                }
            });
            channels.push((bus.to_string(), client, server));
        }

        let mut tasks = Vec::new();
        for (bus, client, _server) in &channels {
            for n in 0..100u32 {
                let client = client.clone();
                let bus = bus.clone();
                tasks.push(tokio::spawn(async move {
                    let value = client
                        .request("echo", Some(json!(n)), Duration::from_secs(5))
                        .await
                        .expect("request should resolve");
                    (bus, n, value)
                }));
            }
        }

        for task in tasks {
            let (bus, n, value) = task.await.expect("task should not panic");
            assert_eq!(value, Some(json!({"bus": bus, "echo": n})));
        }
    }
}
