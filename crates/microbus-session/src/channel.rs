use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use microbus_message::{
    fresh_bus_id, Association, AssociationRegistry, ChannelKeyboardEvent, ChannelNotification,
    EditorContent, EditorInitArgs, EnvelopeNotification, EnvelopeRequest, Rect,
};
use microbus_transport::MessageTransport;

use crate::client::{BusClient, BusClientConfig, InboundCall, SessionState};
use crate::error::{BusError, Result};
use crate::handshake::{InitPoller, InitPollingConfig};

/// Configuration for a channel-side editor session.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Timeout applied to every editor request after the handshake.
    pub request_timeout: Duration,
    pub init: InitPollingConfig,
    pub client: BusClientConfig,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            init: InitPollingConfig::default(),
            client: BusClientConfig::default(),
        }
    }
}

/// Envelope-initiated traffic surfaced to the embedding UI.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The envelope finished rendering its editor.
    Ready,
    /// Pushed content could not be applied by the editor.
    SetContentError { message: String },
}

/// The channel-side surface for one embedded editor.
///
/// Created with a fresh bus id per pairing. Editor operations become
/// available once the init handshake completes; before `Ready` (and after a
/// failed handshake) they reject with [`BusError::NotReady`] without sending
/// anything.
pub struct EditorChannel {
    client: BusClient,
    /// Association offered to the envelope: the channel's own origin plus
    /// the shared bus id, which is what the envelope's transport deliveries
    /// will carry.
    offered: Association,
    poller: Mutex<Option<InitPoller>>,
    config: ChannelConfig,
}

impl EditorChannel {
    /// Bind a new pairing on `transport` toward an envelope at
    /// `envelope_origin`, posting as `channel_origin`.
    pub fn open(
        transport: Arc<dyn MessageTransport>,
        registry: Arc<AssociationRegistry>,
        channel_origin: &str,
        envelope_origin: &str,
        config: ChannelConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ChannelEvent>)> {
        let bus_id = fresh_bus_id();
        let (client, inbound) = BusClient::bind(
            transport,
            registry,
            Association::new(envelope_origin, bus_id.clone()),
            config.client.clone(),
        )?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump_events(inbound, events_tx));

        let channel = Self {
            client,
            offered: Association::new(channel_origin, bus_id),
            poller: Mutex::new(None),
            config,
        };
        Ok((channel, events_rx))
    }

    /// Begin offering `init` to the envelope. No-op if polling is already
    /// running or the session left `Uninitialized`.
    pub fn start_init_polling(&self, editor_init: EditorInitArgs) {
        let mut slot = self.poller.lock().expect("poller lock poisoned");
        if slot.is_some() || self.client.state() != SessionState::Uninitialized {
            debug!(bus_id = %self.bus_id(), "init polling already started");
            return;
        }
        *slot = Some(InitPoller::start(
            self.client.clone(),
            self.offered.clone(),
            editor_init,
            self.config.init.clone(),
        ));
    }

    /// Stop the init poller, if active. Safe to call at any time.
    pub fn stop_init_polling(&self) {
        if let Some(poller) = self
            .poller
            .lock()
            .expect("poller lock poisoned")
            .take()
        {
            poller.stop();
        }
    }

    /// Current document content.
    pub async fn content(&self) -> Result<EditorContent> {
        let value = self.request(EnvelopeRequest::Content).await?;
        decode_response(value)
    }

    /// Push new document content to the editor.
    pub fn set_content(&self, content: EditorContent) -> Result<()> {
        self.notify(EnvelopeNotification::ContentChanged(content))
    }

    pub fn undo(&self) -> Result<()> {
        self.notify(EnvelopeNotification::EditorUndo)
    }

    pub fn redo(&self) -> Result<()> {
        self.notify(EnvelopeNotification::EditorRedo)
    }

    /// Rendered preview of the current document (an SVG payload).
    pub async fn preview(&self) -> Result<String> {
        let value = self.request(EnvelopeRequest::Preview).await?;
        decode_response(value)
    }

    /// Rectangle of the element matching `selector`, for guided-tour
    /// overlay alignment.
    pub async fn element_position(&self, selector: &str) -> Result<Rect> {
        let value = self
            .request(EnvelopeRequest::GuidedTourElementPosition(
                selector.to_string(),
            ))
            .await?;
        decode_response(value)
    }

    /// Forward a keyboard event into the sandboxed editor.
    pub fn send_keyboard_event(&self, event: ChannelKeyboardEvent) -> Result<()> {
        self.notify(EnvelopeNotification::ChannelKeyboardEvent(event))
    }

    pub fn set_locale(&self, locale: &str) -> Result<()> {
        self.notify(EnvelopeNotification::LocaleChange(locale.to_string()))
    }

    /// Tear down: stop polling, reject pending requests, release the
    /// association.
    pub fn close(&self) {
        self.stop_init_polling();
        self.client.close();
    }

    pub fn state(&self) -> SessionState {
        self.client.state()
    }

    pub fn bus_id(&self) -> &str {
        self.client.bus_id()
    }

    async fn request(&self, request: EnvelopeRequest) -> Result<Option<Value>> {
        self.ensure_ready()?;
        let (op, data) = request.to_wire()?;
        self.client
            .request(op, data, self.config.request_timeout)
            .await
    }

    fn notify(&self, notification: EnvelopeNotification) -> Result<()> {
        self.ensure_ready()?;
        let (op, data) = notification.to_wire()?;
        self.client.notify(op, data)
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.client.state() {
            SessionState::Ready => Ok(()),
            SessionState::Closed => Err(BusError::Closed),
            _ => Err(BusError::NotReady),
        }
    }
}

impl Drop for EditorChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for EditorChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EditorChannel")
            .field("bus_id", &self.bus_id())
            .field("state", &self.state())
            .finish()
    }
}

fn decode_response<T: serde::de::DeserializeOwned>(value: Option<Value>) -> Result<T> {
    Ok(serde_json::from_value(value.unwrap_or(Value::Null))?)
}

/// Translate raw inbound calls into typed channel events.
///
/// The channel side implements no requests, so any inbound request is
/// answered with an error response rather than left hanging.
async fn pump_events(
    mut inbound: mpsc::UnboundedReceiver<InboundCall>,
    events: mpsc::UnboundedSender<ChannelEvent>,
) {
    while let Some(call) = inbound.recv().await {
        match call {
            InboundCall::Request { op, responder, .. } => {
                responder.reject(format!("no such operation: '{op}'"));
            }
            InboundCall::Notification { op, data } => {
                match ChannelNotification::from_wire(&op, data.as_ref()) {
                    Ok(ChannelNotification::Ready) => {
                        if events.send(ChannelEvent::Ready).is_err() {
                            break;
                        }
                    }
                    Ok(ChannelNotification::SetContentError(message)) => {
                        if events.send(ChannelEvent::SetContentError { message }).is_err() {
                            break;
                        }
                    }
                    Err(err) => debug!(%err, op, "unhandled notification, dropping"),
                }
            }
        }
    }
}
