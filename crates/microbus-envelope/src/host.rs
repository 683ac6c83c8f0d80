use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use microbus_message::{
    Association, AssociationRegistry, BusMessage, ChannelNotification, EnvelopeNotification,
    EnvelopeRequest, Purpose, RemoteFault,
};
use microbus_session::{BusClient, BusClientConfig, InboundCall, SessionState};
use microbus_transport::{MessageTransport, TransportMessage};

use crate::editor::Editor;

/// Configuration for an envelope host.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeHostConfig {
    /// When set, only init offers delivered from exactly this origin are
    /// accepted; everything else is dropped before touching the editor.
    pub allowed_origin: Option<String>,
    pub client: BusClientConfig,
}

/// Handle over a spawned envelope host task.
#[derive(Debug)]
pub struct EnvelopeHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl EnvelopeHandle {
    /// Ask the host to shut down. The serving task tears its bus client
    /// down on the way out.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for EnvelopeHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// The envelope-side server for one embedded editor.
///
/// Starts without an association: the pairing's bus id is only learned from
/// the first acceptable `init` offer. The host therefore owns the transport's
/// subscription itself until the handshake lands, then hands it to a
/// [`BusClient`] and serves the typed operation catalog from the client's
/// inbound stream.
pub struct EnvelopeHost;

impl EnvelopeHost {
    /// Start serving `editor` over `transport`.
    pub fn spawn(
        transport: Arc<dyn MessageTransport>,
        registry: Arc<AssociationRegistry>,
        editor: Box<dyn Editor>,
        config: EnvelopeHostConfig,
    ) -> EnvelopeHandle {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(
            transport,
            registry,
            editor,
            config,
            cancel.clone(),
        ));
        EnvelopeHandle { cancel, handle }
    }
}

async fn run(
    transport: Arc<dyn MessageTransport>,
    registry: Arc<AssociationRegistry>,
    mut editor: Box<dyn Editor>,
    config: EnvelopeHostConfig,
    cancel: CancellationToken,
) {
    let mut subscription = transport.subscribe();

    // Phase one: wait for an acceptable init offer. The channel re-offers on
    // an interval, so a rejected or undecodable offer costs one poll tick.
    let accepted = loop {
        let delivered = tokio::select! {
            _ = cancel.cancelled() => return,
            delivered = subscription.recv() => delivered,
        };
        let Some(TransportMessage { origin, payload }) = delivered else {
            return;
        };
        match consider_init(&transport, &config, &mut editor, &origin, &payload) {
            Some(association) => break association,
            None => continue,
        }
    };

    info!(association = %accepted, "init accepted, binding bus client");
    let bound = BusClient::bind_to(
        transport.clone(),
        subscription,
        registry,
        accepted.clone(),
        config.client.clone(),
    );
    let (client, mut inbound) = match bound {
        Ok(bound) => bound,
        Err(err) => {
            warn!(%err, association = %accepted, "could not bind accepted pairing");
            return;
        }
    };
    client.set_state(SessionState::Ready);

    if let Err(err) = notify_channel(&client, &ChannelNotification::Ready) {
        debug!(%err, "could not announce ready");
    }

    // Phase two: serve the catalog until cancelled or the transport closes.
    loop {
        let call = tokio::select! {
            _ = cancel.cancelled() => break,
            call = inbound.recv() => call,
        };
        let Some(call) = call else { break };
        match call {
            InboundCall::Request {
                op,
                data,
                responder,
            } => match EnvelopeRequest::from_wire(&op, data.as_ref()) {
                Ok(request) => serve_request(&client, editor.as_ref(), request, responder),
                Err(err) => responder.reject(err.to_string()),
            },
            InboundCall::Notification { op, data } => {
                match EnvelopeNotification::from_wire(&op, data.as_ref()) {
                    Ok(notification) => apply_notification(&client, editor.as_mut(), notification),
                    Err(err) => debug!(%err, op, "unhandled notification, dropping"),
                }
            }
        }
    }
    client.close();
}

/// Decide whether `payload` is an init offer this host accepts, and if so
/// answer it and return the association to bind.
fn consider_init(
    transport: &Arc<dyn MessageTransport>,
    config: &EnvelopeHostConfig,
    editor: &mut Box<dyn Editor>,
    origin: &str,
    payload: &Value,
) -> Option<Association> {
    let Some(message) = BusMessage::decode(payload) else {
        trace!(%origin, "undecodable payload while awaiting init, dropping");
        return None;
    };
    if message.purpose != Purpose::Request || message.op != "init" {
        trace!(%origin, op = %message.op, "not an init offer, dropping");
        return None;
    }
    let request_id = message.request_id.clone()?;

    let parsed = EnvelopeRequest::from_wire(&message.op, message.data.as_ref());
    let Ok(EnvelopeRequest::Init {
        association,
        editor_init,
    }) = parsed
    else {
        debug!(%origin, "malformed init offer, rejecting");
        answer_init(
            transport,
            &message.bus_id,
            &request_id,
            Err("malformed init payload".to_string()),
        );
        return None;
    };

    // The association the channel offers names its own origin; the transport
    // stamps every delivery with the sender's actual origin, and the two
    // must agree or the offer is forged.
    if association.origin != origin || association.bus_id != message.bus_id {
        warn!(
            %origin,
            offered = %association,
            "init offer origin mismatch, dropping"
        );
        return None;
    }
    if let Some(allowed) = &config.allowed_origin {
        if allowed != origin {
            warn!(%origin, %allowed, "init offer from disallowed origin, dropping");
            return None;
        }
    }

    if let Err(fault) = editor.init(&editor_init) {
        warn!(%fault, "editor refused init");
        answer_init(transport, &message.bus_id, &request_id, Err(fault));
        return None;
    }
    answer_init(transport, &message.bus_id, &request_id, Ok(()));
    Some(association)
}

fn answer_init(
    transport: &Arc<dyn MessageTransport>,
    bus_id: &str,
    request_id: &str,
    outcome: Result<(), String>,
) {
    let reply = match outcome {
        Ok(()) => BusMessage::response(bus_id, "init", request_id, None),
        Err(fault) => BusMessage::error_response(bus_id, "init", request_id, RemoteFault::new(fault)),
    };
    match reply.encode() {
        Ok(payload) => {
            if let Err(err) = transport.post(payload) {
                debug!(%err, "could not answer init offer");
            }
        }
        Err(err) => warn!(%err, "init reply failed to serialize"),
    }
}

fn serve_request(
    client: &BusClient,
    editor: &dyn Editor,
    request: EnvelopeRequest,
    responder: microbus_session::Responder,
) {
    match request {
        // The channel re-offers init until the first answer lands; a late
        // duplicate for the already-bound pairing is acknowledged again.
        EnvelopeRequest::Init { association, .. } => {
            if &association == client.association() {
                responder.resolve(None);
            } else {
                responder.reject("already paired with another channel");
            }
        }
        EnvelopeRequest::Content => resolve_serialized(responder, editor.content()),
        EnvelopeRequest::Preview => resolve_serialized(responder, editor.preview()),
        EnvelopeRequest::GuidedTourElementPosition(selector) => {
            resolve_serialized(responder, editor.element_position(&selector))
        }
    }
}

fn resolve_serialized<T: serde::Serialize>(
    responder: microbus_session::Responder,
    outcome: Result<T, String>,
) {
    match outcome {
        Ok(value) => match serde_json::to_value(value) {
            Ok(value) => responder.resolve(Some(value)),
            Err(err) => responder.reject(format!("response failed to serialize: {err}")),
        },
        Err(fault) => responder.reject(fault),
    }
}

fn apply_notification(
    client: &BusClient,
    editor: &mut dyn Editor,
    notification: EnvelopeNotification,
) {
    match notification {
        EnvelopeNotification::ContentChanged(content) => {
            if let Err(fault) = editor.set_content(content) {
                if let Err(err) =
                    notify_channel(client, &ChannelNotification::SetContentError(fault))
                {
                    debug!(%err, "could not report content error");
                }
            }
        }
        EnvelopeNotification::EditorUndo => editor.undo(),
        EnvelopeNotification::EditorRedo => editor.redo(),
        EnvelopeNotification::ChannelKeyboardEvent(event) => editor.apply_keyboard_event(&event),
        EnvelopeNotification::LocaleChange(locale) => editor.set_locale(&locale),
    }
}

fn notify_channel(
    client: &BusClient,
    notification: &ChannelNotification,
) -> microbus_session::Result<()> {
    let (op, data) = notification.to_wire()?;
    client.notify(op, data)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc::UnboundedReceiver;

    use microbus_message::{EditorContent, EditorInitArgs};
    use microbus_session::{
        BusError, ChannelConfig, ChannelEvent, EditorChannel, InitPollingConfig,
    };
    use microbus_transport::LoopbackEndpoint;

    use crate::editor::TextEditor;

    use super::*;

    const CHANNEL_ORIGIN: &str = "vscode://host";
    const ENVELOPE_ORIGIN: &str = "http://envelope";

    fn init_args() -> EditorInitArgs {
        EditorInitArgs {
            resources_path_prefix: "dist".to_string(),
            file_extension: "txt".to_string(),
        }
    }

    fn fast_config() -> ChannelConfig {
        ChannelConfig {
            init: InitPollingConfig {
                interval: Duration::from_millis(20),
                timeout: Duration::from_secs(2),
            },
            ..ChannelConfig::default()
        }
    }

    struct Rig {
        channel: EditorChannel,
        channel_end: Arc<LoopbackEndpoint>,
        events: UnboundedReceiver<ChannelEvent>,
        host: EnvelopeHandle,
    }

    fn rig_with(editor: Box<dyn Editor>, host_config: EnvelopeHostConfig) -> Rig {
        let (channel_end, envelope_end) = LoopbackEndpoint::pair(CHANNEL_ORIGIN, ENVELOPE_ORIGIN);
        let channel_end = Arc::new(channel_end);
        let host = EnvelopeHost::spawn(
            Arc::new(envelope_end),
            Arc::new(AssociationRegistry::new()),
            editor,
            host_config,
        );
        let (channel, events) = EditorChannel::open(
            channel_end.clone(),
            Arc::new(AssociationRegistry::new()),
            CHANNEL_ORIGIN,
            ENVELOPE_ORIGIN,
            fast_config(),
        )
        .expect("open should succeed");
        Rig {
            channel,
            channel_end,
            events,
            host,
        }
    }

    fn rig() -> Rig {
        rig_with(Box::new(TextEditor::new()), EnvelopeHostConfig::default())
    }

    async fn handshake(rig: &mut Rig) {
        rig.channel.start_init_polling(init_args());
        assert_eq!(rig.events.recv().await, Some(ChannelEvent::Ready));
        while rig.channel.state() != SessionState::Ready {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        rig.channel.stop_init_polling();
    }

    #[tokio::test]
    async fn handshake_reaches_ready_on_both_sides() {
        let mut rig = rig();
        handshake(&mut rig).await;
        assert_eq!(rig.channel.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn pushed_content_is_served_back() {
        let mut rig = rig();
        handshake(&mut rig).await;

        rig.channel
            .set_content(EditorContent::with_path("hello", "notes/today.txt"))
            .expect("set_content");
        let content = rig.channel.content().await.expect("content");
        assert_eq!(content.content, "hello");
        assert_eq!(content.path.as_deref(), Some("notes/today.txt"));
    }

    #[tokio::test]
    async fn undo_and_redo_travel_as_notifications() {
        let mut rig = rig();
        handshake(&mut rig).await;

        rig.channel
            .set_content(EditorContent::new("one"))
            .expect("set_content");
        rig.channel
            .set_content(EditorContent::new("two"))
            .expect("set_content");
        rig.channel.undo().expect("undo");
        // A notification carries no settlement; poll until applied.
        loop {
            let content = rig.channel.content().await.expect("content");
            if content.content == "one" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        rig.channel.redo().expect("redo");
        loop {
            let content = rig.channel.content().await.expect("content");
            if content.content == "two" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn preview_renders_current_content() {
        let mut rig = rig();
        handshake(&mut rig).await;

        rig.channel
            .set_content(EditorContent::new("diagram"))
            .expect("set_content");
        let svg = rig.channel.preview().await.expect("preview");
        assert!(svg.starts_with("<svg"));
        assert!(svg.contains("diagram"));
    }

    #[tokio::test]
    async fn element_position_resolves_and_rejects() {
        let mut rig = rig();
        handshake(&mut rig).await;

        let rect = rig
            .channel
            .element_position("#palette")
            .await
            .expect("id selector resolves");
        assert_eq!(rect.height, 24.0);

        let err = rig
            .channel
            .element_position(".missing")
            .await
            .expect_err("non-id selector rejects");
        assert!(matches!(err, BusError::Remote(msg) if msg.contains(".missing")));
    }

    #[tokio::test]
    async fn failed_set_content_surfaces_as_channel_event() {
        struct Rejecting;
        impl Editor for Rejecting {
            fn content(&self) -> Result<EditorContent, String> {
                Ok(EditorContent::new(""))
            }
            fn set_content(&mut self, _content: EditorContent) -> Result<(), String> {
                Err("unparsable xml".to_string())
            }
            fn undo(&mut self) {}
            fn redo(&mut self) {}
            fn preview(&self) -> Result<String, String> {
                Err("no preview".to_string())
            }
            fn element_position(&self, _selector: &str) -> Result<microbus_message::Rect, String> {
                Err("no layout".to_string())
            }
        }

        let mut rig = rig_with(Box::new(Rejecting), EnvelopeHostConfig::default());
        handshake(&mut rig).await;

        rig.channel
            .set_content(EditorContent::new("<broken"))
            .expect("notification send");
        assert_eq!(
            rig.events.recv().await,
            Some(ChannelEvent::SetContentError {
                message: "unparsable xml".to_string()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn disallowed_origin_never_completes_handshake() {
        let (channel_end, envelope_end) = LoopbackEndpoint::pair(CHANNEL_ORIGIN, ENVELOPE_ORIGIN);
        let _host = EnvelopeHost::spawn(
            Arc::new(envelope_end),
            Arc::new(AssociationRegistry::new()),
            Box::new(TextEditor::new()),
            EnvelopeHostConfig {
                allowed_origin: Some("vscode://other-host".to_string()),
                client: BusClientConfig::default(),
            },
        );
        let (channel, _events) = EditorChannel::open(
            Arc::new(channel_end),
            Arc::new(AssociationRegistry::new()),
            CHANNEL_ORIGIN,
            ENVELOPE_ORIGIN,
            ChannelConfig {
                init: InitPollingConfig {
                    interval: Duration::from_millis(50),
                    timeout: Duration::from_millis(500),
                },
                ..ChannelConfig::default()
            },
        )
        .expect("open should succeed");

        channel.start_init_polling(init_args());
        while channel.state() != SessionState::Failed {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn duplicate_init_offers_are_acknowledged_idempotently() {
        let mut rig = rig();
        handshake(&mut rig).await;

        // A retried offer for the already-bound pairing resolves instead of
        // faulting the session. Drive it over the wire directly and watch
        // for the response on our own subscription.
        let mut replies = rig.channel_end.subscribe();
        let (op, data) = EnvelopeRequest::Init {
            association: Association::new(CHANNEL_ORIGIN, rig.channel.bus_id()),
            editor_init: init_args(),
        }
        .to_wire()
        .expect("to_wire");
        let offer = BusMessage::request(rig.channel.bus_id(), op, "dup-1", data);
        rig.channel_end
            .post(offer.encode().expect("encode"))
            .expect("post");

        loop {
            let delivered = replies.recv().await.expect("reply arrives");
            let Some(message) = BusMessage::decode(&delivered.payload) else {
                continue;
            };
            if message.purpose == Purpose::Response && message.request_id.as_deref() == Some("dup-1")
            {
                assert_eq!(message.error, None);
                assert_eq!(message.data, None);
                break;
            }
        }
    }

    #[tokio::test]
    async fn closing_the_host_finishes_its_task() {
        let mut rig = rig();
        handshake(&mut rig).await;

        rig.host.close();
        while !rig.host.is_finished() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
