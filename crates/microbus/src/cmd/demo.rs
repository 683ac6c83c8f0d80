use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use microbus_envelope::{EnvelopeHost, EnvelopeHostConfig, TextEditor};
use microbus_message::{AssociationRegistry, EditorContent, EditorInitArgs};
use microbus_session::{ChannelConfig, ChannelEvent, EditorChannel, InitPollingConfig};
use microbus_transport::LoopbackEndpoint;

use crate::cmd::{parse_duration, DemoArgs};
use crate::exit::{bus_error, CliError, CliResult, SUCCESS, TIMEOUT, USAGE};

const CHANNEL_ORIGIN: &str = "app://microbus-demo";
const ENVELOPE_ORIGIN: &str = "app://microbus-editor";

/// Wire a channel and an envelope-hosted [`TextEditor`] over a loopback
/// transport and run the whole operation catalog once.
pub fn run(args: DemoArgs) -> CliResult<i32> {
    let deadline = parse_duration(&args.timeout)
        .ok_or_else(|| CliError::new(USAGE, format!("invalid timeout: '{}'", args.timeout)))?;

    let runtime = tokio::runtime::Runtime::new()
        .map_err(|err| CliError::new(crate::exit::INTERNAL, format!("runtime start: {err}")))?;
    runtime.block_on(async {
        tokio::time::timeout(deadline, scripted_session(&args))
            .await
            .map_err(|_| CliError::new(TIMEOUT, format!("demo did not finish within {deadline:?}")))?
    })
}

async fn scripted_session(args: &DemoArgs) -> CliResult<i32> {
    let (channel_end, envelope_end) = LoopbackEndpoint::pair(CHANNEL_ORIGIN, ENVELOPE_ORIGIN);

    let host = EnvelopeHost::spawn(
        Arc::new(envelope_end),
        Arc::new(AssociationRegistry::new()),
        Box::new(TextEditor::new()),
        EnvelopeHostConfig {
            allowed_origin: Some(CHANNEL_ORIGIN.to_string()),
            ..EnvelopeHostConfig::default()
        },
    );

    let (channel, mut events) = EditorChannel::open(
        Arc::new(channel_end),
        Arc::new(AssociationRegistry::new()),
        CHANNEL_ORIGIN,
        ENVELOPE_ORIGIN,
        ChannelConfig {
            init: InitPollingConfig {
                interval: Duration::from_millis(50),
                timeout: Duration::from_secs(5),
            },
            ..ChannelConfig::default()
        },
    )
    .map_err(|err| bus_error("open channel", err))?;

    info!(bus_id = %channel.bus_id(), "starting init polling");
    channel.start_init_polling(EditorInitArgs {
        resources_path_prefix: "dist/editors".to_string(),
        file_extension: args.file_extension.clone(),
    });
    loop {
        match events.recv().await {
            Some(ChannelEvent::Ready) => break,
            Some(other) => info!(?other, "event before ready"),
            None => return Err(CliError::new(crate::exit::FAILURE, "envelope went away")),
        }
    }
    channel.stop_init_polling();
    println!("handshake: ready (busId {})", channel.bus_id());

    if let Some(locale) = &args.locale {
        channel
            .set_locale(locale)
            .map_err(|err| bus_error("set locale", err))?;
    }

    channel
        .set_content(EditorContent::new(args.content.clone()))
        .map_err(|err| bus_error("push content", err))?;
    let content = channel
        .content()
        .await
        .map_err(|err| bus_error("read content", err))?;
    println!("content: {}", content.content);

    channel.undo().map_err(|err| bus_error("undo", err))?;
    channel.redo().map_err(|err| bus_error("redo", err))?;

    let svg = channel
        .preview()
        .await
        .map_err(|err| bus_error("preview", err))?;
    println!("preview: {} bytes of svg", svg.len());

    let rect = channel
        .element_position("#document")
        .await
        .map_err(|err| bus_error("element position", err))?;
    println!(
        "element #document: x={} y={} w={} h={}",
        rect.x, rect.y, rect.width, rect.height
    );

    channel.close();
    host.close();
    Ok(SUCCESS)
}
