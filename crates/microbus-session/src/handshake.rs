use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use microbus_message::{Association, EditorInitArgs, EnvelopeRequest};

use crate::client::{BusClient, SessionState};
use crate::error::BusError;

/// Retry cadence and overall bound for the init handshake.
#[derive(Debug, Clone)]
pub struct InitPollingConfig {
    /// Delay between successive `init` offers. Each attempt is also bounded
    /// by this interval so a dead attempt never delays the next one.
    pub interval: Duration,
    /// Total wait before declaring the envelope unreachable.
    pub timeout: Duration,
}

impl Default for InitPollingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Drives the startup handshake from the channel side.
///
/// The envelope's execution context initializes asynchronously and may not
/// have attached its listener yet when the channel starts, so a single init
/// attempt would race the load — instead `init` is offered repeatedly until
/// the envelope answers (session becomes `Ready`, exactly once) or the
/// configured timeout elapses (session becomes `Failed`). Duplicate answers
/// to earlier offers are discarded by request-id correlation.
pub struct InitPoller {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl InitPoller {
    /// Start polling. The session moves to `Polling` immediately.
    pub fn start(
        client: BusClient,
        association: Association,
        editor_init: EditorInitArgs,
        config: InitPollingConfig,
    ) -> Self {
        client.set_state(SessionState::Polling);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(poll_init(
            client,
            association,
            editor_init,
            config,
            cancel.clone(),
        ));
        Self { cancel, handle }
    }

    /// Stop polling. Callable at any time, including before the session is
    /// ready; leaves no outstanding timers or pending init requests behind.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Whether the polling task has finished (reached a terminal state or
    /// been stopped).
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for InitPoller {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn poll_init(
    client: BusClient,
    association: Association,
    editor_init: EditorInitArgs,
    config: InitPollingConfig,
    cancel: CancellationToken,
) {
    let request = EnvelopeRequest::Init {
        association,
        editor_init,
    };
    let (op, data) = match request.to_wire() {
        Ok(wire) => wire,
        Err(err) => {
            warn!(%err, "init arguments failed to serialize, handshake cannot start");
            client.set_state(SessionState::Failed);
            return;
        }
    };

    let deadline = Instant::now() + config.timeout;
    let mut ticker = interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut attempts = 0u32;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(attempts, "init polling stopped");
                return;
            }
            _ = ticker.tick() => {}
        }

        let now = Instant::now();
        if now >= deadline {
            warn!(attempts, timeout = ?config.timeout, "envelope unreachable, handshake failed");
            client.set_state(SessionState::Failed);
            return;
        }

        attempts += 1;
        let attempt_window = config.interval.min(deadline - now);
        let attempt = client.request(op, data.clone(), attempt_window);
        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(attempts, "init polling stopped mid-attempt");
                return;
            }
            outcome = attempt => outcome,
        };

        match outcome {
            Ok(_) => {
                if client.state() == SessionState::Polling {
                    client.set_state(SessionState::Ready);
                    info!(attempts, bus_id = %client.bus_id(), "envelope answered init, session ready");
                }
                return;
            }
            Err(BusError::Timeout(_)) => continue,
            Err(BusError::Closed) => {
                debug!("bus closed during handshake");
                return;
            }
            Err(err) => {
                // A rejected init (envelope still wiring itself up) is retried
                // on the same cadence as a silent one.
                debug!(%err, attempts, "init attempt failed, retrying");
            }
        }
    }
}
