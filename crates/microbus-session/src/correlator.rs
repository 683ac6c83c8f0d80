use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time;
use tracing::{debug, trace};

use crate::error::{BusError, Result};

/// How a pending request settles: the response payload, or a bus error.
type Settlement = Result<Option<Value>>;

struct Pending {
    tx: oneshot::Sender<Settlement>,
    created_at: Instant,
}

#[derive(Default)]
struct Shared {
    pending: Mutex<HashMap<u64, Pending>>,
    next_id: AtomicU64,
}

/// Tracks in-flight requests awaiting a response.
///
/// The transport gives no delivery or cross-sender ordering guarantee, so
/// correlation is by explicit id, never by arrival order: concurrent requests
/// from one side interleave safely, and a response settles exactly the
/// request that carries its id. Ids increase monotonically per bus and are
/// never reused.
#[derive(Clone)]
pub struct RequestCorrelator {
    shared: Arc<Shared>,
    max_pending: usize,
}

impl RequestCorrelator {
    /// Default bound on concurrently pending requests per bus.
    ///
    /// The map must stay bounded under a misbehaving remote peer that never
    /// answers; callers hitting the bound get [`BusError::PendingLimit`].
    pub const DEFAULT_MAX_PENDING: usize = 1024;

    pub fn new(max_pending: usize) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            max_pending,
        }
    }

    /// Allocate a fresh request id and a pending entry for it.
    pub fn register(&self) -> Result<PendingTicket> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.shared.pending.lock().expect("pending lock poisoned");
        if pending.len() >= self.max_pending {
            return Err(BusError::PendingLimit(self.max_pending));
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        pending.insert(
            id,
            Pending {
                tx,
                created_at: Instant::now(),
            },
        );

        Ok(PendingTicket {
            id,
            rx: Some(rx),
            shared: self.shared.clone(),
        })
    }

    /// Settle the pending request with the given id.
    ///
    /// No-ops (with a log) on unknown ids: a response to an already-timed-out
    /// or already-settled request must never corrupt unrelated state.
    pub fn complete(&self, request_id: &str, reply: Settlement) {
        let Ok(id) = request_id.parse::<u64>() else {
            debug!(request_id, "response carries a request id we never issued");
            return;
        };

        let entry = self
            .shared
            .pending
            .lock()
            .expect("pending lock poisoned")
            .remove(&id);

        match entry {
            Some(pending) => {
                trace!(
                    request_id = id,
                    elapsed_ms = pending.created_at.elapsed().as_millis() as u64,
                    ok = reply.is_ok(),
                    "settling pending request"
                );
                // The waiter may have been dropped meanwhile; that is fine.
                let _ = pending.tx.send(reply);
            }
            None => {
                debug!(request_id = id, "late or duplicate response, dropping");
            }
        }
    }

    /// Reject every pending request with the given reason. Called on close so
    /// no caller is ever left hanging.
    pub fn cancel_all(&self, reason: BusError) {
        let drained: Vec<Pending> = self
            .shared
            .pending
            .lock()
            .expect("pending lock poisoned")
            .drain()
            .map(|(_, pending)| pending)
            .collect();

        debug!(count = drained.len(), %reason, "cancelling pending requests");
        for pending in drained {
            let _ = pending.tx.send(Err(reason.clone()));
        }
    }

    /// Number of requests currently in flight.
    pub fn pending_len(&self) -> usize {
        self.shared.pending.lock().expect("pending lock poisoned").len()
    }
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_PENDING)
    }
}

/// Handle to one in-flight request.
///
/// Dropping a ticket without waiting removes its pending entry, so a caller
/// cancelled mid-request leaves no orphaned state behind.
pub struct PendingTicket {
    id: u64,
    rx: Option<oneshot::Receiver<Settlement>>,
    shared: Arc<Shared>,
}

impl fmt::Debug for PendingTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingTicket").field("id", &self.id).finish_non_exhaustive()
    }
}

impl PendingTicket {
    /// The wire form of this request's id.
    pub fn request_id(&self) -> String {
        self.id.to_string()
    }

    /// Suspend until the request settles or `timeout` elapses.
    pub async fn wait(mut self, timeout: Duration) -> Result<Option<Value>> {
        let rx = match self.rx.take() {
            Some(rx) => rx,
            // Unreachable in practice: `wait` consumes the ticket.
            None => return Err(BusError::Closed),
        };

        match time::timeout(timeout, rx).await {
            Ok(Ok(settlement)) => settlement,
            // Sender vanished without settling; only teardown does that.
            Ok(Err(_)) => Err(BusError::Closed),
            Err(_) => {
                self.remove();
                Err(BusError::Timeout(timeout))
            }
        }
    }

    fn remove(&self) {
        self.shared
            .pending
            .lock()
            .expect("pending lock poisoned")
            .remove(&self.id);
    }
}

impl Drop for PendingTicket {
    fn drop(&mut self) {
        self.remove();
    }
}
