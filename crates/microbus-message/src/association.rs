use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Routing key for one channel↔envelope pairing on a shared transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Association {
    /// Origin of the remote participant, as stamped by the transport.
    pub origin: String,
    /// Identifier of the logical session.
    pub bus_id: String,
}

impl Association {
    pub fn new(origin: impl Into<String>, bus_id: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            bus_id: bus_id.into(),
        }
    }

    /// Whether an inbound message with the given sender origin and bus id
    /// belongs to this pairing.
    pub fn matches(&self, origin: &str, bus_id: &str) -> bool {
        self.origin == origin && self.bus_id == bus_id
    }
}

impl std::fmt::Display for Association {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.origin, self.bus_id)
    }
}

/// Generate a bus id that is fresh for this process.
///
/// Combines a process-lifetime counter with wall-clock nanos so ids stay
/// distinct across channel instances even when a transport outlives them.
pub fn fresh_bus_id() -> String {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    let seq = NEXT.fetch_add(1, Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("bus-{seq}-{nanos}")
}

/// Tracks which `(origin, busId)` pairings are live on one transport side.
///
/// Shared (`Arc`) by every bus client hanging off the same physical
/// transport. At most one active pairing owns a given association at any
/// time; inbound messages whose association is unknown are dropped before
/// they reach any handler table.
#[derive(Debug, Default)]
pub struct AssociationRegistry {
    active: Mutex<HashSet<Association>>,
}

impl AssociationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim an association. Returns `false` if another pairing already owns
    /// it, in which case the caller must not start dispatching.
    pub fn register(&self, association: Association) -> bool {
        let inserted = self
            .active
            .lock()
            .expect("association lock poisoned")
            .insert(association.clone());
        if !inserted {
            debug!(?association, "association already owned by an active pairing");
        }
        inserted
    }

    /// Release an association. Idempotent; late in-flight messages for a
    /// deregistered bus are dropped rather than dispatched.
    pub fn deregister(&self, association: &Association) {
        self.active
            .lock()
            .expect("association lock poisoned")
            .remove(association);
    }

    /// Whether an inbound decoded envelope is relevant to any live pairing.
    pub fn accepts(&self, origin: &str, bus_id: &str) -> bool {
        self.active
            .lock()
            .expect("association lock poisoned")
            .contains(&Association::new(origin, bus_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_accepts_deregister_drops() {
        let registry = AssociationRegistry::new();
        let assoc = Association::new("http://envelope", "bus-1");

        assert!(!registry.accepts("http://envelope", "bus-1"));
        assert!(registry.register(assoc.clone()));
        assert!(registry.accepts("http://envelope", "bus-1"));

        registry.deregister(&assoc);
        assert!(!registry.accepts("http://envelope", "bus-1"));
    }

    #[test]
    fn second_registration_of_same_association_is_rejected() {
        let registry = AssociationRegistry::new();
        let assoc = Association::new("o", "b");
        assert!(registry.register(assoc.clone()));
        assert!(!registry.register(assoc.clone()));

        // Still owned by the first pairing.
        assert!(registry.accepts("o", "b"));
    }

    #[test]
    fn accepts_distinguishes_origin_and_bus_id() {
        let registry = AssociationRegistry::new();
        registry.register(Association::new("o1", "b1"));

        assert!(!registry.accepts("o1", "b2"));
        assert!(!registry.accepts("o2", "b1"));
    }

    #[test]
    fn fresh_bus_ids_are_distinct() {
        let a = fresh_bus_id();
        let b = fresh_bus_id();
        assert_ne!(a, b);
    }

    #[test]
    fn association_wire_format_is_camel_case() {
        let assoc = Association::new("o", "b");
        let wire = serde_json::to_value(&assoc).expect("serialize should succeed");
        assert_eq!(wire, serde_json::json!({"origin": "o", "busId": "b"}));
    }
}
