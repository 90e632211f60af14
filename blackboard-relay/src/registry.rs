//! Session registry: who is connected and how to reach them.
//!
//! Each participant is reachable through a [`ConnectionHandle`]: a bounded,
//! non-blocking outbound frame queue plus a one-shot close signal. The
//! registry never performs I/O; the connection task on the other end of the
//! queue does.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::protocol::ParticipantId;

/// Pre-encoded wire frame shared by every target of one fan-out.
pub type OutboundFrame = Arc<str>;

/// Why the relay closed a participant's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Outbound queue overflowed (participant too slow)
    QueueOverflow,
    /// Receiving half of the outbound queue was gone
    Disconnected,
}

impl CloseReason {
    pub fn description(&self) -> &'static str {
        match self {
            Self::QueueOverflow => "outbound queue overflow",
            Self::Disconnected => "connection gone",
        }
    }
}

/// Per-target delivery failure. Never propagated to the sender of the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryFailure {
    #[error("outbound queue full")]
    QueueFull,
    #[error("outbound queue closed")]
    Disconnected,
}

impl From<DeliveryFailure> for CloseReason {
    fn from(failure: DeliveryFailure) -> Self {
        match failure {
            DeliveryFailure::QueueFull => Self::QueueOverflow,
            DeliveryFailure::Disconnected => Self::Disconnected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Capacity exceeded: relay already holds {limit} participants")]
    CapacityExceeded { limit: usize },
}

fn try_send(
    outbound: &mpsc::Sender<OutboundFrame>,
    frame: OutboundFrame,
) -> Result<(), DeliveryFailure> {
    outbound.try_send(frame).map_err(|e| match e {
        mpsc::error::TrySendError::Full(_) => DeliveryFailure::QueueFull,
        mpsc::error::TrySendError::Closed(_) => DeliveryFailure::Disconnected,
    })
}

/// Relay-side handle to one connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    outbound: mpsc::Sender<OutboundFrame>,
    close: Option<oneshot::Sender<CloseReason>>,
}

/// Connection-side counterpart of a [`ConnectionHandle`].
#[derive(Debug)]
pub struct ConnectionEndpoint {
    pub outbound: mpsc::Receiver<OutboundFrame>,
    pub close: oneshot::Receiver<CloseReason>,
}

impl ConnectionHandle {
    /// Create a handle whose outbound queue holds at most `capacity` frames.
    ///
    /// # Panics
    /// If `capacity` is zero.
    pub fn new(capacity: usize) -> (Self, ConnectionEndpoint) {
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (close_tx, close_rx) = oneshot::channel();
        (
            Self {
                outbound: outbound_tx,
                close: Some(close_tx),
            },
            ConnectionEndpoint {
                outbound: outbound_rx,
                close: close_rx,
            },
        )
    }

    /// A connection is live while its endpoint still exists.
    pub fn is_live(&self) -> bool {
        !self.outbound.is_closed()
    }

    /// Enqueue without waiting. Full or closed queues fail immediately.
    pub fn try_deliver(&self, frame: OutboundFrame) -> Result<(), DeliveryFailure> {
        try_send(&self.outbound, frame)
    }

    /// Signal the connection task to shut down. Later calls are no-ops.
    pub fn close(&mut self, reason: CloseReason) {
        if let Some(tx) = self.close.take() {
            // The endpoint may already be gone
            let _ = tx.send(reason);
        }
    }
}

/// One connected client.
#[derive(Debug)]
pub struct Participant {
    pub id: ParticipantId,
    pub joined_at: Instant,
    handle: ConnectionHandle,
}

impl Participant {
    pub fn is_live(&self) -> bool {
        self.handle.is_live()
    }
}

/// Snapshot entry returned by [`SessionRegistry::broadcast_targets`].
#[derive(Debug, Clone)]
pub struct BroadcastTarget {
    pub id: ParticipantId,
    outbound: mpsc::Sender<OutboundFrame>,
}

impl BroadcastTarget {
    pub fn try_deliver(&self, frame: OutboundFrame) -> Result<(), DeliveryFailure> {
        try_send(&self.outbound, frame)
    }
}

/// Tracks currently connected participants.
#[derive(Debug)]
pub struct SessionRegistry {
    participants: HashMap<ParticipantId, Participant>,
    max_participants: usize,
    total_registered: u64,
}

impl SessionRegistry {
    pub fn new(max_participants: usize) -> Self {
        Self {
            participants: HashMap::new(),
            max_participants,
            total_registered: 0,
        }
    }

    /// Admit a connection and assign it a fresh identifier.
    pub fn register(&mut self, handle: ConnectionHandle) -> Result<ParticipantId, RegistryError> {
        if self.participants.len() >= self.max_participants {
            return Err(RegistryError::CapacityExceeded {
                limit: self.max_participants,
            });
        }

        let mut id = ParticipantId::new();
        while self.participants.contains_key(&id) {
            id = ParticipantId::new();
        }

        self.participants.insert(
            id,
            Participant {
                id,
                joined_at: Instant::now(),
                handle,
            },
        );
        self.total_registered += 1;
        Ok(id)
    }

    /// Remove a participant. Idempotent: unknown ids return `None`.
    pub fn unregister(&mut self, id: &ParticipantId) -> Option<Participant> {
        self.participants.remove(id)
    }

    /// Unregister and tell the connection task to close.
    pub fn evict(&mut self, id: &ParticipantId, reason: CloseReason) -> bool {
        match self.participants.remove(id) {
            Some(mut participant) => {
                participant.handle.close(reason);
                true
            }
            None => false,
        }
    }

    /// Every registered participant except `excluding`, as of this call.
    ///
    /// A participant whose endpoint has vanished is still returned; delivery
    /// to it fails with [`DeliveryFailure::Disconnected`] and gets it evicted.
    pub fn broadcast_targets(&self, excluding: &ParticipantId) -> Vec<BroadcastTarget> {
        self.participants
            .values()
            .filter(|p| p.id != *excluding)
            .map(|p| BroadcastTarget {
                id: p.id,
                outbound: p.handle.outbound.clone(),
            })
            .collect()
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.participants.contains_key(id)
    }

    pub fn get(&self, id: &ParticipantId) -> Option<&Participant> {
        self.participants.get(id)
    }

    pub fn participant_ids(&self) -> Vec<ParticipantId> {
        self.participants.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_participants
    }

    /// Registrations over the whole session lifetime.
    pub fn total_registered(&self) -> u64 {
        self.total_registered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_assigns_unique_ids() {
        let mut registry = SessionRegistry::new(8);
        let mut endpoints = Vec::new();
        let mut ids = Vec::new();
        for _ in 0..5 {
            let (handle, endpoint) = ConnectionHandle::new(4);
            endpoints.push(endpoint);
            ids.push(registry.register(handle).unwrap());
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 5);
        assert_eq!(registry.len(), 5);
        assert_eq!(registry.total_registered(), 5);
    }

    #[test]
    fn test_capacity_exceeded() {
        let mut registry = SessionRegistry::new(2);
        let (h1, _e1) = ConnectionHandle::new(4);
        let (h2, _e2) = ConnectionHandle::new(4);
        let (h3, _e3) = ConnectionHandle::new(4);
        registry.register(h1).unwrap();
        registry.register(h2).unwrap();

        let err = registry.register(h3).unwrap_err();
        assert_eq!(err, RegistryError::CapacityExceeded { limit: 2 });
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let mut registry = SessionRegistry::new(2);
        let (h1, _e1) = ConnectionHandle::new(4);
        let id = registry.register(h1).unwrap();

        assert!(registry.unregister(&id).is_some());
        assert!(registry.unregister(&id).is_none());
        assert_eq!(registry.len(), 0);

        // Capacity freed exactly once: two more fit, a third does not
        let (h2, _e2) = ConnectionHandle::new(4);
        let (h3, _e3) = ConnectionHandle::new(4);
        let (h4, _e4) = ConnectionHandle::new(4);
        registry.register(h2).unwrap();
        registry.register(h3).unwrap();
        assert!(registry.register(h4).is_err());
    }

    #[test]
    fn test_broadcast_targets_excludes_origin() {
        let mut registry = SessionRegistry::new(8);
        let (ha, _ea) = ConnectionHandle::new(4);
        let (hb, _eb) = ConnectionHandle::new(4);
        let (hc, _ec) = ConnectionHandle::new(4);
        let a = registry.register(ha).unwrap();
        let b = registry.register(hb).unwrap();
        let c = registry.register(hc).unwrap();

        let mut targets: Vec<ParticipantId> =
            registry.broadcast_targets(&a).iter().map(|t| t.id).collect();
        targets.sort();
        let mut expected = vec![b, c];
        expected.sort();
        assert_eq!(targets, expected);
    }

    #[test]
    fn test_dead_target_fails_delivery() {
        let mut registry = SessionRegistry::new(8);
        let (ha, _ea) = ConnectionHandle::new(4);
        let (hb, eb) = ConnectionHandle::new(4);
        let a = registry.register(ha).unwrap();
        let b = registry.register(hb).unwrap();
        assert!(registry.get(&b).unwrap().is_live());

        drop(eb);
        assert!(!registry.get(&b).unwrap().is_live());
        let targets = registry.broadcast_targets(&a);
        assert_eq!(targets.len(), 1);
        assert_eq!(
            targets[0].try_deliver(Arc::from("frame")),
            Err(DeliveryFailure::Disconnected)
        );
    }

    #[test]
    fn test_snapshot_survives_unregister() {
        let mut registry = SessionRegistry::new(8);
        let (ha, _ea) = ConnectionHandle::new(4);
        let (hb, mut eb) = ConnectionHandle::new(4);
        let a = registry.register(ha).unwrap();
        let b = registry.register(hb).unwrap();

        let targets = registry.broadcast_targets(&a);
        registry.unregister(&b);

        // The snapshot still reaches b's queue; b's endpoint decides what to do
        targets[0].try_deliver(Arc::from("frame")).unwrap();
        assert_eq!(&*eb.outbound.try_recv().unwrap(), "frame");
    }

    #[test]
    fn test_try_deliver_full_queue() {
        let (handle, _endpoint) = ConnectionHandle::new(1);
        handle.try_deliver(Arc::from("one")).unwrap();
        assert_eq!(
            handle.try_deliver(Arc::from("two")),
            Err(DeliveryFailure::QueueFull)
        );
    }

    #[test]
    fn test_try_deliver_closed_queue() {
        let (handle, endpoint) = ConnectionHandle::new(1);
        drop(endpoint);
        assert_eq!(
            handle.try_deliver(Arc::from("frame")),
            Err(DeliveryFailure::Disconnected)
        );
    }

    #[test]
    fn test_evict_signals_close() {
        let mut registry = SessionRegistry::new(4);
        let (handle, mut endpoint) = ConnectionHandle::new(4);
        let id = registry.register(handle).unwrap();

        assert!(registry.evict(&id, CloseReason::QueueOverflow));
        assert!(!registry.evict(&id, CloseReason::QueueOverflow));
        assert_eq!(endpoint.close.try_recv().unwrap(), CloseReason::QueueOverflow);
        assert!(!registry.contains(&id));
    }

    #[test]
    fn test_delivery_failure_maps_to_close_reason() {
        assert_eq!(
            CloseReason::from(DeliveryFailure::QueueFull),
            CloseReason::QueueOverflow
        );
        assert_eq!(
            CloseReason::from(DeliveryFailure::Disconnected),
            CloseReason::Disconnected
        );
    }
}
