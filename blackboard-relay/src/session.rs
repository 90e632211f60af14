//! The shared canvas session: registry + stroke log, owned in one place.
//!
//! Exactly one task (the sequencer in [`crate::broadcast`]) owns a `Session`;
//! membership changes and appends are serialized through it without a lock.

use crate::protocol::{DrawingEvent, ParticipantId};
use crate::registry::{ConnectionHandle, RegistryError, SessionRegistry};
use crate::stroke_log::StrokeLog;

/// Result of admitting a new connection.
#[derive(Debug)]
pub struct Admission {
    pub participant: ParticipantId,
    /// Seed burst: current replay window, in sequence order
    pub replay: Vec<DrawingEvent>,
}

#[derive(Debug)]
pub struct Session {
    registry: SessionRegistry,
    log: StrokeLog,
}

impl Session {
    pub fn new(max_participants: usize) -> Self {
        Self {
            registry: SessionRegistry::new(max_participants),
            log: StrokeLog::new(),
        }
    }

    /// Register `handle` and snapshot the replay window in the same step.
    ///
    /// Every event sequenced after this call reaches the participant through
    /// its outbound queue; every event before it is in `replay`. Nothing is
    /// in both.
    pub fn admit(&mut self, handle: ConnectionHandle) -> Result<Admission, RegistryError> {
        let participant = self.registry.register(handle)?;
        Ok(Admission {
            participant,
            replay: self.log.replay_since_clear().to_vec(),
        })
    }

    /// Unregister a participant. Safe to call any number of times.
    pub fn dismiss(&mut self, participant: &ParticipantId) -> bool {
        self.registry.unregister(participant).is_some()
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut SessionRegistry {
        &mut self.registry
    }

    pub fn log(&self) -> &StrokeLog {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut StrokeLog {
        &mut self.log
    }
}
