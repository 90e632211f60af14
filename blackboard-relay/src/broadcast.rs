//! Broadcast engine: a single sequencer task fanning out to N-1 peers.
//!
//! ```text
//! conn A ──┐                                       ┌──► queue B ──► writer B
//! conn B ──┼── EngineCommand (mpsc) ──► Sequencer ─┼──► queue C ──► writer C
//! conn C ──┘                            (Session)  └──► ...
//! ```
//!
//! The sequencer owns the [`Session`], so appends and membership changes are
//! totally ordered by the order commands leave its channel. Fan-out is a
//! `try_send` per target: a full or closed queue evicts that target and never
//! stalls the sequencer or the other targets.

use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::protocol::{self, DrawingCommand, DrawingEvent, ParticipantId, ProtocolError};
use crate::registry::{ConnectionHandle, DeliveryFailure, OutboundFrame, RegistryError};
use crate::session::{Admission, Session};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub events_sequenced: u64,
    pub deliveries: u64,
    pub delivery_failures: u64,
    pub evictions: u64,
    pub active_participants: usize,
    pub log_len: usize,
    pub replay_len: usize,
}

/// Outcome of sequencing one event.
#[derive(Debug, Clone)]
pub struct FanoutReport {
    pub event: DrawingEvent,
    /// Targets whose queue accepted the frame
    pub delivered: usize,
    /// Targets that failed and were evicted
    pub failed: Vec<(ParticipantId, DeliveryFailure)>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("Participant {0} is not registered")]
    NotRegistered(ParticipantId),
    #[error("Broadcast engine has shut down")]
    Closed,
}

/// Synchronous core of the broadcast engine.
pub struct Sequencer {
    session: Session,
    events_sequenced: u64,
    deliveries: u64,
    delivery_failures: u64,
    evictions: u64,
}

impl Sequencer {
    pub fn new(max_participants: usize) -> Self {
        Self {
            session: Session::new(max_participants),
            events_sequenced: 0,
            deliveries: 0,
            delivery_failures: 0,
            evictions: 0,
        }
    }

    /// Admit a connection; the returned replay precedes anything queued later.
    pub fn join(&mut self, handle: ConnectionHandle) -> Result<Admission, RegistryError> {
        let admission = self.session.admit(handle)?;
        info!(
            "Participant {} joined ({} connected, replaying {} events)",
            admission.participant,
            self.session.registry().len(),
            admission.replay.len()
        );
        Ok(admission)
    }

    /// Validate, sequence, append and fan out one event from `from`.
    ///
    /// Either the event is appended with a fresh sequence number or nothing
    /// changes. Delivery failures never undo the append.
    pub fn ingest(
        &mut self,
        from: ParticipantId,
        command: DrawingCommand,
    ) -> Result<FanoutReport, EngineError> {
        if !self.session.registry().contains(&from) {
            return Err(EngineError::NotRegistered(from));
        }
        command.validate()?;

        // Encode before appending so a failed encode leaves the log untouched
        let sequence = self.session.log().next_sequence();
        let frame: OutboundFrame = protocol::encode_frame(sequence, from, &command)?.into();
        let event = self.session.log_mut().append(from, command).clone();
        self.events_sequenced += 1;

        let targets = self.session.registry().broadcast_targets(&from);
        let mut delivered = 0;
        let mut failed = Vec::new();
        for target in &targets {
            match target.try_deliver(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(failure) => failed.push((target.id, failure)),
            }
        }

        for (id, failure) in &failed {
            warn!("Delivery of #{sequence} to {id} failed ({failure}), evicting");
            if self.session.registry_mut().evict(id, (*failure).into()) {
                self.evictions += 1;
            }
        }

        self.deliveries += delivered as u64;
        self.delivery_failures += failed.len() as u64;
        debug!(
            "Sequenced #{sequence} {} from {from}: {delivered}/{} delivered",
            event.command.type_tag(),
            targets.len()
        );

        Ok(FanoutReport {
            event,
            delivered,
            failed,
        })
    }

    /// Unregister a participant. Idempotent.
    pub fn leave(&mut self, participant: &ParticipantId) -> bool {
        let removed = self.session.dismiss(participant);
        if removed {
            info!(
                "Participant {participant} left ({} connected)",
                self.session.registry().len()
            );
        }
        removed
    }

    /// Current replay window.
    pub fn replay(&self) -> Vec<DrawingEvent> {
        self.session.log().replay_since_clear().to_vec()
    }

    pub fn stats(&self) -> BroadcastStats {
        let log_stats = self.session.log().stats();
        BroadcastStats {
            events_sequenced: self.events_sequenced,
            deliveries: self.deliveries,
            delivery_failures: self.delivery_failures,
            evictions: self.evictions,
            active_participants: self.session.registry().len(),
            log_len: log_stats.total_events,
            replay_len: log_stats.replay_len,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }
}

enum EngineCommand {
    Join {
        handle: ConnectionHandle,
        reply: oneshot::Sender<Result<Admission, RegistryError>>,
    },
    Submit {
        from: ParticipantId,
        command: DrawingCommand,
        reply: oneshot::Sender<Result<FanoutReport, EngineError>>,
    },
    Leave {
        participant: ParticipantId,
        reply: oneshot::Sender<bool>,
    },
    Replay {
        reply: oneshot::Sender<Vec<DrawingEvent>>,
    },
    Stats {
        reply: oneshot::Sender<BroadcastStats>,
    },
}

/// Cloneable handle to the sequencer task.
///
/// The task stops once every handle is dropped.
#[derive(Clone)]
pub struct BroadcastEngine {
    commands: mpsc::Sender<EngineCommand>,
}

impl BroadcastEngine {
    /// Spawn the sequencer on the current tokio runtime.
    pub fn spawn(max_participants: usize, command_capacity: usize) -> Self {
        let (commands, rx) = mpsc::channel(command_capacity);
        tokio::spawn(run_sequencer(Sequencer::new(max_participants), rx));
        Self { commands }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> EngineCommand,
    ) -> Result<T, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| EngineError::Closed)?;
        rx.await.map_err(|_| EngineError::Closed)
    }

    pub async fn join(&self, handle: ConnectionHandle) -> Result<Admission, EngineError> {
        Ok(self
            .request(|reply| EngineCommand::Join { handle, reply })
            .await??)
    }

    pub async fn submit(
        &self,
        from: ParticipantId,
        command: DrawingCommand,
    ) -> Result<FanoutReport, EngineError> {
        self.request(|reply| EngineCommand::Submit {
            from,
            command,
            reply,
        })
        .await?
    }

    pub async fn leave(&self, participant: ParticipantId) -> Result<bool, EngineError> {
        self.request(|reply| EngineCommand::Leave { participant, reply })
            .await
    }

    pub async fn replay(&self) -> Result<Vec<DrawingEvent>, EngineError> {
        self.request(|reply| EngineCommand::Replay { reply }).await
    }

    pub async fn stats(&self) -> Result<BroadcastStats, EngineError> {
        self.request(|reply| EngineCommand::Stats { reply }).await
    }
}

async fn run_sequencer(mut sequencer: Sequencer, mut commands: mpsc::Receiver<EngineCommand>) {
    while let Some(command) = commands.recv().await {
        match command {
            EngineCommand::Join { handle, reply } => {
                if let Err(Ok(admission)) = reply.send(sequencer.join(handle)) {
                    // Joiner vanished before learning its id
                    sequencer.leave(&admission.participant);
                }
            }
            EngineCommand::Submit {
                from,
                command,
                reply,
            } => {
                let _ = reply.send(sequencer.ingest(from, command));
            }
            EngineCommand::Leave { participant, reply } => {
                let _ = reply.send(sequencer.leave(&participant));
            }
            EngineCommand::Replay { reply } => {
                let _ = reply.send(sequencer.replay());
            }
            EngineCommand::Stats { reply } => {
                let _ = reply.send(sequencer.stats());
            }
        }
    }
    debug!("Sequencer stopped");
}
