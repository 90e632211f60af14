//! Per-connection lifecycle: `Connecting → Open → Closing → Closed`.
//!
//! Each accepted socket gets two halves:
//! - the reader (this task) decodes inbound frames and submits them to the
//!   [`BroadcastEngine`];
//! - the writer (a spawned task) sends the seed burst, then drains the
//!   participant's outbound queue until the relay evicts it or the socket dies.
//!
//! Whichever half finishes first ends the connection. The participant is then
//! unregistered and the writer gets a short grace period to finish the closing
//! handshake before it is aborted.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, trace, warn};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message, Utf8Bytes};
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::{BroadcastEngine, EngineError};
use crate::protocol::{self, DrawingEvent, ParticipantId, ProtocolError};
use crate::registry::{CloseReason, ConnectionEndpoint, ConnectionHandle};
use crate::server::{ServerConfig, StatsRecorder};

/// How long the writer may spend closing the socket once the reader is done.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Lifecycle states of one connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Open) | (Connecting, Closing) | (Open, Closing) | (Closing, Closed)
        )
    }
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("WebSocket error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

struct Lifecycle {
    addr: SocketAddr,
    state: ConnectionState,
}

impl Lifecycle {
    fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            state: ConnectionState::Connecting,
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state.can_transition_to(next) {
            trace!("{}: {:?} -> {:?}", self.addr, self.state, next);
            self.state = next;
        } else {
            debug!(
                "{}: ignoring transition {:?} -> {:?}",
                self.addr, self.state, next
            );
        }
    }
}

/// Close frame sent to a participant the relay evicted.
pub fn close_frame_for(reason: CloseReason) -> CloseFrame {
    let code = match reason {
        CloseReason::QueueOverflow => CloseCode::Policy,
        CloseReason::Disconnected => CloseCode::Normal,
    };
    CloseFrame {
        code,
        reason: Utf8Bytes::from_static(reason.description()),
    }
}

/// Complete the WebSocket handshake, refusing upgrades on any path other
/// than `expected_path` with a 404.
async fn accept(
    stream: TcpStream,
    expected_path: Option<String>,
) -> Result<WebSocketStream<TcpStream>, tungstenite::Error> {
    let check_path = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let path = request.uri().path();
        match expected_path.as_deref() {
            Some(expected) if !expected.is_empty() && path != expected => {
                let mut rejection = ErrorResponse::new(Some(format!("no relay endpoint at {path}")));
                *rejection.status_mut() = StatusCode::NOT_FOUND;
                Err(rejection)
            }
            _ => Ok(response),
        }
    };
    tokio_tungstenite::accept_hdr_async(stream, check_path).await
}

/// Drive one TCP connection from handshake to `Closed`.
pub(crate) async fn serve_connection(
    stream: TcpStream,
    addr: SocketAddr,
    engine: BroadcastEngine,
    config: Arc<ServerConfig>,
    stats: Arc<StatsRecorder>,
) -> Result<(), ConnectionError> {
    let mut lifecycle = Lifecycle::new(addr);
    let ws_stream = accept(stream, config.ws_path.clone()).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (handle, endpoint) = ConnectionHandle::new(config.outbound_queue_capacity);
    let admission = match engine.join(handle).await {
        Ok(admission) => admission,
        Err(EngineError::Registry(e)) => {
            stats.connection_rejected();
            warn!("Refusing connection from {addr}: {e}");
            lifecycle.transition(ConnectionState::Closing);
            let frame = CloseFrame {
                code: CloseCode::Again,
                reason: e.to_string().into(),
            };
            // Best effort: the peer may already be gone
            let _ = ws_sender.send(Message::Close(Some(frame))).await;
            lifecycle.transition(ConnectionState::Closed);
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let participant = admission.participant;
    lifecycle.transition(ConnectionState::Open);
    stats.connection_opened();
    info!("Connection from {addr} open as participant {participant}");

    let mut writer = tokio::spawn(write_loop(
        ws_sender,
        admission.replay,
        endpoint,
        participant,
    ));

    let result = read_loop(&mut ws_receiver, &mut writer, &engine, participant, &stats).await;

    lifecycle.transition(ConnectionState::Closing);
    // Unregistering drops the close signal, so the writer closes the sink
    // and flushes the reply to a peer-initiated close
    if let Err(e) = engine.leave(participant).await {
        debug!("Could not unregister {participant}: {e}");
    }
    if !writer.is_finished() && timeout(CLOSE_FLUSH_TIMEOUT, &mut writer).await.is_err() {
        debug!("Writer for {participant} did not finish closing; aborting");
        writer.abort();
    }
    stats.connection_closed();
    lifecycle.transition(ConnectionState::Closed);
    info!("Connection {participant} from {addr} closed");

    result
}

/// Send the seed burst, then forward live frames until closed or evicted.
async fn write_loop(
    mut sink: WsSink,
    replay: Vec<DrawingEvent>,
    mut endpoint: ConnectionEndpoint,
    participant: ParticipantId,
) -> Result<(), ConnectionError> {
    // Live frames wait in the queue until the whole burst is written
    for event in &replay {
        sink.feed(Message::text(protocol::encode_event(event)?)).await?;
    }
    sink.flush().await?;
    if !replay.is_empty() {
        debug!("Sent {} replay events to {participant}", replay.len());
    }

    loop {
        tokio::select! {
            biased;

            reason = &mut endpoint.close => {
                match reason {
                    Ok(reason) => {
                        info!("Closing {participant}: {}", reason.description());
                        let _ = sink.send(Message::Close(Some(close_frame_for(reason)))).await;
                    }
                    // Unregistered: answer or start the closing handshake
                    Err(_) => {
                        let _ = sink.close().await;
                    }
                }
                return Ok(());
            }

            frame = endpoint.outbound.recv() => match frame {
                Some(frame) => sink.send(Message::text(frame.to_string())).await?,
                None => {
                    let _ = sink.close().await;
                    return Ok(());
                }
            },
        }
    }
}

async fn read_loop(
    receiver: &mut WsSource,
    writer: &mut JoinHandle<Result<(), ConnectionError>>,
    engine: &BroadcastEngine,
    participant: ParticipantId,
    stats: &StatsRecorder,
) -> Result<(), ConnectionError> {
    loop {
        tokio::select! {
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    stats.message_received(text.len());
                    if !handle_frame(text.as_str(), engine, participant, stats).await? {
                        return Ok(());
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    stats.message_received(data.len());
                    match std::str::from_utf8(&data) {
                        Ok(text) => {
                            if !handle_frame(text, engine, participant, stats).await? {
                                return Ok(());
                            }
                        }
                        Err(e) => {
                            stats.message_rejected();
                            warn!("Rejected binary frame from {participant}: {}", ProtocolError::DecodeError(e.to_string()));
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!("Peer {participant} closed: {frame:?}");
                    return Ok(());
                }
                None => return Ok(()),
                Some(Ok(_)) => {} // Ping/pong handled by tungstenite
                Some(Err(e)) => {
                    warn!("WebSocket error from {participant}: {e}");
                    return Err(e.into());
                }
            },

            finished = &mut *writer => {
                return match finished {
                    Ok(result) => result,
                    Err(e) => {
                        warn!("Writer for {participant} ended abnormally: {e}");
                        Ok(())
                    }
                };
            }
        }
    }
}

/// Decode and submit one inbound frame. Returns `false` when the connection
/// should stop reading.
async fn handle_frame(
    text: &str,
    engine: &BroadcastEngine,
    participant: ParticipantId,
    stats: &StatsRecorder,
) -> Result<bool, ConnectionError> {
    let command = match protocol::decode_command(text) {
        Ok(command) => command,
        Err(e) => {
            stats.message_rejected();
            warn!("Rejected frame from {participant}: {e}");
            return Ok(true);
        }
    };

    match engine.submit(participant, command).await {
        Ok(report) => {
            trace!(
                "#{} from {participant} reached {} peers",
                report.event.sequence,
                report.delivered
            );
            Ok(true)
        }
        Err(EngineError::Protocol(e)) => {
            stats.message_rejected();
            warn!("Rejected event from {participant}: {e}");
            Ok(true)
        }
        Err(EngineError::NotRegistered(_)) => {
            debug!("{participant} is no longer registered, stop reading");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}
