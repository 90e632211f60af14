//! WebSocket client for the drawing relay.
//!
//! Provides:
//! - Connection lifecycle (connect, retry with backoff, reconnect, disconnect)
//! - Sending locally drawn segments and clears
//! - Receiving sequenced events from other participants, seed burst included
//!
//! Rendering is left to the caller: the client only speaks the wire format.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::{self, Message};

use crate::protocol::{self, DrawingCommand, DrawingEvent, ProtocolError, StrokeSegment};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Waiting out the backoff before attempt number `attempt`
    Retrying { attempt: u32 },
    Connecting,
    Connected,
}

/// Events emitted by the canvas client.
#[derive(Debug, Clone, PartialEq)]
pub enum CanvasEvent {
    /// Connection established; a fresh seed burst follows
    Connected,
    /// Connection lost
    Disconnected,
    /// Event drawn by another participant
    Remote(DrawingEvent),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Not connected")]
    NotConnected,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("WebSocket error: {0}")]
    Transport(#[from] tungstenite::Error),
}

/// Capped exponential delay between reconnection attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(3),
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Same delay before every attempt.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial: delay,
            max: delay,
            multiplier: 1.0,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Last sequence seen on the current connection.
///
/// Diagnostic only: the relay already delivers in order, so a regression is
/// logged and the event is still passed through.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last: Option<u64>,
    anomalies: u64,
}

impl SequenceTracker {
    /// Record `sequence`. Returns `false` if it did not advance.
    pub fn observe(&mut self, sequence: u64) -> bool {
        let advanced = match self.last {
            Some(last) => sequence > last,
            None => true,
        };
        if !advanced {
            self.anomalies += 1;
            log::warn!(
                "Sequence went from {:?} to {sequence}; relay ordering violated",
                self.last
            );
        }
        self.last = Some(sequence);
        advanced
    }

    /// Forget the previous connection; a new seed burst may start anywhere.
    pub fn reset(&mut self) {
        self.last = None;
    }

    pub fn last(&self) -> Option<u64> {
        self.last
    }

    pub fn anomalies(&self) -> u64 {
        self.anomalies
    }
}

/// Connection plumbing shared between the client and its background tasks.
#[derive(Clone)]
struct Link {
    url: Arc<str>,
    backoff: BackoffPolicy,
    auto_reconnect: bool,
    state: Arc<RwLock<ConnectionState>>,
    tracker: Arc<Mutex<SequenceTracker>>,
    /// Bumped on every connect and disconnect; tasks of an older
    /// generation stop reporting
    generation: Arc<AtomicU64>,
    /// Channel to the current WebSocket writer task
    outgoing: Arc<Mutex<Option<mpsc::Sender<String>>>>,
    event_tx: mpsc::Sender<CanvasEvent>,
}

impl Link {
    /// Connect and spawn the reader and writer tasks. With `expected` set,
    /// the new connection is only kept if nothing superseded that generation
    /// while the handshake ran.
    async fn open(&self, expected: Option<u64>) -> Result<(), ClientError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(&*self.url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let generation = match expected {
            None => self.generation.fetch_add(1, Ordering::SeqCst) + 1,
            Some(current) => {
                if self
                    .generation
                    .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    log::debug!("Dropping superseded reconnect to {}", self.url);
                    return Ok(());
                }
                current + 1
            }
        };

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        *self.outgoing.lock().await = Some(out_tx);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::text(text)).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.close().await;
        });

        self.tracker.lock().await.reset();
        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(CanvasEvent::Connected).await;
        log::info!("Connected to {}", self.url);

        // Reader task: seed burst, then live events
        let link = self.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(frame)) => {
                        log::debug!("Relay closed connection: {frame:?}");
                        break;
                    }
                    Err(e) => {
                        log::warn!("Connection error: {e}");
                        break;
                    }
                    Ok(_) => continue,
                };

                match protocol::decode_event(text.as_str()) {
                    Ok(event) => {
                        link.tracker.lock().await.observe(event.sequence);
                        if link.event_tx.send(CanvasEvent::Remote(event)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!("Ignoring frame from relay: {e}"),
                }
            }
            link.connection_lost(generation).await;
        });

        Ok(())
    }

    async fn connection_lost(self, generation: u64) {
        // A newer connection, or an explicit disconnect, owns the state now
        if !self.is_current(generation) {
            return;
        }
        self.outgoing.lock().await.take();
        *self.state.write().await = ConnectionState::Disconnected;
        let _ = self.event_tx.send(CanvasEvent::Disconnected).await;

        if self.auto_reconnect {
            tokio::spawn(self.reconnect(generation));
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Retry forever until connected or superseded.
    fn reconnect(self, generation: u64) -> BoxFuture<'static, ()> {
        async move {
            let mut attempt = 1;
            loop {
                *self.state.write().await = ConnectionState::Retrying { attempt };
                let delay = self.backoff.delay_for(attempt);
                log::info!("Connection to {} lost; attempt {attempt} in {delay:?}", self.url);
                tokio::time::sleep(delay).await;
                if !self.is_current(generation) {
                    return;
                }
                match self.open(Some(generation)).await {
                    Ok(()) => return,
                    Err(e) => {
                        log::warn!("Reconnect to {} failed: {e}", self.url);
                        attempt = attempt.saturating_add(1);
                    }
                }
            }
        }
        .boxed()
    }
}

/// The canvas client.
///
/// Owns one WebSocket connection to the relay at a time. Reconnecting
/// replaces it; the old reader task stops reporting once superseded.
/// A connection that drops on its own is re-established in the background
/// with the backoff policy, unless auto-reconnect is turned off.
pub struct CanvasClient {
    link: Link,
    event_rx: Option<mpsc::Receiver<CanvasEvent>>,
}

impl CanvasClient {
    /// Create a client for a relay endpoint, e.g. `ws://127.0.0.1:8080/ws`.
    pub fn new(url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(1024);
        let url: String = url.into();
        Self {
            link: Link {
                url: url.into(),
                backoff: BackoffPolicy::default(),
                auto_reconnect: true,
                state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
                tracker: Arc::new(Mutex::new(SequenceTracker::default())),
                generation: Arc::new(AtomicU64::new(0)),
                outgoing: Arc::new(Mutex::new(None)),
                event_tx,
            },
            event_rx: Some(event_rx),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.link.backoff = backoff;
        self
    }

    /// Turn background reconnection after a dropped connection on or off.
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.link.auto_reconnect = enabled;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<CanvasEvent>> {
        self.event_rx.take()
    }

    /// Connect once. Any previous connection is dropped first.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        self.disconnect().await;
        self.link.open(None).await
    }

    /// Connect, retrying with the backoff policy up to `max_attempts` times
    /// in total. `max_attempts == 0` retries forever.
    pub async fn connect_with_retry(&mut self, max_attempts: u32) -> Result<(), ClientError> {
        self.disconnect().await;
        let mut attempt = 1;
        loop {
            match self.link.open(None).await {
                Ok(()) => return Ok(()),
                Err(e) if max_attempts != 0 && attempt >= max_attempts => {
                    log::error!("Giving up on {} after {attempt} attempts: {e}", self.link.url);
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.link.backoff.delay_for(attempt);
                    attempt += 1;
                    log::info!("Connect failed ({e}); attempt {attempt} in {delay:?}");
                    *self.link.state.write().await = ConnectionState::Retrying { attempt };
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Close the current connection, if any, and stop reconnecting.
    pub async fn disconnect(&mut self) {
        self.link.generation.fetch_add(1, Ordering::SeqCst);
        self.link.outgoing.lock().await.take();
        *self.link.state.write().await = ConnectionState::Disconnected;
    }

    /// Send one locally drawn segment.
    pub async fn send_draw(&self, segment: StrokeSegment) -> Result<(), ClientError> {
        self.send(DrawingCommand::Draw(segment)).await
    }

    /// Ask every participant to clear their canvas.
    pub async fn send_clear(&self) -> Result<(), ClientError> {
        self.send(DrawingCommand::Clear).await
    }

    async fn send(&self, command: DrawingCommand) -> Result<(), ClientError> {
        command.validate()?;
        if *self.link.state.read().await != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        let tx = self
            .link
            .outgoing
            .lock()
            .await
            .clone()
            .ok_or(ClientError::NotConnected)?;
        let text = protocol::encode_command(&command)?;
        tx.send(text).await.map_err(|_| ClientError::NotConnected)
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.link.state.read().await
    }

    /// Sequence of the last event received on the current connection.
    pub async fn last_sequence(&self) -> Option<u64> {
        self.link.tracker.lock().await.last()
    }

    pub fn url(&self) -> &str {
        &self.link.url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_backoff_is_capped_exponential() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for(4), Duration::from_secs(3));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(3));
    }

    #[test]
    fn test_fixed_backoff() {
        let policy = BackoffPolicy::fixed(Duration::from_secs(3));
        for attempt in [1, 2, 10, 1000] {
            assert_eq!(policy.delay_for(attempt), Duration::from_secs(3));
        }
    }

    #[test]
    fn test_sequence_tracker() {
        let mut tracker = SequenceTracker::default();
        assert_eq!(tracker.last(), None);
        assert!(tracker.observe(4));
        assert!(tracker.observe(5));
        assert!(!tracker.observe(5));
        assert!(!tracker.observe(2));
        assert_eq!(tracker.anomalies(), 2);
        assert_eq!(tracker.last(), Some(2));

        tracker.reset();
        assert!(tracker.observe(1));
        assert_eq!(tracker.anomalies(), 2);
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = CanvasClient::new("ws://127.0.0.1:8080/ws");
        assert_eq!(client.url(), "ws://127.0.0.1:8080/ws");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.last_sequence().await, None);
    }

    #[tokio::test]
    async fn test_send_while_disconnected() {
        let client = CanvasClient::new("ws://127.0.0.1:8080/ws");
        let segment = StrokeSegment::new((0.0, 0.0), (1.0, 1.0), "#000000", 2.0);
        assert!(matches!(
            client.send_draw(segment).await,
            Err(ClientError::NotConnected)
        ));
        assert!(matches!(
            client.send_clear().await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_invalid_segment_rejected_locally() {
        let client = CanvasClient::new("ws://127.0.0.1:8080/ws");
        let segment = StrokeSegment::new((f64::NAN, 0.0), (1.0, 1.0), "#000000", 2.0);
        assert!(matches!(
            client.send_draw(segment).await,
            Err(ClientError::Protocol(ProtocolError::InvalidEvent(_)))
        ));
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = CanvasClient::new("ws://127.0.0.1:8080/ws");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_connect_refused_gives_up() {
        // Grab a free port, then release it so nothing is listening
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut client = CanvasClient::new(format!("ws://{addr}/ws"))
            .with_backoff(BackoffPolicy::fixed(Duration::from_millis(10)));
        let result = client.connect_with_retry(3).await;
        assert!(matches!(result, Err(ClientError::Transport(_))));
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }
}
