//! WebSocket relay server for a single shared canvas.
//!
//! The server owns the listener, the broadcast engine handle and the
//! connection counters. Each accepted socket runs in its own task; see
//! [`crate::connection`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;

use crate::broadcast::BroadcastEngine;
use crate::connection;

pub const ENV_BIND_ADDR: &str = "BLACKBOARD_BIND_ADDR";
pub const ENV_MAX_PARTICIPANTS: &str = "BLACKBOARD_MAX_PARTICIPANTS";
pub const ENV_OUTBOUND_QUEUE: &str = "BLACKBOARD_OUTBOUND_QUEUE";
pub const ENV_COMMAND_QUEUE: &str = "BLACKBOARD_COMMAND_QUEUE";
pub const ENV_WS_PATH: &str = "BLACKBOARD_WS_PATH";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Registry capacity; joins beyond it are refused
    pub max_participants: usize,
    /// Frames buffered per participant before it is evicted as too slow
    pub outbound_queue_capacity: usize,
    /// Commands buffered in front of the sequencer
    pub command_queue_capacity: usize,
    /// Request path accepted for upgrades (`None` = any path)
    pub ws_path: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            max_participants: 256,
            outbound_queue_capacity: 256,
            command_queue_capacity: 1024,
            ws_path: Some("/ws".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0} must be greater than zero")]
    ZeroCapacity(&'static str),
}

impl ServerConfig {
    /// Read overrides from `BLACKBOARD_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup, starting from defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup(ENV_BIND_ADDR) {
            config.bind_addr = addr;
        }
        if let Some(value) = lookup(ENV_MAX_PARTICIPANTS) {
            config.max_participants = parse_count(ENV_MAX_PARTICIPANTS, &value)?;
        }
        if let Some(value) = lookup(ENV_OUTBOUND_QUEUE) {
            config.outbound_queue_capacity = parse_count(ENV_OUTBOUND_QUEUE, &value)?;
        }
        if let Some(value) = lookup(ENV_COMMAND_QUEUE) {
            config.command_queue_capacity = parse_count(ENV_COMMAND_QUEUE, &value)?;
        }
        if let Some(path) = lookup(ENV_WS_PATH) {
            config.ws_path = if path.is_empty() { None } else { Some(path) };
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_participants == 0 {
            return Err(ConfigError::ZeroCapacity("max_participants"));
        }
        if self.outbound_queue_capacity == 0 {
            return Err(ConfigError::ZeroCapacity("outbound_queue_capacity"));
        }
        if self.command_queue_capacity == 0 {
            return Err(ConfigError::ZeroCapacity("command_queue_capacity"));
        }
        Ok(())
    }
}

fn parse_count(key: &'static str, value: &str) -> Result<usize, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|e: std::num::ParseIntError| ConfigError::InvalidValue {
            key,
            value: value.to_string(),
            reason: e.to_string(),
        })
}

/// Server statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub rejected_messages: u64,
    pub total_bytes: u64,
}

/// Lock-free connection counters shared by all connection tasks.
#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_connections: AtomicU64,
    total_messages: AtomicU64,
    rejected_messages: AtomicU64,
    total_bytes: AtomicU64,
}

impl StatsRecorder {
    pub(crate) fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_rejected(&self) {
        self.rejected_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn message_received(&self, bytes: usize) {
        self.total_messages.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn message_rejected(&self) {
        self.rejected_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> ServerStats {
        ServerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            rejected_connections: self.rejected_connections.load(Ordering::Relaxed),
            total_messages: self.total_messages.load(Ordering::Relaxed),
            rejected_messages: self.rejected_messages.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// The relay server.
pub struct RelayServer {
    config: Arc<ServerConfig>,
    listener: TcpListener,
    engine: BroadcastEngine,
    stats: Arc<StatsRecorder>,
}

impl RelayServer {
    /// Validate `config`, bind the listener and spawn the sequencer.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let engine =
            BroadcastEngine::spawn(config.max_participants, config.command_queue_capacity);
        log::info!("Relay listening on {}", listener.local_addr()?);

        Ok(Self {
            config: Arc::new(config),
            listener,
            engine,
            stats: Arc::new(StatsRecorder::default()),
        })
    }

    /// Accept connections forever, one task per connection.
    pub async fn run(&self) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = self.listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let engine = self.engine.clone();
            let config = self.config.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    connection::serve_connection(stream, addr, engine, config, stats).await
                {
                    log::warn!("Connection from {addr} ended with error: {e}");
                }
            });
        }
    }

    /// Address the listener is actually bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// `ws://` URL clients should connect to.
    pub fn endpoint_url(&self) -> Result<String, ServerError> {
        let path = self.config.ws_path.as_deref().unwrap_or("/");
        Ok(format!("ws://{}{}", self.local_addr()?, path))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn engine(&self) -> &BroadcastEngine {
        &self.engine
    }

    /// Get server statistics.
    pub fn stats(&self) -> ServerStats {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.max_participants, 256);
        assert_eq!(config.outbound_queue_capacity, 256);
        assert_eq!(config.command_queue_capacity, 1024);
        assert_eq!(config.ws_path.as_deref(), Some("/ws"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_empty_lookup_is_default() {
        let config = ServerConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.bind_addr, ServerConfig::default().bind_addr);
    }

    #[test]
    fn test_config_overrides() {
        let config = ServerConfig::from_lookup(lookup_from(&[
            (ENV_BIND_ADDR, "0.0.0.0:9000"),
            (ENV_MAX_PARTICIPANTS, " 12 "),
            (ENV_OUTBOUND_QUEUE, "8"),
            (ENV_COMMAND_QUEUE, "64"),
            (ENV_WS_PATH, ""),
        ]))
        .unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.max_participants, 12);
        assert_eq!(config.outbound_queue_capacity, 8);
        assert_eq!(config.command_queue_capacity, 64);
        assert!(config.ws_path.is_none());
    }

    #[test]
    fn test_config_rejects_garbage() {
        let err = ServerConfig::from_lookup(lookup_from(&[(ENV_MAX_PARTICIPANTS, "lots")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { key: ENV_MAX_PARTICIPANTS, .. }
        ));
    }

    #[test]
    fn test_config_rejects_zero_capacity() {
        let err =
            ServerConfig::from_lookup(lookup_from(&[(ENV_OUTBOUND_QUEUE, "0")])).unwrap_err();
        assert_eq!(err, ConfigError::ZeroCapacity("outbound_queue_capacity"));
    }

    #[test]
    fn test_stats_recorder() {
        let recorder = StatsRecorder::default();
        recorder.connection_opened();
        recorder.connection_opened();
        recorder.connection_closed();
        recorder.connection_rejected();
        recorder.message_received(40);
        recorder.message_received(2);
        recorder.message_rejected();

        let stats = recorder.snapshot();
        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.active_connections, 1);
        assert_eq!(stats.rejected_connections, 1);
        assert_eq!(stats.total_messages, 2);
        assert_eq!(stats.rejected_messages, 1);
        assert_eq!(stats.total_bytes, 42);
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".into(),
            ..ServerConfig::default()
        };
        let server = RelayServer::bind(config).await.unwrap();
        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(
            server.endpoint_url().unwrap(),
            format!("ws://127.0.0.1:{}/ws", addr.port())
        );
        assert_eq!(server.stats(), ServerStats::default());
        assert_eq!(server.engine().stats().await.unwrap().active_participants, 0);
    }

    #[tokio::test]
    async fn test_bind_rejects_invalid_config() {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".into(),
            max_participants: 0,
            ..ServerConfig::default()
        };
        assert!(matches!(
            RelayServer::bind(config).await,
            Err(ServerError::Config(ConfigError::ZeroCapacity("max_participants")))
        ));
    }
}
