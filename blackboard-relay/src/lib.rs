//! # blackboard-relay: Real-time stroke relay for a shared canvas
//!
//! Every participant's stroke segments reach every other participant in one
//! agreed order, and late joiners are seeded with the current drawing.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ CanvasClient │ ◄────────────────► │ RelayServer  │
//! │ (per user)   │     JSON frames    │ (central)    │
//! └──────────────┘                    └──────┬───────┘
//!                                            │ one task per connection
//!                                            ▼
//!                                     ┌──────────────┐
//!                                     │  Sequencer   │
//!                                     │ Session:     │
//!                                     │  registry    │
//!                                     │  stroke log  │
//!                                     └──────┬───────┘
//!                                            │ try_send per peer
//!                                            ▼
//!                                     outbound queues
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire codec (`draw` / `clear` envelopes)
//! - [`registry`]: Live participants and their outbound queues
//! - [`stroke_log`]: Append-only sequenced event log with clear tracking
//! - [`session`]: Registry + log owned together
//! - [`broadcast`]: Sequencer task and fan-out
//! - [`connection`]: Per-socket lifecycle
//! - [`server`]: Listener, config, statistics
//! - [`client`]: Reconnecting client

pub mod protocol;
pub mod registry;
pub mod stroke_log;
pub mod session;
pub mod broadcast;
pub mod connection;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{
    DrawingCommand, DrawingEvent, ParticipantId, ProtocolError, StrokeSegment,
};
pub use registry::{CloseReason, ConnectionHandle, DeliveryFailure, RegistryError, SessionRegistry};
pub use stroke_log::{LogStats, StrokeLog};
pub use session::{Admission, Session};
pub use broadcast::{BroadcastEngine, BroadcastStats, EngineError, FanoutReport, Sequencer};
pub use connection::{ConnectionError, ConnectionState};
pub use server::{ConfigError, RelayServer, ServerConfig, ServerError, ServerStats};
pub use client::{BackoffPolicy, CanvasClient, CanvasEvent, ClientError};
