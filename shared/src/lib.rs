//! # Shared session core
//!
//! Everything both node roles need: the authoritative simulation, the wire
//! model and its codec, the UDP transport, the acknowledgement dispatcher and
//! the channels that feed a presentation layer.
//!
//! ## Modules
//!
//! - `engine`: torus grid, snakes, food economy and the per-tick rules
//! - `protocol`: message envelope, payloads and bincode codec
//! - `snapshot`: absolute snapshots and delta-coded snake points
//! - `dispatcher`: sequence numbers, ack tracking and bounded retry
//! - `transport`: unicast socket plus optional multicast discovery socket
//! - `feed`: one-way game-list and state channels towards the UI
//! - `config` / `error`: session parameters, timings and the error type

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod feed;
pub mod protocol;
pub mod snapshot;
pub mod transport;

pub use config::{GameConfig, NetOptions, Timings};
pub use engine::{Cell, Direction, Engine, Snake, StepOutcome};
pub use error::{Result, SnakeError};
pub use feed::{ui_channels, GameListing, UiFeed, UiSink};
pub use protocol::{GameMessage, MessageBody, NodeRole, PlayerId, PlayerInfo};
pub use snapshot::{GameSnapshot, SnakeView};
