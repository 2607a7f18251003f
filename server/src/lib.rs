//! # Master node
//!
//! The Master is the single authority of a session. It runs the simulation,
//! admits players, buffers their steers, broadcasts one absolute state per
//! tick and keeps exactly one Deputy appointed for failover.
//!
//! ## Modules
//!
//! ### Peer directory (`peers`)
//! Addresses the Master talks to, the player bound to each and when it was
//! last heard from. Silent peers are evicted after the node timeout.
//!
//! ### Session (`game`)
//! The engine plus the player roster: joins, leaves, steering, Deputy
//! selection, snapshots and the takeover path used when a Deputy becomes
//! Master.
//!
//! ### Controller (`network`)
//! The select loop tying the session to a UDP socket, the acknowledgement
//! dispatcher and the tick, retry, eviction and announce timers.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::{MasterCommand, MasterController};
//! use shared::{ui_channels, GameConfig, NetOptions};
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> shared::Result<()> {
//!     let (sink, _feed) = ui_channels();
//!     let master =
//!         MasterController::host(GameConfig::default(), "host", NetOptions::default(), sink)
//!             .await?;
//!
//!     let (commands, rx) = mpsc::unbounded_channel();
//!     commands.send(MasterCommand::RespawnSelf).ok();
//!     master.run(rx).await
//! }
//! ```

pub mod game;
pub mod network;
pub mod peers;
