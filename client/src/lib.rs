//! # Player node
//!
//! Everything a node needs when it is not (yet) the Master: hearing game
//! announcements, joining, steering, following the Master and, as Deputy,
//! taking over when the Master falls silent.
//!
//! ## Modules
//!
//! ### Game view (`game`)
//! - Registry of announced games with expiry and a stable, sorted listing
//! - The last accepted state of the joined game, filtered by state order
//!
//! ### Network (`network`)
//! The Normal/Deputy controller: join handshake, tracked steering, pings,
//! acknowledgements and the failover state machine.
//!
//! ### Node (`node`)
//! The facade a presentation layer talks to. It switches a node between
//! the Normal and Master controllers and feeds game lists and states back
//! through one-way channels.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::node::Node;
//! use shared::{Direction, NetOptions};
//!
//! #[tokio::main]
//! async fn main() -> shared::Result<()> {
//!     let (node, mut feed) = Node::start(NetOptions::default());
//!     node.discover()?;
//!
//!     if let Some(games) = feed.games.recv().await {
//!         if !games.is_empty() {
//!             node.join(0, "player")?;
//!         }
//!     }
//!
//!     node.steer(Direction::Up)?;
//!     while let Some(state) = feed.states.recv().await {
//!         println!("order {}: {} snakes", state.order, state.snakes.len());
//!     }
//!     node.stop().await
//! }
//! ```

pub mod game;
pub mod network;
pub mod node;
