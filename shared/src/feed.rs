//! One-way channels from a node's network loop to its presentation layer.
//!
//! The loop only ever sends owned, immutable values; nothing the loop
//! mutates is shared with the receiving side.

use crate::config::GameConfig;
use crate::snapshot::GameSnapshot;
use log::debug;
use std::net::SocketAddr;
use tokio::sync::mpsc;

/// A game heard on the discovery group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameListing {
    pub name: String,
    /// Unicast address to send `Join` to.
    pub address: SocketAddr,
    pub config: GameConfig,
    pub can_join: bool,
    pub player_count: usize,
}

#[derive(Debug, Clone)]
pub struct UiSink {
    games: mpsc::UnboundedSender<Vec<GameListing>>,
    states: mpsc::UnboundedSender<GameSnapshot>,
}

impl UiSink {
    pub fn push_games(&self, games: Vec<GameListing>) {
        if self.games.send(games).is_err() {
            debug!("Game list receiver dropped");
        }
    }

    pub fn push_state(&self, snapshot: GameSnapshot) {
        if self.states.send(snapshot).is_err() {
            debug!("State receiver dropped");
        }
    }
}

/// Receiving half handed to the presentation layer.
pub struct UiFeed {
    pub games: mpsc::UnboundedReceiver<Vec<GameListing>>,
    pub states: mpsc::UnboundedReceiver<GameSnapshot>,
}

pub fn ui_channels() -> (UiSink, UiFeed) {
    let (games_tx, games_rx) = mpsc::unbounded_channel();
    let (states_tx, states_rx) = mpsc::unbounded_channel();
    (
        UiSink {
            games: games_tx,
            states: states_tx,
        },
        UiFeed {
            games: games_rx,
            states: states_rx,
        },
    )
}
