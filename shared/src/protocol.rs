//! Wire envelope exchanged between nodes.
//!
//! Every datagram carries exactly one [`GameMessage`], serialized with
//! bincode. Tracked messages are acknowledged with an `Ack` that echoes their
//! `seq`; the Ack answering a `Join` also carries the newly
//! assigned player id in `receiver_id`.

use crate::config::GameConfig;
use crate::engine::{Cell, Direction};
use crate::error::Result;
use bincode::{deserialize, serialize};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

pub type PlayerId = u32;

/// Sender/receiver id used before a player id is known.
pub const UNASSIGNED: PlayerId = 0;

pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 192, 0, 4);
pub const MULTICAST_PORT: u16 = 9192;
pub const GAME_NAME_PREFIX: &str = "snakenet";
/// Largest datagram a node will read.
pub const MAX_DATAGRAM: usize = 65_507;

pub fn multicast_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(MULTICAST_GROUP), MULTICAST_PORT)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeRole {
    Normal,
    Master,
    Deputy,
    Viewer,
}

/// Point on the wire: absolute for a snake's head and for food, a signed
/// offset from the previous point for the rest of a snake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coord {
    pub x: i32,
    pub y: i32,
}

impl From<Cell> for Coord {
    fn from(cell: Cell) -> Self {
        Self { x: cell.x, y: cell.y }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub id: PlayerId,
    pub name: String,
    pub role: NodeRole,
    pub score: u32,
    /// Address the Master observes this player at.
    pub address: Option<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireSnake {
    pub player_id: PlayerId,
    pub points: Vec<Coord>,
    pub heading: Direction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatePayload {
    pub order: u64,
    pub snakes: Vec<WireSnake>,
    pub foods: Vec<Coord>,
    pub players: Vec<PlayerInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameAnnouncement {
    pub players: Vec<PlayerInfo>,
    pub config: GameConfig,
    pub can_join: bool,
    /// `snakenet:<unicast port>` so listeners can reach the host even when
    /// the multicast source port differs.
    pub game_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    Join {
        player_name: String,
        requested_role: NodeRole,
    },
    Steer {
        direction: Direction,
    },
    Ack,
    State(StatePayload),
    Ping,
    RoleChange {
        sender_role: Option<NodeRole>,
        receiver_role: Option<NodeRole>,
    },
    Error {
        message: String,
    },
    Announcement {
        games: Vec<GameAnnouncement>,
    },
    Discover,
}

impl MessageBody {
    /// Whether the receiver answers this message with an `Ack`.
    pub fn needs_ack(&self) -> bool {
        !matches!(
            self,
            MessageBody::Ack | MessageBody::Announcement { .. } | MessageBody::Discover
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::Join { .. } => "Join",
            MessageBody::Steer { .. } => "Steer",
            MessageBody::Ack => "Ack",
            MessageBody::State(_) => "State",
            MessageBody::Ping => "Ping",
            MessageBody::RoleChange { .. } => "RoleChange",
            MessageBody::Error { .. } => "Error",
            MessageBody::Announcement { .. } => "Announcement",
            MessageBody::Discover => "Discover",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameMessage {
    pub seq: u64,
    pub sender_id: PlayerId,
    pub receiver_id: PlayerId,
    pub body: MessageBody,
}

impl GameMessage {
    pub fn new(seq: u64, sender_id: PlayerId, receiver_id: PlayerId, body: MessageBody) -> Self {
        Self {
            seq,
            sender_id,
            receiver_id,
            body,
        }
    }

    /// Acknowledgement of `self`, echoing its sequence number.
    pub fn ack_for(&self, sender_id: PlayerId, receiver_id: PlayerId) -> Self {
        Self::new(self.seq, sender_id, receiver_id, MessageBody::Ack)
    }
}

pub fn encode(message: &GameMessage) -> Result<Vec<u8>> {
    Ok(serialize(message)?)
}

pub fn decode(bytes: &[u8]) -> Result<GameMessage> {
    Ok(deserialize(bytes)?)
}

pub fn game_name_for_port(port: u16) -> String {
    format!("{}:{}", GAME_NAME_PREFIX, port)
}

/// Recovers the unicast port embedded in an announced game name.
pub fn parse_announced_port(game_name: &str) -> Option<u16> {
    let (_, port) = game_name.rsplit_once(':')?;
    match port.parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(port) => Some(port),
    }
}
