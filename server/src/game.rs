//! Authoritative session state held by the Master.
//!
//! `MasterSession` couples the simulation engine with the player roster.
//! Addresses are not stored here; anything that needs to know where a
//! player lives takes the [`PeerDirectory`] alongside.

use crate::peers::PeerDirectory;
use log::{debug, info};
use shared::config::MAX_NAME_LEN;
use shared::{
    Direction, Engine, GameConfig, GameSnapshot, NodeRole, PlayerId, PlayerInfo, Result,
    SnakeError, StepOutcome,
};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;

/// Id the Master gives its own player in a freshly hosted game.
pub const HOST_PLAYER_ID: PlayerId = 1;

/// Orders skipped when a Deputy takes over, so its first states outrank
/// any the old Master got out to other players but not to the Deputy.
pub const TAKEOVER_ORDER_GAP: u64 = 8;

/// Role of a roster entry.
///
/// Transitions go through the methods below so that the only ways into
/// `Deputy` and `Master` are the ones the protocol allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Deputy,
    Normal,
    Viewer,
}

impl Role {
    pub fn from_wire(role: NodeRole) -> Self {
        match role {
            NodeRole::Master => Role::Master,
            NodeRole::Deputy => Role::Deputy,
            NodeRole::Normal => Role::Normal,
            NodeRole::Viewer => Role::Viewer,
        }
    }

    pub fn to_wire(self) -> NodeRole {
        match self {
            Role::Master => NodeRole::Master,
            Role::Deputy => NodeRole::Deputy,
            Role::Normal => NodeRole::Normal,
            Role::Viewer => NodeRole::Viewer,
        }
    }

    /// Only a Normal can be appointed Deputy.
    pub fn promote_to_deputy(self) -> Option<Role> {
        match self {
            Role::Normal => Some(Role::Deputy),
            _ => None,
        }
    }

    pub fn demote_to_normal(self) -> Role {
        match self {
            Role::Deputy => Role::Normal,
            other => other,
        }
    }

    pub fn leave(self) -> Role {
        Role::Viewer
    }

    pub fn promote_to_master(self) -> Role {
        Role::Master
    }
}

#[derive(Debug, Clone)]
pub struct Player {
    pub id: PlayerId,
    pub name: String,
    pub role: Role,
    /// Monotonic admission counter, used to pick the Deputy.
    pub join_order: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    /// A new player id was allocated.
    New,
    /// The address already had a player whose snake was gone.
    Respawned,
    /// Redelivered Join for a player that is alive and well.
    Duplicate,
}

#[derive(Debug)]
pub enum JoinOutcome {
    Accepted { player_id: PlayerId, kind: JoinKind },
    Rejected(SnakeError),
}

pub struct MasterSession {
    engine: Engine,
    players: BTreeMap<PlayerId, Player>,
    local_id: PlayerId,
    next_player_id: PlayerId,
    next_join_order: u64,
    pending_steers: HashMap<PlayerId, Direction>,
}

impl MasterSession {
    /// Starts a fresh game with the local player as Master.
    pub fn new(config: GameConfig, local_name: &str) -> Result<Self> {
        check_config(&config)?;
        Self::with_engine(Engine::new(config), local_name)
    }

    pub fn with_seed(config: GameConfig, local_name: &str, seed: u64) -> Result<Self> {
        check_config(&config)?;
        Self::with_engine(Engine::with_seed(config, seed), local_name)
    }

    fn with_engine(engine: Engine, local_name: &str) -> Result<Self> {
        let mut session = Self {
            engine,
            players: BTreeMap::new(),
            local_id: HOST_PLAYER_ID,
            next_player_id: HOST_PLAYER_ID + 1,
            next_join_order: 0,
            pending_steers: HashMap::new(),
        };

        let spawn = session.engine.find_spawn().ok_or(SnakeError::NoSpawnSpace)?;
        session.engine.add_snake(HOST_PLAYER_ID, spawn)?;
        session.admit(HOST_PLAYER_ID, local_name, Role::Master);
        info!("Hosting as player {} on a {}x{} board", HOST_PLAYER_ID,
            session.config().width, session.config().height);
        Ok(session)
    }

    /// Takes over a session from the last snapshot a Deputy received.
    ///
    /// Any previous Master is turned into a Viewer and its snake removed.
    /// Every other player with a known address is seeded into the returned
    /// directory so the new Master can reach and time out them as usual.
    pub fn bootstrap(
        config: GameConfig,
        snapshot: &GameSnapshot,
        self_id: PlayerId,
    ) -> (Self, PeerDirectory) {
        let mut engine = Engine::restore(config, snapshot);
        engine.skip_orders(TAKEOVER_ORDER_GAP);
        let mut players = BTreeMap::new();
        let mut peers = PeerDirectory::new();

        let mut ordered: Vec<&PlayerInfo> = snapshot.players.iter().collect();
        ordered.sort_by_key(|p| p.id);

        for (join_order, info) in ordered.into_iter().enumerate() {
            let mut role = Role::from_wire(info.role);
            if info.id == self_id {
                role = role.promote_to_master();
            } else if role == Role::Master {
                engine.remove_snake(info.id);
                role = role.leave();
                debug!("Previous master {} is now a viewer", info.id);
            } else {
                role = role.demote_to_normal();
                if let Some(addr) = info.address {
                    peers.bind(addr, info.id);
                }
            }

            players.insert(
                info.id,
                Player {
                    id: info.id,
                    name: info.name.clone(),
                    role,
                    join_order: join_order as u64,
                },
            );
        }

        if !players.contains_key(&self_id) {
            players.insert(
                self_id,
                Player {
                    id: self_id,
                    name: format!("player-{}", self_id),
                    role: Role::Master,
                    join_order: players.len() as u64,
                },
            );
        }

        let next_player_id = players.keys().max().map_or(HOST_PLAYER_ID, |id| id + 1);
        let next_join_order = players.len() as u64;
        info!(
            "Taking over at order {} as player {} with {} peers",
            engine.state_order(),
            self_id,
            peers.len()
        );

        (
            Self {
                engine,
                players,
                local_id: self_id,
                next_player_id,
                next_join_order,
                pending_steers: HashMap::new(),
            },
            peers,
        )
    }

    fn admit(&mut self, id: PlayerId, name: &str, role: Role) {
        let player = Player {
            id,
            name: sanitize_name(name, id),
            role,
            join_order: self.next_join_order,
        };
        self.next_join_order += 1;
        self.players.insert(id, player);
    }

    pub fn config(&self) -> &GameConfig {
        self.engine.config()
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn local_id(&self) -> PlayerId {
        self.local_id
    }

    pub fn player(&self, id: PlayerId) -> Option<&Player> {
        self.players.get(&id)
    }

    pub fn players(&self) -> impl Iterator<Item = &Player> {
        self.players.values()
    }

    pub fn deputy(&self) -> Option<PlayerId> {
        self.players
            .values()
            .find(|p| p.role == Role::Deputy)
            .map(|p| p.id)
    }

    /// Admits, respawns or re-acknowledges the player at `addr`.
    ///
    /// Joins are idempotent per address. A rejected Join consumes no player
    /// id and leaves the directory untouched.
    pub fn join(
        &mut self,
        peers: &mut PeerDirectory,
        addr: SocketAddr,
        name: &str,
        requested_role: NodeRole,
    ) -> JoinOutcome {
        let wants_viewer = requested_role == NodeRole::Viewer;

        if let Some(player_id) = peers.player_for(addr) {
            let role = match self.players.get(&player_id) {
                Some(player) => player.role,
                None => {
                    self.admit(player_id, name, Role::Normal);
                    Role::Normal
                }
            };

            if wants_viewer || self.engine.is_alive(player_id) {
                return JoinOutcome::Accepted {
                    player_id,
                    kind: JoinKind::Duplicate,
                };
            }

            let Some(spawn) = self.engine.find_spawn() else {
                return JoinOutcome::Rejected(SnakeError::NoSpawnSpace);
            };
            if let Err(e) = self.engine.add_snake(player_id, spawn) {
                return JoinOutcome::Rejected(e);
            }
            if role == Role::Viewer {
                if let Some(player) = self.players.get_mut(&player_id) {
                    player.role = Role::Normal;
                }
            }
            info!("Respawned player {} from {}", player_id, addr);
            return JoinOutcome::Accepted {
                player_id,
                kind: JoinKind::Respawned,
            };
        }

        let player_id = self.next_player_id;
        if wants_viewer {
            self.next_player_id += 1;
            self.admit(player_id, name, Role::Viewer);
            peers.bind(addr, player_id);
            info!("Viewer {} joined from {}", player_id, addr);
            return JoinOutcome::Accepted {
                player_id,
                kind: JoinKind::New,
            };
        }

        let Some(spawn) = self.engine.find_spawn() else {
            return JoinOutcome::Rejected(SnakeError::NoSpawnSpace);
        };
        if let Err(e) = self.engine.add_snake(player_id, spawn) {
            return JoinOutcome::Rejected(e);
        }

        self.next_player_id += 1;
        self.admit(player_id, name, Role::Normal);
        peers.bind(addr, player_id);
        info!("Player {} joined from {}", player_id, addr);
        JoinOutcome::Accepted {
            player_id,
            kind: JoinKind::New,
        }
    }

    /// Buffers a remote steer for the next tick.
    ///
    /// The steer must come from the address bound to `sender_id`, the
    /// snake must be alive, and `seq` must be newer than the last steer
    /// accepted from that address.
    pub fn buffer_steer(
        &mut self,
        peers: &mut PeerDirectory,
        addr: SocketAddr,
        sender_id: PlayerId,
        seq: u64,
        direction: Direction,
    ) -> bool {
        if peers.player_for(addr) != Some(sender_id) || !self.engine.is_alive(sender_id) {
            return false;
        }
        let Some(peer) = peers.get_mut(addr) else {
            return false;
        };
        if !peer.accept_steer(seq) {
            debug!("Ignoring stale steer {} from {}", seq, addr);
            return false;
        }
        self.pending_steers.insert(sender_id, direction);
        true
    }

    pub fn steer_local(&mut self, direction: Direction) {
        if self.engine.is_alive(self.local_id) {
            self.pending_steers.insert(self.local_id, direction);
        }
    }

    /// Turns the player into a Viewer and removes its snake.
    ///
    /// Used both for voluntary leaves and for evicted peers. The Master
    /// itself cannot leave this way.
    pub fn demote_to_viewer(&mut self, player_id: PlayerId) -> bool {
        if player_id == self.local_id {
            return false;
        }
        let Some(player) = self.players.get_mut(&player_id) else {
            return false;
        };
        player.role = player.role.leave();
        self.engine.remove_snake(player_id);
        self.pending_steers.remove(&player_id);
        true
    }

    /// Replaces the local snake with a fresh one.
    ///
    /// On failure the current snake, if any, is left alone.
    pub fn respawn_local(&mut self) -> Result<()> {
        let spawn = self.engine.find_spawn().ok_or(SnakeError::NoSpawnSpace)?;
        self.engine.remove_snake(self.local_id);
        self.pending_steers.remove(&self.local_id);
        self.engine.add_snake(self.local_id, spawn)?;
        info!("Respawned local snake {}", self.local_id);
        Ok(())
    }

    /// Applies buffered steers and advances the game by one tick.
    pub fn tick(&mut self) -> StepOutcome {
        for (player_id, direction) in self.pending_steers.drain() {
            self.engine.steer(player_id, direction);
        }

        let outcome = self.engine.step();
        for player_id in &outcome.died {
            self.engine.set_score(*player_id, 0);
            debug!("Snake {} died at order {}", player_id, self.engine.state_order());
        }
        outcome
    }

    /// Appoints a Deputy if there is none reachable.
    ///
    /// A Deputy without a known address is demoted first. Returns the id of
    /// a newly appointed Deputy.
    pub fn select_deputy(&mut self, peers: &PeerDirectory) -> Option<PlayerId> {
        if let Some(current) = self.deputy() {
            if peers.addr_for(current).is_some() {
                return None;
            }
            if let Some(player) = self.players.get_mut(&current) {
                player.role = player.role.demote_to_normal();
            }
        }

        let candidate = self
            .players
            .values()
            .filter(|p| p.id != self.local_id && peers.addr_for(p.id).is_some())
            .filter(|p| p.role.promote_to_deputy().is_some())
            .min_by_key(|p| p.join_order)
            .map(|p| p.id)?;

        let player = self.players.get_mut(&candidate)?;
        player.role = player.role.promote_to_deputy()?;
        info!("Player {} is the new deputy", candidate);
        Some(candidate)
    }

    /// Absolute state of the current tick, with the addresses the Master
    /// observes for each remote player.
    pub fn snapshot(&self, peers: &PeerDirectory) -> GameSnapshot {
        GameSnapshot {
            order: self.engine.state_order(),
            snakes: self.engine.snake_views(),
            foods: self.engine.food().iter().copied().collect(),
            players: self
                .players
                .values()
                .map(|p| PlayerInfo {
                    id: p.id,
                    name: p.name.clone(),
                    role: p.role.to_wire(),
                    score: self.engine.score(p.id),
                    address: if p.id == self.local_id {
                        None
                    } else {
                        peers.addr_for(p.id)
                    },
                })
                .collect(),
        }
    }

    /// Whether a new snake would currently fit.
    pub fn can_join(&mut self) -> bool {
        self.engine.find_spawn().is_some()
    }
}

fn check_config(config: &GameConfig) -> Result<()> {
    if config.is_valid() {
        Ok(())
    } else {
        Err(SnakeError::InvalidConfig(config.width, config.height))
    }
}

fn sanitize_name(name: &str, id: PlayerId) -> String {
    let trimmed: String = name.trim().chars().take(MAX_NAME_LEN).collect();
    if trimmed.is_empty() {
        format!("player-{}", id)
    } else {
        trimmed
    }
}
