//! Normal and Deputy side of the protocol.
//!
//! A `NormalController` discovers games, joins one, forwards steering to
//! the current center (the Master, or the Deputy during a handover) and
//! watches the center for silence. When a Deputy notices its Master is
//! gone, `run` returns a [`NormalExit::Promote`] so the caller can start a
//! Master from the last accepted state.

use crate::game::{GameRegistry, SessionView};
use log::{debug, error, info, warn};
use server::network::Handover;
use shared::dispatcher::Dispatcher;
use shared::protocol::{self, StatePayload, MAX_DATAGRAM, UNASSIGNED};
use shared::transport::Transport;
use shared::{
    Direction, GameConfig, GameMessage, MessageBody, NetOptions, NodeRole, PlayerId, Result,
    SnakeError, Timings, UiSink,
};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::{interval, Interval, MissedTickBehavior};

/// Pause between leaving a game and joining it again.
pub const REJOIN_PAUSE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalCommand {
    /// Join the game at `index` of the discovered list.
    Join {
        index: usize,
        name: String,
        role: NodeRole,
    },
    /// Join a Master by address. Without a config the Master is asked for
    /// one with a unicast `Discover` first.
    JoinAddr {
        addr: SocketAddr,
        config: Option<GameConfig>,
        name: String,
        role: NodeRole,
    },
    Steer(Direction),
    LeaveAndRespawn,
    RespawnSelf,
    Discover,
    Stop,
}

#[derive(Debug)]
pub enum NormalExit {
    Stopped,
    /// This node was Deputy and its Master went silent.
    Promote(Handover),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Idle,
    /// Waiting for the Master's announcement to learn its config.
    AwaitingConfig {
        addr: SocketAddr,
        name: String,
        role: NodeRole,
        since: Instant,
    },
    Joining {
        seq: u64,
    },
    Playing,
    /// Left the game; joining again at `at`.
    Rejoining {
        at: Instant,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failover {
    /// Following the Deputy as center since `since`.
    Handover { since: Instant },
    /// No Deputy known; waiting for the Master to come back.
    NoDeputy { since: Instant },
}

struct Timers {
    period: Duration,
    retry: Interval,
    watchdog: Interval,
}

impl Timers {
    fn new(timings: &Timings) -> Self {
        let mut retry = interval(timings.retry_interval);
        retry.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut watchdog = interval(timings.ping_interval);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self {
            period: timings.ping_interval,
            retry,
            watchdog,
        }
    }
}

pub struct NormalController {
    transport: Transport,
    dispatcher: Dispatcher,
    registry: GameRegistry,
    timings: Timings,
    sink: UiSink,

    phase: Phase,
    center: Option<SocketAddr>,
    session: Option<SessionView>,
    self_id: PlayerId,
    role: NodeRole,
    name: String,
    requested_role: NodeRole,

    last_contact: Instant,
    last_sent: Instant,
    failover: Option<Failover>,
}

impl NormalController {
    pub async fn start(options: NetOptions, sink: UiSink) -> Result<Self> {
        let transport = Transport::bind(options, true).await?;
        let timings = GameConfig::default().timings();

        Ok(Self {
            transport,
            dispatcher: Dispatcher::new(timings.retry_interval),
            registry: GameRegistry::new(timings.game_expiry),
            timings,
            sink,
            phase: Phase::Idle,
            center: None,
            session: None,
            self_id: UNASSIGNED,
            role: NodeRole::Normal,
            name: String::new(),
            requested_role: NodeRole::Normal,
            last_contact: Instant::now(),
            last_sent: Instant::now(),
            failover: None,
        })
    }

    pub fn local_address(&self) -> Result<SocketAddr> {
        Ok(self.transport.unicast_address()?)
    }

    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<NormalCommand>) -> Result<NormalExit> {
        let mut buffer = vec![0u8; MAX_DATAGRAM];
        let mut multicast_buffer = vec![0u8; MAX_DATAGRAM];
        let mut timers = Timers::new(&self.timings);
        let mut gc_interval = interval(self.timings.announce_interval);

        info!("Normal node listening on {}", self.local_address()?);

        let exit = loop {
            if timers.period != self.timings.ping_interval {
                timers = Timers::new(&self.timings);
            }

            tokio::select! {
                received = self.transport.recv_unicast(&mut buffer) => {
                    match received {
                        Ok((len, addr)) => self.handle_unicast(&buffer[..len], addr).await,
                        Err(e) => debug!("Error receiving datagram: {}", e),
                    }
                },

                received = self.transport.recv_multicast(&mut multicast_buffer) => {
                    match received {
                        Ok((len, addr)) => self.handle_multicast(&multicast_buffer[..len], addr),
                        Err(e) => {
                            warn!("Discovery receive failed: {}", e);
                            self.transport.disable_multicast();
                        }
                    }
                },

                command = commands.recv() => {
                    match command {
                        Some(NormalCommand::Stop) | None => break NormalExit::Stopped,
                        Some(command) => self.on_command(command).await,
                    }
                },

                _ = timers.retry.tick() => self.resend_due().await,

                _ = timers.watchdog.tick() => {
                    if let Some(handover) = self.watchdog().await {
                        break NormalExit::Promote(handover);
                    }
                },

                _ = gc_interval.tick() => self.expire_games(),
            }
        };

        self.transport.close();
        Ok(exit)
    }

    async fn on_command(&mut self, command: NormalCommand) {
        match command {
            NormalCommand::Join { index, name, role } => {
                if self.phase != Phase::Idle {
                    warn!("Already in a game, ignoring join");
                    return;
                }
                match self.registry.get(index) {
                    Some(game) => self.start_join(game.address, game.config, name, role).await,
                    None => warn!("Cannot join: {}", SnakeError::UnknownGame(index)),
                }
            }

            NormalCommand::JoinAddr {
                addr,
                config,
                name,
                role,
            } => {
                if self.phase != Phase::Idle {
                    warn!("Already in a game, ignoring join");
                    return;
                }
                match config {
                    Some(config) => self.start_join(addr, config, name, role).await,
                    None => {
                        debug!("Asking {} for its game config", addr);
                        self.phase = Phase::AwaitingConfig {
                            addr,
                            name,
                            role,
                            since: Instant::now(),
                        };
                        self.send_discover(Some(addr)).await;
                    }
                }
            }

            NormalCommand::Steer(direction) => {
                match self.center.filter(|_| self.phase == Phase::Playing) {
                    Some(center) => {
                        self.send_tracked(center, MessageBody::Steer { direction })
                            .await;
                    }
                    None => debug!("Not playing, steer dropped"),
                }
            }

            NormalCommand::LeaveAndRespawn => {
                let Some(center) = self.center.filter(|_| self.phase == Phase::Playing) else {
                    warn!("Cannot leave: {}", SnakeError::NotJoined);
                    return;
                };
                self.send_tracked(
                    center,
                    MessageBody::RoleChange {
                        sender_role: Some(NodeRole::Viewer),
                        receiver_role: None,
                    },
                )
                .await;
                info!("Left as player {}, joining again", self.self_id);
                self.self_id = UNASSIGNED;
                self.role = NodeRole::Viewer;
                self.phase = Phase::Rejoining {
                    at: Instant::now() + REJOIN_PAUSE,
                };
            }

            NormalCommand::RespawnSelf => {
                let Some(center) = self.center.filter(|_| self.phase == Phase::Playing) else {
                    warn!("Cannot respawn: {}", SnakeError::NotJoined);
                    return;
                };
                let body = MessageBody::Join {
                    player_name: self.name.clone(),
                    requested_role: self.requested_role,
                };
                self.send_tracked(center, body).await;
            }

            NormalCommand::Discover => self.send_discover(None).await,

            NormalCommand::Stop => {}
        }
    }

    async fn start_join(&mut self, addr: SocketAddr, config: GameConfig, name: String, role: NodeRole) {
        if !config.is_valid() {
            warn!(
                "Cannot join {}: {}",
                addr,
                SnakeError::InvalidConfig(config.width, config.height)
            );
            self.reset_session();
            return;
        }
        self.retime(&config);
        self.center = Some(addr);
        self.session = Some(SessionView::new(config));
        self.self_id = UNASSIGNED;
        self.role = NodeRole::Normal;
        self.failover = None;
        self.last_contact = Instant::now();
        self.name = name;
        self.requested_role = role;

        let body = MessageBody::Join {
            player_name: self.name.clone(),
            requested_role: role,
        };
        let seq = self.send_tracked(addr, body).await;
        self.phase = Phase::Joining { seq };
        info!("Joining {} as {:?}", addr, self.name);
    }

    /// Adopts the tick-derived timings of the game being joined.
    fn retime(&mut self, config: &GameConfig) {
        let timings = config.timings();
        if timings == self.timings {
            return;
        }
        let last = self.dispatcher.last_sequence();
        self.dispatcher = Dispatcher::new(timings.retry_interval);
        self.dispatcher.resume_after(last);
        self.timings = timings;
    }

    async fn handle_unicast(&mut self, data: &[u8], src: SocketAddr) {
        let message = match protocol::decode(data) {
            Ok(message) => message,
            Err(e) => {
                debug!("Dropping malformed datagram from {}: {}", src, e);
                return;
            }
        };

        let from_center = self.center == Some(src);
        if from_center {
            self.last_contact = Instant::now();
            if self.failover.take().is_some() {
                info!("Center {} is answering again", src);
            }
        }

        match &message.body {
            MessageBody::Ack => {
                self.dispatcher.ack(src, message.seq);
                if let Phase::Joining { seq } = self.phase {
                    if from_center && seq == message.seq {
                        self.joined(message.receiver_id);
                    }
                }
            }

            MessageBody::State(payload) => {
                self.send_ack(&message, src).await;
                self.apply_state(payload);
            }

            MessageBody::RoleChange {
                sender_role,
                receiver_role,
            } => {
                self.send_ack(&message, src).await;
                self.on_role_change(src, *sender_role, *receiver_role);
            }

            MessageBody::Error { message: reason } => {
                self.send_ack(&message, src).await;
                if from_center && matches!(self.phase, Phase::Joining { .. }) {
                    warn!("Join rejected by {}: {}", src, reason);
                    self.reset_session();
                } else {
                    warn!("Error from {}: {}", src, reason);
                }
            }

            MessageBody::Ping => self.send_ack(&message, src).await,

            MessageBody::Announcement { games } => {
                let mut changed = false;
                for game in games {
                    changed |= self.registry.record(src, game);
                }
                if changed {
                    self.sink.push_games(self.registry.listing());
                }

                if let Phase::AwaitingConfig { addr, name, role, .. } = self.phase.clone() {
                    if let Some(game) = games.first().filter(|_| addr == src) {
                        self.phase = Phase::Idle;
                        self.start_join(addr, game.config, name, role).await;
                    }
                }
            }

            MessageBody::Join { .. } | MessageBody::Steer { .. } | MessageBody::Discover => {
                debug!("Ignoring {} from {}, not a master", message.body.kind(), src);
            }
        }
    }

    fn handle_multicast(&mut self, data: &[u8], src: SocketAddr) {
        let Ok(message) = protocol::decode(data) else {
            debug!("Dropping malformed announcement from {}", src);
            return;
        };
        if let MessageBody::Announcement { games } = &message.body {
            let mut changed = false;
            for game in games {
                changed |= self.registry.record(src, game);
            }
            if changed {
                self.sink.push_games(self.registry.listing());
            }
        }
    }

    fn joined(&mut self, player_id: PlayerId) {
        self.self_id = player_id;
        self.phase = Phase::Playing;
        self.role = match self.requested_role {
            NodeRole::Viewer => NodeRole::Viewer,
            _ => NodeRole::Normal,
        };
        info!("Joined as player {}", player_id);
    }

    fn apply_state(&mut self, payload: &StatePayload) {
        if self.phase == Phase::Idle {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(snapshot) = session.apply(payload) else {
            debug!("Stale state {} ignored", payload.order);
            return;
        };
        let snapshot = snapshot.clone();

        if self.self_id != UNASSIGNED {
            if let Some(role) = session.role_of(self.self_id) {
                if role != self.role && role != NodeRole::Master {
                    info!("Role changed from {:?} to {:?}", self.role, role);
                    self.role = role;
                }
            }
        }
        self.sink.push_state(snapshot);
    }

    fn on_role_change(
        &mut self,
        src: SocketAddr,
        sender_role: Option<NodeRole>,
        receiver_role: Option<NodeRole>,
    ) {
        if sender_role == Some(NodeRole::Master) && self.center != Some(src) && self.phase != Phase::Idle {
            info!("{} is the new master", src);
            if let Some(old) = self.center {
                self.dispatcher.forget(old);
            }
            self.center = Some(src);
            self.last_contact = Instant::now();
            self.failover = None;
        }

        match receiver_role {
            Some(NodeRole::Deputy) => {
                info!("Appointed deputy");
                self.role = NodeRole::Deputy;
            }
            Some(NodeRole::Viewer) => self.role = NodeRole::Viewer,
            Some(NodeRole::Normal) => self.role = NodeRole::Normal,
            Some(NodeRole::Master) | None => {}
        }
    }

    /// Runs the periodic checks: rejoin, config lookup, center liveness and
    /// pings. Returns a handover when this Deputy must become Master.
    async fn watchdog(&mut self) -> Option<Handover> {
        let now = Instant::now();

        match self.phase.clone() {
            Phase::Idle => return None,
            Phase::AwaitingConfig { addr, since, .. } => {
                if now.duration_since(since) > self.timings.no_deputy_grace {
                    warn!("No answer from {}, giving up", addr);
                    self.reset_session();
                } else if now.duration_since(self.last_sent) >= self.timings.deputy_timeout {
                    self.send_discover(Some(addr)).await;
                }
                return None;
            }
            Phase::Rejoining { at } if now >= at => {
                if let (Some(center), Some(config)) =
                    (self.center, self.session.as_ref().map(|s| *s.config()))
                {
                    let (name, role) = (self.name.clone(), self.requested_role);
                    self.start_join(center, config, name, role).await;
                }
            }
            _ => {}
        }

        let center = self.center?;
        let silence = now.duration_since(self.last_contact);

        if self.role == NodeRole::Deputy && silence > self.timings.deputy_timeout {
            if let Some(handover) = self.handover() {
                info!("Master {} silent for {:?}, taking over", center, silence);
                return Some(handover);
            }
        }

        let failover = self.failover;
        match failover {
            None if silence > self.timings.normal_timeout => self.begin_failover(now),
            Some(Failover::Handover { since })
                if now.duration_since(since) > self.timings.handover_grace =>
            {
                self.host_lost()
            }
            Some(Failover::NoDeputy { since })
                if now.duration_since(since) > self.timings.no_deputy_grace =>
            {
                self.host_lost()
            }
            _ => {}
        }

        if let Some(center) = self.center.filter(|_| self.phase == Phase::Playing) {
            if now.duration_since(self.last_sent) >= self.timings.ping_interval {
                self.send_tracked(center, MessageBody::Ping).await;
            }
        }
        None
    }

    fn handover(&self) -> Option<Handover> {
        if self.self_id == UNASSIGNED {
            return None;
        }
        let session = self.session.as_ref()?;
        Some(Handover {
            config: *session.config(),
            snapshot: session.latest()?.clone(),
            self_id: self.self_id,
            port: self.transport.unicast_port(),
            last_seq: self.dispatcher.last_sequence(),
        })
    }

    fn begin_failover(&mut self, now: Instant) {
        let deputy = self
            .session
            .as_ref()
            .and_then(|s| s.deputy_address(self.self_id))
            .filter(|addr| Some(*addr) != self.center);

        match deputy {
            Some(deputy) => {
                info!("Center silent, switching to deputy {}", deputy);
                if let Some(old) = self.center {
                    self.dispatcher.forget(old);
                }
                self.center = Some(deputy);
                self.last_contact = now;
                self.failover = Some(Failover::Handover { since: now });
            }
            None => {
                info!("Center silent and no deputy known, waiting");
                self.failover = Some(Failover::NoDeputy { since: now });
            }
        }
    }

    fn host_lost(&mut self) {
        warn!("Host lost, back to discovery");
        self.reset_session();
    }

    fn reset_session(&mut self) {
        if let Some(center) = self.center.take() {
            self.dispatcher.forget(center);
        }
        self.phase = Phase::Idle;
        self.session = None;
        self.self_id = UNASSIGNED;
        self.role = NodeRole::Normal;
        self.failover = None;
    }

    fn expire_games(&mut self) {
        if self.registry.expire(Instant::now()) > 0 {
            self.sink.push_games(self.registry.listing());
        }
    }

    async fn resend_due(&mut self) {
        for (addr, bytes) in self.dispatcher.due_retries(Instant::now()) {
            self.send_bytes(addr, &bytes).await;
        }
    }

    /// Sends `Discover` to one Master, or to the whole group.
    async fn send_discover(&mut self, to: Option<SocketAddr>) {
        let message = GameMessage::new(
            self.dispatcher.next_sequence(),
            self.self_id,
            UNASSIGNED,
            MessageBody::Discover,
        );
        let bytes = match protocol::encode(&message) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to encode discover: {}", e);
                return;
            }
        };
        let sent = match to {
            Some(addr) => self.transport.send_unicast(addr, &bytes).await,
            None => self.transport.send_multicast(&bytes).await,
        };
        match sent {
            Ok(()) => self.last_sent = Instant::now(),
            Err(e) => debug!("Discover not sent: {}", e),
        }
    }

    async fn send_ack(&self, message: &GameMessage, addr: SocketAddr) {
        let ack = message.ack_for(self.self_id, message.sender_id);
        match protocol::encode(&ack) {
            Ok(bytes) => self.send_bytes(addr, &bytes).await,
            Err(e) => error!("Failed to encode ack: {}", e),
        }
    }

    async fn send_tracked(&mut self, addr: SocketAddr, body: MessageBody) -> u64 {
        let seq = self.dispatcher.next_sequence();
        let message = GameMessage::new(seq, self.self_id, UNASSIGNED, body);
        match protocol::encode(&message) {
            Ok(bytes) => {
                self.send_bytes(addr, &bytes).await;
                self.dispatcher.track(addr, seq, bytes);
                self.last_sent = Instant::now();
            }
            Err(e) => error!("Failed to encode {}: {}", message.body.kind(), e),
        }
        seq
    }

    async fn send_bytes(&self, addr: SocketAddr, bytes: &[u8]) {
        if let Err(e) = self.transport.send_unicast(addr, bytes).await {
            debug!("Failed to send to {}: {}", addr, e);
        }
    }
}
