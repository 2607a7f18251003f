//! Master network layer: one select loop owning the socket, the session and
//! every timer.
//!
//! The loop never shares state with other tasks. Local input arrives as
//! [`MasterCommand`]s over a channel and rendered state leaves through a
//! [`UiSink`].

use crate::game::{JoinKind, JoinOutcome, MasterSession};
use crate::peers::PeerDirectory;
use log::{debug, error, info, warn};
use shared::dispatcher::Dispatcher;
use shared::protocol::{self, GameAnnouncement, MAX_DATAGRAM, UNASSIGNED};
use shared::transport::Transport;
use shared::{
    Direction, GameConfig, GameMessage, GameSnapshot, MessageBody, NetOptions, NodeRole,
    PlayerId, Result, Timings, UiSink,
};
use std::net::SocketAddr;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

/// Requests from the local player to its own Master loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterCommand {
    Steer(Direction),
    RespawnSelf,
    Stop,
}

/// Everything a Deputy hands over when it becomes Master.
#[derive(Debug, Clone)]
pub struct Handover {
    pub config: GameConfig,
    pub snapshot: GameSnapshot,
    pub self_id: PlayerId,
    /// Port the Deputy was reachable on; reused when still free.
    pub port: u16,
    /// Highest sequence number the Deputy ever sent.
    pub last_seq: u64,
}

pub struct MasterController {
    transport: Transport,
    dispatcher: Dispatcher,
    peers: PeerDirectory,
    session: MasterSession,
    timings: Timings,
    sink: UiSink,
    announce: bool,
    takeover: bool,
}

impl MasterController {
    /// Binds a socket and starts a fresh game hosted by `name`.
    pub async fn host(
        config: GameConfig,
        name: &str,
        options: NetOptions,
        sink: UiSink,
    ) -> Result<Self> {
        let transport = Transport::bind(options, true).await?;
        let session = MasterSession::new(config, name)?;
        Ok(Self::assemble(transport, session, PeerDirectory::new(), options, sink, false))
    }

    /// Rebuilds the session from a Deputy's last snapshot.
    pub async fn bootstrap(handover: Handover, options: NetOptions, sink: UiSink) -> Result<Self> {
        let transport = Transport::bind_preferring(options, handover.port, true).await?;
        let (session, peers) =
            MasterSession::bootstrap(handover.config, &handover.snapshot, handover.self_id);

        let mut controller = Self::assemble(transport, session, peers, options, sink, true);
        controller.dispatcher.resume_after(handover.last_seq);
        Ok(controller)
    }

    fn assemble(
        transport: Transport,
        session: MasterSession,
        peers: PeerDirectory,
        options: NetOptions,
        sink: UiSink,
        takeover: bool,
    ) -> Self {
        let timings = session.config().timings();
        Self {
            transport,
            dispatcher: Dispatcher::new(timings.retry_interval),
            peers,
            session,
            timings,
            sink,
            announce: options.multicast,
            takeover,
        }
    }

    pub fn local_address(&self) -> Result<SocketAddr> {
        Ok(self.transport.unicast_address()?)
    }

    pub fn local_id(&self) -> PlayerId {
        self.session.local_id()
    }

    /// Runs until [`MasterCommand::Stop`] arrives or the command channel
    /// closes. Peers are not notified; a Deputy takes over once it notices
    /// the silence.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<MasterCommand>) -> Result<()> {
        let mut tick_interval = interval(self.timings.tick);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut retry_interval = interval(self.timings.retry_interval);
        retry_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut timeout_interval = interval(self.timings.ping_interval);
        timeout_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut announce_interval = interval(self.timings.announce_interval);

        // Skip the first tick since it fires immediately
        tick_interval.tick().await;

        info!(
            "Master {} running on {}",
            self.session.local_id(),
            self.local_address()?
        );

        if self.takeover {
            self.announce_takeover().await;
        } else {
            self.sink.push_state(self.session.snapshot(&self.peers));
        }

        let mut buffer = vec![0u8; MAX_DATAGRAM];
        let mut multicast_buffer = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                received = self.transport.recv_unicast(&mut buffer) => {
                    match received {
                        Ok((len, addr)) => self.handle_datagram(&buffer[..len], addr).await,
                        // ICMP unreachable from a vanished peer surfaces here on some platforms
                        Err(e) => debug!("Error receiving datagram: {}", e),
                    }
                },

                received = self.transport.recv_multicast(&mut multicast_buffer) => {
                    match received {
                        Ok((len, addr)) => self.handle_datagram(&multicast_buffer[..len], addr).await,
                        Err(e) => {
                            warn!("Discovery receive failed: {}", e);
                            self.transport.disable_multicast();
                        }
                    }
                },

                command = commands.recv() => {
                    match command {
                        Some(MasterCommand::Steer(direction)) => self.session.steer_local(direction),
                        Some(MasterCommand::RespawnSelf) => {
                            if let Err(e) = self.session.respawn_local() {
                                warn!("Cannot respawn: {}", e);
                            }
                        }
                        Some(MasterCommand::Stop) | None => {
                            info!("Master shutting down");
                            break;
                        }
                    }
                },

                _ = tick_interval.tick() => self.on_tick().await,

                _ = retry_interval.tick() => self.resend_due().await,

                _ = timeout_interval.tick() => self.evict_silent_peers().await,

                _ = announce_interval.tick(), if self.announce => self.send_announcement(None).await,
            }
        }

        info!(
            "Master stopped at order {} ({} retries abandoned)",
            self.session.engine().state_order(),
            self.dispatcher.dropped()
        );
        self.transport.close();
        Ok(())
    }

    async fn handle_datagram(&mut self, data: &[u8], addr: SocketAddr) {
        let message = match protocol::decode(data) {
            Ok(message) => message,
            Err(e) => {
                debug!("Dropping malformed datagram from {}: {}", addr, e);
                return;
            }
        };
        self.peers.refresh(addr);

        match &message.body {
            MessageBody::Ack => {
                self.dispatcher.ack(addr, message.seq);
            }

            MessageBody::Join {
                player_name,
                requested_role,
            } => {
                let (player_name, requested_role) = (player_name.clone(), *requested_role);
                self.on_join(&message, addr, &player_name, requested_role).await;
            }

            MessageBody::Steer { direction } => {
                let accepted = self.session.buffer_steer(
                    &mut self.peers,
                    addr,
                    message.sender_id,
                    message.seq,
                    *direction,
                );
                if !accepted {
                    debug!("Steer {} from {} not applied", message.seq, addr);
                }
                self.send_ack(&message, addr).await;
            }

            MessageBody::RoleChange {
                sender_role: Some(NodeRole::Viewer),
                ..
            } => {
                self.send_ack(&message, addr).await;
                self.on_leave(addr).await;
            }

            MessageBody::RoleChange { .. } | MessageBody::Ping => {
                self.send_ack(&message, addr).await;
            }

            MessageBody::Discover => self.send_announcement(Some(addr)).await,

            MessageBody::Announcement { .. } => {}

            MessageBody::State(_) | MessageBody::Error { .. } => {
                self.send_ack(&message, addr).await;
                warn!("Unexpected {} from {}", message.body.kind(), addr);
            }
        }
    }

    async fn on_join(
        &mut self,
        message: &GameMessage,
        addr: SocketAddr,
        player_name: &str,
        requested_role: NodeRole,
    ) {
        match self
            .session
            .join(&mut self.peers, addr, player_name, requested_role)
        {
            JoinOutcome::Accepted { player_id, kind } => {
                let ack = message.ack_for(self.session.local_id(), player_id);
                self.send_untracked(addr, &ack).await;

                let snapshot = self.session.snapshot(&self.peers);
                let payload = snapshot.encode(self.session.config());
                self.send_tracked(addr, player_id, MessageBody::State(payload))
                    .await;

                if kind != JoinKind::Duplicate {
                    self.reassign_deputy().await;
                }
            }
            JoinOutcome::Rejected(reason) => {
                info!("Rejecting join from {}: {}", addr, reason);
                self.send_tracked(
                    addr,
                    UNASSIGNED,
                    MessageBody::Error {
                        message: reason.to_string(),
                    },
                )
                .await;
            }
        }
    }

    async fn on_leave(&mut self, addr: SocketAddr) {
        let Some(player_id) = self.peers.unbind(addr) else {
            return;
        };
        if self.session.demote_to_viewer(player_id) {
            info!("Player {} left the game", player_id);
            self.reassign_deputy().await;
        }
    }

    async fn on_tick(&mut self) {
        let outcome = self.session.tick();
        if !outcome.died.is_empty() {
            debug!("Died this tick: {:?}", outcome.died);
        }

        let snapshot = self.session.snapshot(&self.peers);
        let addrs = self.peers.addrs();
        if !addrs.is_empty() {
            let payload = snapshot.encode(self.session.config());
            let seq = self.dispatcher.next_sequence();
            let message = GameMessage::new(
                seq,
                self.session.local_id(),
                UNASSIGNED,
                MessageBody::State(payload),
            );
            match protocol::encode(&message) {
                Ok(bytes) => {
                    for addr in addrs {
                        self.send_bytes(addr, &bytes).await;
                        self.dispatcher.track(addr, seq, bytes.clone());
                    }
                }
                Err(e) => error!("Failed to encode state {}: {}", snapshot.order, e),
            }
        }

        self.sink.push_state(snapshot);
    }

    async fn resend_due(&mut self) {
        for (addr, bytes) in self.dispatcher.due_retries(Instant::now()) {
            self.send_bytes(addr, &bytes).await;
        }
    }

    async fn evict_silent_peers(&mut self) {
        let evicted = self.peers.check_timeouts(self.timings.node_timeout);
        if evicted.is_empty() {
            return;
        }

        for peer in evicted {
            let forgotten = self.dispatcher.forget(peer.addr);
            debug!("Forgot {} pending messages to {}", forgotten, peer.addr);
            if let Some(player_id) = peer.player_id {
                self.session.demote_to_viewer(player_id);
            }
        }
        self.reassign_deputy().await;
    }

    /// Appoints a new Deputy when needed and tells it so.
    async fn reassign_deputy(&mut self) {
        let Some(deputy) = self.session.select_deputy(&self.peers) else {
            return;
        };
        let Some(addr) = self.peers.addr_for(deputy) else {
            return;
        };
        self.send_tracked(
            addr,
            deputy,
            MessageBody::RoleChange {
                sender_role: Some(NodeRole::Master),
                receiver_role: Some(NodeRole::Deputy),
            },
        )
        .await;
    }

    /// Tells every known peer who the Master is now, then publishes a fresh
    /// state so nobody keeps steering towards the old address.
    async fn announce_takeover(&mut self) {
        for addr in self.peers.addrs() {
            let receiver = self.peers.player_for(addr).unwrap_or(UNASSIGNED);
            self.send_tracked(
                addr,
                receiver,
                MessageBody::RoleChange {
                    sender_role: Some(NodeRole::Master),
                    receiver_role: None,
                },
            )
            .await;
        }
        self.reassign_deputy().await;
        self.on_tick().await;
    }

    /// Multicasts the game, or answers a single `Discover` when `to` is set.
    async fn send_announcement(&mut self, to: Option<SocketAddr>) {
        let snapshot = self.session.snapshot(&self.peers);
        let announcement = GameAnnouncement {
            players: snapshot.players,
            config: *self.session.config(),
            can_join: self.session.can_join(),
            game_name: protocol::game_name_for_port(self.transport.unicast_port()),
        };
        let message = GameMessage::new(
            self.dispatcher.next_sequence(),
            self.session.local_id(),
            UNASSIGNED,
            MessageBody::Announcement {
                games: vec![announcement],
            },
        );
        let bytes = match protocol::encode(&message) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to encode announcement: {}", e);
                return;
            }
        };

        let sent = match to {
            Some(addr) => self.transport.send_unicast(addr, &bytes).await,
            None => self.transport.send_multicast(&bytes).await,
        };
        if let Err(e) = sent {
            debug!("Announcement not sent: {}", e);
        }
    }

    async fn send_ack(&self, message: &GameMessage, addr: SocketAddr) {
        let ack = message.ack_for(self.session.local_id(), message.sender_id);
        self.send_untracked(addr, &ack).await;
    }

    async fn send_untracked(&self, addr: SocketAddr, message: &GameMessage) {
        match protocol::encode(message) {
            Ok(bytes) => self.send_bytes(addr, &bytes).await,
            Err(e) => error!("Failed to encode {}: {}", message.body.kind(), e),
        }
    }

    async fn send_tracked(&mut self, addr: SocketAddr, receiver_id: PlayerId, body: MessageBody) {
        let seq = self.dispatcher.next_sequence();
        let message = GameMessage::new(seq, self.session.local_id(), receiver_id, body);
        match protocol::encode(&message) {
            Ok(bytes) => {
                self.send_bytes(addr, &bytes).await;
                self.dispatcher.track(addr, seq, bytes);
            }
            Err(e) => error!("Failed to encode {}: {}", message.body.kind(), e),
        }
    }

    async fn send_bytes(&self, addr: SocketAddr, bytes: &[u8]) {
        if let Err(e) = self.transport.send_unicast(addr, bytes).await {
            debug!("Failed to send to {}: {}", addr, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::ui_channels;
    use std::time::Duration;
    use tokio::net::UdpSocket;
    use tokio::time::timeout;
    use tokio_test::assert_ok;

    fn quiet_options() -> NetOptions {
        NetOptions {
            multicast: false,
            port: None,
        }
    }

    fn fast_config() -> GameConfig {
        GameConfig {
            state_delay_ms: 50,
            ..GameConfig::default()
        }
    }

    async fn recv_message(socket: &UdpSocket) -> GameMessage {
        let mut buffer = vec![0u8; MAX_DATAGRAM];
        let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buffer))
            .await
            .expect("timed out waiting for master")
            .unwrap();
        protocol::decode(&buffer[..len]).unwrap()
    }

    async fn spawn_master() -> (SocketAddr, mpsc::UnboundedSender<MasterCommand>) {
        let (sink, _feed) = ui_channels();
        let controller =
            assert_ok!(MasterController::host(fast_config(), "host", quiet_options(), sink).await);
        let port = controller.local_address().unwrap().port();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(controller.run(rx));
        (SocketAddr::from(([127, 0, 0, 1], port)), tx)
    }

    #[tokio::test]
    async fn test_join_is_acked_with_player_id_then_state() {
        let (master, stop) = spawn_master().await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let join = GameMessage::new(
            1,
            UNASSIGNED,
            UNASSIGNED,
            MessageBody::Join {
                player_name: "alice".into(),
                requested_role: NodeRole::Normal,
            },
        );
        socket
            .send_to(&protocol::encode(&join).unwrap(), master)
            .await
            .unwrap();

        let ack = recv_message(&socket).await;
        assert_eq!(ack.body, MessageBody::Ack);
        assert_eq!(ack.seq, 1);
        assert_eq!(ack.receiver_id, 2);

        let state = recv_message(&socket).await;
        match state.body {
            MessageBody::State(payload) => {
                assert!(payload.players.iter().any(|p| p.id == 2));
            }
            other => panic!("expected state, got {:?}", other),
        }

        stop.send(MasterCommand::Stop).unwrap();
    }

    async fn join_raw(socket: &UdpSocket, master: SocketAddr, name: &str) -> PlayerId {
        let join = GameMessage::new(
            1,
            UNASSIGNED,
            UNASSIGNED,
            MessageBody::Join {
                player_name: name.into(),
                requested_role: NodeRole::Normal,
            },
        );
        socket
            .send_to(&protocol::encode(&join).unwrap(), master)
            .await
            .unwrap();
        loop {
            let message = recv_message(socket).await;
            if message.body == MessageBody::Ack && message.seq == 1 {
                return message.receiver_id;
            }
        }
    }

    #[tokio::test]
    async fn test_silent_deputy_is_evicted_and_replaced() {
        let (master, stop) = spawn_master().await;
        let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let first_id = join_raw(&first, master, "first").await;
        let second_id = join_raw(&second, master, "second").await;
        assert_eq!((first_id, second_id), (2, 3));

        // `first` was appointed deputy and now goes quiet; `second` keeps
        // acknowledging everything it gets
        let deadline = Instant::now() + Duration::from_secs(5);
        let (mut demoted, mut appointed) = (false, false);
        while !(demoted && appointed) {
            assert!(Instant::now() < deadline, "eviction never happened");
            let message = recv_message(&second).await;
            if message.body.needs_ack() {
                let ack = message.ack_for(second_id, message.sender_id);
                second
                    .send_to(&protocol::encode(&ack).unwrap(), master)
                    .await
                    .unwrap();
            }

            match &message.body {
                MessageBody::State(payload) => {
                    let viewer = payload
                        .players
                        .iter()
                        .any(|p| p.id == first_id && p.role == NodeRole::Viewer && p.address.is_none());
                    let snakeless = payload.snakes.iter().all(|s| s.player_id != first_id);
                    demoted |= viewer && snakeless;
                }
                MessageBody::RoleChange {
                    sender_role,
                    receiver_role: Some(NodeRole::Deputy),
                } => {
                    assert_eq!(*sender_role, Some(NodeRole::Master));
                    assert_eq!(message.receiver_id, second_id);
                    appointed = true;
                }
                _ => {}
            }
        }

        stop.send(MasterCommand::Stop).unwrap();
    }

    #[tokio::test]
    async fn test_discover_is_answered_directly() {
        let (master, stop) = spawn_master().await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let discover = GameMessage::new(1, UNASSIGNED, UNASSIGNED, MessageBody::Discover);
        socket
            .send_to(&protocol::encode(&discover).unwrap(), master)
            .await
            .unwrap();

        match recv_message(&socket).await.body {
            MessageBody::Announcement { games } => {
                assert_eq!(games.len(), 1);
                assert!(games[0].can_join);
                assert_eq!(
                    protocol::parse_announced_port(&games[0].game_name),
                    Some(master.port())
                );
            }
            other => panic!("expected announcement, got {:?}", other),
        }

        stop.send(MasterCommand::Stop).unwrap();
    }

    #[tokio::test]
    async fn test_stop_ends_run() {
        let (sink, _feed) = ui_channels();
        let controller =
            assert_ok!(MasterController::host(fast_config(), "host", quiet_options(), sink).await);
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(controller.run(rx));

        tx.send(MasterCommand::Stop).unwrap();
        let result = timeout(Duration::from_secs(2), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }
}
