//! Integration tests for replicated sessions
//!
//! These tests run real Masters and Nodes against each other over localhost
//! UDP with discovery disabled.

use client::node::Node;
use server::network::{MasterCommand, MasterController};
use shared::protocol::{self, MAX_DATAGRAM, UNASSIGNED};
use shared::{
    ui_channels, Direction, GameConfig, GameMessage, GameSnapshot, MessageBody, NetOptions,
    NodeRole, PlayerId, UiFeed,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_test::assert_ok;

fn quiet_options() -> NetOptions {
    NetOptions {
        multicast: false,
        port: None,
    }
}

fn test_config() -> GameConfig {
    GameConfig {
        state_delay_ms: 100,
        ..GameConfig::default()
    }
}

/// Starts a Master and returns its loopback address, its command channel
/// and its own state feed.
async fn spawn_master() -> (SocketAddr, mpsc::UnboundedSender<MasterCommand>, UiFeed) {
    let (sink, feed) = ui_channels();
    let controller =
        assert_ok!(MasterController::host(test_config(), "host", quiet_options(), sink).await);
    let port = controller.local_address().unwrap().port();
    let (commands, rx) = mpsc::unbounded_channel();
    tokio::spawn(controller.run(rx));
    (SocketAddr::from(([127, 0, 0, 1], port)), commands, feed)
}

/// Drains `feed` until a state matches, or gives up after `limit`.
async fn wait_for_state<F>(feed: &mut UiFeed, limit: Duration, mut matches: F) -> Option<GameSnapshot>
where
    F: FnMut(&GameSnapshot) -> bool,
{
    let deadline = Instant::now() + limit;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, feed.states.recv()).await {
            Ok(Some(snapshot)) if matches(&snapshot) => return Some(snapshot),
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return None,
        }
    }
}

fn player_named(snapshot: &GameSnapshot, name: &str) -> Option<PlayerId> {
    snapshot
        .players
        .iter()
        .filter(|p| p.name == name && p.role != NodeRole::Viewer)
        .map(|p| p.id)
        .max()
}

/// SESSION TESTS
mod session_tests {
    use super::*;

    /// A joining node gets the next id and sees its own snake
    #[tokio::test]
    async fn join_assigns_id_and_replicates_state() {
        let (master, stop, _master_feed) = spawn_master().await;
        let (node, mut feed) = Node::start(quiet_options());
        node.join_addr(master, Some(test_config()), "alice").unwrap();

        let snapshot = wait_for_state(&mut feed, Duration::from_secs(5), |s| {
            player_named(s, "alice").is_some()
        })
        .await
        .expect("alice never appeared in a replicated state");

        let alice = player_named(&snapshot, "alice").unwrap();
        assert_eq!(alice, 2);
        assert_eq!(snapshot.master().map(|p| p.id), Some(1));
        assert!(snapshot.snake(alice).is_some());

        assert_ok!(node.stop().await);
        stop.send(MasterCommand::Stop).unwrap();
    }

    /// Joining without a config first learns it from the Master
    #[tokio::test]
    async fn join_without_config_asks_master() {
        let (master, stop, _master_feed) = spawn_master().await;
        let (node, mut feed) = Node::start(quiet_options());
        node.join_addr(master, None, "curious").unwrap();

        let snapshot = wait_for_state(&mut feed, Duration::from_secs(5), |s| {
            player_named(s, "curious").is_some()
        })
        .await;
        assert!(snapshot.is_some());

        assert_ok!(node.stop().await);
        stop.send(MasterCommand::Stop).unwrap();
    }

    /// A repeated Join from the same address is acknowledged with the same id
    #[tokio::test]
    async fn repeated_join_is_idempotent() {
        let (master, stop, mut master_feed) = spawn_master().await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut buffer = vec![0u8; MAX_DATAGRAM];

        let mut assigned = Vec::new();
        for seq in [1, 2] {
            let join = GameMessage::new(
                seq,
                UNASSIGNED,
                UNASSIGNED,
                MessageBody::Join {
                    player_name: "twice".into(),
                    requested_role: NodeRole::Normal,
                },
            );
            socket
                .send_to(&protocol::encode(&join).unwrap(), master)
                .await
                .unwrap();

            loop {
                let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buffer))
                    .await
                    .expect("no reply to join")
                    .unwrap();
                let reply = protocol::decode(&buffer[..len]).unwrap();
                if reply.body == MessageBody::Ack && reply.seq == seq {
                    assigned.push(reply.receiver_id);
                    break;
                }
            }
        }
        assert_eq!(assigned, vec![2, 2]);

        let snapshot = wait_for_state(&mut master_feed, Duration::from_secs(2), |s| {
            s.player(2).is_some()
        })
        .await
        .unwrap();
        assert_eq!(snapshot.players.len(), 2);
        assert_eq!(snapshot.snakes.len(), 2);

        stop.send(MasterCommand::Stop).unwrap();
    }

    /// Steering from a Normal turns its snake on the Master
    #[tokio::test]
    async fn steer_reaches_master() {
        let (master, stop, _master_feed) = spawn_master().await;
        let (node, mut feed) = Node::start(quiet_options());
        node.join_addr(master, Some(test_config()), "steerer").unwrap();

        let snapshot = wait_for_state(&mut feed, Duration::from_secs(5), |s| {
            player_named(s, "steerer").map_or(false, |id| s.snake(id).is_some())
        })
        .await
        .unwrap();
        let id = player_named(&snapshot, "steerer").unwrap();
        let heading = snapshot.snake(id).unwrap().heading;
        let turn = Direction::ALL
            .into_iter()
            .find(|d| *d != heading && *d != heading.opposite())
            .unwrap();

        node.steer(turn).unwrap();

        let turned = wait_for_state(&mut feed, Duration::from_secs(5), |s| {
            s.snake(id).map_or(false, |snake| snake.heading == turn)
        })
        .await;
        assert!(turned.is_some(), "snake {} never turned {:?}", id, turn);

        assert_ok!(node.stop().await);
        stop.send(MasterCommand::Stop).unwrap();
    }

    /// Leaving turns the old player into a Viewer and rejoins with a new id
    #[tokio::test]
    async fn leave_and_respawn_rejoins_with_new_id() {
        let (master, stop, mut master_feed) = spawn_master().await;
        let (node, mut feed) = Node::start(quiet_options());
        node.join_addr(master, Some(test_config()), "leaver").unwrap();

        let first = wait_for_state(&mut feed, Duration::from_secs(5), |s| {
            player_named(s, "leaver").is_some()
        })
        .await
        .unwrap();
        let old_id = player_named(&first, "leaver").unwrap();

        node.leave_and_respawn().unwrap();

        let after = wait_for_state(&mut master_feed, Duration::from_secs(5), |s| {
            player_named(s, "leaver").map_or(false, |id| id != old_id)
        })
        .await
        .expect("node never rejoined");

        let new_id = player_named(&after, "leaver").unwrap();
        assert!(new_id > old_id);
        assert!(after.snake(new_id).is_some());
        assert!(after.snake(old_id).is_none());
        assert_eq!(after.player(old_id).map(|p| p.role), Some(NodeRole::Viewer));

        assert_ok!(node.stop().await);
        stop.send(MasterCommand::Stop).unwrap();
    }
}

/// FAILOVER TESTS
mod failover_tests {
    use super::*;

    /// Tests the full takeover: the Master goes silent, its Deputy promotes
    /// itself and the remaining Normal follows the new Master's states
    #[tokio::test]
    async fn deputy_takes_over_silent_master() {
        let (master, stop, mut master_feed) = spawn_master().await;

        let (deputy, mut deputy_feed) = Node::start(quiet_options());
        deputy.join_addr(master, Some(test_config()), "deputy").unwrap();
        wait_for_state(&mut deputy_feed, Duration::from_secs(5), |s| {
            player_named(s, "deputy").is_some()
        })
        .await
        .expect("deputy never joined");

        let (normal, mut normal_feed) = Node::start(quiet_options());
        normal.join_addr(master, Some(test_config()), "normal").unwrap();

        let settled = wait_for_state(&mut master_feed, Duration::from_secs(5), |s| {
            let deputy_id = player_named(s, "deputy");
            deputy_id.is_some()
                && s.deputy().map(|p| p.id) == deputy_id
                && player_named(s, "normal").is_some()
        })
        .await
        .expect("deputy was never appointed");
        let deputy_id = player_named(&settled, "deputy").unwrap();

        // Let both nodes see a state carrying the deputy before cutting over
        let seen = wait_for_state(&mut normal_feed, Duration::from_secs(5), |s| {
            s.deputy().map(|p| p.id) == Some(deputy_id)
        })
        .await
        .expect("normal never learned the deputy");
        wait_for_state(&mut deputy_feed, Duration::from_secs(5), |s| {
            s.deputy().map(|p| p.id) == Some(deputy_id)
        })
        .await
        .expect("deputy never saw its own appointment");

        stop.send(MasterCommand::Stop).unwrap();
        let before = seen.order;

        let promoted = wait_for_state(&mut deputy_feed, Duration::from_secs(10), |s| {
            s.master().map(|p| p.id) == Some(deputy_id)
        })
        .await
        .expect("deputy never promoted itself");
        assert!(promoted.snake(deputy_id).is_some());
        assert_ne!(promoted.player(1).map(|p| p.role), Some(NodeRole::Master));

        let followed = wait_for_state(&mut normal_feed, Duration::from_secs(10), |s| {
            s.order > before && s.master().map(|p| p.id) == Some(deputy_id)
        })
        .await
        .expect("normal never followed the new master");
        assert!(player_named(&followed, "normal").is_some());

        assert_ok!(normal.stop().await);
        assert_ok!(deputy.stop().await);
    }

    /// Stopping a Node that hosts a game shuts its Master down cleanly
    #[tokio::test]
    async fn hosting_node_stops_cleanly() {
        let (node, mut feed) = Node::start(quiet_options());
        node.host_with("solo", test_config()).unwrap();

        let snapshot = wait_for_state(&mut feed, Duration::from_secs(5), |s| s.order >= 2)
            .await
            .unwrap();
        assert_eq!(snapshot.master().map(|p| p.name.as_str()), Some("solo"));

        let stopped = timeout(Duration::from_secs(2), node.stop()).await;
        assert!(matches!(stopped, Ok(Ok(()))));
    }
}
