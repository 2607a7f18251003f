//! Address book of the Master: who is reachable where, and since when.
//!
//! This module tracks every remote node the Master talks to:
//! - the player id bound to each address (at most one per address, and at
//!   most one address per player)
//! - the last time any datagram arrived from the address
//! - the highest steer sequence accepted from the address, so redelivered
//!   steers cannot override newer ones
//!
//! Peers are keyed by `SocketAddr`; two sockets on the same host are two
//! peers.

use log::info;
use shared::PlayerId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct Peer {
    pub addr: SocketAddr,
    pub player_id: Option<PlayerId>,
    /// Last time we received any packet from this peer
    pub last_seen: Instant,
    /// Highest steer sequence applied for this peer
    pub last_steer_seq: u64,
}

impl Peer {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            player_id: None,
            last_seen: Instant::now(),
            last_steer_seq: 0,
        }
    }

    /// Checks if the peer has exceeded the liveness timeout
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }

    /// Accepts a steer sequence only if it is newer than every steer seen
    /// from this peer so far.
    pub fn accept_steer(&mut self, seq: u64) -> bool {
        if seq <= self.last_steer_seq {
            return false;
        }
        self.last_steer_seq = seq;
        true
    }
}

#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: HashMap<SocketAddr, Peer>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records activity from `addr`, creating the peer on first contact.
    pub fn touch(&mut self, addr: SocketAddr) -> &mut Peer {
        let peer = self.peers.entry(addr).or_insert_with(|| Peer::new(addr));
        peer.last_seen = Instant::now();
        peer
    }

    /// Records activity from `addr` only if it is already known.
    pub fn refresh(&mut self, addr: SocketAddr) -> bool {
        match self.peers.get_mut(&addr) {
            Some(peer) => {
                peer.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, addr: SocketAddr) -> Option<&Peer> {
        self.peers.get(&addr)
    }

    pub fn get_mut(&mut self, addr: SocketAddr) -> Option<&mut Peer> {
        self.peers.get_mut(&addr)
    }

    pub fn player_for(&self, addr: SocketAddr) -> Option<PlayerId> {
        self.peers.get(&addr).and_then(|p| p.player_id)
    }

    pub fn addr_for(&self, player_id: PlayerId) -> Option<SocketAddr> {
        self.peers
            .values()
            .find(|p| p.player_id == Some(player_id))
            .map(|p| p.addr)
    }

    /// Binds `player_id` to `addr`, releasing any other address that held it.
    pub fn bind(&mut self, addr: SocketAddr, player_id: PlayerId) {
        for peer in self.peers.values_mut() {
            if peer.player_id == Some(player_id) && peer.addr != addr {
                peer.player_id = None;
            }
        }
        self.touch(addr).player_id = Some(player_id);
    }

    /// Detaches the player from `addr`, keeping the address as a peer.
    pub fn unbind(&mut self, addr: SocketAddr) -> Option<PlayerId> {
        self.peers.get_mut(&addr).and_then(|p| p.player_id.take())
    }

    pub fn remove(&mut self, addr: SocketAddr) -> Option<Peer> {
        self.peers.remove(&addr)
    }

    /// Removes and returns every peer silent for longer than `timeout`.
    pub fn check_timeouts(&mut self, timeout: Duration) -> Vec<Peer> {
        let timed_out: Vec<SocketAddr> = self
            .peers
            .values()
            .filter(|peer| peer.is_timed_out(timeout))
            .map(|peer| peer.addr)
            .collect();

        timed_out
            .into_iter()
            .filter_map(|addr| self.peers.remove(&addr))
            .inspect(|peer| info!("Peer {} timed out (player {:?})", peer.addr, peer.player_id))
            .collect()
    }

    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.peers.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
