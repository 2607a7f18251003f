//! What a Normal node knows about the world: the games it has heard
//! announced and the latest state of the game it plays in.

use log::{debug, info};
use shared::protocol::{self, GameAnnouncement, StatePayload};
use shared::{GameConfig, GameListing, GameSnapshot, NodeRole, PlayerId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct DiscoveredGame {
    listing: GameListing,
    last_seen: Instant,
}

/// Games heard on the discovery group, keyed by the unicast address their
/// Master answers on.
#[derive(Debug)]
pub struct GameRegistry {
    games: HashMap<SocketAddr, DiscoveredGame>,
    expiry: Duration,
}

impl GameRegistry {
    pub fn new(expiry: Duration) -> Self {
        Self {
            games: HashMap::new(),
            expiry,
        }
    }

    /// Records an announcement heard from `source`.
    ///
    /// The game is keyed by the source ip and the port embedded in the game
    /// name, falling back to the source port. Returns whether the listing
    /// shown to the user changed.
    pub fn record(&mut self, source: SocketAddr, announcement: &GameAnnouncement) -> bool {
        self.record_at(source, announcement, Instant::now())
    }

    pub fn record_at(
        &mut self,
        source: SocketAddr,
        announcement: &GameAnnouncement,
        now: Instant,
    ) -> bool {
        if !announcement.config.is_valid() {
            debug!("Ignoring game with unusable config from {}", source);
            return false;
        }
        let port = protocol::parse_announced_port(&announcement.game_name).unwrap_or(source.port());
        let address = SocketAddr::new(source.ip(), port);
        let listing = GameListing {
            name: announcement.game_name.clone(),
            address,
            config: announcement.config,
            can_join: announcement.can_join,
            player_count: announcement.players.len(),
        };

        match self.games.get_mut(&address) {
            Some(known) => {
                known.last_seen = now;
                if known.listing == listing {
                    return false;
                }
                known.listing = listing;
            }
            None => {
                info!("Discovered game {} at {}", listing.name, address);
                self.games.insert(
                    address,
                    DiscoveredGame {
                        listing,
                        last_seen: now,
                    },
                );
            }
        }
        true
    }

    /// Forgets games not heard from within the expiry window.
    pub fn expire(&mut self, now: Instant) -> usize {
        let before = self.games.len();
        let expiry = self.expiry;
        self.games.retain(|address, game| {
            let alive = now.saturating_duration_since(game.last_seen) <= expiry;
            if !alive {
                debug!("Game at {} expired", address);
            }
            alive
        });
        before - self.games.len()
    }

    /// Listing sorted by name, then address, so indices stay stable while
    /// the set of games does not change.
    pub fn listing(&self) -> Vec<GameListing> {
        let mut games: Vec<GameListing> = self.games.values().map(|g| g.listing.clone()).collect();
        games.sort_by(|a, b| a.name.cmp(&b.name).then(a.address.cmp(&b.address)));
        games
    }

    pub fn get(&self, index: usize) -> Option<GameListing> {
        self.listing().into_iter().nth(index)
    }

    pub fn len(&self) -> usize {
        self.games.len()
    }

    pub fn is_empty(&self) -> bool {
        self.games.is_empty()
    }
}

/// The last accepted state of the joined game.
#[derive(Debug, Clone)]
pub struct SessionView {
    config: GameConfig,
    latest: Option<GameSnapshot>,
}

impl SessionView {
    pub fn new(config: GameConfig) -> Self {
        Self {
            config,
            latest: None,
        }
    }

    pub fn config(&self) -> &GameConfig {
        &self.config
    }

    pub fn latest(&self) -> Option<&GameSnapshot> {
        self.latest.as_ref()
    }

    pub fn last_order(&self) -> Option<u64> {
        self.latest.as_ref().map(|s| s.order)
    }

    /// Decodes and keeps `payload` if it is newer than anything applied so
    /// far. Stale and duplicate states return `None`.
    pub fn apply(&mut self, payload: &StatePayload) -> Option<&GameSnapshot> {
        if self.last_order().map_or(false, |order| payload.order <= order) {
            return None;
        }
        self.latest = Some(GameSnapshot::decode(payload, &self.config));
        self.latest.as_ref()
    }

    pub fn role_of(&self, player_id: PlayerId) -> Option<NodeRole> {
        self.latest.as_ref()?.player(player_id).map(|p| p.role)
    }

    /// Address of the Deputy as observed by the Master, unless it is us.
    pub fn deputy_address(&self, self_id: PlayerId) -> Option<SocketAddr> {
        let deputy = self.latest.as_ref()?.deputy()?;
        if deputy.id == self_id {
            return None;
        }
        deputy.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::PlayerInfo;

    fn announcement(name: &str, players: usize) -> GameAnnouncement {
        GameAnnouncement {
            players: (0..players)
                .map(|i| PlayerInfo {
                    id: i as PlayerId + 1,
                    name: format!("p{}", i),
                    role: NodeRole::Normal,
                    score: 0,
                    address: None,
                })
                .collect(),
            config: GameConfig::default(),
            can_join: true,
            game_name: name.to_string(),
        }
    }

    fn source(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 7], port))
    }

    fn payload(order: u64, players: Vec<PlayerInfo>) -> StatePayload {
        StatePayload {
            order,
            snakes: vec![],
            foods: vec![],
            players,
        }
    }

    fn info(id: PlayerId, role: NodeRole, port: u16) -> PlayerInfo {
        PlayerInfo {
            id,
            name: format!("p{}", id),
            role,
            score: 0,
            address: Some(SocketAddr::from(([127, 0, 0, 1], port))),
        }
    }

    #[test]
    fn test_announced_port_overrides_source_port() {
        let mut registry = GameRegistry::new(Duration::from_secs(3));
        assert!(registry.record(source(40000), &announcement("snakenet:5000", 1)));

        let games = registry.listing();
        assert_eq!(games.len(), 1);
        assert_eq!(games[0].address, source(5000));
        assert_eq!(games[0].player_count, 1);
    }

    #[test]
    fn test_unparseable_name_uses_source_port() {
        let mut registry = GameRegistry::new(Duration::from_secs(3));
        registry.record(source(40000), &announcement("somebody's game", 0));
        assert_eq!(registry.listing()[0].address, source(40000));
    }

    #[test]
    fn test_unusable_config_is_ignored() {
        let mut registry = GameRegistry::new(Duration::from_secs(3));
        let mut broken = announcement("snakenet:5000", 1);
        broken.config.width = 0;

        assert!(!registry.record(source(1), &broken));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_repeat_announcement_is_not_a_change() {
        let mut registry = GameRegistry::new(Duration::from_secs(3));
        registry.record(source(1), &announcement("snakenet:5000", 1));
        assert!(!registry.record(source(1), &announcement("snakenet:5000", 1)));
        assert!(registry.record(source(1), &announcement("snakenet:5000", 2)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_games_expire() {
        let mut registry = GameRegistry::new(Duration::from_secs(3));
        let start = Instant::now();
        registry.record_at(source(1), &announcement("snakenet:5000", 1), start);
        registry.record_at(source(1), &announcement("snakenet:6000", 1), start + Duration::from_secs(2));

        assert_eq!(registry.expire(start + Duration::from_secs(4)), 1);
        assert_eq!(registry.listing()[0].address, source(6000));
    }

    #[test]
    fn test_listing_is_sorted() {
        let mut registry = GameRegistry::new(Duration::from_secs(3));
        registry.record(source(1), &announcement("snakenet:7000", 0));
        registry.record(source(1), &announcement("snakenet:5000", 0));

        assert_eq!(registry.get(0).unwrap().address, source(5000));
        assert_eq!(registry.get(1).unwrap().address, source(7000));
        assert!(registry.get(2).is_none());
    }

    #[test]
    fn test_stale_states_are_not_applied() {
        let mut view = SessionView::new(GameConfig::default());
        assert!(view.apply(&payload(5, vec![])).is_some());
        assert!(view.apply(&payload(5, vec![])).is_none());
        assert!(view.apply(&payload(3, vec![])).is_none());
        assert!(view.apply(&payload(6, vec![])).is_some());
        assert_eq!(view.last_order(), Some(6));
    }

    #[test]
    fn test_deputy_address_excludes_self() {
        let mut view = SessionView::new(GameConfig::default());
        view.apply(&payload(
            1,
            vec![
                PlayerInfo {
                    address: None,
                    ..info(1, NodeRole::Master, 0)
                },
                info(2, NodeRole::Deputy, 6002),
                info(3, NodeRole::Normal, 6003),
            ],
        ));

        assert_eq!(view.deputy_address(3), Some(SocketAddr::from(([127, 0, 0, 1], 6002))));
        assert_eq!(view.deputy_address(2), None);
        assert_eq!(view.role_of(2), Some(NodeRole::Deputy));
        assert_eq!(view.role_of(9), None);
    }
}
