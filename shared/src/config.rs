//! Session configuration and the protocol timings derived from it.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_WIDTH: i32 = 40;
pub const DEFAULT_HEIGHT: i32 = 30;
pub const DEFAULT_FOOD_STATIC: u32 = 1;
pub const DEFAULT_STATE_DELAY_MS: u64 = 200;

/// Attempts a tracked message gets before it is dropped.
pub const RETRY_BUDGET: u32 = 10;
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1);
/// Announce intervals a discovered game may miss before it is forgotten.
pub const GAME_EXPIRY_INTERVALS: u32 = 3;
pub const MAX_NAME_LEN: usize = 32;

/// Board and tick parameters of a session, carried in every announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameConfig {
    pub width: i32,
    pub height: i32,
    pub food_static: u32,
    pub state_delay_ms: u64,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            food_static: DEFAULT_FOOD_STATIC,
            state_delay_ms: DEFAULT_STATE_DELAY_MS,
        }
    }
}

impl GameConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.state_delay_ms.max(1))
    }

    pub fn timings(&self) -> Timings {
        Timings::from_config(self)
    }

    /// Whether a board can be built from this config. Configs heard from
    /// the network are checked before anything is sized by them.
    pub fn is_valid(&self) -> bool {
        self.width >= 1 && self.height >= 1
    }
}

/// Every timer a node runs, scaled to the session tick.
///
/// A Deputy always gives up on a silent Master before an ordinary Normal
/// does, so that by the time Normals start looking for a new center the
/// Deputy has usually announced itself already.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub tick: Duration,
    pub retry_interval: Duration,
    pub ping_interval: Duration,
    /// Master evicts peers silent for longer than this.
    pub node_timeout: Duration,
    pub deputy_timeout: Duration,
    pub normal_timeout: Duration,
    pub handover_grace: Duration,
    pub no_deputy_grace: Duration,
    pub announce_interval: Duration,
    pub game_expiry: Duration,
}

impl Timings {
    pub fn from_config(config: &GameConfig) -> Self {
        let delay = config.state_delay_ms.max(1);
        let tenth = Duration::from_millis((delay / 10).max(1));
        let deputy_timeout = Duration::from_millis(delay * 8 / 10).max(Duration::from_millis(150));
        let handover_grace = Duration::from_millis(delay * 5).max(Duration::from_secs(1));

        Self {
            tick: config.tick(),
            retry_interval: tenth,
            ping_interval: tenth,
            node_timeout: Duration::from_millis(delay * 8 / 10).max(Duration::from_millis(300)),
            deputy_timeout,
            normal_timeout: deputy_timeout * 2,
            handover_grace,
            no_deputy_grace: handover_grace * 2,
            announce_interval: ANNOUNCE_INTERVAL,
            game_expiry: ANNOUNCE_INTERVAL * GAME_EXPIRY_INTERVALS,
        }
    }
}

/// Socket-level options of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetOptions {
    /// Join the discovery group and send announcements.
    pub multicast: bool,
    /// Unicast port to bind; `None` lets the OS choose.
    pub port: Option<u16>,
}

impl Default for NetOptions {
    fn default() -> Self {
        Self {
            multicast: true,
            port: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GameConfig::default();
        assert_eq!(config.width, 40);
        assert_eq!(config.height, 30);
        assert_eq!(config.food_static, 1);
        assert_eq!(config.state_delay_ms, 200);
    }

    #[test]
    fn test_retry_interval_is_tenth_of_tick() {
        let timings = GameConfig::default().timings();
        assert_eq!(timings.retry_interval, Duration::from_millis(20));
        assert_eq!(timings.ping_interval, Duration::from_millis(20));
    }

    #[test]
    fn test_retry_interval_never_zero() {
        let config = GameConfig {
            state_delay_ms: 5,
            ..GameConfig::default()
        };
        assert_eq!(config.timings().retry_interval, Duration::from_millis(1));
    }

    #[test]
    fn test_empty_board_is_invalid() {
        assert!(GameConfig::default().is_valid());
        for (width, height) in [(0, 30), (40, 0), (-3, 10)] {
            let config = GameConfig {
                width,
                height,
                ..GameConfig::default()
            };
            assert!(!config.is_valid());
        }
    }

    #[test]
    fn test_deputy_gives_up_before_normal() {
        for delay in [10, 100, 200, 1000, 3000] {
            let config = GameConfig {
                state_delay_ms: delay,
                ..GameConfig::default()
            };
            let timings = config.timings();
            assert!(timings.deputy_timeout < timings.normal_timeout);
            assert!(timings.handover_grace < timings.no_deputy_grace);
        }
    }
}
