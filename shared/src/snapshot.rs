//! Absolute game snapshots and their delta-coded wire form.
//!
//! On the wire a snake is its head followed by one offset per further cell,
//! each the shortest step around the torus from the previous cell. Decoding
//! accumulates the offsets and wraps them back onto the board, so any
//! snake, including one crossing an edge, comes back cell for cell.

use crate::config::GameConfig;
use crate::engine::{Cell, Direction};
use crate::protocol::{Coord, NodeRole, PlayerId, PlayerInfo, StatePayload, WireSnake};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnakeView {
    pub player_id: PlayerId,
    /// Head first.
    pub cells: Vec<Cell>,
    pub heading: Direction,
}

/// One authoritative tick as seen by every node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameSnapshot {
    pub order: u64,
    pub snakes: Vec<SnakeView>,
    pub foods: Vec<Cell>,
    pub players: Vec<PlayerInfo>,
}

impl GameSnapshot {
    pub fn player(&self, id: PlayerId) -> Option<&PlayerInfo> {
        self.players.iter().find(|p| p.id == id)
    }

    pub fn snake(&self, id: PlayerId) -> Option<&SnakeView> {
        self.snakes.iter().find(|s| s.player_id == id)
    }

    pub fn master(&self) -> Option<&PlayerInfo> {
        self.players.iter().find(|p| p.role == NodeRole::Master)
    }

    pub fn deputy(&self) -> Option<&PlayerInfo> {
        self.players.iter().find(|p| p.role == NodeRole::Deputy)
    }

    pub fn encode(&self, config: &GameConfig) -> StatePayload {
        let foods: BTreeSet<Cell> = self.foods.iter().copied().collect();

        StatePayload {
            order: self.order,
            snakes: self
                .snakes
                .iter()
                .map(|snake| WireSnake {
                    player_id: snake.player_id,
                    points: encode_points(&snake.cells, config),
                    heading: snake.heading,
                })
                .collect(),
            foods: foods.into_iter().map(Coord::from).collect(),
            players: self.players.clone(),
        }
    }

    pub fn decode(payload: &StatePayload, config: &GameConfig) -> Self {
        let foods: BTreeSet<Cell> = payload
            .foods
            .iter()
            .map(|c| Cell::wrapped(c.x, c.y, config.width, config.height))
            .collect();

        Self {
            order: payload.order,
            snakes: payload
                .snakes
                .iter()
                .map(|snake| SnakeView {
                    player_id: snake.player_id,
                    cells: decode_points(&snake.points, config),
                    heading: snake.heading,
                })
                .collect(),
            foods: foods.into_iter().collect(),
            players: payload.players.clone(),
        }
    }
}

/// Shortest signed step from `from` to `to` on a ring of `size` cells.
fn torus_delta(from: i32, to: i32, size: i32) -> i32 {
    let delta = (to - from).rem_euclid(size);
    if delta > size / 2 {
        delta - size
    } else {
        delta
    }
}

fn encode_points(cells: &[Cell], config: &GameConfig) -> Vec<Coord> {
    let mut points = Vec::with_capacity(cells.len());
    let mut previous: Option<Cell> = None;

    for cell in cells {
        let point = match previous {
            None => Coord::from(*cell),
            Some(prev) => Coord {
                x: torus_delta(prev.x, cell.x, config.width),
                y: torus_delta(prev.y, cell.y, config.height),
            },
        };
        points.push(point);
        previous = Some(*cell);
    }

    points
}

/// `from + offset` brought back onto a ring of `size` cells. Offsets come
/// off the wire and may be anything, so the sum is taken in 64 bits.
fn step_on_ring(from: i32, offset: i32, size: i32) -> i32 {
    (i64::from(from) + i64::from(offset)).rem_euclid(i64::from(size)) as i32
}

fn decode_points(points: &[Coord], config: &GameConfig) -> Vec<Cell> {
    let mut cells = Vec::with_capacity(points.len());
    let mut iter = points.iter();

    let Some(head) = iter.next() else {
        return cells;
    };
    let mut current = Cell::wrapped(head.x, head.y, config.width, config.height);
    cells.push(current);

    for offset in iter {
        current = Cell::new(
            step_on_ring(current.x, offset.x, config.width),
            step_on_ring(current.y, offset.y, config.height),
        );
        cells.push(current);
    }

    cells
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::protocol::{decode, encode, GameMessage, MessageBody};

    fn config() -> GameConfig {
        GameConfig {
            width: 10,
            height: 8,
            food_static: 2,
            state_delay_ms: 100,
        }
    }

    fn crossing_snake() -> SnakeView {
        SnakeView {
            player_id: 3,
            cells: vec![
                Cell::new(0, 7),
                Cell::new(0, 0),
                Cell::new(9, 0),
                Cell::new(8, 0),
                Cell::new(8, 1),
            ],
            heading: Direction::Up,
        }
    }

    #[test]
    fn test_points_are_offsets_after_head() {
        let points = encode_points(&crossing_snake().cells, &config());
        assert_eq!(points[0], Coord { x: 0, y: 7 });
        assert_eq!(points[1], Coord { x: 0, y: 1 });
        assert_eq!(points[2], Coord { x: -1, y: 0 });
        assert_eq!(points[3], Coord { x: -1, y: 0 });
        assert_eq!(points[4], Coord { x: 0, y: 1 });
    }

    #[test]
    fn test_decode_wraps_accumulated_offsets() {
        let points = vec![
            Coord { x: 9, y: 0 },
            Coord { x: 1, y: 0 },
            Coord { x: 0, y: -1 },
        ];
        let cells = decode_points(&points, &config());
        assert_eq!(cells, vec![Cell::new(9, 0), Cell::new(0, 0), Cell::new(0, 7)]);
    }

    #[test]
    fn test_decode_survives_extreme_offsets() {
        let points = vec![
            Coord { x: 5, y: 5 },
            Coord { x: i32::MAX, y: 0 },
            Coord { x: i32::MIN, y: i32::MIN },
        ];
        let cells = decode_points(&points, &config());
        assert_eq!(cells.len(), 3);
        for cell in cells {
            assert!((0..10).contains(&cell.x));
            assert!((0..8).contains(&cell.y));
        }
    }

    #[test]
    fn test_snapshot_roundtrip_through_datagram() {
        let snapshot = GameSnapshot {
            order: 41,
            snakes: vec![crossing_snake()],
            foods: vec![Cell::new(5, 5), Cell::new(1, 2), Cell::new(5, 5)],
            players: vec![],
        };

        let message = GameMessage::new(1, 1, 0, MessageBody::State(snapshot.encode(&config())));
        let bytes = encode(&message).unwrap();
        let MessageBody::State(payload) = decode(&bytes).unwrap().body else {
            panic!("expected a State message");
        };
        let decoded = GameSnapshot::decode(&payload, &config());

        assert_eq!(decoded.order, 41);
        assert_eq!(decoded.snakes, snapshot.snakes);
        let expected: BTreeSet<Cell> = snapshot.foods.iter().copied().collect();
        let actual: BTreeSet<Cell> = decoded.foods.iter().copied().collect();
        assert_eq!(actual, expected);
        assert_eq!(decoded.foods.len(), 2, "food is deduplicated");
    }

    #[test]
    fn test_engine_snapshot_roundtrip() {
        let mut engine = Engine::with_seed(config(), 21);
        for id in 1..=2 {
            if let Some(spawn) = engine.find_spawn() {
                engine.add_snake(id, spawn).unwrap();
            }
        }
        for _ in 0..25 {
            engine.step();
        }

        let snapshot = GameSnapshot {
            order: engine.state_order(),
            snakes: engine.snake_views(),
            foods: engine.food().iter().copied().collect(),
            players: vec![],
        };
        let decoded = GameSnapshot::decode(&snapshot.encode(&config()), &config());

        assert_eq!(decoded.snakes, snapshot.snakes);
        assert_eq!(decoded.foods, snapshot.foods);
    }

    #[test]
    fn test_role_lookup() {
        let player = |id, role| PlayerInfo {
            id,
            name: format!("p{}", id),
            role,
            score: 0,
            address: None,
        };
        let snapshot = GameSnapshot {
            order: 1,
            snakes: vec![],
            foods: vec![],
            players: vec![
                player(1, NodeRole::Master),
                player(2, NodeRole::Normal),
                player(3, NodeRole::Deputy),
            ],
        };
        assert_eq!(snapshot.master().map(|p| p.id), Some(1));
        assert_eq!(snapshot.deputy().map(|p| p.id), Some(3));
        assert_eq!(snapshot.player(2).map(|p| p.role), Some(NodeRole::Normal));
    }
}
