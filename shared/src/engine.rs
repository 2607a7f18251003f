//! Authoritative torus-grid simulation.
//!
//! The engine owns every snake, score and food cell of a session and is only
//! ever driven by the Master. One call to [`Engine::step`] is one tick; the
//! outcome is fully determined by the current state, the buffered headings
//! and the engine's random generator, so a seeded engine replays exactly.

use crate::config::GameConfig;
use crate::error::{Result, SnakeError};
use crate::protocol::PlayerId;
use crate::snapshot::{GameSnapshot, SnakeView};
use log::debug;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

/// Probability that a cell of a dead snake turns into food.
pub const DEATH_FOOD_PROBABILITY: f64 = 0.5;
/// Half side of the square that must be clear around a spawn point.
const SPAWN_RADIUS: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cell {
    pub x: i32,
    pub y: i32,
}

impl Cell {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Brings arbitrary coordinates back onto a `width` x `height` torus.
    pub fn wrapped(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x: x.rem_euclid(width),
            y: y.rem_euclid(height),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::Up,
        Direction::Down,
        Direction::Left,
        Direction::Right,
    ];

    pub fn opposite(self) -> Self {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
            Direction::Left => Direction::Right,
            Direction::Right => Direction::Left,
        }
    }

    /// Unit offset of one move; `Up` decreases `y`.
    pub fn offset(self) -> (i32, i32) {
        match self {
            Direction::Up => (0, -1),
            Direction::Down => (0, 1),
            Direction::Left => (-1, 0),
            Direction::Right => (1, 0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snake {
    pub player_id: PlayerId,
    /// Head first.
    pub cells: VecDeque<Cell>,
    pub heading: Direction,
    pub alive: bool,
}

impl Snake {
    pub fn new(player_id: PlayerId, cells: impl IntoIterator<Item = Cell>, heading: Direction) -> Self {
        Self {
            player_id,
            cells: cells.into_iter().collect(),
            heading,
            alive: true,
        }
    }

    pub fn head(&self) -> Option<Cell> {
        self.cells.front().copied()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// What happened during one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepOutcome {
    /// Players whose snake died this tick.
    pub died: Vec<PlayerId>,
}

pub struct Engine {
    config: GameConfig,
    rng: StdRng,
    state_order: u64,
    snakes: BTreeMap<PlayerId, Snake>,
    scores: BTreeMap<PlayerId, u32>,
    food: BTreeSet<Cell>,
}

impl Engine {
    pub fn new(config: GameConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    pub fn with_seed(config: GameConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: GameConfig, rng: StdRng) -> Self {
        let mut engine = Self {
            config,
            rng,
            state_order: 0,
            snakes: BTreeMap::new(),
            scores: BTreeMap::new(),
            food: BTreeSet::new(),
        };
        engine.ensure_food();
        engine
    }

    /// Rebuilds an engine from a received snapshot.
    ///
    /// Snake positions, headings, food and the scores carried by the player
    /// list are taken over as-is; the next [`step`](Self::step) continues
    /// the order sequence of the snapshot.
    pub fn restore(config: GameConfig, snapshot: &GameSnapshot) -> Self {
        let mut engine = Self {
            config,
            rng: StdRng::from_entropy(),
            state_order: snapshot.order,
            snakes: BTreeMap::new(),
            scores: BTreeMap::new(),
            food: BTreeSet::new(),
        };

        for view in &snapshot.snakes {
            let cells = view
                .cells
                .iter()
                .map(|c| Cell::wrapped(c.x, c.y, config.width, config.height));
            engine.insert_snake(Snake::new(view.player_id, cells, view.heading));
        }
        for player in &snapshot.players {
            if engine.snakes.contains_key(&player.id) {
                engine.scores.insert(player.id, player.score);
            }
        }

        let occupied = engine.occupied();
        engine.food = snapshot
            .foods
            .iter()
            .map(|c| Cell::wrapped(c.x, c.y, config.width, config.height))
            .filter(|c| !occupied.contains_key(c))
            .collect();
        engine.ensure_food();
        engine
    }

    pub fn config(&self) -> &GameConfig {
        &self.config
    }

    pub fn state_order(&self) -> u64 {
        self.state_order
    }

    /// Moves the order counter forward without simulating.
    pub fn skip_orders(&mut self, count: u64) {
        self.state_order = self.state_order.saturating_add(count);
    }

    pub fn snake(&self, player_id: PlayerId) -> Option<&Snake> {
        self.snakes.get(&player_id)
    }

    pub fn snakes(&self) -> impl Iterator<Item = &Snake> {
        self.snakes.values()
    }

    pub fn is_alive(&self, player_id: PlayerId) -> bool {
        self.snakes.get(&player_id).map_or(false, |s| s.alive)
    }

    pub fn alive_count(&self) -> usize {
        self.snakes.values().filter(|s| s.alive).count()
    }

    pub fn score(&self, player_id: PlayerId) -> u32 {
        self.scores.get(&player_id).copied().unwrap_or(0)
    }

    pub fn set_score(&mut self, player_id: PlayerId, score: u32) {
        self.scores.insert(player_id, score);
    }

    pub fn food(&self) -> &BTreeSet<Cell> {
        &self.food
    }

    fn wrap(&self, x: i32, y: i32) -> Cell {
        Cell::wrapped(x, y, self.config.width, self.config.height)
    }

    fn neighbor(&self, cell: Cell, direction: Direction) -> Cell {
        let (dx, dy) = direction.offset();
        self.wrap(cell.x + dx, cell.y + dy)
    }

    /// Cells covered by live snakes.
    fn occupied(&self) -> HashMap<Cell, PlayerId> {
        self.snakes
            .values()
            .filter(|s| s.alive)
            .flat_map(|s| s.cells.iter().map(move |c| (*c, s.player_id)))
            .collect()
    }

    /// Picks a spawn center whose 5x5 neighbourhood holds no snake cell.
    ///
    /// Candidates are visited in random order and the first fit wins, so
    /// successive joiners do not pile up in one corner.
    pub fn find_spawn(&mut self) -> Option<Cell> {
        let occupied = self.occupied();
        let mut candidates: Vec<Cell> = (0..self.config.height)
            .flat_map(|y| (0..self.config.width).map(move |x| Cell::new(x, y)))
            .collect();
        candidates.shuffle(&mut self.rng);

        candidates.into_iter().find(|center| {
            (-SPAWN_RADIUS..=SPAWN_RADIUS).all(|dy| {
                (-SPAWN_RADIUS..=SPAWN_RADIUS)
                    .all(|dx| !occupied.contains_key(&self.wrap(center.x + dx, center.y + dy)))
            })
        })
    }

    /// Places a two-cell snake with its head on `center`.
    ///
    /// The tail goes on a free neighbouring cell and the snake heads away
    /// from it. Any food under the head or the tail is removed.
    pub fn add_snake(&mut self, player_id: PlayerId, center: Cell) -> Result<()> {
        if self.is_alive(player_id) {
            return Err(SnakeError::SnakeExists(player_id));
        }

        let center = self.wrap(center.x, center.y);
        let occupied = self.occupied();
        if occupied.contains_key(&center) {
            return Err(SnakeError::NoSpawnSpace);
        }

        let mut tail_sides = Direction::ALL;
        tail_sides.shuffle(&mut self.rng);
        let (tail, tail_side) = tail_sides
            .iter()
            .map(|side| (self.neighbor(center, *side), *side))
            .find(|(cell, _)| !occupied.contains_key(cell))
            .ok_or(SnakeError::NoSpawnSpace)?;

        self.food.remove(&center);
        self.food.remove(&tail);
        self.snakes.insert(
            player_id,
            Snake::new(player_id, [center, tail], tail_side.opposite()),
        );
        self.scores.insert(player_id, 0);
        debug!("Spawned snake {} at ({}, {})", player_id, center.x, center.y);

        self.ensure_food();
        Ok(())
    }

    /// Inserts a snake exactly as given, replacing any previous one.
    pub fn insert_snake(&mut self, snake: Snake) {
        for cell in &snake.cells {
            self.food.remove(cell);
        }
        self.scores.entry(snake.player_id).or_insert(0);
        self.snakes.insert(snake.player_id, snake);
    }

    pub fn remove_snake(&mut self, player_id: PlayerId) -> bool {
        self.scores.remove(&player_id);
        self.snakes.remove(&player_id).is_some()
    }

    /// Changes the heading used by the next step. Reversing onto the
    /// snake's own neck is ignored.
    pub fn steer(&mut self, player_id: PlayerId, direction: Direction) {
        if let Some(snake) = self.snakes.get_mut(&player_id) {
            if snake.alive && direction != snake.heading.opposite() {
                snake.heading = direction;
            }
        }
    }

    pub fn step(&mut self) -> StepOutcome {
        self.state_order += 1;

        let alive: Vec<PlayerId> = self
            .snakes
            .values()
            .filter(|s| s.alive)
            .map(|s| s.player_id)
            .collect();

        // New heads, and who lands on food.
        let mut new_heads = BTreeMap::new();
        for id in &alive {
            let snake = &self.snakes[id];
            if let Some(head) = snake.head() {
                new_heads.insert(*id, self.neighbor(head, snake.heading));
            }
        }
        let grown: BTreeSet<PlayerId> = new_heads
            .iter()
            .filter(|(_, head)| self.food.contains(head))
            .map(|(id, _)| *id)
            .collect();

        for (id, head) in &new_heads {
            let Some(snake) = self.snakes.get_mut(id) else {
                continue;
            };
            snake.cells.push_front(*head);
            if grown.contains(id) {
                self.food.remove(head);
                *self.scores.entry(*id).or_insert(0) += 1;
            } else {
                snake.cells.pop_back();
            }
        }

        let (dead, bonus) = self.resolve_collisions(&alive);

        let mut dead_cells = BTreeSet::new();
        for id in &dead {
            if let Some(snake) = self.snakes.get_mut(id) {
                snake.alive = false;
                dead_cells.extend(snake.cells.drain(..));
            }
        }

        for (victim, amount) in bonus {
            if let Some(snake) = self.snakes.get_mut(&victim) {
                if !snake.alive {
                    continue;
                }
                *self.scores.entry(victim).or_insert(0) += amount;
                for _ in 0..amount {
                    if let Some(tail) = snake.cells.back().copied() {
                        snake.cells.push_back(tail);
                    }
                }
            }
        }

        let occupied = self.occupied();
        for cell in dead_cells {
            if !occupied.contains_key(&cell) && self.rng.gen_bool(DEATH_FOOD_PROBABILITY) {
                self.food.insert(cell);
            }
        }

        self.ensure_food();

        StepOutcome {
            died: dead.into_iter().collect(),
        }
    }

    /// Returns the snakes killed this tick and the growth owed to victims
    /// whose body was hit.
    fn resolve_collisions(&self, alive: &[PlayerId]) -> (BTreeSet<PlayerId>, BTreeMap<PlayerId, u32>) {
        let mut occupancy: HashMap<Cell, Vec<(PlayerId, usize)>> = HashMap::new();
        for id in alive {
            for (index, cell) in self.snakes[id].cells.iter().enumerate() {
                occupancy.entry(*cell).or_default().push((*id, index));
            }
        }

        let mut dead = BTreeSet::new();
        let mut bonus: BTreeMap<PlayerId, u32> = BTreeMap::new();

        for id in alive {
            let Some(head) = self.snakes[id].head() else {
                continue;
            };
            let occupants = occupancy.get(&head).map(Vec::as_slice).unwrap_or(&[]);

            let heads_here = occupants.iter().filter(|(_, index)| *index == 0).count();
            if heads_here > 1 {
                dead.insert(*id);
                continue;
            }

            if occupants.iter().any(|(owner, index)| owner == id && *index > 0) {
                dead.insert(*id);
                continue;
            }

            if let Some((victim, _)) = occupants.iter().find(|(owner, _)| owner != id) {
                dead.insert(*id);
                *bonus.entry(*victim).or_insert(0) += 1;
            }
        }

        (dead, bonus)
    }

    /// Tops food up to `food_static` plus one per live snake, sampling
    /// uniformly from the cells that are neither snake nor food.
    fn ensure_food(&mut self) {
        let need = self.config.food_static as usize + self.alive_count();
        if self.food.len() >= need {
            return;
        }

        let occupied = self.occupied();
        let free: Vec<Cell> = (0..self.config.height)
            .flat_map(|y| (0..self.config.width).map(move |x| Cell::new(x, y)))
            .filter(|c| !occupied.contains_key(c) && !self.food.contains(c))
            .collect();

        let missing = need - self.food.len();
        let placed: Vec<Cell> = free
            .choose_multiple(&mut self.rng, missing)
            .copied()
            .collect();
        self.food.extend(placed);
    }

    /// Live snakes in wire-ready form.
    pub fn snake_views(&self) -> Vec<SnakeView> {
        self.snakes
            .values()
            .filter(|s| s.alive)
            .map(|s| SnakeView {
                player_id: s.player_id,
                cells: s.cells.iter().copied().collect(),
                heading: s.heading,
            })
            .collect()
    }
}
