//! Demo simulation that feeds the relay: two teams wandering a grid
//!
//! Units pick a random grid cell, walk to it, and pick another. Each unit has a
//! limited lifetime; when it expires the unit disappears and a fresh one with
//! a new id spawns elsewhere, so observers see entities come and go. A single
//! avatar is steered by the most recent observer input.

use crate::recording::SceneSource;
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::{Color, EntityView, Shape, SimulationState, Snapshot, GRID_SIZE};

pub const UNIT_SPEED: f32 = 80.0;
pub const AVATAR_SPEED: f32 = 160.0;
pub const AVATAR_ID: &str = "Avatar#1";
const ARRIVE_DISTANCE: f32 = 1.0;

/// Arrow key codes recorded for observer steering
pub const KEY_LEFT: i32 = 37;
pub const KEY_UP: i32 = 38;
pub const KEY_RIGHT: i32 = 39;
pub const KEY_DOWN: i32 = 40;
/// Steering components smaller than this press no key
const STEER_DEAD_ZONE: f32 = 0.1;

/// Arrow keys equivalent to a steering direction, y pointing down
pub fn steering_keys(vx: f32, vy: f32) -> Vec<i32> {
    let mut keys = Vec::new();
    if vx <= -STEER_DEAD_ZONE {
        keys.push(KEY_LEFT);
    } else if vx >= STEER_DEAD_ZONE {
        keys.push(KEY_RIGHT);
    }
    if vy <= -STEER_DEAD_ZONE {
        keys.push(KEY_UP);
    } else if vy >= STEER_DEAD_ZONE {
        keys.push(KEY_DOWN);
    }
    keys
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Team {
    Heroes,
    Imps,
}

impl Team {
    fn prefix(&self) -> &'static str {
        match self {
            Team::Heroes => "Hero",
            Team::Imps => "Imp",
        }
    }

    fn color(&self) -> Color {
        match self {
            Team::Heroes => Color::new(0.9, 0.3, 0.2, 1.0),
            Team::Imps => Color::new(0.4, 0.2, 0.8, 1.0),
        }
    }

    fn shape(&self) -> (Shape, f32) {
        match self {
            Team::Heroes => (Shape::Rectangle, 30.0),
            Team::Imps => (Shape::Circle, 24.0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Unit {
    pub id: String,
    pub team: Team,
    pub x: f32,
    pub y: f32,
    pub target: (f32, f32),
    /// Seconds left before the unit despawns
    pub ttl: f32,
}

impl Unit {
    fn view(&self) -> EntityView {
        let (shape, size) = self.team.shape();
        EntityView::new(self.id.clone(), self.x, self.y)
            .with_color(self.team.color())
            .with_shape(shape, size, size)
    }
}

#[derive(Debug, Clone)]
pub struct ArenaConfig {
    pub width: u32,
    pub height: u32,
    pub units_per_team: usize,
    /// Lifetime range in seconds for wandering units
    pub lifetime: (f32, f32),
    pub seed: Option<u64>,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            width: shared::WORLD_WIDTH,
            height: shared::WORLD_HEIGHT,
            units_per_team: 6,
            lifetime: (5.0, 15.0),
            seed: None,
        }
    }
}

pub struct Arena {
    config: ArenaConfig,
    rng: StdRng,
    units: Vec<Unit>,
    avatar: (f32, f32),
    avatar_velocity: (f32, f32),
    /// Per-team id counters; ids are never reused
    next_ids: [u64; 2],
    pub tick: u64,
    pub state: SimulationState,
}

impl Arena {
    pub fn new(config: ArenaConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let avatar = (config.width as f32 / 2.0, config.height as f32 / 2.0);
        let mut arena = Self {
            config,
            rng,
            units: Vec::new(),
            avatar,
            avatar_velocity: (0.0, 0.0),
            next_ids: [0, 0],
            tick: 0,
            state: SimulationState::Playing,
        };
        for _ in 0..arena.config.units_per_team {
            arena.spawn(Team::Heroes);
            arena.spawn(Team::Imps);
        }
        arena
    }

    pub fn units(&self) -> &[Unit] {
        &self.units
    }

    pub fn avatar(&self) -> (f32, f32) {
        self.avatar
    }

    /// Normalized steering direction; components are clamped to [-1, 1]
    pub fn set_avatar_velocity(&mut self, vx: f32, vy: f32) {
        self.avatar_velocity = (vx.clamp(-1.0, 1.0), vy.clamp(-1.0, 1.0));
    }

    fn random_cell(&mut self) -> (f32, f32) {
        let cols = ((self.config.width as f32 / GRID_SIZE) as u32).max(1);
        let rows = ((self.config.height as f32 / GRID_SIZE) as u32).max(1);
        let col = self.rng.gen_range(0..cols);
        let row = self.rng.gen_range(0..rows);
        (col as f32 * GRID_SIZE, row as f32 * GRID_SIZE)
    }

    fn spawn(&mut self, team: Team) {
        let slot = match team {
            Team::Heroes => 0,
            Team::Imps => 1,
        };
        self.next_ids[slot] += 1;
        let id = format!("{}#{}", team.prefix(), self.next_ids[slot]);
        let (x, y) = self.random_cell();
        let target = self.random_cell();
        let (min, max) = self.config.lifetime;
        let ttl = if max > min {
            self.rng.gen_range(min..max)
        } else {
            min
        };
        debug!("Spawned {} at ({}, {})", id, x, y);
        self.units.push(Unit {
            id,
            team,
            x,
            y,
            target,
            ttl,
        });
    }

    pub fn step(&mut self, dt: f32) {
        self.tick += 1;

        let mut retargets = Vec::new();
        for (idx, unit) in self.units.iter_mut().enumerate() {
            unit.ttl -= dt;
            let dx = unit.target.0 - unit.x;
            let dy = unit.target.1 - unit.y;
            let distance = (dx * dx + dy * dy).sqrt();
            let reach = UNIT_SPEED * dt;
            if distance <= reach.max(ARRIVE_DISTANCE) {
                unit.x = unit.target.0;
                unit.y = unit.target.1;
                retargets.push(idx);
            } else {
                unit.x += dx / distance * reach;
                unit.y += dy / distance * reach;
            }
        }
        for idx in retargets {
            let target = self.random_cell();
            self.units[idx].target = target;
        }

        let mut expired = Vec::new();
        self.units.retain(|unit| {
            if unit.ttl <= 0.0 {
                expired.push(unit.team);
                false
            } else {
                true
            }
        });
        for team in expired {
            self.spawn(team);
        }

        let max_x = (self.config.width as f32 - GRID_SIZE).max(0.0);
        let max_y = (self.config.height as f32 - GRID_SIZE).max(0.0);
        let (vx, vy) = self.avatar_velocity;
        self.avatar.0 = (self.avatar.0 + vx * AVATAR_SPEED * dt).clamp(0.0, max_x);
        self.avatar.1 = (self.avatar.1 + vy * AVATAR_SPEED * dt).clamp(0.0, max_y);
    }

    pub fn snapshot(&self, timestamp: f64) -> Snapshot {
        Snapshot::new(timestamp, self.state, self.active_entities())
    }
}

impl SceneSource for Arena {
    fn active_entities(&self) -> Vec<EntityView> {
        let mut views: Vec<EntityView> = self.units.iter().map(Unit::view).collect();
        views.push(
            EntityView::new(AVATAR_ID, self.avatar.0, self.avatar.1)
                .with_color(Color::new(1.0, 0.85, 0.1, 1.0))
                .with_shape(Shape::Rectangle, 34.0, 34.0),
        );
        views
    }

    fn simulation_state(&self) -> SimulationState {
        self.state
    }
}
