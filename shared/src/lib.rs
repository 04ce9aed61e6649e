//! Data model and text protocol shared by the relay server and its observers.
//!
//! Everything that crosses a thread, socket, or file boundary lives here: the
//! immutable [`Snapshot`] captured once per broadcast tick, the line-oriented
//! wire/recording records in [`protocol`], the blend math both the live
//! interpolation buffer and the replay reconstructor use in [`interp`], and
//! the durable-storage boundary in [`storage`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod interp;
pub mod protocol;
pub mod storage;

pub use protocol::{ControlFrame, ProtocolError, Record};
pub use storage::{FileRecordingStorage, MemoryRecordingStorage, RecordingStorage};

pub const WORLD_WIDTH: u32 = 800;
pub const WORLD_HEIGHT: u32 = 600;
pub const GRID_SIZE: f32 = 40.0;
pub const DEFAULT_PORT: u16 = 7777;

/// Format version written into every recording header.
pub const RECORDING_VERSION: u32 = 1;

/// High-level phase of the simulation, carried on every broadcast frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SimulationState {
    #[default]
    Playing,
    Menu,
    Victory,
    Defeat,
}

impl SimulationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SimulationState::Playing => "PLAYING",
            SimulationState::Menu => "MENU",
            SimulationState::Victory => "VICTORY",
            SimulationState::Defeat => "DEFEAT",
        }
    }
}

impl fmt::Display for SimulationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Shape {
    #[default]
    Rectangle,
    Circle,
}

/// RGBA color, serialized as a `[r, g, b, a]` array.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub const WHITE: Color = Color::new(1.0, 1.0, 1.0, 1.0);

    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }
}

impl Default for Color {
    fn default() -> Self {
        Color::WHITE
    }
}

impl From<[f32; 4]> for Color {
    fn from([r, g, b, a]: [f32; 4]) -> Self {
        Color { r, g, b, a }
    }
}

impl From<Color> for [f32; 4] {
    fn from(color: Color) -> Self {
        [color.r, color.g, color.b, color.a]
    }
}

/// One entity's identity, position and visual attributes within a snapshot.
///
/// `id` is the join key for interpolation and replay. It must stay stable for
/// the lifetime of the simulated entity and must not be handed to a different
/// entity afterwards, otherwise observers draw a motion trail between the two.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityView {
    pub id: String,
    pub x: f32,
    pub y: f32,
    pub color: Color,
    pub shape: Shape,
    pub width: f32,
    pub height: f32,
}

impl EntityView {
    pub fn new(id: impl Into<String>, x: f32, y: f32) -> Self {
        Self {
            id: id.into(),
            x,
            y,
            color: Color::WHITE,
            shape: Shape::Rectangle,
            width: 0.0,
            height: 0.0,
        }
    }

    pub fn with_color(mut self, color: Color) -> Self {
        self.color = color;
        self
    }

    pub fn with_shape(mut self, shape: Shape, width: f32, height: f32) -> Self {
        self.shape = shape;
        self.width = width;
        self.height = height;
        self
    }
}

/// Timestamped capture of every active entity. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Seconds. Live frames use wall-clock seconds since the UNIX epoch,
    /// recorded frames use seconds since the recording started.
    pub timestamp: f64,
    pub state: SimulationState,
    pub entities: Vec<EntityView>,
}

impl Snapshot {
    pub fn new(timestamp: f64, state: SimulationState, entities: Vec<EntityView>) -> Self {
        Self {
            timestamp,
            state,
            entities,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn entity(&self, id: &str) -> Option<&EntityView> {
        self.entities.iter().find(|e| e.id == id)
    }
}

/// Wall-clock time in fractional seconds since the UNIX epoch
pub fn unix_time_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs_f64()
}
