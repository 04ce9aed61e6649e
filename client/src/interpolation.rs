//! Time-ordered buffer of received snapshots, sampled slightly in the past
//!
//! Rendering at `now - INTERP_DELAY` keeps the sample time between two
//! received frames most of the time, so motion is blended instead of jumping
//! from frame to frame.

use log::debug;
use shared::interp::{blend_factor, lerp_point};
use shared::{EntityView, SimulationState, Snapshot};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

pub use shared::interp::EPSILON;

/// Frames older than this, relative to the newest, are evicted (seconds)
pub const MAX_AGE: f64 = 2.0;
/// How far behind the wall clock rendering samples (seconds)
pub const INTERP_DELAY: f64 = 0.120;

pub type SharedBuffer = Arc<Mutex<InterpolationBuffer>>;

#[derive(Debug, Clone)]
pub struct InterpolationBuffer {
    frames: VecDeque<Snapshot>,
    max_age: f64,
    delay: f64,
}

impl Default for InterpolationBuffer {
    fn default() -> Self {
        Self::with_timing(MAX_AGE, INTERP_DELAY)
    }
}

impl InterpolationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timing(max_age: f64, delay: f64) -> Self {
        Self {
            frames: VecDeque::new(),
            max_age,
            delay,
        }
    }

    pub fn shared() -> SharedBuffer {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    pub fn delay(&self) -> f64 {
        self.delay
    }

    pub fn latest_state(&self) -> Option<SimulationState> {
        self.frames.back().map(|f| f.state)
    }

    pub fn newest_timestamp(&self) -> Option<f64> {
        self.frames.back().map(|f| f.timestamp)
    }

    /// Appends a snapshot and evicts stale ones. Snapshots older than the
    /// newest buffered frame are rejected.
    pub fn push(&mut self, snapshot: Snapshot) -> bool {
        if let Some(newest) = self.frames.back() {
            if snapshot.timestamp < newest.timestamp {
                debug!(
                    "Rejecting out-of-order snapshot ({:.3} < {:.3})",
                    snapshot.timestamp, newest.timestamp
                );
                return false;
            }
        }

        let pushed_at = snapshot.timestamp;
        self.frames.push_back(snapshot);
        while let Some(oldest) = self.frames.front() {
            if pushed_at - oldest.timestamp > self.max_age {
                self.frames.pop_front();
            } else {
                break;
            }
        }
        true
    }

    /// Scene as it looked `delay` seconds before `now`
    pub fn sample(&self, now: f64) -> Option<Snapshot> {
        self.sample_at(now - self.delay)
    }

    /// Blends the two frames bracketing `target`. Before the first frame or
    /// after the last, the nearest frame is returned as-is.
    pub fn sample_at(&self, target: f64) -> Option<Snapshot> {
        let mut a = self.frames.front()?;
        let mut b = self.frames.back()?;
        for frame in &self.frames {
            if frame.timestamp <= target {
                a = frame;
            } else {
                b = frame;
                break;
            }
        }

        let u = blend_factor(a.timestamp, b.timestamp, target);
        let later: HashMap<&str, &EntityView> =
            b.entities.iter().map(|e| (e.id.as_str(), e)).collect();

        let entities = a
            .entities
            .iter()
            .filter_map(|from| {
                let to = later.get(from.id.as_str())?;
                let (x, y) = lerp_point((from.x, from.y), (to.x, to.y), u);
                Some(EntityView {
                    x,
                    y,
                    ..from.clone()
                })
            })
            .collect();

        Some(Snapshot::new(target, a.state, entities))
    }
}
