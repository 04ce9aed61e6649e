//! Loading recorded sessions and reconstructing the scene at any time
//!
//! A [`ReplayReconstructor`] keeps one display object per entity id ever seen.
//! Scrubbing blends positions between the two keyframes around the cursor and
//! toggles objects active or inactive; objects are never destroyed, so an id
//! keeps its identity across the whole replay.

use log::{debug, warn};
use shared::interp::{blend_factor, lerp_point};
use shared::{Color, EntityView, Record, RecordingStorage, Shape, SimulationState, Snapshot};
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::Path;

/// Size used for recorded entities that carry no usable width or height
pub const DEFAULT_OBJECT_SIZE: f32 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordingHeader {
    pub version: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedInput {
    pub t: f64,
    pub keys: Vec<i32>,
}

/// A parsed recording log
#[derive(Debug, Clone, Default)]
pub struct Recording {
    pub header: Option<RecordingHeader>,
    pub keyframes: Vec<Snapshot>,
    pub inputs: Vec<RecordedInput>,
    /// Lines that could not be parsed and were skipped
    pub skipped: usize,
}

impl Recording {
    pub fn parse<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut recording = Recording::default();

        for (number, line) in lines.into_iter().enumerate() {
            let line = line.as_ref().trim();
            if line.is_empty() {
                continue;
            }
            let record = match Record::parse(line) {
                Ok(record) => record,
                Err(e) => {
                    warn!("Skipping recording line {}: {}", number + 1, e);
                    recording.skipped += 1;
                    continue;
                }
            };

            match record {
                Record::Header { version, w, h } => {
                    recording.header = Some(RecordingHeader {
                        version,
                        width: w,
                        height: h,
                    });
                }
                Record::Input { t, keys } => recording.inputs.push(RecordedInput { t, keys }),
                frame @ (Record::Keyframe { .. } | Record::Broadcast { .. }) => {
                    match frame.into_snapshot() {
                        Ok(snapshot) => recording.keyframes.push(snapshot),
                        Err(e) => {
                            debug!("Skipping frame on line {}: {}", number + 1, e);
                            recording.skipped += 1;
                        }
                    }
                }
            }
        }

        recording
            .keyframes
            .sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        recording.inputs.sort_by(|a, b| a.t.total_cmp(&b.t));
        recording
    }

    pub fn load(storage: &dyn RecordingStorage, path: &Path) -> io::Result<Self> {
        let lines = storage.read_lines(path)?;
        let recording = Self::parse(lines);
        debug!(
            "Loaded {}: {} keyframes, {} inputs, {} skipped",
            path.display(),
            recording.keyframes.len(),
            recording.inputs.len(),
            recording.skipped
        );
        Ok(recording)
    }

    pub fn start_time(&self) -> f64 {
        self.keyframes.first().map(|k| k.timestamp).unwrap_or(0.0)
    }

    pub fn end_time(&self) -> f64 {
        self.keyframes.last().map(|k| k.timestamp).unwrap_or(0.0)
    }

    pub fn duration(&self) -> f64 {
        self.end_time() - self.start_time()
    }

    /// Input events with `from < t <= to`
    pub fn inputs_between(&self, from: f64, to: f64) -> impl Iterator<Item = &RecordedInput> {
        self.inputs.iter().filter(move |i| i.t > from && i.t <= to)
    }
}

/// One reconstructed display object
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayObject {
    pub id: String,
    pub x: f32,
    pub y: f32,
    pub color: Color,
    pub shape: Shape,
    pub width: f32,
    pub height: f32,
    pub active: bool,
}

fn display_size(value: f32) -> f32 {
    if value > 0.0 {
        value.max(1.0)
    } else {
        DEFAULT_OBJECT_SIZE
    }
}

impl ReplayObject {
    fn from_view(view: &EntityView) -> Self {
        let mut object = Self {
            id: view.id.clone(),
            x: view.x,
            y: view.y,
            color: view.color,
            shape: view.shape,
            width: DEFAULT_OBJECT_SIZE,
            height: DEFAULT_OBJECT_SIZE,
            active: false,
        };
        object.apply_visuals(view);
        object
    }

    fn apply_visuals(&mut self, view: &EntityView) {
        self.color = view.color;
        self.shape = view.shape;
        self.width = display_size(view.width);
        self.height = display_size(view.height);
    }

    pub fn to_view(&self) -> EntityView {
        EntityView::new(self.id.clone(), self.x, self.y)
            .with_color(self.color)
            .with_shape(self.shape, self.width, self.height)
    }
}

pub struct ReplayReconstructor {
    recording: Recording,
    objects: HashMap<String, ReplayObject>,
    cursor: f64,
}

impl ReplayReconstructor {
    pub fn new(recording: Recording) -> Self {
        let cursor = recording.start_time();
        let mut replay = Self {
            recording,
            objects: HashMap::new(),
            cursor,
        };
        replay.scrub(cursor);
        replay
    }

    pub fn recording(&self) -> &Recording {
        &self.recording
    }

    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn duration(&self) -> f64 {
        self.recording.duration()
    }

    pub fn is_finished(&self) -> bool {
        self.cursor >= self.recording.end_time()
    }

    /// Moves the cursor forward by `dt` seconds, stopping at the last keyframe
    pub fn advance(&mut self, dt: f64) {
        self.scrub(self.cursor + dt);
    }

    /// Rebuilds the scene at time `t`, clamped to the recorded range
    pub fn scrub(&mut self, t: f64) {
        let frames = &self.recording.keyframes;
        let (Some(first), Some(last)) = (frames.first(), frames.last()) else {
            self.cursor = 0.0;
            return;
        };

        let t = t.clamp(first.timestamp, last.timestamp);
        self.cursor = t;

        let (a, b) = frames
            .windows(2)
            .find(|pair| pair[0].timestamp <= t && t <= pair[1].timestamp)
            .map(|pair| (&pair[0], &pair[1]))
            .unwrap_or((first, last));
        let u = blend_factor(a.timestamp, b.timestamp, t);

        let later: HashMap<&str, &EntityView> =
            b.entities.iter().map(|e| (e.id.as_str(), e)).collect();
        let earlier: HashSet<&str> = a.entities.iter().map(|e| e.id.as_str()).collect();
        let mut present: HashSet<&str> = HashSet::new();

        for from in &a.entities {
            present.insert(from.id.as_str());
            let object = self
                .objects
                .entry(from.id.clone())
                .or_insert_with(|| ReplayObject::from_view(from));
            match later.get(from.id.as_str()) {
                Some(to) => {
                    let (x, y) = lerp_point((from.x, from.y), (to.x, to.y), u);
                    object.x = x;
                    object.y = y;
                    object.apply_visuals(to);
                }
                None => {
                    object.x = from.x;
                    object.y = from.y;
                    object.apply_visuals(from);
                }
            }
            object.active = true;
        }

        for to in b.entities.iter().filter(|e| !earlier.contains(e.id.as_str())) {
            present.insert(to.id.as_str());
            let object = self
                .objects
                .entry(to.id.clone())
                .or_insert_with(|| ReplayObject::from_view(to));
            object.x = to.x;
            object.y = to.y;
            object.apply_visuals(to);
            object.active = true;
        }

        for object in self.objects.values_mut() {
            if !present.contains(object.id.as_str()) {
                object.active = false;
            }
        }
    }

    /// Every object created so far, sorted by id
    pub fn objects(&self) -> Vec<&ReplayObject> {
        let mut objects: Vec<&ReplayObject> = self.objects.values().collect();
        objects.sort_by(|a, b| a.id.cmp(&b.id));
        objects
    }

    pub fn active_objects(&self) -> Vec<&ReplayObject> {
        self.objects().into_iter().filter(|o| o.active).collect()
    }

    pub fn object(&self, id: &str) -> Option<&ReplayObject> {
        self.objects.get(id)
    }

    /// The active objects as a snapshot at the cursor
    pub fn scene(&self) -> Snapshot {
        Snapshot::new(
            self.cursor,
            SimulationState::Playing,
            self.active_objects().iter().map(|o| o.to_view()).collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use shared::MemoryRecordingStorage;

    fn keyframe(t: f64, entities: &[(&str, f32, f32)]) -> String {
        let views: Vec<EntityView> = entities
            .iter()
            .map(|(id, x, y)| EntityView::new(*id, *x, *y))
            .collect();
        Record::keyframe(t, &views, 2).to_line().unwrap()
    }

    fn replay(lines: Vec<String>) -> ReplayReconstructor {
        ReplayReconstructor::new(Recording::parse(lines))
    }

    #[test]
    fn test_parse_full_recording() {
        let lines = vec![
            Record::header(800, 600).to_line().unwrap(),
            Record::input(0.05, &[32], 2).to_line().unwrap(),
            keyframe(0.1, &[("A", 1.0, 2.0)]),
            "{broken".to_string(),
            String::new(),
            keyframe(0.2, &[("A", 3.0, 4.0)]),
        ];
        let recording = Recording::parse(lines);

        assert_eq!(
            recording.header,
            Some(RecordingHeader {
                version: 1,
                width: 800,
                height: 600
            })
        );
        assert_eq!(recording.inputs.len(), 1);
        assert_eq!(recording.keyframes.len(), 2);
        assert_eq!(recording.skipped, 1);
        assert_approx_eq!(recording.duration(), 0.1, 1e-9);
    }

    #[test]
    fn test_keyframes_are_sorted() {
        let recording = Recording::parse(vec![
            keyframe(2.0, &[("A", 2.0, 0.0)]),
            keyframe(1.0, &[("A", 1.0, 0.0)]),
        ]);
        assert_eq!(recording.keyframes[0].timestamp, 1.0);
        assert_eq!(recording.keyframes[1].timestamp, 2.0);
    }

    #[test]
    fn test_load_from_storage() {
        let storage = MemoryRecordingStorage::new();
        storage
            .insert("rec.jsonl", vec![keyframe(0.0, &[("A", 0.0, 0.0)])])
            .unwrap();
        let recording = Recording::load(&storage, Path::new("rec.jsonl")).unwrap();
        assert_eq!(recording.keyframes.len(), 1);
        assert!(Recording::load(&storage, Path::new("missing.jsonl")).is_err());
    }

    #[test]
    fn test_inputs_between() {
        let recording = Recording::parse(vec![
            Record::input(0.1, &[1], 2).to_line().unwrap(),
            Record::input(0.2, &[2], 2).to_line().unwrap(),
            Record::input(0.3, &[3], 2).to_line().unwrap(),
        ]);
        let keys: Vec<i32> = recording
            .inputs_between(0.1, 0.3)
            .flat_map(|i| i.keys.clone())
            .collect();
        assert_eq!(keys, vec![2, 3]);
    }

    #[test]
    fn test_scrub_blends_positions() {
        let mut replay = replay(vec![
            keyframe(0.0, &[("A", 0.0, 0.0)]),
            keyframe(1.0, &[("A", 10.0, 20.0)]),
        ]);
        replay.scrub(0.25);
        let a = replay.object("A").unwrap();
        assert_approx_eq!(a.x, 2.5, 1e-5);
        assert_approx_eq!(a.y, 5.0, 1e-5);
        assert!(a.active);
    }

    #[test]
    fn test_identity_continuity_across_keyframes() {
        let mut replay = replay(vec![
            keyframe(0.0, &[("A", 0.0, 0.0)]),
            keyframe(1.0, &[("B", 5.0, 5.0)]),
        ]);

        replay.scrub(0.5);
        let a = replay.object("A").unwrap();
        let b = replay.object("B").unwrap();
        assert_eq!((a.x, a.y), (0.0, 0.0));
        assert_eq!((b.x, b.y), (5.0, 5.0));
        assert!(a.active && b.active);

        // Clamped to the last keyframe, which still brackets with the first
        replay.scrub(1.5);
        assert_eq!(replay.cursor(), 1.0);
        let a = replay.object("A").unwrap();
        let b = replay.object("B").unwrap();
        assert_eq!((a.x, a.y), (0.0, 0.0));
        assert_eq!((b.x, b.y), (5.0, 5.0));
        assert!(a.active && b.active);
        assert_eq!(replay.objects().len(), 2);
    }

    #[test]
    fn test_objects_outside_bracket_are_deactivated() {
        let mut replay = replay(vec![
            keyframe(0.0, &[("A", 0.0, 0.0)]),
            keyframe(1.0, &[("A", 1.0, 0.0)]),
            keyframe(2.0, &[("B", 0.0, 0.0)]),
            keyframe(3.0, &[("B", 1.0, 0.0)]),
        ]);

        replay.scrub(2.5);
        assert!(!replay.object("A").unwrap().active);
        assert!(replay.object("B").unwrap().active);
        assert_eq!(replay.active_objects().len(), 1);

        // Scrubbing back reuses the existing object for A
        replay.scrub(0.5);
        assert!(replay.object("A").unwrap().active);
        assert!(!replay.object("B").unwrap().active);
        assert_eq!(replay.objects().len(), 2);
    }

    #[test]
    fn test_single_keyframe() {
        let mut replay = replay(vec![keyframe(4.0, &[("A", 7.0, 8.0)])]);
        replay.scrub(0.0);
        assert_eq!(replay.cursor(), 4.0);
        let a = replay.object("A").unwrap();
        assert_eq!((a.x, a.y), (7.0, 8.0));
        assert!(replay.is_finished());
    }

    #[test]
    fn test_empty_recording() {
        let mut replay = replay(Vec::new());
        replay.scrub(3.0);
        replay.advance(1.0);
        assert!(replay.objects().is_empty());
        assert_eq!(replay.duration(), 0.0);
    }

    #[test]
    fn test_advance_stops_at_end() {
        let mut replay = replay(vec![
            keyframe(0.0, &[("A", 0.0, 0.0)]),
            keyframe(1.0, &[("A", 10.0, 0.0)]),
        ]);
        for _ in 0..30 {
            replay.advance(0.05);
        }
        assert_eq!(replay.cursor(), 1.0);
        assert!(replay.is_finished());
        assert_approx_eq!(replay.object("A").unwrap().x, 10.0, 1e-5);
    }

    #[test]
    fn test_visuals_come_from_later_keyframe() {
        let early = EntityView::new("A", 0.0, 0.0)
            .with_color(Color::new(1.0, 0.0, 0.0, 1.0))
            .with_shape(Shape::Circle, 0.0, -3.0);
        let late = EntityView::new("A", 4.0, 0.0)
            .with_color(Color::new(0.0, 1.0, 0.0, 1.0))
            .with_shape(Shape::Rectangle, 0.5, 44.0);
        let mut replay = replay(vec![
            Record::keyframe(0.0, &[early], 2).to_line().unwrap(),
            Record::keyframe(1.0, &[late], 2).to_line().unwrap(),
        ]);

        let a = replay.object("A").unwrap();
        // Created from the first keyframe, no usable size there
        assert_eq!(a.width, DEFAULT_OBJECT_SIZE);
        assert_eq!(a.height, DEFAULT_OBJECT_SIZE);

        replay.scrub(0.5);
        let a = replay.object("A").unwrap();
        assert_eq!(a.color, Color::new(0.0, 1.0, 0.0, 1.0));
        assert_eq!(a.shape, Shape::Rectangle);
        assert_eq!(a.width, 1.0);
        assert_eq!(a.height, 44.0);
    }

    #[test]
    fn test_scene_contains_active_objects() {
        let replay = replay(vec![keyframe(0.0, &[("A", 1.0, 1.0), ("B", 2.0, 2.0)])]);
        let scene = replay.scene();
        assert_eq!(scene.entities.len(), 2);
        assert_eq!(scene.entities[0].id, "A");
    }
}
