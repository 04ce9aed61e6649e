//! Session recorder: header, input events and periodic keyframes
//!
//! The simulation thread calls [`Recorder::update`] once per tick. Lines are
//! handed to a dedicated writer thread over a bounded queue, so a slow disk
//! costs recorded frames, never simulation time.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, error, info, warn};
use shared::storage::DEFAULT_RECORDING_DIR;
use shared::{EntityView, Record, RecordingStorage, SimulationState};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("failed to open recording {path}: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("failed to spawn recording writer: {0}")]
    Spawn(io::Error),
}

/// What the recorder captures keyframes from
pub trait SceneSource {
    fn active_entities(&self) -> Vec<EntityView>;

    fn simulation_state(&self) -> SimulationState {
        SimulationState::Playing
    }
}

/// Key codes pressed since the previous tick
pub trait InputSource {
    fn just_pressed(&self) -> Vec<i32>;
}

pub struct NoInput;

impl InputSource for NoInput {
    fn just_pressed(&self) -> Vec<i32> {
        Vec::new()
    }
}

impl InputSource for Vec<i32> {
    fn just_pressed(&self) -> Vec<i32> {
        self.clone()
    }
}

#[derive(Debug, Clone)]
pub struct RecordingConfig {
    /// Seconds between keyframes
    pub keyframe_interval: f64,
    pub queue_capacity: usize,
    pub output_path: PathBuf,
    pub quantize_decimals: u32,
    /// Seconds after start before the first keyframe
    pub warmup: f64,
    pub join_timeout: Duration,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        Self {
            keyframe_interval: 0.1,
            queue_capacity: 1000,
            output_path: PathBuf::from(DEFAULT_RECORDING_DIR)
                .join(format!("session_{}.jsonl", millis)),
            quantize_decimals: 2,
            warmup: 0.1,
            join_timeout: Duration::from_millis(500),
        }
    }
}

impl RecordingConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: path.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordingStats {
    pub enqueued: u64,
    pub written: u64,
    pub dropped: u64,
    pub writer_failed: bool,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    written: AtomicU64,
    dropped: AtomicU64,
    writer_failed: AtomicBool,
}

/// Closes storage and signals completion however the writer thread exits
struct WriterGuard {
    storage: Arc<dyn RecordingStorage>,
    done: Sender<()>,
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        if let Err(e) = self.storage.close_writer() {
            warn!("Failed to close recording: {}", e);
        }
        let _ = self.done.send(());
    }
}

fn write_loop(
    storage: Arc<dyn RecordingStorage>,
    lines: Receiver<String>,
    counters: Arc<Counters>,
    done: Sender<()>,
) {
    let guard = WriterGuard { storage, done };
    for line in lines.iter() {
        if let Err(e) = guard.storage.write_line(&line) {
            error!("Recording write failed, stopping writer: {}", e);
            counters.writer_failed.store(true, Ordering::Release);
            return;
        }
        counters.written.fetch_add(1, Ordering::Relaxed);
    }
    debug!("Recording queue closed, writer exiting");
}

pub struct Recorder {
    config: RecordingConfig,
    storage: Arc<dyn RecordingStorage>,
    counters: Arc<Counters>,
    queue: Option<Sender<String>>,
    writer: Option<(JoinHandle<()>, Receiver<()>)>,
    elapsed: f64,
    since_keyframe: f64,
}

impl Recorder {
    pub fn new(config: RecordingConfig, storage: Arc<dyn RecordingStorage>) -> Self {
        Self {
            config,
            storage,
            counters: Arc::new(Counters::default()),
            queue: None,
            writer: None,
            elapsed: 0.0,
            since_keyframe: 0.0,
        }
    }

    pub fn config(&self) -> &RecordingConfig {
        &self.config
    }

    pub fn is_recording(&self) -> bool {
        self.queue.is_some()
    }

    /// Seconds recorded so far
    pub fn elapsed(&self) -> f64 {
        self.elapsed
    }

    pub fn stats(&self) -> RecordingStats {
        RecordingStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            written: self.counters.written.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            writer_failed: self.counters.writer_failed.load(Ordering::Acquire),
        }
    }

    /// Opens storage, starts the writer thread and writes the header.
    /// Does nothing while already recording.
    pub fn start(&mut self, width: u32, height: u32) -> Result<(), RecordingError> {
        if self.is_recording() {
            return Ok(());
        }

        let path = self.config.output_path.clone();
        self.storage
            .open_writer(&path)
            .map_err(|source| RecordingError::Open {
                path: path.clone(),
                source,
            })?;

        let (line_tx, line_rx) = bounded(self.config.queue_capacity.max(1));
        let (done_tx, done_rx) = bounded(1);
        let storage = Arc::clone(&self.storage);
        let counters = Arc::clone(&self.counters);

        let handle = thread::Builder::new()
            .name("recording-writer".to_string())
            .spawn(move || write_loop(storage, line_rx, counters, done_tx));
        let handle = match handle {
            Ok(handle) => handle,
            Err(e) => {
                let _ = self.storage.close_writer();
                return Err(RecordingError::Spawn(e));
            }
        };

        self.queue = Some(line_tx);
        self.writer = Some((handle, done_rx));
        self.elapsed = 0.0;
        self.since_keyframe = 0.0;
        self.enqueue(&Record::header(width, height));

        info!("Recording started: {}", path.display());
        Ok(())
    }

    /// Advances the recording clock by `dt` seconds
    pub fn update(&mut self, dt: f64, scene: &dyn SceneSource, input: &dyn InputSource) {
        if !self.is_recording() {
            return;
        }
        self.elapsed += dt;
        self.since_keyframe += dt;

        let keys = input.just_pressed();
        if !keys.is_empty() {
            let record = Record::input(self.elapsed, &keys, self.config.quantize_decimals);
            self.enqueue(&record);
        }

        if self.elapsed >= self.config.warmup
            && self.since_keyframe >= self.config.keyframe_interval
            && self.write_keyframe(scene)
        {
            self.since_keyframe = 0.0;
        }
    }

    /// Writes an optional final keyframe, then drains and closes the log
    pub fn stop(&mut self, final_scene: Option<&dyn SceneSource>) {
        if !self.is_recording() {
            return;
        }
        if let Some(scene) = final_scene {
            self.write_keyframe(scene);
        }

        // Dropping the sender ends the writer's loop once the queue is empty
        self.queue = None;

        if let Some((handle, done)) = self.writer.take() {
            match done.recv_timeout(self.config.join_timeout) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    if handle.join().is_err() {
                        error!("Recording writer panicked");
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        "Recording writer still busy after {:?}, detaching",
                        self.config.join_timeout
                    );
                }
            }
        }

        let stats = self.stats();
        info!(
            "Recording stopped: {} lines written, {} dropped",
            stats.written, stats.dropped
        );
    }

    fn write_keyframe(&mut self, scene: &dyn SceneSource) -> bool {
        let entities = scene.active_entities();
        if entities.is_empty() {
            return false;
        }
        let record = Record::keyframe(self.elapsed, &entities, self.config.quantize_decimals);
        self.enqueue(&record);
        true
    }

    fn enqueue(&self, record: &Record) -> bool {
        let Some(queue) = &self.queue else {
            return false;
        };
        let line = match record.to_line() {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to encode {} record: {}", record.kind(), e);
                return false;
            }
        };

        match queue.try_send(line) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Recording queue full, dropped a {} line", record.kind());
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.stop(None);
    }
}
