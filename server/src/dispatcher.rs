//! Rate-limited hand-off from the simulation to the transport
//!
//! The simulation tells the [`BroadcastDispatcher`] a fresh [`Snapshot`] every
//! tick. At most one per broadcast interval is serialized and published into
//! the [`LatestSnapshot`] cell, which the transport reads on its own cadence.
//! Only the newest frame matters, so older ones are simply overwritten.

use crate::actor::{Actor, ActorError, Envelope, Mailbox};
use log::{debug, trace};
use shared::protocol::encode_broadcast;
use shared::{unix_time_secs, Snapshot};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const DISPATCHER_ID: &str = "network-broadcast";
pub const DISPATCHER_CAPACITY: usize = 5000;
pub const BROADCAST_INTERVAL: Duration = Duration::from_millis(50);

/// Single-value cell holding the most recent serialized broadcast line
#[derive(Clone, Default)]
pub struct LatestSnapshot {
    payload: Arc<Mutex<Option<Arc<str>>>>,
    version: Arc<AtomicU64>,
}

impl LatestSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, payload: impl Into<Arc<str>>) {
        let payload = payload.into();
        let mut slot = self.payload.lock().unwrap_or_else(|p| p.into_inner());
        *slot = Some(payload);
        self.version.fetch_add(1, Ordering::Release);
    }

    pub fn load(&self) -> Option<Arc<str>> {
        self.payload
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn clear(&self) {
        *self.payload.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }

    /// Number of publications so far
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone)]
pub enum DispatchMessage {
    Snapshot(Snapshot),
}

#[derive(Debug, Default)]
pub struct DispatchCounters {
    published: AtomicU64,
    rate_limited: AtomicU64,
}

impl DispatchCounters {
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn rate_limited(&self) -> u64 {
        self.rate_limited.load(Ordering::Relaxed)
    }
}

pub struct BroadcastDispatcher {
    latest: LatestSnapshot,
    interval: Duration,
    last_broadcast: Option<Instant>,
    counters: Arc<DispatchCounters>,
}

impl BroadcastDispatcher {
    pub fn new(latest: LatestSnapshot, interval: Duration) -> Self {
        Self {
            latest,
            interval,
            last_broadcast: None,
            counters: Arc::new(DispatchCounters::default()),
        }
    }

    pub fn counters(&self) -> Arc<DispatchCounters> {
        Arc::clone(&self.counters)
    }

    /// Dispatcher wrapped in a mailbox under [`DISPATCHER_ID`], not yet started
    pub fn mailbox(
        latest: LatestSnapshot,
        interval: Duration,
    ) -> (Mailbox<BroadcastDispatcher>, Arc<DispatchCounters>) {
        let dispatcher = BroadcastDispatcher::new(latest, interval);
        let counters = dispatcher.counters();
        (
            Mailbox::new(DISPATCHER_ID, DISPATCHER_CAPACITY, dispatcher),
            counters,
        )
    }

    fn dispatch(&mut self, snapshot: Snapshot) -> Result<(), ActorError> {
        let now = Instant::now();
        if let Some(last) = self.last_broadcast {
            if now.duration_since(last) < self.interval {
                self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        }
        self.last_broadcast = Some(now);

        let stamped = Snapshot {
            timestamp: unix_time_secs(),
            ..snapshot
        };
        let line = encode_broadcast(&stamped)?;
        self.latest.publish(line);
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl Actor for BroadcastDispatcher {
    type Message = DispatchMessage;

    fn on_receive(&mut self, envelope: Envelope<DispatchMessage>) -> Result<(), ActorError> {
        match envelope.payload {
            DispatchMessage::Snapshot(snapshot) => self.dispatch(snapshot),
        }
    }

    fn on_start(&mut self, id: &str) {
        debug!("{} publishing at most every {:?}", id, self.interval);
    }

    fn on_dropped(id: &str, envelope: &Envelope<DispatchMessage>) {
        trace!("{} dropped a snapshot from {}", id, envelope.sender);
    }
}
