//! Mailbox actors with a bounded inbox and one worker thread each
//!
//! An [`Actor`] owns its state exclusively; the outside world reaches it only
//! through [`Mailbox::tell`], which never blocks. When the inbox is full, or the
//! actor is not running, the message is dropped and counted. Producers are
//! expected to treat a drop as lossy delivery, never as a fatal condition.
//!
//! Lifecycle: created → [`Mailbox::start`] → [`Mailbox::stop`] (terminal). The
//! worker exits after the message it is currently handling and does not drain
//! the rest of the inbox.

use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, error, trace};
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

pub const DEFAULT_MAILBOX_CAPACITY: usize = 10_000;

const CREATED: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

#[derive(Debug, Error)]
pub enum ActorError {
    #[error("handler failed: {0}")]
    Handler(String),
    #[error("handler panicked: {0}")]
    Panicked(String),
    #[error(transparent)]
    Protocol(#[from] shared::ProtocolError),
}

/// A message plus the metadata stamped on it at enqueue time
#[derive(Debug, Clone)]
pub struct Envelope<M> {
    pub sender: String,
    pub sent_at: Instant,
    pub payload: M,
}

impl<M> Envelope<M> {
    pub fn new(sender: impl Into<String>, payload: M) -> Self {
        Self {
            sender: sender.into(),
            sent_at: Instant::now(),
            payload,
        }
    }
}

/// Behaviour plugged into a [`Mailbox`].
///
/// `on_start`, `on_receive`, `on_error` and `on_stop` all run on the actor's
/// own worker thread. `on_dropped` runs on the producer's thread and therefore
/// has no access to actor state.
pub trait Actor: Send + 'static {
    type Message: Send + 'static;

    fn on_receive(&mut self, envelope: Envelope<Self::Message>) -> Result<(), ActorError>;

    fn on_start(&mut self, _id: &str) {}

    fn on_stop(&mut self, _id: &str) {}

    fn on_error(&mut self, id: &str, err: &ActorError) {
        error!("[actor-{}] {}", id, err);
    }

    fn on_dropped(_id: &str, _envelope: &Envelope<Self::Message>)
    where
        Self: Sized,
    {
    }
}

/// Point-in-time counters for one actor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorStats {
    pub id: String,
    pub running: bool,
    pub processed: u64,
    pub failed: u64,
    pub dropped: u64,
    pub pending: usize,
    pub capacity: usize,
}

impl fmt::Display for ActorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] Processed: {}, Failed: {}, Dropped: {}, Pending: {}/{}",
            self.id, self.processed, self.failed, self.dropped, self.pending, self.capacity
        )
    }
}

/// Type-erased view of a mailbox, used by the actor directory
pub trait MailboxRef<M>: Send + Sync {
    fn id(&self) -> &str;
    fn start(&self) -> bool;
    fn stop(&self);
    fn join(&self, timeout: Duration) -> bool;
    fn tell(&self, envelope: Envelope<M>) -> bool;
    fn is_running(&self) -> bool;
    fn stats(&self) -> ActorStats;
}

/// State shared between the mailbox handle and its worker thread
#[derive(Default)]
struct Lifecycle {
    state: AtomicU8,
    processed: AtomicU64,
    failed: AtomicU64,
}

impl Lifecycle {
    fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == RUNNING
    }
}

/// Everything the worker thread takes ownership of when the actor starts
struct WorkerParts<A: Actor> {
    actor: A,
    inbox: Receiver<Envelope<A::Message>>,
    stop: Receiver<()>,
    done: Sender<()>,
}

pub struct Mailbox<A: Actor> {
    id: String,
    capacity: usize,
    inbox: Sender<Envelope<A::Message>>,
    stop_signal: Sender<()>,
    done: Receiver<()>,
    lifecycle: Arc<Lifecycle>,
    dropped: AtomicU64,
    parts: Mutex<Option<WorkerParts<A>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<A: Actor> Mailbox<A> {
    pub fn new(id: impl Into<String>, capacity: usize, actor: A) -> Self {
        let capacity = capacity.max(1);
        let (inbox_tx, inbox_rx) = bounded(capacity);
        let (stop_tx, stop_rx) = bounded(1);
        let (done_tx, done_rx) = bounded(1);

        Self {
            id: id.into(),
            capacity,
            inbox: inbox_tx,
            stop_signal: stop_tx,
            done: done_rx,
            lifecycle: Arc::new(Lifecycle::default()),
            dropped: AtomicU64::new(0),
            parts: Mutex::new(Some(WorkerParts {
                actor,
                inbox: inbox_rx,
                stop: stop_rx,
                done: done_tx,
            })),
            worker: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Spawns the worker thread. Returns false if the actor was already
    /// started or has been stopped.
    pub fn start(&self) -> bool {
        if self
            .lifecycle
            .state
            .compare_exchange(CREATED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let parts = match self.parts.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        let Some(parts) = parts else {
            self.lifecycle.state.store(STOPPED, Ordering::Release);
            return false;
        };

        let id = self.id.clone();
        let lifecycle = Arc::clone(&self.lifecycle);
        let spawned = thread::Builder::new()
            .name(format!("actor-{}", self.id))
            .spawn(move || run_worker(id, parts, lifecycle));

        match spawned {
            Ok(handle) => {
                if let Ok(mut worker) = self.worker.lock() {
                    *worker = Some(handle);
                }
                true
            }
            Err(e) => {
                error!("Failed to spawn worker for actor {}: {}", self.id, e);
                self.lifecycle.state.store(STOPPED, Ordering::Release);
                false
            }
        }
    }

    /// Signals the worker to exit after its current message. Safe from any
    /// thread; does not wait.
    pub fn stop(&self) {
        let was_running = self
            .lifecycle
            .state
            .compare_exchange(RUNNING, STOPPED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if was_running {
            let _ = self.stop_signal.try_send(());
        } else {
            let _ = self.lifecycle.state.compare_exchange(
                CREATED,
                STOPPED,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    /// Waits up to `timeout` for the worker thread to exit. Returns true once
    /// it has been joined, or if there was never a worker to join.
    pub fn join(&self, timeout: Duration) -> bool {
        let handle = match self.worker.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        let Some(handle) = handle else {
            return true;
        };

        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    error!("Worker thread of actor {} panicked", self.id);
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                if let Ok(mut worker) = self.worker.lock() {
                    *worker = Some(handle);
                }
                false
            }
        }
    }

    /// Non-blocking enqueue. Returns false, counts a drop and fires
    /// [`Actor::on_dropped`] when the actor is not running or the inbox is full.
    pub fn tell(&self, envelope: Envelope<A::Message>) -> bool {
        if !self.lifecycle.is_running() {
            self.record_drop(&envelope);
            return false;
        }

        match self.inbox.try_send(envelope) {
            Ok(()) => true,
            Err(TrySendError::Full(envelope)) | Err(TrySendError::Disconnected(envelope)) => {
                self.record_drop(&envelope);
                false
            }
        }
    }

    fn record_drop(&self, envelope: &Envelope<A::Message>) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        A::on_dropped(&self.id, envelope);
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    pub fn pending(&self) -> usize {
        self.inbox.len()
    }

    pub fn processed(&self) -> u64 {
        self.lifecycle.processed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.lifecycle.failed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> ActorStats {
        ActorStats {
            id: self.id.clone(),
            running: self.is_running(),
            processed: self.processed(),
            failed: self.failed(),
            dropped: self.dropped(),
            pending: self.pending(),
            capacity: self.capacity,
        }
    }
}

impl<A: Actor> Drop for Mailbox<A> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<A: Actor> MailboxRef<A::Message> for Mailbox<A> {
    fn id(&self) -> &str {
        Mailbox::id(self)
    }

    fn start(&self) -> bool {
        Mailbox::start(self)
    }

    fn stop(&self) {
        Mailbox::stop(self)
    }

    fn join(&self, timeout: Duration) -> bool {
        Mailbox::join(self, timeout)
    }

    fn tell(&self, envelope: Envelope<A::Message>) -> bool {
        Mailbox::tell(self, envelope)
    }

    fn is_running(&self) -> bool {
        Mailbox::is_running(self)
    }

    fn stats(&self) -> ActorStats {
        Mailbox::stats(self)
    }
}

fn run_worker<A: Actor>(id: String, parts: WorkerParts<A>, lifecycle: Arc<Lifecycle>) {
    let WorkerParts {
        mut actor,
        inbox,
        stop,
        done,
    } = parts;

    actor.on_start(&id);
    debug!("Actor {} started", id);

    while lifecycle.is_running() {
        select! {
            recv(stop) -> signal => {
                if signal.is_ok() && lifecycle.is_running() {
                    trace!("Actor {} woke without a stop request", id);
                    continue;
                }
                break;
            }
            recv(inbox) -> message => {
                let Ok(envelope) = message else {
                    break;
                };
                // A stop that raced with this receive wins; the inbox is not drained
                if !lifecycle.is_running() {
                    break;
                }
                if dispatch(&mut actor, &id, envelope) {
                    lifecycle.processed.fetch_add(1, Ordering::Relaxed);
                } else {
                    lifecycle.failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    actor.on_stop(&id);
    debug!("Actor {} stopped", id);
    let _ = done.send(());
}

/// Runs the handler, routing both errors and panics to `on_error`
fn dispatch<A: Actor>(actor: &mut A, id: &str, envelope: Envelope<A::Message>) -> bool {
    let outcome = catch_unwind(AssertUnwindSafe(|| actor.on_receive(envelope)));
    let err = match outcome {
        Ok(Ok(())) => return true,
        Ok(Err(err)) => err,
        Err(payload) => ActorError::Panicked(panic_message(payload.as_ref())),
    };
    actor.on_error(id, &err);
    false
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    /// Records every payload it sees
    struct Collector {
        seen: Arc<Mutex<Vec<u32>>>,
    }

    impl Actor for Collector {
        type Message = u32;

        fn on_receive(&mut self, envelope: Envelope<u32>) -> Result<(), ActorError> {
            self.seen.lock().unwrap().push(envelope.payload);
            Ok(())
        }
    }

    /// Blocks inside the handler until released
    struct Gate {
        entered: Sender<()>,
        release: Receiver<()>,
    }

    impl Actor for Gate {
        type Message = u32;

        fn on_receive(&mut self, _envelope: Envelope<u32>) -> Result<(), ActorError> {
            let _ = self.entered.send(());
            let _ = self.release.recv();
            Ok(())
        }
    }

    /// Fails on odd payloads, panics on zero
    struct Flaky {
        errors: Arc<AtomicUsize>,
    }

    impl Actor for Flaky {
        type Message = u32;

        fn on_receive(&mut self, envelope: Envelope<u32>) -> Result<(), ActorError> {
            match envelope.payload {
                0 => panic!("zero is not allowed"),
                n if n % 2 == 1 => Err(ActorError::Handler(format!("odd payload {}", n))),
                _ => Ok(()),
            }
        }

        fn on_error(&mut self, _id: &str, _err: &ActorError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    static DROP_HOOK_FIRED: AtomicBool = AtomicBool::new(false);

    struct Hooked;

    impl Actor for Hooked {
        type Message = ();

        fn on_receive(&mut self, _envelope: Envelope<()>) -> Result<(), ActorError> {
            Ok(())
        }

        fn on_dropped(_id: &str, _envelope: &Envelope<()>) {
            DROP_HOOK_FIRED.store(true, Ordering::SeqCst);
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    fn collector(capacity: usize) -> (Mailbox<Collector>, Arc<Mutex<Vec<u32>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mailbox = Mailbox::new(
            "collector",
            capacity,
            Collector {
                seen: Arc::clone(&seen),
            },
        );
        (mailbox, seen)
    }

    #[test]
    fn test_unstarted_actor_rejects_everything() {
        let (mailbox, _) = collector(4);
        for i in 0..3 {
            assert!(!mailbox.tell(Envelope::new("test", i)));
        }
        assert_eq!(mailbox.dropped(), 3);
        assert_eq!(mailbox.pending(), 0);
    }

    #[test]
    fn test_messages_processed_in_order() {
        let (mailbox, seen) = collector(16);
        assert!(mailbox.start());
        for i in 0..10 {
            assert!(mailbox.tell(Envelope::new("test", i)));
        }
        assert!(wait_until(|| mailbox.processed() == 10));
        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
        mailbox.stop();
        assert!(mailbox.join(Duration::from_secs(1)));
    }

    #[test]
    fn test_start_is_idempotent() {
        let (mailbox, _) = collector(4);
        assert!(mailbox.start());
        assert!(!mailbox.start());
        assert!(mailbox.is_running());
        mailbox.stop();
        assert!(!mailbox.start(), "stopped actors never restart");
        assert!(mailbox.join(Duration::from_secs(1)));
    }

    #[test]
    fn test_full_inbox_drops_exactly_one() {
        let capacity = 3;
        let (entered_tx, entered_rx) = bounded(capacity + 2);
        let (release_tx, release_rx) = bounded(capacity + 2);
        let mailbox = Mailbox::new(
            "gate",
            capacity,
            Gate {
                entered: entered_tx,
                release: release_rx,
            },
        );
        mailbox.start();

        // First message occupies the handler
        assert!(mailbox.tell(Envelope::new("test", 0)));
        entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        for i in 1..=capacity as u32 {
            assert!(mailbox.tell(Envelope::new("test", i)));
        }
        assert_eq!(mailbox.pending(), capacity);

        assert!(!mailbox.tell(Envelope::new("test", 99)));
        assert_eq!(mailbox.dropped(), 1);
        assert_eq!(mailbox.pending(), capacity);

        for _ in 0..=capacity {
            release_tx.send(()).unwrap();
        }
        assert!(wait_until(|| mailbox.processed() == capacity as u64 + 1));
        mailbox.stop();
        assert!(mailbox.join(Duration::from_secs(1)));
    }

    #[test]
    fn test_stop_does_not_drain_inbox() {
        let (entered_tx, entered_rx) = bounded(8);
        let (release_tx, release_rx) = bounded(8);
        let mailbox = Mailbox::new(
            "gate",
            8,
            Gate {
                entered: entered_tx,
                release: release_rx,
            },
        );
        mailbox.start();

        assert!(mailbox.tell(Envelope::new("test", 0)));
        entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        for i in 1..5 {
            assert!(mailbox.tell(Envelope::new("test", i)));
        }

        mailbox.stop();
        release_tx.send(()).unwrap();
        assert!(mailbox.join(Duration::from_secs(2)));

        assert_eq!(mailbox.processed(), 1);
        assert!(!mailbox.tell(Envelope::new("test", 7)));
    }

    #[test]
    fn test_handler_faults_do_not_kill_actor() {
        let errors = Arc::new(AtomicUsize::new(0));
        let mailbox = Mailbox::new(
            "flaky",
            16,
            Flaky {
                errors: Arc::clone(&errors),
            },
        );
        mailbox.start();

        for payload in [1, 2, 0, 4, 3, 6] {
            assert!(mailbox.tell(Envelope::new("test", payload)));
        }

        assert!(wait_until(|| mailbox.processed() + mailbox.failed() == 6));
        assert_eq!(mailbox.processed(), 3);
        assert_eq!(mailbox.failed(), 3);
        assert_eq!(errors.load(Ordering::SeqCst), 3);
        assert!(mailbox.is_running());

        mailbox.stop();
        assert!(mailbox.join(Duration::from_secs(1)));
    }

    #[test]
    fn test_drop_hook_runs_on_rejection() {
        let mailbox = Mailbox::new("hooked", 1, Hooked);
        assert!(!mailbox.tell(Envelope::new("test", ())));
        assert!(DROP_HOOK_FIRED.load(Ordering::SeqCst));
    }

    #[test]
    fn test_join_without_start() {
        let (mailbox, _) = collector(1);
        assert!(mailbox.join(Duration::from_millis(10)));
    }

    #[test]
    fn test_stats_display() {
        let (mailbox, _) = collector(8);
        mailbox.tell(Envelope::new("test", 1));
        let stats = mailbox.stats();
        assert_eq!(stats.dropped, 1);
        assert_eq!(
            stats.to_string(),
            "[collector] Processed: 0, Failed: 0, Dropped: 1, Pending: 0/8"
        );
    }

    #[test]
    fn test_envelope_metadata() {
        let envelope = Envelope::new("simulation", 5u32);
        assert_eq!(envelope.sender, "simulation");
        assert!(envelope.sent_at.elapsed() < Duration::from_secs(1));
    }
}
