//! Registry of running actors plus a small periodic-task scheduler
//!
//! The directory is constructed explicitly and handed to whoever needs it;
//! there is no process-wide instance.

use crate::actor::{ActorStats, Envelope, MailboxRef};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

struct ScheduledTask {
    name: String,
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

pub struct ActorDirectory<M> {
    actors: RwLock<HashMap<String, Arc<dyn MailboxRef<M>>>>,
    tasks: Mutex<Vec<ScheduledTask>>,
    monitoring: AtomicBool,
    join_timeout: Duration,
}

impl<M> ActorDirectory<M> {
    pub fn new() -> Self {
        Self::with_join_timeout(DEFAULT_JOIN_TIMEOUT)
    }

    pub fn with_join_timeout(join_timeout: Duration) -> Self {
        Self {
            actors: RwLock::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            monitoring: AtomicBool::new(false),
            join_timeout,
        }
    }

    /// Stores the mailbox under its id and starts it. An id that is already
    /// registered keeps its existing actor and the call returns false.
    pub fn register(&self, mailbox: Arc<dyn MailboxRef<M>>) -> bool {
        let Ok(mut actors) = self.actors.write() else {
            return false;
        };
        if actors.contains_key(mailbox.id()) {
            debug!("Actor {} already registered", mailbox.id());
            return false;
        }
        mailbox.start();
        info!("Registered actor {}", mailbox.id());
        actors.insert(mailbox.id().to_string(), mailbox);
        true
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn MailboxRef<M>>> {
        self.actors.read().ok()?.get(id).cloned()
    }

    /// Stops and forgets an actor. The caller may still join it through the
    /// returned handle.
    pub fn remove(&self, id: &str) -> Option<Arc<dyn MailboxRef<M>>> {
        let removed = self.actors.write().ok()?.remove(id)?;
        removed.stop();
        Some(removed)
    }

    pub fn send(&self, id: &str, envelope: Envelope<M>) -> bool {
        match self.get(id) {
            Some(mailbox) => mailbox.tell(envelope),
            None => {
                debug!("No actor registered as {}", id);
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.actors.read().map(|a| a.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = match self.actors.read() {
            Ok(actors) => actors.keys().cloned().collect(),
            Err(_) => Vec::new(),
        };
        ids.sort();
        ids
    }

    /// Stats for every registered actor, sorted by id
    pub fn stats(&self) -> Vec<ActorStats> {
        let mut stats: Vec<ActorStats> = match self.actors.read() {
            Ok(actors) => actors.values().map(|a| a.stats()).collect(),
            Err(_) => Vec::new(),
        };
        stats.sort_by(|a, b| a.id.cmp(&b.id));
        stats
    }

    /// Runs `callback` every `interval` on a dedicated thread until shutdown
    pub fn schedule<F>(&self, name: &str, interval: Duration, mut callback: F) -> io::Result<()>
    where
        F: FnMut() + Send + 'static,
    {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name(format!("sched-{}", name))
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => callback(),
                    _ => break,
                }
            })?;

        let task = ScheduledTask {
            name: name.to_string(),
            stop: stop_tx,
            handle,
        };
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.push(task),
            Err(_) => {
                let _ = task.stop.send(());
            }
        }
        Ok(())
    }

    /// Stops every actor and scheduled task, waiting a bounded time for each.
    /// Calling it again is harmless.
    pub fn shutdown(&self) {
        let actors: Vec<Arc<dyn MailboxRef<M>>> = match self.actors.write() {
            Ok(mut actors) => actors.drain().map(|(_, a)| a).collect(),
            Err(_) => Vec::new(),
        };
        for actor in &actors {
            actor.stop();
        }
        for actor in &actors {
            if !actor.join(self.join_timeout) {
                warn!(
                    "Actor {} did not stop within {:?}",
                    actor.id(),
                    self.join_timeout
                );
            }
        }

        let tasks: Vec<ScheduledTask> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for task in &tasks {
            let _ = task.stop.send(());
        }
        for task in tasks {
            // The monitor may hold the last reference and run this from its own thread
            if task.handle.thread().id() == thread::current().id() {
                continue;
            }
            if task.handle.join().is_err() {
                warn!("Scheduled task {} panicked", task.name);
            }
        }

        if !actors.is_empty() {
            info!("Actor directory shut down ({} actors)", actors.len());
        }
    }
}

impl<M: Send + 'static> ActorDirectory<M> {
    /// Logs every actor's stats each `interval`. Only the first call has an effect.
    pub fn start_monitoring(self: &Arc<Self>, interval: Duration) -> io::Result<()> {
        if self.monitoring.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let directory = Arc::downgrade(self);
        self.schedule("monitor", interval, move || {
            if let Some(directory) = directory.upgrade() {
                for stats in directory.stats() {
                    info!("{}", stats);
                }
            }
        })
    }
}

impl<M: Clone> ActorDirectory<M> {
    /// Best-effort delivery to every actor; returns how many accepted it
    pub fn broadcast(&self, envelope: Envelope<M>) -> usize {
        let actors: Vec<Arc<dyn MailboxRef<M>>> = match self.actors.read() {
            Ok(actors) => actors.values().cloned().collect(),
            Err(_) => return 0,
        };
        actors
            .iter()
            .filter(|actor| actor.tell(envelope.clone()))
            .count()
    }
}

impl<M> Default for ActorDirectory<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Drop for ActorDirectory<M> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{Actor, ActorError, Mailbox};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    struct Counter {
        hits: Arc<AtomicUsize>,
    }

    impl Actor for Counter {
        type Message = u32;

        fn on_receive(&mut self, envelope: Envelope<u32>) -> Result<(), ActorError> {
            self.hits.fetch_add(envelope.payload as usize, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counter(id: &str, capacity: usize) -> (Arc<Mailbox<Counter>>, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let mailbox = Arc::new(Mailbox::new(
            id,
            capacity,
            Counter {
                hits: Arc::clone(&hits),
            },
        ));
        (mailbox, hits)
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

    #[test]
    fn test_register_starts_actor() {
        let directory = ActorDirectory::new();
        let (mailbox, hits) = counter("alpha", 8);

        assert!(directory.register(mailbox.clone()));
        assert!(mailbox.is_running());
        assert!(directory.send("alpha", Envelope::new("test", 3)));
        assert!(wait_until(|| hits.load(Ordering::SeqCst) == 3));

        directory.shutdown();
        assert!(!mailbox.is_running());
    }

    #[test]
    fn test_register_same_id_is_noop() {
        let directory = ActorDirectory::new();
        let (first, first_hits) = counter("dup", 8);
        let (second, _) = counter("dup", 8);

        assert!(directory.register(first.clone()));
        assert!(!directory.register(second.clone()));
        assert!(!second.is_running());
        assert_eq!(directory.len(), 1);

        directory.send("dup", Envelope::new("test", 1));
        assert!(wait_until(|| first_hits.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn test_send_to_unknown_actor() {
        let directory: ActorDirectory<u32> = ActorDirectory::new();
        assert!(!directory.send("ghost", Envelope::new("test", 1)));
        assert!(directory.is_empty());
    }

    #[test]
    fn test_remove_stops_actor() {
        let directory = ActorDirectory::new();
        let (mailbox, _) = counter("gone", 4);
        directory.register(mailbox.clone());

        let removed = directory.remove("gone").unwrap();
        assert!(removed.join(Duration::from_secs(1)));
        assert!(!mailbox.is_running());
        assert!(directory.get("gone").is_none());
        assert!(directory.remove("gone").is_none());
    }

    #[test]
    fn test_broadcast_counts_acceptances() {
        let directory = ActorDirectory::new();
        let (a, a_hits) = counter("a", 4);
        let (b, b_hits) = counter("b", 4);
        directory.register(a);
        directory.register(b.clone());
        b.stop();

        assert_eq!(directory.broadcast(Envelope::new("test", 2)), 1);
        assert!(wait_until(|| a_hits.load(Ordering::SeqCst) == 2));
        assert_eq!(b_hits.load(Ordering::SeqCst), 0);
        assert_eq!(directory.ids(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_schedule_runs_until_shutdown() {
        let directory: ActorDirectory<u32> = ActorDirectory::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        directory
            .schedule("tick", Duration::from_millis(5), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert!(wait_until(|| ticks.load(Ordering::SeqCst) >= 3));
        directory.shutdown();
        let after = ticks.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(ticks.load(Ordering::SeqCst), after);
    }

    #[test]
    fn test_monitoring_starts_once() {
        let directory: Arc<ActorDirectory<u32>> = Arc::new(ActorDirectory::new());
        directory.start_monitoring(Duration::from_millis(10)).unwrap();
        directory.start_monitoring(Duration::from_millis(10)).unwrap();
        assert_eq!(directory.tasks.lock().unwrap().len(), 1);
        directory.shutdown();
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let directory = ActorDirectory::new();
        let (mailbox, _) = counter("once", 4);
        directory.register(mailbox);
        directory.shutdown();
        directory.shutdown();
        assert!(directory.is_empty());
    }
}
