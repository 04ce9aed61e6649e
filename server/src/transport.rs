//! TCP fan-out of the latest snapshot to every connected observer
//!
//! One task owns the listener and every connection. Each loop iteration waits
//! for whichever comes first: a new connection, read readiness on any
//! connection, the stop signal, or the next broadcast tick (bounded by the poll
//! timeout). Writes are non-blocking; a peer that cannot keep up skips frames
//! instead of slowing everyone else down.

use crate::dispatcher::LatestSnapshot;
use log::{debug, info, warn};
use shared::protocol::JOIN_ACK;
use shared::{ControlFrame, DEFAULT_PORT};
use std::future::{pending, poll_fn};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::Poll;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Upper bound on reads per connection per wake, keeps one chatty peer from
/// monopolizing the loop
const MAX_READS_PER_WAKE: usize = 16;
/// Unterminated input beyond this is discarded
const MAX_LINE_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub bind_addr: SocketAddr,
    pub broadcast_interval: Duration,
    pub poll_timeout: Duration,
    pub read_buffer: usize,
    pub max_pending_write: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            broadcast_interval: Duration::from_millis(50),
            poll_timeout: Duration::from_millis(250),
            read_buffer: 1024,
            max_pending_write: 256 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Listening,
    Running,
    Stopped,
}

impl TransportState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TransportState::Listening,
            1 => TransportState::Running,
            _ => TransportState::Stopped,
        }
    }
}

/// Callbacks fired from the transport task. Implementations must not block.
pub trait TransportEvents: Send + Sync {
    fn connection_opened(&self, _peer: SocketAddr, _count: usize) {}
    fn connection_closed(&self, _peer: SocketAddr, _count: usize) {}
    fn joined(&self, _peer: SocketAddr, _name: &str) {}
    fn input(&self, _peer: SocketAddr, _vx: f32, _vy: f32) {}
}

pub struct NoopEvents;

impl TransportEvents for NoopEvents {}

/// Lock-free observer counters, readable from the simulation side
#[derive(Debug, Default)]
pub struct ObserverStats {
    connections: AtomicUsize,
    joins: AtomicU64,
    inputs: AtomicU64,
    last_input: AtomicU64,
}

impl ObserverStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn joins(&self) -> u64 {
        self.joins.load(Ordering::Relaxed)
    }

    pub fn inputs(&self) -> u64 {
        self.inputs.load(Ordering::Acquire)
    }

    /// Most recent velocity any observer sent, if one ever did
    pub fn last_input(&self) -> Option<(f32, f32)> {
        if self.inputs() == 0 {
            return None;
        }
        let bits = self.last_input.load(Ordering::Acquire);
        Some((f32::from_bits((bits >> 32) as u32), f32::from_bits(bits as u32)))
    }
}

impl TransportEvents for ObserverStats {
    fn connection_opened(&self, _peer: SocketAddr, count: usize) {
        self.connections.store(count, Ordering::Relaxed);
    }

    fn connection_closed(&self, _peer: SocketAddr, count: usize) {
        self.connections.store(count, Ordering::Relaxed);
    }

    fn joined(&self, _peer: SocketAddr, _name: &str) {
        self.joins.fetch_add(1, Ordering::Relaxed);
    }

    fn input(&self, _peer: SocketAddr, vx: f32, vy: f32) {
        let bits = ((vx.to_bits() as u64) << 32) | vy.to_bits() as u64;
        self.last_input.store(bits, Ordering::Release);
        self.inputs.fetch_add(1, Ordering::Release);
    }
}

#[derive(Default)]
struct TransportShared {
    state: AtomicU8,
    connections: AtomicUsize,
    frames_sent: AtomicU64,
    coalesced: AtomicU64,
}

impl TransportShared {
    fn set_state(&self, state: TransportState) {
        let value = match state {
            TransportState::Listening => 0,
            TransportState::Running => 1,
            TransportState::Stopped => 2,
        };
        self.state.store(value, Ordering::Release);
    }
}

struct Connection {
    peer: SocketAddr,
    stream: TcpStream,
    inbound: Vec<u8>,
    outbound: Vec<u8>,
    closed: bool,
}

impl Connection {
    fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            peer,
            stream,
            inbound: Vec::new(),
            outbound: Vec::new(),
            closed: false,
        }
    }

    fn close(&mut self, reason: &str) {
        if !self.closed {
            debug!("Closing connection {}: {}", self.peer, reason);
            self.closed = true;
        }
    }

    /// Reads whatever is available without blocking
    fn read_available(&mut self, buf: &mut [u8], events: &dyn TransportEvents) {
        for _ in 0..MAX_READS_PER_WAKE {
            match self.stream.try_read(buf) {
                Ok(0) => {
                    self.close("peer closed");
                    return;
                }
                Ok(n) => {
                    self.inbound.extend_from_slice(&buf[..n]);
                    self.handle_lines(events);
                    if self.closed {
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.close(&format!("read failed: {}", e));
                    return;
                }
            }
        }
    }

    fn handle_lines(&mut self, events: &dyn TransportEvents) {
        while let Some(pos) = self.inbound.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.inbound.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line);
            for frame in ControlFrame::scan(text.trim_end()) {
                self.handle_frame(frame, events);
            }
        }

        // An unterminated tail is acted on as soon as it holds a usable frame
        if !self.inbound.is_empty() {
            let tail = String::from_utf8_lossy(&self.inbound).into_owned();
            let frames: Vec<ControlFrame> = ControlFrame::scan(&tail)
                .into_iter()
                .filter(|frame| !matches!(frame, ControlFrame::Join { name } if name.is_empty()))
                .collect();
            if !frames.is_empty() {
                self.inbound.clear();
                for frame in frames {
                    self.handle_frame(frame, events);
                }
            }
        }

        if self.inbound.len() > MAX_LINE_BYTES {
            warn!(
                "Discarding {} unterminated bytes from {}",
                self.inbound.len(),
                self.peer
            );
            self.inbound.clear();
        }
    }

    fn handle_frame(&mut self, frame: ControlFrame, events: &dyn TransportEvents) {
        match frame {
            ControlFrame::Join { name } => {
                debug!("{} joined as {}", self.peer, name);
                self.outbound.extend_from_slice(JOIN_ACK.as_bytes());
                self.outbound.push(b'\n');
                self.flush();
                events.joined(self.peer, &name);
            }
            ControlFrame::Input { vx, vy } => events.input(self.peer, vx, vy),
        }
    }

    /// Writes as much of the backlog as the socket accepts right now
    fn flush(&mut self) {
        while !self.outbound.is_empty() && !self.closed {
            match self.stream.try_write(&self.outbound) {
                Ok(0) => self.close("write returned zero"),
                Ok(n) => {
                    self.outbound.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => self.close(&format!("write failed: {}", e)),
            }
        }
    }

    /// Queues one snapshot line unless an earlier one is still unsent
    fn queue_snapshot(&mut self, payload: &str) -> bool {
        if !self.outbound.is_empty() {
            return false;
        }
        self.outbound.extend_from_slice(payload.as_bytes());
        self.outbound.push(b'\n');
        self.flush();
        true
    }
}

enum Wake {
    Stop,
    Signal,
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    Readable,
    Tick,
}

/// Resolves once any connection has read readiness; never with no connections
async fn any_readable(connections: &[Connection]) {
    if connections.is_empty() {
        return pending().await;
    }
    poll_fn(|cx| {
        let mut ready = false;
        for conn in connections {
            if conn.stream.poll_read_ready(cx).is_ready() {
                ready = true;
            }
        }
        if ready {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    })
    .await
}

pub struct TransportServer {
    config: TransportConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    latest: LatestSnapshot,
    events: Arc<dyn TransportEvents>,
    shared: Arc<TransportShared>,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
}

impl TransportServer {
    pub async fn bind(
        config: TransportConfig,
        latest: LatestSnapshot,
        events: Arc<dyn TransportEvents>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let (stop_tx, stop_rx) = watch::channel(false);
        info!("Transport bound to {}", local_addr);

        Ok(Self {
            config,
            listener,
            local_addr,
            latest,
            events,
            shared: Arc::new(TransportShared::default()),
            stop_tx: Arc::new(stop_tx),
            stop_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Runs the loop on its own task
    pub fn spawn(self) -> TransportHandle {
        let stop = Arc::clone(&self.stop_tx);
        let shared = Arc::clone(&self.shared);
        let local_addr = self.local_addr;
        let task = tokio::spawn(self.run());

        TransportHandle {
            stop,
            task,
            shared,
            local_addr,
        }
    }

    /// The transport loop. Returns once stopped, after every socket is closed.
    pub async fn run(self) -> io::Result<()> {
        let TransportServer {
            config,
            listener,
            local_addr,
            latest,
            events,
            shared,
            stop_tx: _stop_tx,
            mut stop_rx,
        } = self;

        shared.set_state(TransportState::Running);
        info!("Transport running on {}", local_addr);

        let mut connections: Vec<Connection> = Vec::new();
        let mut read_buf = vec![0u8; config.read_buffer.max(1)];
        let mut last_push = Instant::now();

        loop {
            if *stop_rx.borrow() {
                break;
            }

            let until_push = config
                .broadcast_interval
                .saturating_sub(last_push.elapsed());
            let wait = config.poll_timeout.min(until_push);

            let wake = tokio::select! {
                changed = stop_rx.changed() => match changed {
                    Ok(()) => Wake::Signal,
                    Err(_) => Wake::Stop,
                },
                accepted = listener.accept() => Wake::Accepted(accepted),
                _ = any_readable(&connections) => Wake::Readable,
                _ = tokio::time::sleep(wait) => Wake::Tick,
            };

            match wake {
                Wake::Stop => break,
                Wake::Signal | Wake::Tick => {}
                Wake::Accepted(Ok((stream, peer))) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Could not disable Nagle for {}: {}", peer, e);
                    }
                    connections.push(Connection::new(stream, peer));
                    let count = connections.len();
                    shared.connections.store(count, Ordering::Relaxed);
                    info!("Observer connected from {} ({} connected)", peer, count);
                    events.connection_opened(peer, count);
                }
                Wake::Accepted(Err(e)) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Wake::Readable => {
                    for conn in connections.iter_mut() {
                        conn.read_available(&mut read_buf, events.as_ref());
                    }
                }
            }

            for conn in connections.iter_mut().filter(|c| !c.outbound.is_empty()) {
                conn.flush();
                if conn.outbound.len() > config.max_pending_write {
                    conn.close("write backlog exceeded");
                }
            }

            if last_push.elapsed() >= config.broadcast_interval {
                last_push = Instant::now();
                if let Some(payload) = latest.load() {
                    for conn in connections.iter_mut().filter(|c| !c.closed) {
                        if conn.queue_snapshot(&payload) {
                            shared.frames_sent.fetch_add(1, Ordering::Relaxed);
                        } else {
                            shared.coalesced.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            }

            let mut idx = 0;
            while idx < connections.len() {
                if connections[idx].closed {
                    let conn = connections.remove(idx);
                    let count = connections.len();
                    shared.connections.store(count, Ordering::Relaxed);
                    info!("Observer {} disconnected ({} connected)", conn.peer, count);
                    events.connection_closed(conn.peer, count);
                } else {
                    idx += 1;
                }
            }
        }

        let remaining = connections.len();
        connections.clear();
        drop(listener);
        shared.connections.store(0, Ordering::Relaxed);
        shared.set_state(TransportState::Stopped);
        info!("Transport stopped, closed {} connections", remaining);
        Ok(())
    }
}

pub struct TransportHandle {
    stop: Arc<watch::Sender<bool>>,
    task: JoinHandle<io::Result<()>>,
    shared: Arc<TransportShared>,
    local_addr: SocketAddr,
}

impl TransportHandle {
    /// Requests shutdown. Callable from any thread, does not wait.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    /// Waits for the loop to exit and release its sockets
    pub async fn join(self) -> io::Result<()> {
        self.task
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }

    pub async fn shutdown(self) -> io::Result<()> {
        self.stop();
        self.join().await
    }

    pub fn state(&self) -> TransportState {
        TransportState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::Relaxed)
    }

    /// Snapshot lines handed to sockets so far
    pub fn frames_sent(&self) -> u64 {
        self.shared.frames_sent.load(Ordering::Relaxed)
    }

    /// Snapshots skipped because a peer still had unsent data
    pub fn coalesced(&self) -> u64 {
        self.shared.coalesced.load(Ordering::Relaxed)
    }
}
