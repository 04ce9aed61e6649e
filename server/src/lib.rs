//! # Snapshot Relay Server
//!
//! Publishes the state of a running simulation to any number of TCP observers
//! and, optionally, records it to a replayable log.
//!
//! ## Data Flow
//!
//! ```text
//! simulation thread ──tell──▶ BroadcastDispatcher (actor) ──publish──▶ LatestSnapshot
//!        │                                                                  │
//!        └──update──▶ Recorder ──queue──▶ writer thread ──▶ RecordingStorage │
//!                                                                           ▼
//!                                        TransportServer task ──push──▶ observers
//! ```
//!
//! The simulation never blocks on any of its consumers. Telling the dispatcher
//! is a non-blocking enqueue that may drop, recording is a non-blocking enqueue
//! that may drop, and the transport reads whatever was published last on its
//! own fixed cadence.
//!
//! ## Module Organization
//!
//! ### Actor Module (`actor`)
//! Mailbox actors: each [`actor::Actor`] owns its state and runs on one named
//! OS thread fed by a bounded inbox. Handler errors and panics are contained
//! and reported through the actor's `on_error` hook.
//!
//! ### Directory Module (`directory`)
//! Explicitly constructed registry of running actors, with best-effort
//! broadcast, periodic tasks, stats monitoring, and bounded shutdown.
//!
//! ### Dispatcher Module (`dispatcher`)
//! The rate-limited broadcast actor and the single-value cell it publishes
//! serialized snapshots into.
//!
//! ### Transport Module (`transport`)
//! A single tokio task multiplexing the listener and every observer
//! connection. Handles `JOIN:`/`INPUT:` control frames and pushes the latest
//! snapshot at a fixed interval, skipping peers with unsent backlog.
//!
//! ### Recording Module (`recording`)
//! Header, input events and quantized keyframes written through a bounded
//! queue by a dedicated writer thread.
//!
//! ### Arena Module (`arena`)
//! A small demo simulation used by the server binary.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::actor::Envelope;
//! use server::directory::ActorDirectory;
//! use server::dispatcher::{BroadcastDispatcher, DispatchMessage, LatestSnapshot, BROADCAST_INTERVAL, DISPATCHER_ID};
//! use server::transport::{NoopEvents, TransportConfig, TransportServer};
//! use shared::{unix_time_secs, Snapshot, SimulationState};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let latest = LatestSnapshot::new();
//!     let directory = ActorDirectory::new();
//!     let (dispatcher, _counters) = BroadcastDispatcher::mailbox(latest.clone(), BROADCAST_INTERVAL);
//!     directory.register(Arc::new(dispatcher));
//!
//!     let transport = TransportServer::bind(TransportConfig::default(), latest, Arc::new(NoopEvents))
//!         .await?
//!         .spawn();
//!
//!     let snapshot = Snapshot::new(unix_time_secs(), SimulationState::Playing, Vec::new());
//!     directory.send(DISPATCHER_ID, Envelope::new("main", DispatchMessage::Snapshot(snapshot)));
//!
//!     transport.shutdown().await?;
//!     directory.shutdown();
//!     Ok(())
//! }
//! ```

pub mod actor;
pub mod arena;
pub mod directory;
pub mod dispatcher;
pub mod recording;
pub mod transport;

pub use actor::{Actor, ActorError, Envelope, Mailbox};
pub use directory::ActorDirectory;
pub use dispatcher::{BroadcastDispatcher, DispatchMessage, LatestSnapshot};
pub use recording::{Recorder, RecordingConfig, RecordingError};
pub use transport::{ObserverStats, TransportConfig, TransportEvents, TransportServer};
