//! # Snapshot Relay Observer Library
//!
//! Client-side pieces for watching a relay server live or replaying a
//! recorded session. Presentation is left to the caller: everything here
//! produces [`shared::Snapshot`]s or display objects that a renderer can draw.
//!
//! ## Module Organization
//!
//! ### Network Module (`network`)
//! Connects to the relay over TCP, performs the `JOIN:` handshake, decodes
//! broadcast lines and sends `INPUT:` frames. The reader half can run on its
//! own task, feeding a shared interpolation buffer.
//!
//! ### Interpolation Module (`interpolation`)
//! A time-ordered buffer of received snapshots sampled slightly in the past,
//! so motion between 20 Hz broadcasts is blended rather than stepped:
//! - Out-of-order snapshots are rejected
//! - Frames older than two seconds relative to the newest are evicted
//! - Entities are joined across frames by id, never by position in the list
//!
//! ### Replay Module (`replay`)
//! Parses recording logs and reconstructs the scene at any point in time.
//! Display objects are created lazily and only ever deactivated, so an
//! entity keeps its identity while the user scrubs back and forth.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::interpolation::InterpolationBuffer;
//! use client::network::{ObserverClient, DEFAULT_JOIN_TIMEOUT};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut observer = ObserverClient::connect("127.0.0.1:7777").await?;
//!     observer.join("viewer", DEFAULT_JOIN_TIMEOUT).await?;
//!
//!     let buffer = InterpolationBuffer::shared();
//!     let (reader, _writer) = observer.split();
//!     tokio::spawn(reader.run(buffer.clone()));
//!
//!     // Later, once per rendered frame:
//!     let scene = buffer.lock().unwrap().sample(shared::unix_time_secs());
//!     println!("{:?}", scene.map(|s| s.entities.len()));
//!     Ok(())
//! }
//! ```

pub mod interpolation;
pub mod network;
pub mod replay;

pub use interpolation::{InterpolationBuffer, SharedBuffer};
pub use network::{ClientError, ObserverClient};
pub use replay::{Recording, ReplayReconstructor};
