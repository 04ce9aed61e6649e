//! Observer side of the relay protocol over TCP
//!
//! An [`ObserverClient`] connects, optionally joins with a display name, then
//! reads one broadcast line at a time. It can be split into a [`FrameReader`]
//! that feeds an interpolation buffer and a [`ControlWriter`] for sending
//! input while the reader runs on its own task.

use crate::interpolation::SharedBuffer;
use log::{debug, info, warn};
use shared::protocol::{decode_broadcast, JOIN_ACK};
use shared::{ControlFrame, Snapshot};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("network error: {0}")]
    Io(#[from] io::Error),
    #[error("no JOIN-ACK within {0:?}")]
    JoinTimeout(Duration),
    #[error("server closed the connection")]
    Closed,
}

#[derive(Debug)]
pub struct FrameReader {
    lines: Lines<BufReader<OwnedReadHalf>>,
    malformed: u64,
}

impl FrameReader {
    fn new(read: OwnedReadHalf) -> Self {
        Self {
            lines: BufReader::new(read).lines(),
            malformed: 0,
        }
    }

    /// Lines that were neither a snapshot nor an acknowledgement
    pub fn malformed(&self) -> u64 {
        self.malformed
    }

    /// Next snapshot from the server, or `None` once it closes the connection.
    /// Acknowledgements and undecodable lines are skipped.
    pub async fn next_snapshot(&mut self) -> Result<Option<Snapshot>, ClientError> {
        while let Some(line) = self.lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() || line == JOIN_ACK {
                continue;
            }
            match decode_broadcast(line) {
                Ok(snapshot) => return Ok(Some(snapshot)),
                Err(e) => {
                    self.malformed += 1;
                    debug!("Skipping undecodable line: {}", e);
                }
            }
        }
        Ok(None)
    }

    async fn wait_for_ack(&mut self) -> Result<(), ClientError> {
        loop {
            match self.lines.next_line().await? {
                Some(line) if line.trim() == JOIN_ACK => return Ok(()),
                Some(_) => continue,
                None => return Err(ClientError::Closed),
            }
        }
    }

    /// Pushes every received snapshot into `buffer` until the server closes
    /// the connection. Returns how many were accepted.
    pub async fn run(mut self, buffer: SharedBuffer) -> Result<u64, ClientError> {
        let mut accepted = 0;
        while let Some(snapshot) = self.next_snapshot().await? {
            let pushed = match buffer.lock() {
                Ok(mut guard) => guard.push(snapshot),
                Err(poisoned) => poisoned.into_inner().push(snapshot),
            };
            if pushed {
                accepted += 1;
            }
        }
        info!("Server closed the stream after {} snapshots", accepted);
        Ok(accepted)
    }
}

#[derive(Debug)]
pub struct ControlWriter {
    write: OwnedWriteHalf,
}

impl ControlWriter {
    pub async fn send(&mut self, frame: &ControlFrame) -> io::Result<()> {
        self.write.write_all(frame.to_line().as_bytes()).await?;
        self.write.flush().await
    }

    pub async fn send_input(&mut self, vx: f32, vy: f32) -> io::Result<()> {
        self.send(&ControlFrame::Input { vx, vy }).await
    }
}

#[derive(Debug)]
pub struct ObserverClient {
    server_addr: SocketAddr,
    reader: FrameReader,
    writer: ControlWriter,
}

impl ObserverClient {
    pub async fn connect(addr: &str) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Could not disable Nagle: {}", e);
        }
        let server_addr = stream.peer_addr()?;
        let (read, write) = stream.into_split();
        debug!("Connected to {}", server_addr);

        Ok(Self {
            server_addr,
            reader: FrameReader::new(read),
            writer: ControlWriter { write },
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// Sends `JOIN:<name>` and waits for the acknowledgement. Snapshots that
    /// arrive in the meantime are discarded.
    pub async fn join(&mut self, name: &str, timeout: Duration) -> Result<(), ClientError> {
        self.writer
            .send(&ControlFrame::Join {
                name: name.to_string(),
            })
            .await?;
        tokio::time::timeout(timeout, self.reader.wait_for_ack())
            .await
            .map_err(|_| ClientError::JoinTimeout(timeout))??;
        info!("Joined {} as {}", self.server_addr, name);
        Ok(())
    }

    pub async fn send_input(&mut self, vx: f32, vy: f32) -> Result<(), ClientError> {
        Ok(self.writer.send_input(vx, vy).await?)
    }

    pub async fn next_snapshot(&mut self) -> Result<Option<Snapshot>, ClientError> {
        self.reader.next_snapshot().await
    }

    pub fn split(self) -> (FrameReader, ControlWriter) {
        (self.reader, self.writer)
    }
}
