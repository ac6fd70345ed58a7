//! Registry of connected clients and the per-tick fan-out.
//!
//! Every structural change and every fan-out runs under one async mutex, so
//! the accept loop can never add a client while a tick is being written, and
//! a tick never observes a half-removed client.

use crate::Result;
use chrono::{DateTime, Local};
use log::{debug, info};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

pub type ClientId = u64;

/// One registered connection. Only the registry ever holds these.
pub struct ClientEntry<W> {
    pub id: ClientId,
    connection: W,
    pub remote_addr: SocketAddr,
    pub joined_at: DateTime<Local>,
}

/// Result of one fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub dropped: usize,
}

impl FanOut {
    pub fn attempted(&self) -> usize {
        self.delivered + self.dropped
    }
}

pub struct ClientRegistry<W> {
    clients: Mutex<Vec<ClientEntry<W>>>,
    next_id: AtomicU64,
    write_timeout: Duration,
}

/// Write a complete frame, bounded by `timeout`.
pub(crate) async fn write_frame<W>(connection: &mut W, frame: &[u8], timeout: Duration) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let write = async {
        connection.write_all(frame).await?;
        connection.flush().await
    };
    match tokio::time::timeout(timeout, write).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("write did not complete within {:?}", timeout),
        )),
    }
}

impl<W> ClientRegistry<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(write_timeout: Duration) -> Self {
        Self {
            clients: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            write_timeout,
        }
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    pub async fn add(&self, connection: W, remote_addr: SocketAddr) -> ClientId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut clients = self.clients.lock().await;
        clients.push(ClientEntry {
            id,
            connection,
            remote_addr,
            joined_at: Local::now(),
        });
        info!(
            "[CONNECTED] Client {} ({}) registered, {} connected",
            id,
            remote_addr,
            clients.len()
        );
        id
    }

    /// Remove and close one client. Returns false if it was already gone.
    pub async fn remove(&self, id: ClientId) -> bool {
        let entry = {
            let mut clients = self.clients.lock().await;
            let Some(index) = clients.iter().position(|c| c.id == id) else {
                return false;
            };
            clients.remove(index)
        };
        release(entry).await;
        true
    }

    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.lock().await.is_empty()
    }

    /// Remote addresses of the current clients, in join order.
    pub async fn peers(&self) -> Vec<(ClientId, SocketAddr)> {
        self.clients
            .lock()
            .await
            .iter()
            .map(|c| (c.id, c.remote_addr))
            .collect()
    }

    /// Write one frame to every client.
    ///
    /// `build` receives the number of clients at send time and is not called
    /// at all when the registry is empty. The frame is serialized once and
    /// the identical bytes go to every client. Clients whose write fails or
    /// times out are removed and closed.
    pub async fn fan_out<F>(&self, build: F) -> Result<FanOut>
    where
        F: FnOnce(usize) -> Result<Vec<u8>>,
    {
        let mut clients = self.clients.lock().await;
        if clients.is_empty() {
            return Ok(FanOut::default());
        }

        let frame = build(clients.len())?;
        let mut outcome = FanOut::default();
        let mut index = 0;
        while index < clients.len() {
            let client = &mut clients[index];
            match write_frame(&mut client.connection, &frame, self.write_timeout).await {
                Ok(()) => {
                    outcome.delivered += 1;
                    index += 1;
                }
                Err(e) => {
                    let entry = clients.remove(index);
                    info!(
                        "[DISCONNECTED] Client {} ({}) dropped: {}",
                        entry.id, entry.remote_addr, e
                    );
                    release(entry).await;
                    outcome.dropped += 1;
                }
            }
        }
        Ok(outcome)
    }

    /// Close every client. Returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let entries: Vec<_> = std::mem::take(&mut *self.clients.lock().await);
        let count = entries.len();
        for entry in entries {
            release(entry).await;
        }
        count
    }
}

/// Shut down a client's connection. A handle that is already dead is fine.
async fn release<W: AsyncWrite + Unpin>(mut entry: ClientEntry<W>) {
    let connected_for = Local::now().signed_duration_since(entry.joined_at);
    if let Err(e) = entry.connection.shutdown().await {
        debug!("Client {} shutdown: {}", entry.id, e);
    }
    debug!(
        "Client {} ({}) released after {}s",
        entry.id,
        entry.remote_addr,
        connected_for.num_seconds()
    );
}
