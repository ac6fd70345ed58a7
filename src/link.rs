//! Client side of the PIR protocol.
//!
//! A [`SensorLink`] owns one connection to a broadcast server. A background
//! task decodes the stream and latches rising edges; the consumer polls
//! [`SensorLink::get_motion`] from any thread.
//!
//! When the server goes away the link stays in a disconnected state. It
//! never reconnects by itself: callers watch [`SensorLink::is_connected`]
//! and build a new link when they want to.

use crate::config::LinkConfig;
use crate::decoder::{EdgeDetector, FrameDecoder, MotionLatch};
use crate::discovery;
use crate::error::{PirError, Result};
use crate::protocol::{PirState, Record};
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

const READ_BUFFER_SIZE: usize = 1024;

/// State shared between the decode task and the consumer.
#[derive(Default)]
struct LinkState {
    connected: AtomicBool,
    last_state: AtomicBool,
    latch: Mutex<MotionLatch>,
}

impl LinkState {
    fn apply(&self, detector: &mut EdgeDetector, record: &Record) {
        let edge = detector.observe(record);
        match record {
            Record::Welcome(welcome) => {
                info!("Connected: {} (PIR {})", welcome.message, welcome.pir_state);
            }
            Record::State(_) => {
                if let Some(edge) = edge {
                    self.latch.lock().set(Instant::now());
                    info!("Motion detected! (Count: {})", edge.motion_count);
                }
            }
        }
        self.last_state
            .store(detector.previous().is_motion(), Ordering::SeqCst);
    }
}

pub struct SensorLink {
    state: Arc<LinkState>,
    peer: SocketAddr,
    cancel: CancellationToken,
}

impl SensorLink {
    /// Connect to a broadcast server and start decoding in the background.
    pub async fn connect(addr: SocketAddr, config: &LinkConfig) -> Result<Self> {
        info!("Connecting to PIR server at {}...", addr);
        let stream = match tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(PirError::Connect { addr, source }),
            Err(_) => {
                return Err(PirError::ConnectTimeout {
                    addr,
                    timeout: config.connect_timeout,
                });
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }
        info!("Connected to PIR server at {}", addr);
        Ok(Self::from_stream(stream, addr, config))
    }

    /// Connect to `config.server`, or discover a server when none is set.
    pub async fn connect_or_discover(config: &LinkConfig) -> Result<Self> {
        let addr = match config.server.as_deref() {
            Some(server) => resolve(server, config.port).await?,
            None => discovery::discover(config.port, config.probe_timeout).await?,
        };
        Self::connect(addr, config).await
    }

    /// Start decoding an already established stream.
    pub fn from_stream<S>(stream: S, peer: SocketAddr, config: &LinkConfig) -> Self
    where
        S: AsyncRead + Unpin + Send + 'static,
    {
        let state = Arc::new(LinkState::default());
        state.connected.store(true, Ordering::SeqCst);
        let cancel = CancellationToken::new();

        tokio::spawn(decode_loop(
            stream,
            state.clone(),
            cancel.clone(),
            peer,
            config.read_timeout,
            config.max_frame_len,
        ));

        Self {
            state,
            peer,
            cancel,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    /// Consume a pending motion edge once it is older than `debounce`.
    ///
    /// The edge is reported only after the debounce window has elapsed, and
    /// exactly once.
    pub fn get_motion(&self, debounce: Duration) -> bool {
        self.state
            .latch
            .lock()
            .take_debounced(Instant::now(), debounce)
    }

    /// An edge is latched and not yet consumed.
    pub fn motion_pending(&self) -> bool {
        self.state.latch.lock().is_pending()
    }

    /// Drop a pending edge without reporting it.
    pub fn clear_motion(&self) {
        self.state.latch.lock().clear();
    }

    /// When the latest rising edge was seen, consumed or not.
    pub fn last_motion(&self) -> Option<Instant> {
        self.state.latch.lock().last_motion()
    }

    /// An edge is pending or the last one is younger than `window`.
    pub fn motion_within(&self, window: Duration) -> bool {
        self.state
            .latch
            .lock()
            .active_within(Instant::now(), window)
    }

    /// Last state received from the server (welcome or tick).
    pub fn last_state(&self) -> PirState {
        PirState::from(self.state.last_state.load(Ordering::SeqCst))
    }

    /// Stop the decode task and close the connection. Safe to call repeatedly.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            debug!("Closing link to {}", self.peer);
        }
        self.cancel.cancel();
        self.state.connected.store(false, Ordering::SeqCst);
    }
}

impl Drop for SensorLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Resolve `host` or `host:port`, defaulting to `port`.
pub async fn resolve(server: &str, port: u16) -> Result<SocketAddr> {
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let target = match server.rsplit_once(':') {
        Some((host, p)) if !host.contains(':') => match p.parse::<u16>() {
            Ok(p) => (host, p),
            Err(_) => return Err(PirError::InvalidAddress(server.to_string())),
        },
        _ => (server, port),
    };
    tokio::net::lookup_host(target)
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| PirError::InvalidAddress(server.to_string()))
}

async fn decode_loop<S>(
    mut stream: S,
    state: Arc<LinkState>,
    cancel: CancellationToken,
    peer: SocketAddr,
    read_timeout: Duration,
    max_frame_len: usize,
) where
    S: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::new(max_frame_len);
    let mut detector = EdgeDetector::default();
    let mut buf = [0u8; READ_BUFFER_SIZE];

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Decode loop for {} cancelled", peer);
                break;
            }
            read = tokio::time::timeout(read_timeout, stream.read(&mut buf)) => read,
        };

        match read {
            Err(_) => trace!("No data from {} within {:?}", peer, read_timeout),
            Ok(Ok(0)) => {
                warn!("Connection closed by server {}", peer);
                break;
            }
            Ok(Ok(n)) => {
                decoder.push(&buf[..n]);
                for frame in decoder.frames() {
                    match frame {
                        Ok(record) => state.apply(&mut detector, &record),
                        Err(e) => debug!("Discarding frame from {}: {}", peer, e),
                    }
                }
            }
            Ok(Err(e)) => {
                error!("Receive error from {}: {}", peer, e);
                break;
            }
        }
    }

    state.connected.store(false, Ordering::SeqCst);
}
