//! PIR broadcast server.
//!
//! Two tasks share one [`ServerContext`] for the server's lifetime:
//!
//! - the accept loop hands each new connection to its own admission task,
//!   which greets it with a welcome record carrying the current sensor state
//!   and then registers it;
//! - the poll loop reads the sensor once per tick, tracks transitions and
//!   fans the serialized state record out to every registered client.
//!
//! Both loops stop on the server's cancellation token. Losing clients is
//! routine and never stops the server.

pub mod edges;
pub mod registry;

pub use edges::{EdgeTracker, Transition};
pub use registry::{ClientEntry, ClientId, ClientRegistry, FanOut};

use crate::config::ServerConfig;
use crate::error::{PirError, Result};
use crate::protocol::{PirState, Record, StateRecord, WelcomeRecord};
use crate::sensors::SensorSource;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use registry::write_frame;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const LISTEN_BACKLOG: u32 = 5;

/// Pause after a failed accept so a persistent error does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Log a status line every this many broadcasts.
const STATUS_EVERY: u64 = 10;

/// State shared by the accept loop and the poll loop.
struct ServerContext {
    registry: ClientRegistry<TcpStream>,
    sensor: Arc<dyn SensorSource>,
    current: AtomicBool,
    motion_count: AtomicU64,
    pin: u8,
    tick_interval: Duration,
}

impl ServerContext {
    fn current_state(&self) -> PirState {
        PirState::from(self.current.load(Ordering::SeqCst))
    }

    /// Greet a new connection and register it. A connection that cannot
    /// take the welcome record is dropped unregistered.
    async fn admit(&self, mut stream: TcpStream, remote: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", remote, e);
        }

        let welcome = match Record::from(WelcomeRecord::new(self.current_state())).to_line() {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to serialize welcome record: {}", e);
                return;
            }
        };
        if let Err(e) = write_frame(&mut stream, &welcome, self.registry.write_timeout()).await {
            info!("[REJECTED] Client {} failed to receive welcome: {}", remote, e);
            return;
        }

        self.registry.add(stream, remote).await;
    }
}

/// Handle to a running broadcast server.
pub struct BroadcastServer {
    context: Arc<ServerContext>,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    admissions: TaskTracker,
}

impl BroadcastServer {
    /// Bind the listening socket and start the accept and poll loops.
    ///
    /// Fails with [`PirError::Bind`] if the address cannot be acquired.
    pub async fn start(config: &ServerConfig, sensor: Arc<dyn SensorSource>) -> Result<Self> {
        let listener = bind(&config.bind_address, config.port).await?;
        let local_addr = listener.local_addr()?;

        let initial = sensor.read();
        info!("[INIT] Initial PIR state: {}", initial);

        let context = Arc::new(ServerContext {
            registry: ClientRegistry::new(config.write_timeout),
            sensor,
            current: AtomicBool::new(initial.is_motion()),
            motion_count: AtomicU64::new(0),
            pin: config.pin,
            tick_interval: config.tick_interval,
        });
        let cancel = CancellationToken::new();
        let admissions = TaskTracker::new();

        let accept_task = tokio::spawn(accept_loop(
            listener,
            context.clone(),
            cancel.clone(),
            admissions.clone(),
        ));
        let poll_task = tokio::spawn(poll_loop(context.clone(), cancel.clone()));

        info!(
            "PIR broadcast server listening on {} (pin {}, every {:?})",
            local_addr, config.pin, config.tick_interval
        );

        Ok(Self {
            context,
            local_addr,
            cancel,
            tasks: Mutex::new(vec![accept_task, poll_task]),
            admissions,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    pub async fn client_count(&self) -> usize {
        self.context.registry.len().await
    }

    /// Rising edges counted since start.
    pub fn motion_count(&self) -> u64 {
        self.context.motion_count.load(Ordering::SeqCst)
    }

    /// State read on the most recent tick.
    pub fn current_state(&self) -> PirState {
        self.context.current_state()
    }

    /// Stop both loops, close every client and release the listener.
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            info!("Stopping PIR broadcast server");
        }
        self.cancel.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await
                && !e.is_cancelled()
            {
                error!("Server task failed: {}", e);
            }
        }

        // Admissions may still register clients until they see the cancel.
        self.admissions.close();
        self.admissions.wait().await;

        let closed = self.context.registry.close_all().await;
        if closed > 0 {
            info!("Closed {} client connection(s)", closed);
        }
    }
}

impl Drop for BroadcastServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn bind(address: &str, port: u16) -> Result<TcpListener> {
    let display = format!("{}:{}", address, port);
    let bind_error = |source: io::Error| PirError::Bind {
        addr: display.clone(),
        source,
    };

    let addr = tokio::net::lookup_host((address, port))
        .await
        .map_err(&bind_error)?
        .next()
        .ok_or_else(|| {
            bind_error(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "address did not resolve",
            ))
        })?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(&bind_error)?;
    socket.set_reuseaddr(true).map_err(&bind_error)?;
    socket.bind(addr).map_err(&bind_error)?;
    socket.listen(LISTEN_BACKLOG).map_err(&bind_error)
}

async fn accept_loop(
    listener: TcpListener,
    context: Arc<ServerContext>,
    cancel: CancellationToken,
    admissions: TaskTracker,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, remote)) => {
                debug!("Accepted connection from {}", remote);
                let context = context.clone();
                let cancel = cancel.clone();
                admissions.spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => debug!("Dropped pending client {} on shutdown", remote),
                        _ = context.admit(stream, remote) => {}
                    }
                });
            }
            Err(e) => {
                warn!("[ERROR] Accept failed: {}", e);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                }
            }
        }
    }
    debug!("Accept loop stopped");
}

async fn poll_loop(context: Arc<ServerContext>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(context.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut tracker = EdgeTracker::new();
    let mut sent: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let now = Instant::now();
        let state = context.sensor.read();
        match tracker.observe(state, now) {
            Transition::MotionStarted => {
                info!("[PIR] Motion detected! (Total: {})", tracker.motion_count())
            }
            Transition::MotionEnded => info!("[PIR] Motion ended"),
            Transition::None => {}
        }
        context.current.store(state.is_motion(), Ordering::SeqCst);
        context
            .motion_count
            .store(tracker.motion_count(), Ordering::SeqCst);

        let motion_count = tracker.motion_count();
        let since_change = tracker.time_since_change(now);
        let result = context
            .registry
            .fan_out(|clients| {
                let record = StateRecord::new(state, context.pin, motion_count, since_change, clients);
                Ok(Record::from(record).to_line()?)
            })
            .await;

        match result {
            Ok(outcome) if outcome.attempted() > 0 => {
                sent += 1;
                if sent % STATUS_EVERY == 0 {
                    info!(
                        "[STATUS] PIR: {} | Clients: {} | Sent: {}",
                        state, outcome.delivered, sent
                    );
                }
            }
            Ok(_) => {}
            Err(e) => error!("Failed to broadcast state: {}", e),
        }
    }
    debug!("Poll loop stopped after {} broadcasts", sent);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::BooleanSensor;
    use serde_json::Value;
    use tokio::io::{AsyncBufReadExt, BufReader, Lines};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn test_config() -> ServerConfig {
        ServerConfig {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            tick_interval: Duration::from_millis(20),
            pin: 24,
            write_timeout: Duration::from_millis(500),
        }
    }

    async fn start(sensor: Arc<BooleanSensor>) -> BroadcastServer {
        BroadcastServer::start(&test_config(), sensor).await.unwrap()
    }

    async fn connect(server: &BroadcastServer) -> Lines<BufReader<TcpStream>> {
        let stream = TcpStream::connect(server.local_addr()).await.unwrap();
        BufReader::new(stream).lines()
    }

    async fn next_record(lines: &mut Lines<BufReader<TcpStream>>) -> Value {
        let line = timeout(WAIT, lines.next_line())
            .await
            .expect("timed out waiting for a record")
            .unwrap()
            .expect("connection closed");
        serde_json::from_str(&line).unwrap()
    }

    async fn wait_for_clients(server: &BroadcastServer, expected: usize) {
        let deadline = Instant::now() + WAIT;
        while server.client_count().await != expected {
            assert!(Instant::now() < deadline, "expected {} clients", expected);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_welcome_carries_current_state() {
        let sensor = Arc::new(BooleanSensor::new(true));
        let server = start(sensor.clone()).await;

        let mut client = connect(&server).await;
        let welcome = next_record(&mut client).await;
        assert_eq!(welcome["type"], "welcome");
        assert_eq!(welcome["pir_state"], 1);

        let state = next_record(&mut client).await;
        assert_eq!(state["type"], "pir_state");
        assert_eq!(state["state"], 1);
        assert_eq!(state["motion"], true);
        assert_eq!(state["pin"], 24);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_broadcast_counts_edges_and_clients() {
        let sensor = Arc::new(BooleanSensor::new(false));
        let server = start(sensor.clone()).await;

        let mut first = connect(&server).await;
        let mut second = connect(&server).await;
        wait_for_clients(&server, 2).await;

        sensor.set(true);
        for client in [&mut first, &mut second] {
            loop {
                let record = next_record(client).await;
                if record["type"] == "pir_state" && record["state"] == 1 {
                    assert_eq!(record["motion_count"], 1);
                    assert_eq!(record["clients_connected"], 2);
                    break;
                }
            }
        }
        assert_eq!(server.motion_count(), 1);
        assert_eq!(server.current_state(), PirState::Motion);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_lost_client_does_not_affect_others() {
        let sensor = Arc::new(BooleanSensor::new(false));
        let server = start(sensor.clone()).await;

        let mut a = connect(&server).await;
        let b = connect(&server).await;
        let mut c = connect(&server).await;
        wait_for_clients(&server, 3).await;

        drop(b);
        wait_for_clients(&server, 2).await;

        for client in [&mut a, &mut c] {
            loop {
                let record = next_record(client).await;
                if record["type"] == "pir_state" && record["clients_connected"] == 2 {
                    break;
                }
            }
        }
        assert!(server.is_running());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_clients_and_is_idempotent() {
        let server = start(Arc::new(BooleanSensor::new(false))).await;
        let addr = server.local_addr();
        let mut client = connect(&server).await;
        wait_for_clients(&server, 1).await;

        server.shutdown().await;
        server.shutdown().await;
        assert!(!server.is_running());
        assert_eq!(server.client_count().await, 0);

        // Drain whatever was sent before the close, then expect EOF.
        loop {
            match timeout(WAIT, client.next_line()).await.unwrap() {
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => break,
            }
        }
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_burst_is_admitted_concurrently() {
        let server = start(Arc::new(BooleanSensor::new(false))).await;

        // Hold a connection open without ever reading from it.
        let _silent = TcpStream::connect(server.local_addr()).await.unwrap();
        let mut clients = Vec::new();
        for _ in 0..8 {
            clients.push(connect(&server).await);
        }
        wait_for_clients(&server, 9).await;
        for client in &mut clients {
            assert_eq!(next_record(client).await["type"], "welcome");
        }

        server.shutdown().await;
        assert_eq!(server.client_count().await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_during_admissions_leaves_no_clients() {
        let server = start(Arc::new(BooleanSensor::new(false))).await;
        let addr = server.local_addr();

        let connecting = tokio::spawn(async move {
            let mut streams = Vec::new();
            for _ in 0..20 {
                match TcpStream::connect(addr).await {
                    Ok(stream) => streams.push(stream),
                    Err(_) => break,
                }
            }
            streams
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        server.shutdown().await;

        assert_eq!(server.client_count().await, 0);
        drop(connecting.await.unwrap());
    }

    #[tokio::test]
    async fn test_bind_error_when_port_taken() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = test_config();
        config.port = taken.local_addr().unwrap().port();

        let result = BroadcastServer::start(&config, Arc::new(BooleanSensor::default())).await;
        assert!(matches!(result, Err(PirError::Bind { .. })));
    }
}
