//! TCP implementation of the core's [`Transport`].
//!
//! A tokio runtime runs on its own threads. The accept loop admits peers
//! up to the client limit and gives each a task that owns both halves of
//! its stream. The tick thread talks to peers only through non-blocking
//! handles: a bounded outbound queue per peer, a shared inbound channel,
//! and lifecycle events.

use std::net::{AddrParseError, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use cairn_config::NetworkConfig;
use cairn_sched::{ClientId, ClientMessage, LifecycleSender, Transport, TransportError};
use crossbeam_channel::{Receiver, Sender, unbounded};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use crate::framing::{FrameError, FrameLimits, read_frame, write_frame};
use crate::wire::decode_client;

/// How long queued output may take to drain once shutdown begins.
const SHUTDOWN_FLUSH: Duration = Duration::from_secs(1);

/// Atomic generator for monotonically increasing [`ClientId`]s.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Creates a generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Returns the next unused id.
    pub fn next_id(&self) -> ClientId {
        ClientId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Settings for [`TcpTransport`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Listener address. Port 0 picks an ephemeral port.
    pub bind_addr: SocketAddr,
    /// Peers admitted at once; further connections are closed on accept.
    pub max_clients: usize,
    /// Frame size limits in both directions.
    pub limits: FrameLimits,
    /// Frames queued per peer before `send` reports backpressure.
    pub outbound_queue_frames: usize,
    /// Inbound silence after which a peer is dropped as timed out.
    pub peer_timeout: Duration,
}

impl TransportConfig {
    /// Builds transport settings from the network section of the config.
    pub fn from_network(config: &NetworkConfig) -> Result<Self, AddrParseError> {
        Ok(Self {
            bind_addr: config.socket_addr()?,
            max_clients: config.max_clients,
            limits: FrameLimits::from(config),
            outbound_queue_frames: config.outbound_queue_frames.max(1),
            peer_timeout: Duration::from_secs_f32(config.peer_timeout_s.max(0.001)),
        })
    }
}

struct Peer {
    outbound: mpsc::Sender<Vec<u8>>,
}

/// State shared by the tick thread and the runtime's tasks.
struct Shared {
    config: TransportConfig,
    peers: DashMap<ClientId, Peer>,
    ids: IdGenerator,
    lifecycle: LifecycleSender,
    inbound: Sender<(ClientId, ClientMessage)>,
}

struct Running {
    thread: JoinHandle<()>,
    runtime: Handle,
    shutdown: watch::Sender<bool>,
    local_addr: SocketAddr,
}

/// TCP transport with length-prefixed, postcard-encoded packets.
pub struct TcpTransport {
    shared: Arc<Shared>,
    inbound: Receiver<(ClientId, ClientMessage)>,
    running: Mutex<Option<Running>>,
}

impl TcpTransport {
    /// Creates a stopped transport that will report peers to `lifecycle`.
    pub fn new(config: TransportConfig, lifecycle: LifecycleSender) -> Self {
        let (inbound_tx, inbound) = unbounded();
        Self {
            shared: Arc::new(Shared {
                config,
                peers: DashMap::new(),
                ids: IdGenerator::new(),
                lifecycle,
                inbound: inbound_tx,
            }),
            inbound,
            running: Mutex::new(None),
        }
    }

    /// Address actually bound, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    /// Number of admitted peers.
    pub fn peer_count(&self) -> usize {
        self.shared.peers.len()
    }

    /// Runs `f` once when the process receives Ctrl-C.
    pub fn on_interrupt(&self, f: impl FnOnce() + Send + 'static) -> Result<(), TransportError> {
        let running = self.running.lock();
        let running = running.as_ref().ok_or(TransportError::Closed)?;
        running.runtime.spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => f(),
                Err(e) => warn!(error = %e, "failed to listen for Ctrl-C"),
            }
        });
        Ok(())
    }
}

impl Transport for TcpTransport {
    fn start(&self) -> Result<(), TransportError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }

        let listener = std::net::TcpListener::bind(self.shared.config.bind_addr)
            .map_err(TransportError::Bind)?;
        listener
            .set_nonblocking(true)
            .map_err(TransportError::Bind)?;
        let local_addr = listener.local_addr().map_err(TransportError::Bind)?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("cairn-net")
            .enable_all()
            .build()
            .map_err(TransportError::Startup)?;
        let handle = runtime.handle().clone();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Arc::clone(&self.shared);
        let thread = std::thread::Builder::new()
            .name("cairn-net-accept".into())
            .spawn(move || {
                runtime.block_on(async move {
                    match TcpListener::from_std(listener) {
                        Ok(listener) => accept_loop(listener, shared, shutdown_rx).await,
                        Err(e) => warn!(error = %e, "failed to register listener"),
                    }
                });
            })
            .map_err(TransportError::Startup)?;

        info!(addr = %local_addr, "listening");
        *running = Some(Running {
            thread,
            runtime: handle,
            shutdown: shutdown_tx,
            local_addr,
        });
        Ok(())
    }

    fn send(&self, client: ClientId, payload: Vec<u8>) -> Result<(), TransportError> {
        let max = self.shared.config.limits.max_payload as usize;
        if payload.len() > max {
            return Err(TransportError::FrameTooLarge {
                size: payload.len(),
                max,
            });
        }
        let peer = self
            .shared
            .peers
            .get(&client)
            .ok_or(TransportError::UnknownClient(client))?;
        match peer.outbound.try_send(payload) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(TransportError::Backpressure(client)),
            Err(TrySendError::Closed(_)) => Err(TransportError::UnknownClient(client)),
        }
    }

    fn receive(&self) -> Option<(ClientId, ClientMessage)> {
        self.inbound.try_recv().ok()
    }

    fn disconnect(&self, client: ClientId) {
        // Dropping the queue's sender lets the writer flush and close.
        if self.shared.peers.remove(&client).is_some() {
            debug!(client = %client, "closing peer");
        }
    }

    fn shutdown(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        let _ = running.shutdown.send(true);
        if running.thread.join().is_err() {
            warn!("network thread panicked");
        }
        info!("transport stopped");
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Runtime side
// ---------------------------------------------------------------------------

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut peers = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    if shared.peers.len() >= shared.config.max_clients {
                        warn!(%addr, max = shared.config.max_clients, "server full, rejecting peer");
                        drop(stream);
                    } else {
                        peers.spawn(admit(stream, addr, Arc::clone(&shared), shutdown.clone()));
                    }
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
            Some(_) = peers.join_next(), if !peers.is_empty() => {}
            _ = shutdown.changed() => break,
        }
    }

    drop(listener);
    // Dropping every queue lets each writer flush what it has and close.
    // Every peer reports its disconnect before shutdown returns.
    shared.peers.clear();
    while peers.join_next().await.is_some() {}
}

fn admit(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown: watch::Receiver<bool>,
) -> impl Future<Output = ()> {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%addr, error = %e, "failed to set TCP_NODELAY");
    }
    let id = shared.ids.next_id();
    let (tx, rx) = mpsc::channel(shared.config.outbound_queue_frames.max(1));
    shared.peers.insert(id, Peer { outbound: tx });
    shared.lifecycle.connected(id);
    info!(client = %id, %addr, "peer connected");
    serve_peer(id, stream, shared, rx, shutdown)
}

async fn serve_peer(
    id: ClientId,
    stream: TcpStream,
    shared: Arc<Shared>,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let limits = shared.config.limits;
    let (mut reader, mut writer) = stream.into_split();

    // The writer ends on its own once the peer's queue sender is dropped
    // and drained, which is how both disconnect and shutdown close a peer.
    let timed_out = tokio::select! {
        timed_out = read_loop(id, &mut reader, &shared) => timed_out,
        () = write_loop(id, &mut writer, &mut outbound, limits) => false,
        () = shutdown_grace(&mut shutdown) => {
            debug!(client = %id, "gave up flushing on shutdown");
            false
        }
    };

    shared.peers.remove(&id);
    shared.lifecycle.disconnected(id, timed_out);
    info!(client = %id, timed_out, "peer disconnected");
}

/// Completes [`SHUTDOWN_FLUSH`] after shutdown is signalled.
async fn shutdown_grace(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
    tokio::time::sleep(SHUTDOWN_FLUSH).await;
}

/// Returns `true` if the peer went silent for too long.
async fn read_loop(id: ClientId, reader: &mut OwnedReadHalf, shared: &Shared) -> bool {
    let limits = shared.config.limits;
    loop {
        let read = tokio::time::timeout(shared.config.peer_timeout, read_frame(reader, limits));
        let frame = match read.await {
            Err(_) => return true,
            Ok(Err(FrameError::Closed)) => return false,
            Ok(Err(e)) => {
                debug!(client = %id, error = %e, "read failed");
                return false;
            }
            Ok(Ok(frame)) => frame,
        };
        if frame.is_empty() {
            continue;
        }
        match decode_client(&frame) {
            Ok(message) => {
                trace!(client = %id, ?message, "received");
                if shared.inbound.send((id, message)).is_err() {
                    return false;
                }
            }
            Err(e) => warn!(client = %id, error = %e, "dropping undecodable frame"),
        }
    }
}

async fn write_loop(
    id: ClientId,
    writer: &mut OwnedWriteHalf,
    outbound: &mut mpsc::Receiver<Vec<u8>>,
    limits: FrameLimits,
) {
    while let Some(payload) = outbound.recv().await {
        if let Err(e) = write_frame(writer, &payload, limits).await {
            debug!(client = %id, error = %e, "write failed");
            return;
        }
    }
    let _ = writer.shutdown().await;
}
