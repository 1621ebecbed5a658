//! The tick-driven state machine that ties the core together.
//!
//! `Stopped -> Starting -> Running -> Stopping -> Stopped`. While running,
//! every [`ServerLoop::step`] does, in order:
//!
//! 1. drain the lifecycle queue into the registry
//! 2. advance the send clock, uptime and per-client timers
//! 3. apply inbound client messages
//! 4. plan sends and emerges for every ready client
//! 5. drain the send scheduler within budget and transmit
//! 6. collect emerge results and offer them to interested clients
//! 7. wake the emerge worker if there is work for it
//!
//! The tick never blocks on I/O. Storage runs on the emerge worker; the
//! transport queues outbound frames and reports backpressure instead of
//! waiting.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cairn_config::Config;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, error, info, trace, warn};

use crate::budget::ClientBandwidthTracker;
use crate::client::{ClientId, ClientView};
use crate::coords::BlockPos;
use crate::emerge::EmergeScheduler;
use crate::error::{HandshakeError, ServerError, StorageError};
use crate::lifecycle::{LifecycleEvent, LifecycleSender, PeerLifecycleQueue};
use crate::planner::{plan_client, priority_for_distance};
use crate::send::{DrainBudget, SendScheduler};
use crate::services::{ClientMessage, PacketCodec, ServerMessage, Transport, WorldStorage};
use crate::shared::{BothGuard, SharedState};
use crate::worker::EmergeWorker;

/// Inbound messages applied per tick before the rest of the tick runs.
const MAX_INBOUND_PER_TICK: usize = 4096;

/// Lifecycle state of a [`ServerLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerState {
    /// Not started, or fully torn down.
    Stopped,
    /// Opening the transport and spawning the worker.
    Starting,
    /// Ticking.
    Running,
    /// Tearing down.
    Stopping,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Point-in-time summary for operators.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServerStatus {
    /// Current lifecycle state.
    pub state: ServerState,
    /// Seconds of simulated time since start.
    pub uptime: f64,
    /// Connected clients.
    pub clients: usize,
    /// Blocks held in the environment.
    pub loaded_blocks: usize,
    /// Queued emerge requests.
    pub emerge_queue: usize,
    /// Queued send requests.
    pub send_queue: usize,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} uptime={:.1}s clients={} loaded={} emerge_queue={} send_queue={}",
            self.state,
            self.uptime,
            self.clients,
            self.loaded_blocks,
            self.emerge_queue,
            self.send_queue
        )
    }
}

/// Cloneable flag that asks a running loop to stop at its next tick.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    /// Requests shutdown. Safe to call from any thread, including a
    /// signal handler task.
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether shutdown was requested.
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Withdraws a request once the stop it asked for has happened.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The authoritative server's tick loop.
pub struct ServerLoop {
    config: Config,
    state: ServerState,
    shared: Arc<SharedState>,
    emerge: Arc<EmergeScheduler>,
    send: SendScheduler,
    lifecycle: PeerLifecycleQueue,
    transport: Arc<dyn Transport>,
    storage: Arc<dyn WorldStorage>,
    codec: Arc<dyn PacketCodec>,
    worker: Option<EmergeWorker>,
    /// Requested and not yet reported back by the worker.
    emerging: FxHashSet<BlockPos>,
    /// Uptime before which a failed position is not requested again.
    emerge_backoff: FxHashMap<BlockPos, f64>,
    /// Blocks that cannot be encoded or framed for a client. Never planned
    /// for that client again while it stays connected.
    undeliverable: FxHashSet<(ClientId, BlockPos)>,
    bandwidth: FxHashMap<ClientId, ClientBandwidthTracker>,
    emerge_trigger_timer: f32,
    print_info_timer: f32,
    shutdown: ShutdownHandle,
}

impl ServerLoop {
    /// Builds a stopped loop.
    ///
    /// `lifecycle` must be the queue whose sender was handed to `transport`.
    pub fn new(
        config: Config,
        lifecycle: PeerLifecycleQueue,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn WorldStorage>,
        codec: Arc<dyn PacketCodec>,
    ) -> Self {
        Self {
            config,
            state: ServerState::Stopped,
            shared: Arc::new(SharedState::new()),
            emerge: Arc::new(EmergeScheduler::new()),
            send: SendScheduler::new(),
            lifecycle,
            transport,
            storage,
            codec,
            worker: None,
            emerging: FxHashSet::default(),
            emerge_backoff: FxHashMap::default(),
            undeliverable: FxHashSet::default(),
            bandwidth: FxHashMap::default(),
            emerge_trigger_timer: 0.0,
            print_info_timer: 0.0,
            shutdown: ShutdownHandle::default(),
        }
    }

    /// Opens the transport and spawns the emerge worker.
    pub fn start(&mut self) -> Result<(), ServerError> {
        self.expect_state(ServerState::Stopped)?;
        self.state = ServerState::Starting;

        if let Err(e) = self.transport.start() {
            self.state = ServerState::Stopped;
            return Err(ServerError::Transport(e));
        }
        let worker = EmergeWorker::spawn(
            Arc::clone(&self.emerge),
            Arc::clone(&self.storage),
            Arc::clone(&self.shared),
        );
        match worker {
            Ok(worker) => self.worker = Some(worker),
            Err(e) => {
                self.transport.shutdown();
                self.state = ServerState::Stopped;
                return Err(e);
            }
        }

        self.state = ServerState::Running;
        info!(
            tick_rate = self.config.server.tick_rate,
            max_view_radius = self.config.streaming.max_view_radius,
            "server running"
        );
        Ok(())
    }

    /// Runs one tick of `dtime` seconds.
    ///
    /// A fatal storage error tears the server down and is returned. If a
    /// shutdown was requested, the loop stops instead of ticking.
    pub fn step(&mut self, dtime: f32) -> Result<(), ServerError> {
        self.expect_state(ServerState::Running)?;
        if self.shutdown.is_requested() {
            info!("shutdown requested");
            self.stop();
            return Ok(());
        }
        let dtime = dtime.max(0.0);

        self.process_lifecycle();
        self.advance_clocks(dtime);
        self.process_inbound();
        let requested = self.plan_blocks();
        self.send_blocks();
        if let Err(e) = self.collect_emerges() {
            error!(error = %e, "unrecoverable storage failure, stopping");
            self.stop();
            return Err(ServerError::FatalStorage(e));
        }
        self.drive_worker(dtime, requested);
        self.print_info(dtime);
        Ok(())
    }

    /// Notifies clients, joins the worker, closes the transport and drops
    /// every client. Does nothing if already stopped.
    pub fn stop(&mut self) {
        if self.state == ServerState::Stopped {
            return;
        }
        self.state = ServerState::Stopping;
        info!("server stopping");

        let notice = ServerMessage::Shutdown {
            reason: "server shutting down".into(),
        };
        let ids = self.shared.lock_registry().ids();
        for &id in &ids {
            self.send_message(id, &notice);
        }

        if let Some(mut worker) = self.worker.take() {
            worker.shutdown();
        }
        self.transport.shutdown();

        self.shared.lock_registry().clear();
        // Events for peers that no longer exist in the registry.
        let stale = self.lifecycle.drain();
        self.send.clear();
        self.emerge.clear();
        self.emerging.clear();
        self.emerge_backoff.clear();
        self.undeliverable.clear();
        self.bandwidth.clear();
        // The request that led here is spent; a later start runs normally.
        self.shutdown.reset();

        self.state = ServerState::Stopped;
        info!(clients = ids.len(), stale_events = stale.len(), "server stopped");
    }

    /// Asks the loop to stop at its next tick.
    pub fn request_shutdown(&self) {
        self.shutdown.request();
    }

    /// A handle other threads can use to request shutdown.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Snapshot of the loop's counters.
    pub fn status(&self) -> ServerStatus {
        let (uptime, loaded_blocks) = {
            let env = self.shared.lock_env();
            (env.uptime(), env.loaded_len())
        };
        ServerStatus {
            state: self.state,
            uptime,
            clients: self.shared.lock_registry().len(),
            loaded_blocks,
            emerge_queue: self.emerge.size(),
            send_queue: self.send.size(),
        }
    }

    /// Producer handle for the lifecycle queue.
    pub fn lifecycle_sender(&self) -> LifecycleSender {
        self.lifecycle.sender()
    }

    /// The environment and registry locks.
    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    /// The send queue.
    pub fn send_scheduler(&self) -> &SendScheduler {
        &self.send
    }

    /// The emerge queue.
    pub fn emerge_scheduler(&self) -> &EmergeScheduler {
        &self.emerge
    }

    /// Active configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn expect_state(&self, expected: ServerState) -> Result<(), ServerError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(ServerError::InvalidState {
                expected,
                actual: self.state,
            })
        }
    }

    // -----------------------------------------------------------------------
    // Tick phases
    // -----------------------------------------------------------------------

    fn process_lifecycle(&mut self) {
        for event in self.lifecycle.drain() {
            match event {
                LifecycleEvent::Connected(id) => {
                    self.shared.lock_registry().create(id);
                    let budget = self.config.streaming.bytes_per_client_per_tick;
                    self.bandwidth
                        .insert(id, ClientBandwidthTracker::new(id, budget));
                    info!(client = %id, "client connected");
                }
                LifecycleEvent::Disconnected { id, timeout } => {
                    let purged = self.send.purge_client(id);
                    let client = self.shared.lock_registry().destroy(id);
                    self.bandwidth.remove(&id);
                    self.undeliverable.retain(|(client, _)| *client != id);
                    info!(
                        client = %id,
                        player = %client.player_name,
                        timeout,
                        purged,
                        "client disconnected"
                    );
                }
            }
        }
    }

    fn advance_clocks(&mut self, dtime: f32) {
        self.send.advance_clock(dtime);
        let uptime = {
            let mut env = self.shared.lock_env();
            env.advance_uptime(dtime);
            env.uptime()
        };
        self.shared.lock_registry().advance_timers(dtime);
        for tracker in self.bandwidth.values_mut() {
            tracker.end_tick();
        }
        self.emerge_backoff.retain(|_, retry_at| *retry_at > uptime);
    }

    fn process_inbound(&mut self) {
        for _ in 0..MAX_INBOUND_PER_TICK {
            let Some((id, message)) = self.transport.receive() else {
                break;
            };
            self.handle_message(id, message);
        }
    }

    fn handle_message(&self, id: ClientId, message: ClientMessage) {
        let reply = {
            let mut registry = self.shared.lock_registry();
            let Some(client) = registry.get_mut(id) else {
                debug!(client = %id, "message from unknown client dropped");
                return;
            };
            match message {
                ClientMessage::Init {
                    serialization_version,
                    protocol_version,
                    player_name,
                } => {
                    let protocol = &self.config.protocol;
                    match client.begin_handshake(
                        serialization_version,
                        protocol_version,
                        &player_name,
                        protocol.min_serialization_version,
                        protocol.max_serialization_version,
                    ) {
                        Ok(version) => {
                            info!(client = %id, player = %player_name, version, "handshake started");
                            Some(ServerMessage::InitAck {
                                serialization_version: version,
                            })
                        }
                        Err(e @ HandshakeError::VersionMismatch { .. }) => {
                            warn!(client = %id, player = %player_name, error = %e, "access denied");
                            Some(ServerMessage::AccessDenied {
                                reason: e.to_string(),
                            })
                        }
                        Err(e) => {
                            warn!(client = %id, error = %e, "ignoring Init");
                            None
                        }
                    }
                }
                ClientMessage::Init2 => {
                    match client.complete_handshake() {
                        Ok(version) => info!(client = %id, version, "client ready"),
                        Err(e) => warn!(client = %id, error = %e, "ignoring Init2"),
                    }
                    None
                }
                ClientMessage::PlayerView { center, radius } => {
                    let max = self.config.streaming.max_view_radius;
                    client.set_view(ClientView {
                        center,
                        radius: radius.clamp(0, max.max(0)),
                    });
                    None
                }
                ClientMessage::GotBlocks(blocks) => {
                    for pos in blocks {
                        client.mark_block_sent(pos);
                    }
                    None
                }
                ClientMessage::DeletedBlocks(blocks) => {
                    let forgotten = blocks.into_iter().filter(|&p| client.forget_block(p)).count();
                    trace!(client = %id, forgotten, "client deleted blocks");
                    None
                }
                ClientMessage::Interacted => {
                    client.note_building();
                    None
                }
            }
        };

        if let Some(reply) = reply {
            let deny = matches!(reply, ServerMessage::AccessDenied { .. });
            self.send_message(id, &reply);
            if deny {
                self.transport.disconnect(id);
            }
        }
    }

    /// Returns how many emerge requests were issued.
    fn plan_blocks(&mut self) -> usize {
        let streaming = &self.config.streaming;
        let mut sends = Vec::new();
        let mut emerges = Vec::new();
        {
            let BothGuard { env, mut registry } = self.shared.lock_both();
            let uptime = env.uptime();
            for client in registry.iter_mut() {
                let id = client.id;
                let plan = plan_client(
                    client,
                    &env,
                    streaming,
                    |pos| {
                        self.send.is_queued(id, pos) || self.undeliverable.contains(&(id, pos))
                    },
                    |pos| {
                        self.emerging.contains(&pos)
                            || self
                                .emerge_backoff
                                .get(&pos)
                                .is_some_and(|retry_at| *retry_at > uptime)
                    },
                );
                sends.extend(plan.sends.into_iter().map(|(pos, p)| (id, pos, p)));
                emerges.extend(plan.emerges);
            }
        }

        let timeout = streaming.block_send_timeout_s;
        for (id, pos, priority) in sends {
            self.send.offer(id, pos, priority, timeout);
        }
        let requested = emerges.len();
        for (pos, priority) in emerges {
            self.emerge.request_emerge(pos, priority);
            self.emerging.insert(pos);
        }
        requested
    }

    fn send_blocks(&mut self) {
        let streaming = &self.config.streaming;
        let requests = self.send.drain(DrainBudget {
            max_total: streaming.max_sends_per_tick,
            max_per_client: streaming.max_sends_per_client_per_tick,
        });
        if requests.is_empty() {
            return;
        }

        // Resolve under both locks, then encode and transmit with none held.
        let mut jobs = Vec::with_capacity(requests.len());
        {
            let BothGuard { env, registry } = self.shared.lock_both();
            for req in requests {
                let Some(client) = registry.get(req.client) else {
                    debug!(client = %req.client, pos = %req.pos, "send for departed client dropped");
                    continue;
                };
                let Some(version) = client.serialization_version else {
                    continue;
                };
                if client.is_block_sent(req.pos) {
                    continue;
                }
                let Some(block) = env.block(req.pos) else {
                    continue;
                };
                jobs.push((req, version, block));
            }
        }

        let mut delivered = Vec::new();
        let mut retry = Vec::new();
        for (req, version, block) in jobs {
            let bytes = match self.codec.encode_block(req.pos, &block, version) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(client = %req.client, pos = %req.pos, error = %e, "failed to encode block, giving up on it");
                    self.undeliverable.insert((req.client, req.pos));
                    continue;
                }
            };
            let Some(budget) = self.bandwidth.get_mut(&req.client) else {
                continue;
            };
            let len = bytes.len();
            if !budget.allows(len) {
                retry.push(req);
                continue;
            }
            match self.transport.send(req.client, bytes) {
                Ok(()) => {
                    budget.consume(len);
                    delivered.push((req.client, req.pos));
                }
                Err(e) if e.is_transient() => {
                    trace!(client = %req.client, pos = %req.pos, "outbound queue full, re-offering");
                    retry.push(req);
                }
                Err(e) => {
                    debug!(client = %req.client, pos = %req.pos, error = %e, "send failed, giving up on block");
                    self.undeliverable.insert((req.client, req.pos));
                }
            }
        }

        if !delivered.is_empty() {
            let mut registry = self.shared.lock_registry();
            for (id, pos) in delivered {
                registry.mark_block_sent(id, pos);
            }
        }
        for req in retry {
            self.send
                .offer(req.client, req.pos, req.priority, streaming.block_send_timeout_s);
        }
    }

    /// Fails only on an unrecoverable storage error.
    fn collect_emerges(&mut self) -> Result<(), StorageError> {
        let Some(worker) = &self.worker else {
            return Ok(());
        };
        let outcomes = worker.drain_outcomes();
        if outcomes.is_empty() {
            return Ok(());
        }

        let streaming = &self.config.streaming;
        let uptime = self.shared.lock_env().uptime();
        let mut offers = Vec::new();
        {
            let registry = self.shared.lock_registry();
            for outcome in outcomes {
                let pos = outcome.pos;
                self.emerging.remove(&pos);
                match outcome.result {
                    Ok(()) => {
                        self.emerge_backoff.remove(&pos);
                        for client in registry.iter() {
                            let Some(view) = client.view else {
                                continue;
                            };
                            if client.is_ready()
                                && !client.is_block_sent(pos)
                                && !self.undeliverable.contains(&(client.id, pos))
                                && view.covers(pos, streaming.max_view_radius)
                            {
                                let d = view.center.chebyshev_distance(pos);
                                offers.push((client.id, pos, priority_for_distance(d as i16)));
                            }
                        }
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        let retry_at = uptime + streaming.emerge_retry_backoff_s as f64;
                        debug!(pos = %pos, error = %e, retry_at, "emerge backing off");
                        self.emerge_backoff.insert(pos, retry_at);
                    }
                }
            }
        }

        for (id, pos, priority) in offers {
            self.send
                .offer(id, pos, priority, streaming.block_send_timeout_s);
        }
        Ok(())
    }

    fn drive_worker(&mut self, dtime: f32, requested: usize) {
        let Some(worker) = &self.worker else {
            return;
        };
        self.emerge_trigger_timer += dtime;
        let overdue = self.emerge_trigger_timer >= self.config.server.emerge_trigger_interval_s;
        if requested > 0 || (overdue && self.emerge.size() > 0) {
            self.emerge_trigger_timer = 0.0;
            worker.trigger();
        }
    }

    fn print_info(&mut self, dtime: f32) {
        let interval = self.config.server.print_info_interval_s;
        if interval <= 0.0 {
            return;
        }
        self.print_info_timer += dtime;
        if self.print_info_timer < interval {
            return;
        }
        self.print_info_timer = 0.0;
        info!(status = %self.status(), "server status");
    }

    fn send_message(&self, id: ClientId, message: &ServerMessage) -> bool {
        let bytes = match self.codec.encode_message(message) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(client = %id, error = %e, "failed to encode message");
                return false;
            }
        };
        match self.transport.send(id, bytes) {
            Ok(()) => true,
            Err(e) => {
                debug!(client = %id, error = %e, "failed to send message");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[path = "server_loop_tests.rs"]
mod tests;
