//! Scheduling and delivery core of the cairn voxel server: which blocks to
//! emerge next, which blocks to send to which client next, per-client
//! bookkeeping, peer lifecycle, and the tick loop that drives them under a
//! fixed environment-before-registry lock order.

pub mod budget;
pub mod client;
pub mod coords;
pub mod emerge;
pub mod error;
pub mod lifecycle;
pub mod planner;
pub mod queue;
pub mod registry;
pub mod send;
pub mod server_loop;
pub mod services;
pub mod shared;
pub mod worker;

pub use budget::ClientBandwidthTracker;
pub use client::{ClientId, ClientState, ClientView, NEVER_BUILT, ObjectId};
pub use coords::{BlockPos, shell};
pub use emerge::{EmergeRequest, EmergeScheduler};
pub use error::{CodecError, HandshakeError, ServerError, StorageError, TransportError};
pub use lifecycle::{LifecycleEvent, LifecycleSender, PeerLifecycleQueue};
pub use planner::{BlockPlan, EMPTY_SWEEPS_BEFORE_PAUSE, plan_client, priority_for_distance};
pub use queue::{PriorityTimeoutQueue, QueuedEntry, UpsertOutcome};
pub use registry::ClientRegistry;
pub use send::{DrainBudget, SendRequest, SendScheduler};
pub use server_loop::{ServerLoop, ServerState, ServerStatus, ShutdownHandle};
pub use services::{
    BlockContent, ClientMessage, PacketCodec, ServerMessage, Transport, WorldStorage,
};
pub use shared::{BothGuard, EnvGuard, Environment, RegistryGuard, SharedState};
pub use worker::{EmergeOutcome, EmergeWorker, WORKER_THREAD_NAME};
