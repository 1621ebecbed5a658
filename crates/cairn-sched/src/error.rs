//! Error types shared by the scheduling core and its collaborators.

use crate::client::ClientId;
use crate::coords::BlockPos;
use crate::server_loop::ServerState;

/// Failure reported by a [`WorldStorage`](crate::WorldStorage) implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// The block could not be produced this time. The position is dropped
    /// from the emerge queue; whoever needed it may ask again later.
    #[error("block {pos} unavailable: {reason}")]
    Unavailable {
        /// Position that failed.
        pos: BlockPos,
        /// Human-readable cause.
        reason: String,
    },

    /// Storage is unusable. The server must stop.
    #[error("fatal storage failure: {0}")]
    Fatal(String),
}

impl StorageError {
    /// Whether the error should bring the server down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Failure reported by a [`Transport`](crate::Transport) implementation.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The peer's outbound buffer is full; retry on a later tick.
    #[error("outbound buffer for client {0} is full")]
    Backpressure(ClientId),

    /// No live connection exists for this client.
    #[error("unknown client {0}")]
    UnknownClient(ClientId),

    /// The payload exceeds the transport's frame limit.
    #[error("payload of {size} bytes exceeds the {max} byte frame limit")]
    FrameTooLarge {
        /// Payload size.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// The transport has been shut down.
    #[error("transport closed")]
    Closed,

    /// The listener could not be opened.
    #[error("failed to bind listener: {0}")]
    Bind(#[source] std::io::Error),

    /// The transport's runtime or threads could not be started.
    #[error("failed to start transport: {0}")]
    Startup(#[source] std::io::Error),
}

impl TransportError {
    /// Whether re-offering the same payload later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backpressure(_))
    }
}

/// Failure while encoding an outbound packet.
#[derive(Debug, thiserror::Error)]
#[error("failed to encode packet: {0}")]
pub struct CodecError(pub String);

/// Reasons a client's handshake is refused or out of order.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    /// The client cannot read any serialization version the server writes.
    #[error("client serialization version {client} is outside {min}..={max}")]
    VersionMismatch {
        /// Highest version the client understands.
        client: u8,
        /// Oldest version the server writes.
        min: u8,
        /// Newest version the server writes.
        max: u8,
    },

    /// `Init` was received twice.
    #[error("client already sent Init")]
    AlreadyInitialized,

    /// `Init2` arrived before `Init`.
    #[error("Init2 received before Init")]
    NotInitialized,
}

/// Errors surfaced by [`ServerLoop`](crate::ServerLoop) to the operator.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// World storage reported an unrecoverable failure.
    #[error("storage failure: {0}")]
    FatalStorage(#[source] StorageError),

    /// The transport could not be started.
    #[error("transport failure: {0}")]
    Transport(#[source] TransportError),

    /// A lifecycle method was called in the wrong state.
    #[error("invalid server state: expected {expected:?}, found {actual:?}")]
    InvalidState {
        /// State the call requires.
        expected: ServerState,
        /// State the loop was actually in.
        actual: ServerState,
    },

    /// The emerge worker thread could not be spawned.
    #[error("failed to spawn emerge worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),
}
