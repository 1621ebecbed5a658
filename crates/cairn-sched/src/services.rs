//! Collaborators the core calls but does not implement.
//!
//! World storage, the transport and the packet codec are supplied by the
//! embedding binary. The core only sees these traits and the message
//! vocabulary below.

use serde::{Deserialize, Serialize};

use crate::client::ClientId;
use crate::coords::BlockPos;
use crate::error::{CodecError, StorageError, TransportError};

/// Opaque content of one block as produced by world storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockContent {
    /// Storage-defined block payload.
    pub data: Vec<u8>,
}

impl BlockContent {
    /// Wraps raw block bytes.
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

/// Application messages a client sends, already decoded by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// First handshake step.
    Init {
        /// Highest serialization version the client can read.
        serialization_version: u8,
        /// Network protocol version the client speaks.
        protocol_version: u16,
        /// Player name.
        player_name: String,
    },
    /// Second handshake step; the client is ready for world data.
    Init2,
    /// The client's viewpoint moved or its view range changed.
    PlayerView {
        /// Block containing the viewpoint.
        center: BlockPos,
        /// Requested view radius in blocks.
        radius: i16,
    },
    /// Acknowledges received blocks.
    GotBlocks(Vec<BlockPos>),
    /// The client evicted these blocks from memory.
    DeletedBlocks(Vec<BlockPos>),
    /// The client placed or removed something.
    Interacted,
}

/// Control messages the server sends. Block payloads go through
/// [`PacketCodec::encode_block`] instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Answers `Init` with the chosen serialization version.
    InitAck {
        /// Version the server will write.
        serialization_version: u8,
    },
    /// The handshake was refused; the connection is about to close.
    AccessDenied {
        /// Human-readable reason.
        reason: String,
    },
    /// The server is stopping.
    Shutdown {
        /// Human-readable reason.
        reason: String,
    },
}

/// Loads blocks from disk or generates them.
///
/// Called only from the emerge worker and never while the environment lock
/// is held, so implementations may block on disk or generation work.
pub trait WorldStorage: Send + Sync {
    /// Produces the content of `pos`.
    fn load_or_generate(&self, pos: BlockPos) -> Result<BlockContent, StorageError>;
}

/// Connection-level I/O, running on its own threads.
///
/// Connect and disconnect notifications are pushed through the
/// [`LifecycleSender`](crate::LifecycleSender) the transport was built with.
pub trait Transport: Send + Sync {
    /// Opens the listener.
    fn start(&self) -> Result<(), TransportError>;

    /// Queues `payload` for `client` without blocking.
    fn send(&self, client: ClientId, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Next decoded inbound message, if any.
    fn receive(&self) -> Option<(ClientId, ClientMessage)>;

    /// Closes one peer's connection after its queued output.
    fn disconnect(&self, client: ClientId);

    /// Stops accepting and closes every connection.
    fn shutdown(&self);
}

/// Turns blocks and control messages into wire bytes.
pub trait PacketCodec: Send + Sync {
    /// Encodes a block for a client reading `version`.
    fn encode_block(
        &self,
        pos: BlockPos,
        block: &BlockContent,
        version: u8,
    ) -> Result<Vec<u8>, CodecError>;

    /// Encodes a control message.
    fn encode_message(&self, message: &ServerMessage) -> Result<Vec<u8>, CodecError>;
}
