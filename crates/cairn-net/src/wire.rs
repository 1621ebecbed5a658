//! Packet encoding on top of frames.
//!
//! Every frame payload is one wire-version byte followed by a postcard
//! body. Server-to-client payloads are [`ServerPacket`]s; client-to-server
//! payloads are [`ClientMessage`]s. Block data is LZ4-compressed inside
//! [`ServerPacket::Block`].

use cairn_sched::{BlockContent, BlockPos, ClientMessage, CodecError, PacketCodec, ServerMessage};
use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use serde::{Deserialize, Serialize};

/// Version byte leading every payload.
pub const WIRE_VERSION: u8 = 1;

/// Everything the server sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerPacket {
    /// One block, serialized for `serialization_version`.
    Block {
        /// Block position.
        pos: BlockPos,
        /// Serialization version the payload was written for.
        serialization_version: u8,
        /// LZ4 block, size-prepended.
        compressed: Vec<u8>,
    },
    /// A control message.
    Message(ServerMessage),
}

impl ServerPacket {
    /// Decompresses a block payload. `None` for control messages.
    pub fn block_content(&self) -> Option<Result<BlockContent, WireError>> {
        match self {
            Self::Block { compressed, .. } => Some(
                decompress_size_prepended(compressed)
                    .map(BlockContent::new)
                    .map_err(|e| WireError::Decompress(e.to_string())),
            ),
            Self::Message(_) => None,
        }
    }
}

/// Payload decoding failures.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// No version byte.
    #[error("empty payload")]
    Empty,

    /// The version byte is not [`WIRE_VERSION`].
    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u8),

    /// The postcard body is malformed.
    #[error("malformed body: {0}")]
    Postcard(#[from] postcard::Error),

    /// A block payload failed to decompress.
    #[error("block decompression failed: {0}")]
    Decompress(String),
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, postcard::Error> {
    let body = postcard::to_allocvec(value)?;
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(WIRE_VERSION);
    out.extend_from_slice(&body);
    Ok(out)
}

fn decode<'a, T: Deserialize<'a>>(data: &'a [u8]) -> Result<T, WireError> {
    let (&version, body) = data.split_first().ok_or(WireError::Empty)?;
    if version != WIRE_VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }
    Ok(postcard::from_bytes(body)?)
}

/// Encodes a client message.
pub fn encode_client(message: &ClientMessage) -> Result<Vec<u8>, postcard::Error> {
    encode(message)
}

/// Decodes a client message.
pub fn decode_client(data: &[u8]) -> Result<ClientMessage, WireError> {
    decode(data)
}

/// Encodes a server packet.
pub fn encode_server(packet: &ServerPacket) -> Result<Vec<u8>, postcard::Error> {
    encode(packet)
}

/// Decodes a server packet.
pub fn decode_server(data: &[u8]) -> Result<ServerPacket, WireError> {
    decode(data)
}

/// The production [`PacketCodec`].
#[derive(Debug, Clone, Copy, Default)]
pub struct WireCodec;

impl PacketCodec for WireCodec {
    fn encode_block(
        &self,
        pos: BlockPos,
        block: &BlockContent,
        version: u8,
    ) -> Result<Vec<u8>, CodecError> {
        let packet = ServerPacket::Block {
            pos,
            serialization_version: version,
            compressed: compress_prepend_size(&block.data),
        };
        encode_server(&packet).map_err(|e| CodecError(e.to_string()))
    }

    fn encode_message(&self, message: &ServerMessage) -> Result<Vec<u8>, CodecError> {
        encode_server(&ServerPacket::Message(message.clone())).map_err(|e| CodecError(e.to_string()))
    }
}
