//! TCP networking for the cairn server: message framing, the packet wire
//! format, and the threaded transport the tick loop talks to.

pub mod framing;
pub mod tcp_transport;
pub mod wire;

pub use framing::{FrameError, FrameLimits, PREFIX_LEN, encode_frame, read_frame, write_frame};
pub use tcp_transport::{IdGenerator, TcpTransport, TransportConfig};
pub use wire::{
    ServerPacket, WIRE_VERSION, WireCodec, WireError, decode_client, decode_server, encode_client,
    encode_server,
};
