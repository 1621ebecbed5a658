//! Length-prefixed frames on a byte stream.
//!
//! ```text
//! +-------------------+------------------+
//! | length: u32 (LE)  | payload          |
//! +-------------------+------------------+
//! ```
//!
//! The length excludes the prefix. A zero-length frame is a keepalive and
//! carries no packet.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Bytes in the length prefix.
pub const PREFIX_LEN: usize = 4;

/// Frame size limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    /// Largest payload accepted or written.
    pub max_payload: u32,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_payload: 1_048_576,
        }
    }
}

impl From<&cairn_config::NetworkConfig> for FrameLimits {
    fn from(config: &cairn_config::NetworkConfig) -> Self {
        Self {
            max_payload: config.max_frame_size,
        }
    }
}

/// Framing failures.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The announced or supplied payload exceeds [`FrameLimits::max_payload`].
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    TooLarge {
        /// Offending size.
        size: usize,
        /// Configured limit.
        max: u32,
    },

    /// The peer closed the stream, possibly mid-frame.
    #[error("connection closed")]
    Closed,

    /// Any other I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn closed_or_io(e: std::io::Error) -> FrameError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::Closed
    } else {
        FrameError::Io(e)
    }
}

/// Reads one frame and returns its payload.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    limits: FrameLimits,
) -> Result<Vec<u8>, FrameError> {
    let mut prefix = [0u8; PREFIX_LEN];
    reader.read_exact(&mut prefix).await.map_err(closed_or_io)?;

    let len = u32::from_le_bytes(prefix);
    if len > limits.max_payload {
        return Err(FrameError::TooLarge {
            size: len as usize,
            max: limits.max_payload,
        });
    }

    let mut payload = vec![0u8; len as usize];
    if len > 0 {
        reader.read_exact(&mut payload).await.map_err(closed_or_io)?;
    }
    Ok(payload)
}

/// Prefixes `payload` with its length, ready to write in one call.
pub fn encode_frame(payload: &[u8], limits: FrameLimits) -> Result<Vec<u8>, FrameError> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= limits.max_payload)
        .ok_or(FrameError::TooLarge {
            size: payload.len(),
            max: limits.max_payload,
        })?;
    let mut frame = Vec::with_capacity(PREFIX_LEN + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Writes one frame and flushes.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
    limits: FrameLimits,
) -> Result<(), FrameError> {
    let frame = encode_frame(payload, limits)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_frames_arrive_separately() {
        let (mut tx, mut rx) = duplex(4096);
        let limits = FrameLimits::default();
        let payloads: [&[u8]; 3] = [b"init", b"", b"view"];
        for payload in payloads {
            write_frame(&mut tx, payload, limits).await.unwrap();
        }
        assert_eq!(read_frame(&mut rx, limits).await.unwrap(), b"init");
        assert!(read_frame(&mut rx, limits).await.unwrap().is_empty());
        assert_eq!(read_frame(&mut rx, limits).await.unwrap(), b"view");
    }

    #[tokio::test]
    async fn test_frame_larger_than_pipe_buffer() {
        let (mut tx, mut rx) = duplex(16);
        let limits = FrameLimits::default();
        let payload: Vec<u8> = (0..=255).collect();

        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            write_frame(&mut tx, &payload, limits).await.unwrap();
        });
        let got = read_frame(&mut rx, limits).await.unwrap();
        writer.await.unwrap();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn test_oversized_prefix_rejected() {
        let (mut tx, mut rx) = duplex(64);
        tx.write_all(&4096u32.to_le_bytes()).await.unwrap();
        let limits = FrameLimits { max_payload: 64 };
        assert!(matches!(
            read_frame(&mut rx, limits).await,
            Err(FrameError::TooLarge { size: 4096, max: 64 })
        ));
    }

    #[tokio::test]
    async fn test_oversized_payload_not_written() {
        let (mut tx, _rx) = duplex(64);
        let limits = FrameLimits { max_payload: 8 };
        let result = write_frame(&mut tx, &[0u8; 9], limits).await;
        assert!(matches!(result, Err(FrameError::TooLarge { size: 9, .. })));
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_closed() {
        let (mut tx, mut rx) = duplex(64);
        tx.write_all(&10u32.to_le_bytes()).await.unwrap();
        tx.write_all(b"abc").await.unwrap();
        drop(tx);
        assert!(matches!(
            read_frame(&mut rx, FrameLimits::default()).await,
            Err(FrameError::Closed)
        ));
    }

    #[test]
    fn test_prefix_is_little_endian() {
        let frame = encode_frame(b"hello", FrameLimits::default()).unwrap();
        assert_eq!(&frame[..4], &[5, 0, 0, 0]);
        assert_eq!(&frame[4..], b"hello");
    }
}
