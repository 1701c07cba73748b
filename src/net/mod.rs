//! Network Module
//!
//! Frame encoding shared by the consensus transport and the client
//! RPC surface, plus the stream layer and listener demultiplexer.

mod mux;
mod stream_layer;

pub use mux::ListenerMux;
pub use stream_layer::{NodeStream, StreamLayer, CLIENT_TAG, CONSENSUS_TAG};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Upper bound on a single frame body
const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a header for a message body
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            length: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            checksum: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
        }
    }
}

/// Read a framed message from a reader
pub async fn read_message<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > MAX_FRAME_BYTES {
        return Err(Error::Network(format!(
            "frame of {} bytes exceeds limit",
            header.length
        )));
    }

    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    if crc32fast::hash(&body) != header.checksum {
        return Err(Error::Network("message checksum mismatch".into()));
    }

    Ok(bincode::deserialize(&body)?)
}

/// Write a framed message to a writer
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = bincode::serialize(message)?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_header() {
        let data = b"test message data";
        let header = FrameHeader::new(data);
        let bytes = header.to_bytes();
        let restored = FrameHeader::from_bytes(&bytes);

        assert_eq!(header.length, restored.length);
        assert_eq!(header.checksum, restored.checksum);
    }

    #[tokio::test]
    async fn test_message_round_trip() {
        let msg = vec!["first".to_string(), "second".to_string()];

        let mut writer = std::io::Cursor::new(Vec::new());
        write_message(&mut writer, &msg).await.unwrap();

        let mut reader = std::io::Cursor::new(writer.into_inner());
        let restored: Vec<String> = read_message(&mut reader).await.unwrap();
        assert_eq!(restored, msg);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_rejected() {
        let mut writer = std::io::Cursor::new(Vec::new());
        write_message(&mut writer, &"payload".to_string())
            .await
            .unwrap();

        // Corrupt one body byte
        let mut buf = writer.into_inner();
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;

        let mut reader = std::io::Cursor::new(buf);
        let result: Result<String> = read_message(&mut reader).await;
        assert!(result.is_err());
    }
}
