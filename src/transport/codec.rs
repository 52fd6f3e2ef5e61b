//! Length-prefixed JSON frames
//!
//! A frame is a big-endian `u32` byte length followed by that many bytes of
//! JSON.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::TransportError;

#[derive(Debug, Error)]
pub enum FrameError {
    /// Declared length exceeds the configured maximum
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    TooLarge { len: usize, max: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, TransportError> {
    serde_json::to_vec(value).map_err(|e| TransportError::Codec(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, TransportError> {
    serde_json::from_slice(bytes).map_err(|e| TransportError::Codec(e.to_string()))
}

pub async fn write_frame<W>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(bytes.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame larger than 4GiB")
    })?;
    writer.write_u32(len).await?;
    writer.write_all(bytes).await?;
    writer.flush().await
}

/// Read one frame; `Ok(None)` on a clean end of stream
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Option<Vec<u8>>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if len > max_len {
        return Err(FrameError::TooLarge { len, max: max_len });
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::types::{Envelope, Message, RunId};

    #[tokio::test]
    async fn test_frame_through_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let envelope = Envelope::new(RunId::new(), Message::AbortRequest);
        write_frame(&mut client, &encode(&envelope).unwrap())
            .await
            .unwrap();
        drop(client);

        let bytes = read_frame(&mut server, 1024).await.unwrap().unwrap();
        let decoded: Envelope = decode(&bytes).unwrap();
        assert_eq!(decoded, envelope);
        // clean EOF after the only frame
        assert!(read_frame(&mut server, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversize_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, &[b'x'; 100]).await.unwrap();
        match read_frame(&mut server, 10).await {
            Err(FrameError::TooLarge { len: 100, max: 10 }) => {}
            other => panic!("expected TooLarge, got {:?}", other.map(|f| f.map(|b| b.len()))),
        }
    }

    #[tokio::test]
    async fn test_truncated_frame_is_io_error() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_u32(8).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);

        let err = read_frame(&mut server, 1024).await.unwrap_err();
        assert!(matches!(err, FrameError::Io(_)));
        let boxed: Box<dyn std::error::Error> = Box::new(err);
        assert!(!boxed.to_string().is_empty());
    }
}
