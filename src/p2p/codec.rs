//! Length-prefixed wire framing: 4-byte big-endian length, then a JSON
//! payload. A frame over 1 MiB is a protocol error and closes the
//! connection.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame payload size.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {0} bytes exceeds limit")]
    Oversized(usize),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), FrameError> {
    if payload.len() > MAX_FRAME_BYTES {
        return Err(FrameError::Oversized(payload.len()));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer closed cleanly at a frame
/// boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Vec<u8>>, FrameError> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(FrameError::Oversized(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        write_frame(&mut client, b"hello mesh").await.unwrap();
        write_frame(&mut client, b"").await.unwrap();
        drop(client);

        assert_eq!(read_frame(&mut server).await.unwrap().unwrap(), b"hello mesh");
        assert_eq!(read_frame(&mut server).await.unwrap().unwrap(), b"");
        assert!(read_frame(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_protocol_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let bad_len = ((MAX_FRAME_BYTES + 1) as u32).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut client, &bad_len).await.unwrap();

        match read_frame(&mut server).await {
            Err(FrameError::Oversized(_)) => {}
            other => panic!("expected oversized error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_write_is_rejected_locally() {
        let (mut client, _server) = tokio::io::duplex(64);
        let huge = vec![0u8; MAX_FRAME_BYTES + 1];
        assert!(matches!(
            write_frame(&mut client, &huge).await,
            Err(FrameError::Oversized(_))
        ));
    }
}
