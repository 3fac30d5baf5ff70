//! Length-prefixed framing for coordinator/agent connections.
//!
//! Each frame is a 4-byte big-endian length followed by a MessagePack
//! encoded [`Frame`].

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Frame, SimError};

/// Maximum encoded frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Read one frame.
///
/// Returns `Ok(None)` if the peer closed the stream cleanly between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, SimError>
where
    R: AsyncRead + Unpin,
{
    // Read 4-byte length prefix (big-endian)
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(SimError::FrameTooLarge {
            size: len,
            limit: MAX_FRAME_SIZE,
        });
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Frame::from_bytes(&buf).map(Some)
}

/// Write one frame and flush.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), SimError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = frame.to_bytes()?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(SimError::FrameTooLarge {
            size: bytes.len(),
            limit: MAX_FRAME_SIZE,
        });
    }

    writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Address, Envelope, Operation};

    #[tokio::test]
    async fn frames_survive_a_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let envelope = Envelope::new(
            Address::COORDINATOR,
            Address::agent(1),
            1,
            &Operation::Log {
                message: "hello".into(),
            },
        )
        .unwrap();

        write_frame(&mut client, &Frame::Request(envelope.clone()))
            .await
            .unwrap();
        write_frame(&mut client, &Frame::Request(envelope.clone()))
            .await
            .unwrap();
        drop(client);

        for _ in 0..2 {
            let frame = read_frame(&mut server).await.unwrap().unwrap();
            assert_eq!(frame, Frame::Request(envelope.clone()));
        }
        assert!(read_frame(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_length_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes())
            .await
            .unwrap();
        assert!(matches!(
            read_frame(&mut server).await,
            Err(SimError::FrameTooLarge { .. })
        ));
    }
}
