use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::TransportError;

/// Write a length-prefixed frame: 4-byte big-endian length, then payload.
pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(
    send: &mut W,
    data: &[u8],
    max_size: usize,
) -> Result<(), TransportError> {
    if data.len() > max_size || data.len() > u32::MAX as usize {
        return Err(TransportError::MessageTooLarge {
            size: data.len(),
            max: max_size,
        });
    }

    let len = (data.len() as u32).to_be_bytes();
    send.write_all(&len).await?;
    send.write_all(data).await?;
    send.flush().await?;
    Ok(())
}

/// Read a length-prefixed frame, rejecting lengths above `max_size`.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(
    recv: &mut R,
    max_size: usize,
) -> Result<Vec<u8>, TransportError> {
    let mut len_buf = [0u8; 4];
    recv.read_exact(&mut len_buf).await?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(TransportError::MessageTooLarge {
            size: len,
            max: max_size,
        });
    }

    let mut buf = vec![0u8; len];
    recv.read_exact(&mut buf).await?;

    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"hello tree", 64).await.unwrap();
        write_frame(&mut a, b"", 64).await.unwrap();

        assert_eq!(read_frame(&mut b, 64).await.unwrap(), b"hello tree");
        assert!(read_frame(&mut b, 64).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn oversized_frame_rejected_on_both_ends() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let err = write_frame(&mut a, &[0u8; 32], 16).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::MessageTooLarge { size: 32, max: 16 }
        ));

        write_frame(&mut a, &[0u8; 32], 64).await.unwrap();
        let err = read_frame(&mut b, 16).await.unwrap_err();
        assert!(matches!(err, TransportError::MessageTooLarge { .. }));
    }

    #[tokio::test]
    async fn eof_mid_header_is_classified() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0, 0]).await.unwrap();
        drop(a);
        let err = read_frame(&mut b, 64).await.unwrap_err();
        assert!(matches!(err, TransportError::Eof));
    }
}
