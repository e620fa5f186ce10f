//! TCP Framing
//!
//! Every message on a TCP stream is preceded by its length as a big-endian
//! `u32`, matching the clients' packet library. UDP datagrams carry one
//! unframed message each.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default upper bound on a single frame. Generous for chat lines and
/// countdown command lists; protects against hostile length prefixes.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

/// Prefix a payload with its length.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Read one frame.
///
/// Returns `Ok(None)` on a clean end of stream before a new frame begins,
/// `UnexpectedEof` when the stream ends mid-frame and `InvalidData` when the
/// announced length exceeds `max_len`.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {len} bytes (max {max_len})"),
        ));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Write an already-framed buffer (see [`frame`]).
pub async fn write_framed<W>(writer: &mut W, framed: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(framed).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_in_sequence() {
        let mut buf = Vec::new();
        for msg in [&b"first"[..], b"", b"third"] {
            write_framed(&mut buf, &frame(msg)).await.unwrap();
        }

        let mut reader = &buf[..];
        assert_eq!(read_frame(&mut reader, 1024).await.unwrap().unwrap(), b"first");
        assert_eq!(read_frame(&mut reader, 1024).await.unwrap().unwrap(), b"");
        assert_eq!(read_frame(&mut reader, 1024).await.unwrap().unwrap(), b"third");
        assert!(read_frame(&mut reader, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_length_prefix_is_big_endian() {
        assert_eq!(frame(b"ab"), vec![0, 0, 0, 2, b'a', b'b']);
    }

    #[tokio::test]
    async fn test_rejects_oversized_frame() {
        let bytes = 2048u32.to_be_bytes();
        let mut reader = &bytes[..];
        let err = read_frame(&mut reader, 1024).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_eof_mid_frame() {
        let bytes = [0u8, 0, 0, 8, 1, 2];
        let mut reader = &bytes[..];
        let err = read_frame(&mut reader, 1024).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
