//! Frame codec
//!
//! Frame format: [LEN: u32 big-endian][PAYLOAD: bincode]

use crate::common::{Error, Result};
use bytes::{BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub fn encode<T: Serialize>(msg: &T) -> Result<BytesMut> {
    let payload = bincode::serialize(msg)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(Error::Internal(format!(
            "frame too large: {} bytes",
            payload.len()
        )));
    }
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);
    Ok(buf)
}

pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let buf = encode(msg)?;
    writer.write_all(&buf).await.map_err(io_error)?;
    writer.flush().await.map_err(io_error)?;
    Ok(())
}

/// Read one frame. Returns `Ok(None)` on a clean end of stream.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..]).await.map_err(io_error)?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::Internal(format!(
                "truncated frame header ({} of 4 bytes)",
                filled
            )));
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Internal(format!("frame too large: {} bytes", len)));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::Internal("truncated frame".into())
        } else {
            io_error(e)
        }
    })?;

    Ok(Some(bincode::deserialize(&payload)?))
}

fn io_error(e: std::io::Error) -> Error {
    Error::connection("peer", e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ErrorKind;
    use crate::rpc::message::{Frame, Request};

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let sent = vec![
            Frame {
                seq: 1,
                body: Request::QueryConfig {
                    table: "temp".into(),
                },
            },
            Frame {
                seq: 2,
                body: Request::QueryConfig {
                    table: "other".into(),
                },
            },
        ];
        for frame in &sent {
            write_frame(&mut client, frame).await.unwrap();
        }
        drop(client);

        let mut received = Vec::new();
        while let Some(frame) = read_frame::<_, Frame<Request>>(&mut server).await.unwrap() {
            received.push(frame);
        }
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn test_truncated_frame() {
        let buf = encode(&Frame {
            seq: 9,
            body: Request::QueryConfig {
                table: "temp".into(),
            },
        })
        .unwrap();
        let mut torn = &buf[..buf.len() - 2];
        let err = read_frame::<_, Frame<Request>>(&mut torn).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[tokio::test]
    async fn test_torn_header_is_not_clean_eof() {
        let mut torn: &[u8] = &[0, 0];
        let err = read_frame::<_, Frame<Request>>(&mut torn).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.to_string().contains("truncated frame header"));

        let mut empty: &[u8] = &[];
        assert!(read_frame::<_, Frame<Request>>(&mut empty)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let len = (MAX_FRAME_LEN as u32 + 1).to_be_bytes();
        let mut input = &len[..];
        let err = read_frame::<_, Frame<Request>>(&mut input).await.unwrap_err();
        assert!(err.to_string().contains("frame too large"));
    }
}
