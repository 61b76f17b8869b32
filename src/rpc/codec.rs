//! Length-prefixed msgpack framing
//!
//! Frames are a u32 big-endian length followed by a msgpack body in named
//! (map) encoding, so both ends deserialize symmetrically regardless of
//! field order. The unary round-trip is two frames out (header, argument)
//! and one or two frames back (header, then the reply unless the header
//! carries an error).

use bytes::{BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::types::{BackhaulError, Result};

/// Upper bound on a single frame body.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// First frame of a unary exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestHeader {
    pub method: String,
}

/// First frame of a unary response. `error` set means no reply frame follows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseHeader {
    pub error: Option<String>,
}

/// Handshake header for a streaming substream; raw bytes follow it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingHeader {
    pub method: String,
}

/// Write one msgpack frame.
pub async fn write_frame<S, T>(io: &mut S, value: &T) -> Result<()>
where
    S: AsyncWrite + Unpin + ?Sized,
    T: Serialize + ?Sized,
{
    let body = rmp_serde::to_vec_named(value).map_err(|e| BackhaulError::Codec(e.to_string()))?;
    write_raw_frame(io, &body).await
}

/// Write one frame whose body is already msgpack.
pub async fn write_raw_frame<S>(io: &mut S, body: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    if body.len() > MAX_FRAME_BYTES {
        return Err(BackhaulError::Codec(format!(
            "frame of {} bytes exceeds {} byte limit",
            body.len(),
            MAX_FRAME_BYTES
        )));
    }
    // Length prefix and body go out in a single write.
    let mut frame = BytesMut::with_capacity(4 + body.len());
    frame.put_u32(body.len() as u32);
    frame.put_slice(body);
    io.write_all(&frame).await?;
    io.flush().await?;
    Ok(())
}

/// Read one msgpack frame into `T`.
pub async fn read_frame<S, T>(io: &mut S) -> Result<T>
where
    S: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    let body = read_raw_frame(io).await?;
    rmp_serde::from_slice(&body).map_err(|e| BackhaulError::Codec(e.to_string()))
}

/// Read one frame body without decoding it.
pub async fn read_raw_frame<S>(io: &mut S) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let len = io.read_u32().await? as usize;
    if len > MAX_FRAME_BYTES {
        return Err(BackhaulError::Codec(format!(
            "frame of {} bytes exceeds {} byte limit",
            len, MAX_FRAME_BYTES
        )));
    }
    let mut body = vec![0u8; len];
    io.read_exact(&mut body).await?;
    Ok(body)
}

/// Drive one unary round-trip over an already-opened, mode-selected stream.
pub async fn call_unary<S, A, R>(io: &mut S, method: &str, args: &A) -> Result<R>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
    A: Serialize + Sync,
    R: DeserializeOwned,
{
    write_frame(
        io,
        &RequestHeader {
            method: method.to_string(),
        },
    )
    .await?;
    write_frame(io, args).await?;

    let header: ResponseHeader = read_frame(io).await?;
    if let Some(message) = header.error {
        return Err(BackhaulError::Remote(message));
    }
    read_frame(io).await
}
