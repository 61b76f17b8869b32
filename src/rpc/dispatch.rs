//! Unary and streaming dispatch over a worker session
//!
//! Both call paths open a fresh substream, write the mode byte, and then
//! either drive the unary codec or hand the raw stream back to the caller.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crate::rpc::codec::{self, StreamingHeader};
use crate::session::{BoxConn, MuxSession};
use crate::types::Result;

/// Mode selector written as the first byte of every new substream.
///
/// Stable wire values agreed between server and worker; do not renumber.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// A codec-framed unary RPC follows.
    Unary = 0x01,
    /// A streaming handshake header follows, then opaque bytes.
    Streaming = 0x02,
}

impl StreamMode {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Unary),
            0x02 => Some(Self::Streaming),
            _ => None,
        }
    }
}

/// Make a unary RPC to a worker over its session.
///
/// Exactly one substream is opened per call, and it is closed before this
/// returns regardless of outcome. Cancelling the returned future drops the
/// substream, which aborts the in-flight exchange.
pub async fn node_rpc<A, R>(session: &dyn MuxSession, method: &str, args: &A) -> Result<R>
where
    A: Serialize + Sync,
    R: DeserializeOwned,
{
    let mut stream = session.open().await?;
    let result = async {
        stream.write_all(&[StreamMode::Unary.as_byte()]).await?;
        codec::call_unary(&mut *stream, method, args).await
    }
    .await;
    let _ = stream.shutdown().await;
    result
}

/// Start a streaming RPC to a worker and hand the open substream back.
///
/// Conducts the mode-byte + header handshake only; the caller owns the
/// returned connection and must close it. Closing it is also how the call is
/// cancelled.
pub async fn node_streaming_rpc(session: &dyn MuxSession, method: &str) -> Result<BoxConn> {
    let mut stream = session.open().await?;
    let handshake = async {
        stream.write_all(&[StreamMode::Streaming.as_byte()]).await?;
        codec::write_frame(
            &mut *stream,
            &StreamingHeader {
                method: method.to_string(),
            },
        )
        .await
    }
    .await;

    if let Err(e) = handshake {
        let _ = stream.shutdown().await;
        return Err(e);
    }
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::codec::{read_frame, read_raw_frame, write_frame, RequestHeader, ResponseHeader};
    use crate::types::BackhaulError;
    use async_trait::async_trait;
    use serde::Deserialize;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio::sync::Mutex;

    /// Session whose substreams are pre-seeded duplex halves, so tests can
    /// inspect the peer side of everything the dispatcher writes.
    struct PipeSession {
        pending: Mutex<Vec<DuplexStream>>,
    }

    impl PipeSession {
        fn with_streams(streams: Vec<DuplexStream>) -> Self {
            Self {
                pending: Mutex::new(streams),
            }
        }
    }

    #[async_trait]
    impl MuxSession for PipeSession {
        async fn open(&self) -> Result<BoxConn> {
            match self.pending.lock().await.pop() {
                Some(stream) => Ok(Box::new(stream)),
                None => Err(BackhaulError::Session("no more substreams".to_string())),
            }
        }

        async fn close(&self) {}

        fn is_closed(&self) -> bool {
            false
        }
    }

    #[derive(Debug, Clone, PartialEq, serde::Serialize, Deserialize)]
    struct Msg {
        text: String,
    }

    #[tokio::test]
    async fn test_unary_mode_byte_is_first_on_the_wire() {
        let (local, mut peer) = tokio::io::duplex(64 * 1024);
        let session = Arc::new(PipeSession::with_streams(vec![local]));

        let peer_task = tokio::spawn(async move {
            let mut mode = [0u8; 1];
            peer.read_exact(&mut mode).await.unwrap();
            assert_eq!(mode[0], StreamMode::Unary.as_byte());

            let header: RequestHeader = read_frame(&mut peer).await.unwrap();
            assert_eq!(header.method, "Test.Echo");
            let args: Msg = read_frame(&mut peer).await.unwrap();

            write_frame(&mut peer, &ResponseHeader { error: None })
                .await
                .unwrap();
            write_frame(&mut peer, &args).await.unwrap();
        });

        let reply: Msg = node_rpc(
            session.as_ref(),
            "Test.Echo",
            &Msg {
                text: "hi".to_string(),
            },
        )
        .await
        .unwrap();
        assert_eq!(reply.text, "hi");
        peer_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_streaming_mode_byte_and_header() {
        let (local, mut peer) = tokio::io::duplex(64 * 1024);
        let session = Arc::new(PipeSession::with_streams(vec![local]));

        let conn = node_streaming_rpc(session.as_ref(), "Test.Tail")
            .await
            .unwrap();

        let mut mode = [0u8; 1];
        peer.read_exact(&mut mode).await.unwrap();
        assert_eq!(mode[0], StreamMode::Streaming.as_byte());

        let header: StreamingHeader = read_frame(&mut peer).await.unwrap();
        assert_eq!(header.method, "Test.Tail");

        // The caller owns the still-open stream.
        drop(conn);
    }

    #[tokio::test]
    async fn test_unary_substream_closed_after_success() {
        let (local, mut peer) = tokio::io::duplex(64 * 1024);
        let session = Arc::new(PipeSession::with_streams(vec![local]));

        let peer_task = tokio::spawn(async move {
            let mut mode = [0u8; 1];
            peer.read_exact(&mut mode).await.unwrap();
            let _header: RequestHeader = read_frame(&mut peer).await.unwrap();
            let _args: Msg = read_frame(&mut peer).await.unwrap();
            write_frame(&mut peer, &ResponseHeader { error: None })
                .await
                .unwrap();
            write_frame(
                &mut peer,
                &Msg {
                    text: "ok".to_string(),
                },
            )
            .await
            .unwrap();

            // After the dispatcher returns it must have closed its end:
            // the next read observes EOF.
            let mut rest = Vec::new();
            peer.read_to_end(&mut rest).await.unwrap();
            assert!(rest.is_empty(), "no stray bytes after the reply");
        });

        let _reply: Msg = node_rpc(
            session.as_ref(),
            "Test.Echo",
            &Msg {
                text: "x".to_string(),
            },
        )
        .await
        .unwrap();
        peer_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_unary_substream_closed_after_remote_error() {
        let (local, mut peer) = tokio::io::duplex(64 * 1024);
        let session = Arc::new(PipeSession::with_streams(vec![local]));

        let peer_task = tokio::spawn(async move {
            let mut mode = [0u8; 1];
            peer.read_exact(&mut mode).await.unwrap();
            let _header: RequestHeader = read_frame(&mut peer).await.unwrap();
            let _args = read_raw_frame(&mut peer).await.unwrap();
            write_frame(
                &mut peer,
                &ResponseHeader {
                    error: Some("nope".to_string()),
                },
            )
            .await
            .unwrap();

            let mut rest = Vec::new();
            peer.read_to_end(&mut rest).await.unwrap();
            assert!(rest.is_empty());
        });

        let result: Result<Msg> = node_rpc(
            session.as_ref(),
            "Test.Echo",
            &Msg {
                text: "x".to_string(),
            },
        )
        .await;
        assert!(matches!(result, Err(BackhaulError::Remote(_))));
        peer_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_open_failure_is_fail_fast() {
        let session = Arc::new(PipeSession::with_streams(Vec::new()));
        let result: Result<Msg> = node_rpc(
            session.as_ref(),
            "Test.Echo",
            &Msg {
                text: "x".to_string(),
            },
        )
        .await;
        assert!(matches!(result, Err(BackhaulError::Session(_))));
    }
}
