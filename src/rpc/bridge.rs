//! Full-duplex byte splice between two connections
//!
//! Used to relay a caller's stream through the server that owns a worker
//! session: the server bridges its inbound connection to the substream it
//! opened on the worker.

use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Copy `a → b` and `b → a` concurrently until either direction terminates,
/// then close both endpoints and wait for both copy tasks to finish.
///
/// One-sided close on a multiplexed substream can leave the peer blocked on
/// read; tearing down both endpoints as soon as either direction ends turns
/// that into a clean EOF. Transfer errors during teardown are expected at
/// session termination and are not surfaced.
///
/// Returns the byte counts copied in each direction (`a → b`, `b → a`),
/// informational only.
pub async fn bridge<A, B>(a: A, b: B) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (a_read, a_write) = io::split(a);
    let (b_read, b_write) = io::split(b);
    let teardown = CancellationToken::new();

    let forward = tokio::spawn(copy_until_torn_down(a_read, b_write, teardown.clone()));
    let backward = tokio::spawn(copy_until_torn_down(b_read, a_write, teardown));

    let a_to_b = forward.await.unwrap_or(0);
    let b_to_a = backward.await.unwrap_or(0);
    trace!(a_to_b, b_to_a, "bridge finished");
    (a_to_b, b_to_a)
}

/// One direction of the splice. Whichever direction finishes first (EOF or
/// error) trips the token so the other direction stops without waiting on
/// its remote, then both writers are shut down.
async fn copy_until_torn_down<R, W>(mut src: R, mut dst: W, teardown: CancellationToken) -> u64
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let copied = tokio::select! {
        result = io::copy(&mut src, &mut dst) => result.unwrap_or(0),
        _ = teardown.cancelled() => 0,
    };
    teardown.cancel();
    let _ = dst.shutdown().await;
    copied
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_bridge_relays_both_directions() {
        let (left_outer, left_inner) = tokio::io::duplex(4096);
        let (right_outer, right_inner) = tokio::io::duplex(4096);

        let bridge_task = tokio::spawn(bridge(left_inner, right_inner));

        let (mut left_read, mut left_write) = io::split(left_outer);
        let (mut right_read, mut right_write) = io::split(right_outer);

        left_write.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        right_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        right_write.write_all(b"pong").await.unwrap();
        left_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // Closing one side ends the bridge.
        left_write.shutdown().await.unwrap();
        timeout(Duration::from_secs(2), bridge_task)
            .await
            .expect("bridge must return after a close")
            .unwrap();
    }

    #[tokio::test]
    async fn test_closing_one_end_unblocks_the_other() {
        let (left_outer, left_inner) = tokio::io::duplex(4096);
        let (right_outer, right_inner) = tokio::io::duplex(4096);

        let bridge_task = tokio::spawn(bridge(left_inner, right_inner));

        // The right side sits in a blocking read; closing the left side must
        // end it with EOF in bounded time.
        drop(left_outer);

        let (mut right_read, _right_write) = io::split(right_outer);
        let mut buf = Vec::new();
        let read = timeout(Duration::from_secs(2), right_read.read_to_end(&mut buf))
            .await
            .expect("read must unblock after the far close");
        assert_eq!(read.unwrap(), 0, "expected clean EOF");

        timeout(Duration::from_secs(2), bridge_task)
            .await
            .expect("bridge must return after both directions end")
            .unwrap();
    }

    #[tokio::test]
    async fn test_slow_reader_does_not_starve_the_other_direction() {
        // Tiny buffers so the stalled direction fills up immediately.
        let (left_outer, left_inner) = tokio::io::duplex(64);
        let (right_outer, right_inner) = tokio::io::duplex(64);

        let _bridge_task = tokio::spawn(bridge(left_inner, right_inner));

        let (mut left_read, mut left_write) = io::split(left_outer);
        let (_right_read, mut right_write) = io::split(right_outer);

        // Saturate left → right; nobody reads right_outer.
        let stall = vec![0u8; 64 * 4];
        let _ = timeout(Duration::from_millis(200), left_write.write_all(&stall)).await;

        // The reverse direction must still flow.
        right_write.write_all(b"through").await.unwrap();
        let mut buf = [0u8; 7];
        timeout(Duration::from_secs(2), left_read.read_exact(&mut buf))
            .await
            .expect("reverse direction must not be starved")
            .unwrap();
        assert_eq!(&buf, b"through");
    }
}
