//! Multiplexed session layer
//!
//! A worker keeps exactly one TCP connection to a server; both sides open
//! independent substreams over it via yamux. The server side holds the
//! session handle in the node registry and dispatches reverse RPCs through
//! it, so the handle has to stay usable from many tasks at once while a
//! single driver task pumps the underlying connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tracing::debug;

use crate::types::{BackhaulError, Result};

/// Bidirectional byte stream usable as a substream or a raw connection.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Conn for T {}

/// Owned, type-erased connection. The holder is responsible for closing it.
pub type BoxConn = Box<dyn Conn>;

/// Handle on a multiplexed transport.
///
/// `open` is independently thread-safe; each returned substream is owned by
/// the caller and must not be shared between tasks. Once the underlying
/// connection dies, `open` fails deterministically.
#[async_trait]
pub trait MuxSession: Send + Sync {
    /// Open a new substream on the session.
    async fn open(&self) -> Result<BoxConn>;

    /// Close the session and all of its substreams.
    async fn close(&self);

    /// Whether the session driver has terminated.
    fn is_closed(&self) -> bool;
}

/// Inbound substreams queued per session before dispatch picks them up.
/// A full queue intentionally backpressures the whole session.
const INBOUND_BACKLOG: usize = 64;

/// Yamux-backed [`MuxSession`].
///
/// Construction spawns a driver task that owns the `yamux::Connection`,
/// forwards inbound substreams to the returned receiver, and marks the
/// session closed when the connection ends.
pub struct YamuxSession {
    control: yamux::Control,
    closed: Arc<AtomicBool>,
}

impl YamuxSession {
    /// Wrap the dialing end of a connection.
    pub fn client<S>(io: S) -> (Arc<Self>, mpsc::Receiver<BoxConn>)
    where
        S: Conn + 'static,
    {
        Self::new(io, yamux::Mode::Client)
    }

    /// Wrap the accepting end of a connection.
    pub fn server<S>(io: S) -> (Arc<Self>, mpsc::Receiver<BoxConn>)
    where
        S: Conn + 'static,
    {
        Self::new(io, yamux::Mode::Server)
    }

    fn new<S>(io: S, mode: yamux::Mode) -> (Arc<Self>, mpsc::Receiver<BoxConn>)
    where
        S: Conn + 'static,
    {
        let connection = yamux::Connection::new(io.compat(), yamux::Config::default(), mode);
        let control = connection.control();
        let closed = Arc::new(AtomicBool::new(false));
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BACKLOG);

        tokio::spawn(drive(connection, inbound_tx, Arc::clone(&closed)));

        (Arc::new(Self { control, closed }), inbound_rx)
    }
}

#[async_trait]
impl MuxSession for YamuxSession {
    async fn open(&self) -> Result<BoxConn> {
        if self.is_closed() {
            return Err(BackhaulError::Session("session closed".to_string()));
        }
        let mut control = self.control.clone();
        let stream = control.open_stream().await?;
        Ok(Box::new(stream.compat()))
    }

    async fn close(&self) {
        let mut control = self.control.clone();
        let _ = control.close().await;
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Pump the connection until it ends. Yamux requires the connection to be
/// polled continuously for outbound opens to make progress, so this loop runs
/// even when the inbound receiver has been dropped.
async fn drive<S>(
    mut connection: yamux::Connection<Compat<S>>,
    inbound_tx: mpsc::Sender<BoxConn>,
    closed: Arc<AtomicBool>,
) where
    S: Conn + 'static,
{
    loop {
        match connection.next_stream().await {
            Ok(Some(stream)) => {
                let conn: BoxConn = Box::new(stream.compat());
                if inbound_tx.send(conn).await.is_err() {
                    // Nobody is accepting inbound substreams on this side;
                    // drop the stream (resets it) and keep driving.
                    continue;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "session terminated");
                break;
            }
        }
    }
    closed.store(true, Ordering::SeqCst);
}
