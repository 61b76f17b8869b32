//! Inbound substream demultiplexer and handler registry
//!
//! Servers and workers run the same demux on every inbound substream: read
//! the mode byte, then hand off to a registered unary or streaming handler
//! by method name. Unary handlers are typed closures bridged through
//! msgpack; streaming handlers take ownership of the raw substream.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::rpc::codec::{self, RequestHeader, ResponseHeader, StreamingHeader};
use crate::rpc::dispatch::StreamMode;
use crate::session::BoxConn;

type UnaryHandler = Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>, String>> + Send + Sync>;
type StreamingHandler = Arc<dyn Fn(BoxConn) -> BoxFuture<'static, ()> + Send + Sync>;

/// Method-name-keyed registry of unary and streaming handlers.
///
/// A registry can be scoped over a shared fallback, which lets a connection
/// task layer per-connection methods (like the registration handshake) over
/// the process-wide set.
#[derive(Default)]
pub struct HandlerRegistry {
    unary: DashMap<String, UnaryHandler>,
    streaming: DashMap<String, StreamingHandler>,
    fallback: Option<Arc<HandlerRegistry>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that resolves misses through `shared`.
    pub fn scoped(shared: Arc<HandlerRegistry>) -> Self {
        Self {
            unary: DashMap::new(),
            streaming: DashMap::new(),
            fallback: Some(shared),
        }
    }

    /// Register a typed unary handler. The handler's error string is sent to
    /// the caller verbatim in the response header.
    pub fn register_unary<A, R, F, Fut>(&self, method: &str, handler: F)
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, String>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: UnaryHandler = Arc::new(move |body: Vec<u8>| {
            let handler = Arc::clone(&handler);
            async move {
                let args: A =
                    rmp_serde::from_slice(&body).map_err(|e| format!("bad argument: {}", e))?;
                let reply = handler(args).await?;
                rmp_serde::to_vec_named(&reply).map_err(|e| format!("bad reply: {}", e))
            }
            .boxed()
        });
        self.unary.insert(method.to_string(), erased);
    }

    /// Register a streaming handler. It owns the substream it receives and
    /// must close it on all exit paths.
    pub fn register_streaming<F, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(BoxConn) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let erased: StreamingHandler = Arc::new(move |conn| handler(conn).boxed());
        self.streaming.insert(method.to_string(), erased);
    }

    fn lookup_unary(&self, method: &str) -> Option<UnaryHandler> {
        self.unary
            .get(method)
            .map(|entry| Arc::clone(entry.value()))
            .or_else(|| self.fallback.as_ref().and_then(|f| f.lookup_unary(method)))
    }

    fn lookup_streaming(&self, method: &str) -> Option<StreamingHandler> {
        self.streaming
            .get(method)
            .map(|entry| Arc::clone(entry.value()))
            .or_else(|| {
                self.fallback
                    .as_ref()
                    .and_then(|f| f.lookup_streaming(method))
            })
    }

    /// Serve one inbound substream to completion.
    pub async fn serve_stream(&self, mut stream: BoxConn) {
        let mut mode = [0u8; 1];
        if let Err(e) = stream.read_exact(&mut mode).await {
            debug!(error = %e, "substream closed before mode byte");
            return;
        }
        match StreamMode::from_byte(mode[0]) {
            Some(StreamMode::Unary) => self.serve_unary(stream).await,
            Some(StreamMode::Streaming) => self.serve_streaming(stream).await,
            None => {
                warn!(mode = mode[0], "unknown substream mode, dropping");
            }
        }
    }

    async fn serve_unary(&self, mut stream: BoxConn) {
        let request = async {
            let header: RequestHeader = codec::read_frame(&mut *stream).await?;
            let body = codec::read_raw_frame(&mut *stream).await?;
            Ok::<_, crate::types::BackhaulError>((header, body))
        }
        .await;

        let (header, body) = match request {
            Ok(parts) => parts,
            Err(e) => {
                debug!(error = %e, "failed reading unary request");
                return;
            }
        };

        let outcome = match self.lookup_unary(&header.method) {
            Some(handler) => handler(body).await,
            None => Err(format!("unknown method: {}", header.method)),
        };

        let written = match outcome {
            Ok(reply) => {
                match codec::write_frame(&mut *stream, &ResponseHeader { error: None }).await {
                    Ok(()) => codec::write_raw_frame(&mut *stream, &reply).await,
                    Err(e) => Err(e),
                }
            }
            Err(message) => {
                debug!(method = %header.method, error = %message, "unary handler failed");
                codec::write_frame(
                    &mut *stream,
                    &ResponseHeader {
                        error: Some(message),
                    },
                )
                .await
            }
        };
        if let Err(e) = written {
            debug!(method = %header.method, error = %e, "failed writing unary response");
        }
        let _ = stream.shutdown().await;
    }

    async fn serve_streaming(&self, mut stream: BoxConn) {
        let header: StreamingHeader = match codec::read_frame(&mut *stream).await {
            Ok(header) => header,
            Err(e) => {
                debug!(error = %e, "failed reading streaming header");
                return;
            }
        };
        match self.lookup_streaming(&header.method) {
            Some(handler) => handler(stream).await,
            None => {
                warn!(method = %header.method, "unknown streaming method");
                let _ = stream.shutdown().await;
            }
        }
    }
}
