//! Multiplexed tunnel over HTTP/2
//!
//! Each registered path is exposed as a bidirectional-streaming gRPC method
//! `/{path}/Connect`. Every call is one tunnelled connection: request frames
//! are written to the path's transport handler and whatever the handler writes
//! back is streamed out as response frames. When the client finishes its half
//! of the stream the handler sees end of input.

use crate::common::{ConnectionAddrs, EventSink, Result, TunnelError};
use crate::transport::TransportHandler;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use http::{HeaderValue, Request, Response};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use std::collections::HashMap;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Notify, oneshot};
use tokio_util::io::ReaderStream;
use tonic::codec::{ProstCodec, Streaming};
use tonic::server::{Grpc, StreamingService};
use tonic::{Status, body::Body};
use tracing::{debug, info, instrument, warn};

/// Method name every tunnel service exposes
pub const CONNECT_METHOD: &str = "Connect";

/// Room left in each message for the protobuf field header
const FRAME_OVERHEAD: usize = 16;

/// gRPC status code for an unknown service or method
const GRPC_UNIMPLEMENTED: &str = "12";

/// One chunk of tunnelled bytes
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct TunnelFrame {
    #[prost(bytes = "bytes", tag = "1")]
    pub payload: Bytes,
}

/// HTTP/2 and message limits of the tunnel listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelSettings {
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    /// Limit on a single encoded message, in both directions
    pub max_message_size: usize,
    pub initial_window_size: u32,
    pub max_concurrent_streams: u32,
    pub max_header_list_size: u32,
    /// A connection with no open tunnel stream for this long is shut down
    pub max_connection_idle: Duration,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(60),
            keepalive_timeout: Duration::from_secs(20),
            max_message_size: 64 * 1024,
            initial_window_size: 1024 * 1024,
            max_concurrent_streams: 64,
            max_header_list_size: 2048,
            max_connection_idle: Duration::from_secs(300),
        }
    }
}

impl TunnelSettings {
    /// Largest payload that still fits in one message
    pub fn max_payload(&self) -> usize {
        self.max_message_size.saturating_sub(FRAME_OVERHEAD).max(1)
    }
}

/// Path-keyed registry of tunnel addons, served over HTTP/2
pub struct TunnelServer {
    settings: TunnelSettings,
    addons: HashMap<String, Arc<dyn TransportHandler>>,
    order: Vec<String>,
}

impl TunnelServer {
    pub fn new(settings: TunnelSettings) -> Self {
        Self {
            settings,
            addons: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub const fn settings(&self) -> &TunnelSettings {
        &self.settings
    }

    /// Registered paths in registration order
    pub fn paths(&self) -> &[String] {
        &self.order
    }

    /// gRPC method path a client calls to reach `path`
    pub fn method_path(path: &str) -> String {
        format!("/{path}/{CONNECT_METHOD}")
    }

    fn lookup(&self, uri_path: &str) -> Option<Arc<dyn TransportHandler>> {
        let (service, method) = uri_path.strip_prefix('/')?.rsplit_once('/')?;
        if method != CONNECT_METHOD {
            return None;
        }
        self.addons.get(service).cloned()
    }

    /// Serve one decrypted HTTP/2 connection until the client goes away
    ///
    /// Failures of individual tunnelled streams are reported to `sink` and do
    /// not end the connection.
    #[instrument(name = "tunnel.connection", skip_all, fields(peer = %addrs.peer))]
    pub async fn serve_connection<IO>(
        self: &Arc<Self>,
        io: IO,
        addrs: ConnectionAddrs,
        sink: Arc<dyn EventSink>,
    ) -> Result<()>
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let server = Arc::clone(self);
        let streams = Arc::new(StreamTracker::default());
        let tracker = Arc::clone(&streams);
        let service = hyper::service::service_fn(move |request: Request<Incoming>| {
            let server = Arc::clone(&server);
            let sink = Arc::clone(&sink);
            let tracker = Arc::clone(&tracker);
            async move {
                Ok::<_, Infallible>(server.dispatch(request, addrs, sink, &tracker).await)
            }
        });

        let mut builder = auto::Builder::new(TokioExecutor::new()).http2_only();
        builder
            .http2()
            .timer(TokioTimer::new())
            .keep_alive_interval(Some(self.settings.keepalive_interval))
            .keep_alive_timeout(self.settings.keepalive_timeout)
            .initial_stream_window_size(self.settings.initial_window_size)
            .initial_connection_window_size(self.settings.initial_window_size)
            .max_concurrent_streams(self.settings.max_concurrent_streams)
            .max_header_list_size(self.settings.max_header_list_size);

        let connection = builder.serve_connection(TokioIo::new(io), service);
        tokio::pin!(connection);

        let finished = tokio::select! {
            served = connection.as_mut() => Some(served),
            () = streams.idle_for(self.settings.max_connection_idle) => None,
        };
        let served = if let Some(served) = finished {
            served
        } else {
            debug!(
                "no tunnel streams for {:?}, closing connection",
                self.settings.max_connection_idle
            );
            connection.as_mut().graceful_shutdown();
            connection.await
        };
        served.map_err(|e| TunnelError::Tunnel(e.to_string()))?;

        debug!("tunnel connection closed");
        Ok(())
    }

    async fn dispatch(
        &self,
        request: Request<Incoming>,
        addrs: ConnectionAddrs,
        sink: Arc<dyn EventSink>,
        streams: &Arc<StreamTracker>,
    ) -> Response<Body> {
        let Some(handler) = self.lookup(request.uri().path()) else {
            debug!(path = request.uri().path(), "no tunnel addon for path");
            return unimplemented_response();
        };

        let addon = TunnelAddon {
            handler,
            addrs,
            sink,
            max_payload: self.settings.max_payload(),
            active: Some(StreamTracker::open(streams)),
        };
        let mut grpc = Grpc::new(ProstCodec::<TunnelFrame, TunnelFrame>::default())
            .max_decoding_message_size(self.settings.max_message_size)
            .max_encoding_message_size(self.settings.max_message_size);
        grpc.streaming(addon, request).await
    }
}

impl std::fmt::Debug for TunnelServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelServer")
            .field("settings", &self.settings)
            .field("paths", &self.order)
            .finish()
    }
}

/// Register `handler` on `server` at `path`
///
/// # Errors
///
/// [`TunnelError::DuplicatePath`] when `path` is taken, and
/// [`TunnelError::InvalidRouteSpec`] when it is empty or contains `/`.
pub fn register_tunnel_addon(
    server: &mut TunnelServer,
    handler: Arc<dyn TransportHandler>,
    path: &str,
) -> Result<()> {
    if path.is_empty() || path.contains('/') {
        return Err(TunnelError::InvalidRouteSpec(path.to_string()));
    }
    if server.addons.contains_key(path) {
        return Err(TunnelError::DuplicatePath(path.to_string()));
    }

    info!(path, method = %TunnelServer::method_path(path), "registered tunnel addon");
    server.addons.insert(path.to_string(), handler);
    server.order.push(path.to_string());
    Ok(())
}

type FrameStream = Pin<Box<dyn Stream<Item = std::result::Result<TunnelFrame, Status>> + Send>>;
type BoxFuture<T> = Pin<Box<dyn Future<Output = std::result::Result<T, Status>> + Send>>;

/// Open tunnel streams of one HTTP/2 connection
#[derive(Debug, Default)]
struct StreamTracker {
    active: AtomicUsize,
    changed: Notify,
}

impl StreamTracker {
    fn open(self: &Arc<Self>) -> ActiveStream {
        self.active.fetch_add(1, Ordering::SeqCst);
        self.changed.notify_waiters();
        ActiveStream(Arc::clone(self))
    }

    /// Resolve once no stream has been open for `limit`
    async fn idle_for(&self, limit: Duration) {
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if self.active.load(Ordering::SeqCst) == 0 {
                if tokio::time::timeout(limit, changed).await.is_err() {
                    return;
                }
            } else {
                changed.await;
            }
        }
    }
}

/// Counts as an open stream until dropped
#[derive(Debug)]
struct ActiveStream(Arc<StreamTracker>);

impl Drop for ActiveStream {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
        self.0.changed.notify_waiters();
    }
}

/// One tunnel call bridged onto a transport handler
struct TunnelAddon {
    handler: Arc<dyn TransportHandler>,
    addrs: ConnectionAddrs,
    sink: Arc<dyn EventSink>,
    max_payload: usize,
    active: Option<ActiveStream>,
}

impl StreamingService<TunnelFrame> for TunnelAddon {
    type Response = TunnelFrame;
    type ResponseStream = FrameStream;
    type Future = BoxFuture<tonic::Response<Self::ResponseStream>>;

    fn call(&mut self, request: tonic::Request<Streaming<TunnelFrame>>) -> Self::Future {
        let handler = Arc::clone(&self.handler);
        let sink = Arc::clone(&self.sink);
        let addrs = self.addrs;
        let max_payload = self.max_payload;
        let active = self.active.take();

        Box::pin(async move {
            let inbound = request.into_inner();
            // `local` is what the handler sees; `remote` is our end of the pipe
            let (local, remote) = tokio::io::duplex(max_payload);
            let (remote_read, remote_write) = tokio::io::split(remote);
            let (outcome_tx, outcome_rx) = oneshot::channel();

            tokio::spawn(pump_inbound(inbound, remote_write));
            tokio::spawn(async move {
                let outcome = handler.handle(Box::new(local)).await.map_err(|e| {
                    if !e.is_connection_closed() {
                        sink.connection_error(addrs, &e);
                    }
                    Status::unavailable(e.to_string())
                });
                let _ = outcome_tx.send(outcome);
            });

            let frames = ReaderStream::with_capacity(remote_read, max_payload).map(|chunk| {
                chunk
                    .map(|payload| TunnelFrame { payload })
                    .map_err(|e| Status::unavailable(e.to_string()))
            });
            // The handler's failure, if any, becomes the call's final status
            let outcome = futures::stream::once(async move {
                let _active = active;
                match outcome_rx.await {
                    Ok(Err(status)) => Some(Err(status)),
                    _ => None,
                }
            })
            .filter_map(futures::future::ready);

            Ok(tonic::Response::new(Box::pin(frames.chain(outcome)) as FrameStream))
        })
    }
}

/// Write every inbound frame into `writer`, then half-close it
async fn pump_inbound<W>(mut inbound: Streaming<TunnelFrame>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    loop {
        match inbound.message().await {
            Ok(Some(frame)) => {
                if let Err(e) = writer.write_all(&frame.payload).await {
                    debug!("tunnel handler stopped reading: {}", e);
                    return;
                }
            }
            Ok(None) => break,
            Err(status) => {
                warn!("tunnel stream aborted: {}", status.message());
                break;
            }
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!("failed to half-close tunnel pipe: {}", e);
    }
}

fn unimplemented_response() -> Response<Body> {
    let mut response = Response::new(Body::empty());
    let headers = response.headers_mut();
    headers.insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/grpc"),
    );
    headers.insert("grpc-status", HeaderValue::from_static(GRPC_UNIMPLEMENTED));
    response
}
