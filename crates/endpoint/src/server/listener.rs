//! TLS accept loop shared by both serving modes

use crate::common::{ConnectionAddrs, EventSink, Result, TunnelError};
use crate::policy::TlsServerPolicy;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tlsmux_core::tracing::prelude::*;
use tokio_rustls::server::TlsStream;

/// Decrypted connection handed to a mode's connection handler
pub type TlsConnection = TlsStream<TcpStream>;

/// Accepts TCP connections, terminates TLS and hands them to a handler
pub struct TlsListener {
    listener: TcpListener,
    policy: Arc<TlsServerPolicy>,
    limiter: Arc<Semaphore>,
    max_connections: usize,
    sink: Arc<dyn EventSink>,
}

impl TlsListener {
    pub fn new(
        listener: TcpListener,
        policy: TlsServerPolicy,
        max_connections: usize,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let max_connections = max_connections.max(1);
        Self {
            listener,
            policy: Arc::new(policy),
            limiter: Arc::new(Semaphore::new(max_connections)),
            max_connections,
            sink,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept forever, running `handler` on each connection that passes the TLS policy
    ///
    /// Returns only when accepting fails for a reason other than a single
    /// aborted connection. Handshake and handler failures are reported to the
    /// sink and end only their own connection.
    pub async fn serve<H, Fut>(self, handler: H) -> Result<()>
    where
        H: Fn(TlsConnection, ConnectionAddrs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let local_addr = self.local_addr()?;

        loop {
            if self.limiter.available_permits() == 0 {
                warn!(
                    "Connection limit reached ({}), waiting for available slot",
                    self.max_connections
                );
            }
            let permit = Arc::clone(&self.limiter)
                .acquire_owned()
                .await
                .map_err(|e| TunnelError::Tunnel(format!("connection limiter closed: {e}")))?;

            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) if is_transient_accept_error(&e) => {
                    debug!("accept aborted: {}", e);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let addrs = ConnectionAddrs {
                peer,
                local: stream.local_addr().unwrap_or(local_addr),
            };
            let policy = Arc::clone(&self.policy);
            let sink = Arc::clone(&self.sink);
            let handler = Arc::clone(&handler);

            tokio::spawn(
                async move {
                    debug!("New connection from {}", peer);
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("failed to set TCP_NODELAY: {}", e);
                    }

                    let result = match policy.accept(stream).await {
                        Ok(tls) => handler(tls, addrs).await,
                        Err(e) => Err(e),
                    };

                    if let Err(e) = result {
                        if e.is_connection_closed() {
                            debug!("connection closed by peer: {}", e);
                        } else {
                            sink.connection_error(addrs, &e);
                        }
                    }
                    drop(permit);
                }
                .instrument(tracing::info_span!("connection", %peer)),
            );
        }
    }
}

fn is_transient_accept_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
    )
}
