//! Serving mode selection and listener startup

use super::listener::TlsListener;
use crate::common::{EventSink, Result, TunnelError};
use crate::policy::{ALPN_H2, TlsServerPolicy};
use crate::routes::RouteTable;
use crate::transport::{HandlerFactory, TransportHandler};
use crate::tunnel::{TunnelServer, TunnelSettings, register_tunnel_addon};
use std::sync::Arc;
use tlsmux_core::tracing::prelude::*;
use tokio::net::TcpListener;

/// How the listener treats decrypted connections, fixed for its lifetime
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointMode {
    /// Forward every connection to one destination
    RawRelay(String),
    /// Serve the tunnel protocol, one addon per route
    MultiplexedTunnel(RouteTable),
}

impl EndpointMode {
    /// Pick the mode for `destination_spec`
    ///
    /// In raw mode the string is taken as a single destination and not parsed
    /// as a route table.
    pub fn select(destination_spec: &str, use_tunnel: bool) -> Result<Self> {
        if use_tunnel {
            return Ok(Self::MultiplexedTunnel(RouteTable::parse(destination_spec)?));
        }
        if destination_spec.is_empty() {
            return Err(TunnelError::InvalidRouteSpec(String::new()));
        }
        Ok(Self::RawRelay(destination_spec.to_string()))
    }
}

/// What the accept loop hands each connection to
enum ConnectionService {
    Raw(Arc<dyn TransportHandler>),
    Tunnel(Arc<TunnelServer>),
}

/// Starts the endpoint in the configured mode
///
/// Destination handlers come from the injected factory, and per-connection
/// failures are reported to the injected sink.
pub struct EndpointDispatcher {
    handler_factory: HandlerFactory,
    sink: Arc<dyn EventSink>,
    tunnel_settings: TunnelSettings,
    max_connections: usize,
}

impl EndpointDispatcher {
    pub fn new(handler_factory: HandlerFactory, sink: Arc<dyn EventSink>) -> Self {
        Self {
            handler_factory,
            sink,
            tunnel_settings: TunnelSettings::default(),
            max_connections: 1024,
        }
    }

    #[must_use]
    pub const fn with_tunnel_settings(mut self, settings: TunnelSettings) -> Self {
        self.tunnel_settings = settings;
        self
    }

    #[must_use]
    pub const fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Bind `bind_address` and serve until the listener fails
    ///
    /// The destination string is parsed and every tunnel addon registered before
    /// the socket is bound, so a bad route list never occupies the port.
    pub async fn start(
        &self,
        bind_address: &str,
        destination_spec: &str,
        use_tunnel: bool,
        service_name: &str,
        policy: TlsServerPolicy,
    ) -> Result<()> {
        let mode = EndpointMode::select(destination_spec, use_tunnel)?;
        let service = self.prepare(mode, service_name)?;

        let listener = TcpListener::bind(bind_address)
            .await
            .map_err(|e| TunnelError::bind(bind_address, e))?;

        self.run(listener, service, policy).await
    }

    /// Serve on an already bound listener
    pub async fn serve(
        &self,
        listener: TcpListener,
        mode: EndpointMode,
        service_name: &str,
        policy: TlsServerPolicy,
    ) -> Result<()> {
        let service = self.prepare(mode, service_name)?;
        self.run(listener, service, policy).await
    }

    fn prepare(&self, mode: EndpointMode, service_name: &str) -> Result<ConnectionService> {
        match mode {
            EndpointMode::RawRelay(destination) => {
                info!("relaying raw TLS connections to {}", destination);
                Ok(ConnectionService::Raw((self.handler_factory)(&destination)))
            }
            EndpointMode::MultiplexedTunnel(routes) => {
                Ok(ConnectionService::Tunnel(Arc::new(self.tunnel_server(&routes, service_name)?)))
            }
        }
    }

    /// Register one addon per route, in declaration order
    pub fn tunnel_server(&self, routes: &RouteTable, service_name: &str) -> Result<TunnelServer> {
        let mut server = TunnelServer::new(self.tunnel_settings);
        for (path, destination) in routes.resolved(service_name) {
            info!("starting tunnel addon at path {} -> {}", path, destination);
            register_tunnel_addon(&mut server, (self.handler_factory)(destination), path)?;
        }
        Ok(server)
    }

    async fn run(
        &self,
        listener: TcpListener,
        service: ConnectionService,
        policy: TlsServerPolicy,
    ) -> Result<()> {
        let sink = Arc::clone(&self.sink);

        match service {
            ConnectionService::Raw(handler) => {
                let listener = TlsListener::new(listener, policy, self.max_connections, sink);
                info!("raw relay listening on {}", listener.local_addr()?);
                listener
                    .serve(move |tls, _addrs| {
                        let handler = Arc::clone(&handler);
                        async move { handler.handle(Box::new(tls)).await }
                    })
                    .await
            }
            ConnectionService::Tunnel(server) => {
                let policy = policy.with_alpn_protocols(vec![ALPN_H2.to_vec()]);
                let listener =
                    TlsListener::new(listener, policy, self.max_connections, Arc::clone(&sink));
                info!(
                    paths = ?server.paths(),
                    "multiplexed tunnel listening on {}",
                    listener.local_addr()?
                );
                listener
                    .serve(move |tls, addrs| {
                        let server = Arc::clone(&server);
                        let sink = Arc::clone(&sink);
                        async move { server.serve_connection(tls, addrs, sink).await }
                    })
                    .await
            }
        }
    }
}

impl std::fmt::Debug for EndpointDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointDispatcher")
            .field("tunnel_settings", &self.tunnel_settings)
            .field("max_connections", &self.max_connections)
            .finish_non_exhaustive()
    }
}
