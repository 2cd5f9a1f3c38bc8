//! Endpoint startup: configuration, mode dispatch and the accept loop

pub mod config;
pub mod dispatcher;
pub mod listener;

pub use config::EndpointConfig;
pub use dispatcher::{EndpointDispatcher, EndpointMode};
pub use listener::{TlsConnection, TlsListener};

use crate::cert::CertificateProvisioner;
use crate::common::{EventSink, Result};
use crate::policy::TlsPolicyBuilder;
use crate::transport::DstTransportHandler;
use std::sync::Arc;
use tracing::info;

/// Resolve the identity, build the TLS policy and serve according to `config`
///
/// Every startup step runs once, in order, and its error is returned as is.
pub async fn run(config: &EndpointConfig, sink: Arc<dyn EventSink>) -> Result<()> {
    let identity = CertificateProvisioner::new(Arc::clone(&sink)).resolve(&config.identity)?;
    info!(source = %identity.source(), "serving identity resolved");

    let policy = TlsPolicyBuilder::new()
        .handshake_timeout(config.handshake_timeout())
        .build(&identity)?;

    let dispatcher = EndpointDispatcher::new(
        DstTransportHandler::factory(config.relay_settings()),
        sink,
    )
    .with_tunnel_settings(config.tunnel_settings())
    .with_max_connections(config.listen.max_connections);

    dispatcher
        .start(
            &config.listen.bind_addr,
            &config.listen.destination,
            config.listen.tunnel,
            &config.listen.service_name,
            policy,
        )
        .await
}
