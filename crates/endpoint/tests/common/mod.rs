//! Shared helpers for the loopback integration tests

#![allow(dead_code)]

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore, SupportedProtocolVersion};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tlsmux_endpoint::cert::{Identity, IdentitySource, default_provider, generate_certificate};
use tlsmux_endpoint::common::{EventSink, RecordingSink};
use tlsmux_endpoint::server::{EndpointDispatcher, EndpointMode};
use tlsmux_endpoint::transport::{DstTransportHandler, RelaySettings};
use tlsmux_endpoint::tunnel::TunnelSettings;
use tlsmux_endpoint::{TlsPolicyBuilder, TlsServerPolicy};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

pub const SERVER_NAME: &str = "localhost";

pub fn identity() -> Identity {
    let generated = generate_certificate(SERVER_NAME, None).unwrap();
    Identity::from_pem(
        generated.cert_pem.as_bytes(),
        generated.key_pem.as_bytes(),
        IdentitySource::Ephemeral,
    )
    .unwrap()
}

pub fn policy(identity: &Identity) -> TlsServerPolicy {
    TlsPolicyBuilder::new()
        .handshake_timeout(Duration::from_secs(5))
        .build(identity)
        .unwrap()
}

/// TCP server echoing every connection back to itself
pub async fn echo_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

/// TCP server that writes `greeting` to every connection and closes it
pub async fn greeting_server(greeting: &'static [u8]) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = stream.write_all(greeting).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    addr
}

/// Start a dispatcher on a loopback port and return its address
pub async fn start_endpoint(
    mode: EndpointMode,
    service_name: &str,
    policy: TlsServerPolicy,
    sink: RecordingSink,
) -> SocketAddr {
    start_endpoint_with(mode, service_name, policy, sink, TunnelSettings::default()).await
}

/// Like [`start_endpoint`] with explicit tunnel settings
pub async fn start_endpoint_with(
    mode: EndpointMode,
    service_name: &str,
    policy: TlsServerPolicy,
    sink: RecordingSink,
    tunnel_settings: TunnelSettings,
) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let sink: Arc<dyn EventSink> = Arc::new(sink);
    let factory = DstTransportHandler::factory(RelaySettings::default());
    let dispatcher = EndpointDispatcher::new(factory, sink)
        .with_tunnel_settings(tunnel_settings)
        .with_max_connections(16);
    let service_name = service_name.to_string();

    tokio::spawn(async move {
        dispatcher
            .serve(listener, mode, &service_name, policy)
            .await
    });
    addr
}

/// Address with nothing listening on it
pub async fn unreachable_destination() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().to_string()
}

pub fn connector(
    identity: &Identity,
    versions: &[&'static SupportedProtocolVersion],
    alpn: &[&[u8]],
) -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.add(identity.certificate_der().clone()).unwrap();
    let mut config = ClientConfig::builder_with_provider(Arc::new(default_provider()))
        .with_protocol_versions(versions)
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    TlsConnector::from(Arc::new(config))
}

pub async fn connect(
    addr: SocketAddr,
    connector: &TlsConnector,
) -> std::io::Result<TlsStream<TcpStream>> {
    let tcp = TcpStream::connect(addr).await?;
    let name = ServerName::try_from(SERVER_NAME).unwrap();
    connector.connect(name, tcp).await
}

/// Wait until `sink` has recorded at least one connection error
pub async fn wait_for_connection_error(sink: &RecordingSink) -> Vec<String> {
    for _ in 0..100 {
        let errors = sink.connection_errors();
        if !errors.is_empty() {
            return errors;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("no connection error recorded");
}
