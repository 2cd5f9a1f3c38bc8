//! TLS server policy
//!
//! Only TLS 1.3 is offered, and every completed handshake is checked again
//! against [`MINIMUM_TLS_VERSION`] before any application data flows. The
//! post-handshake check is an equality test, so a future protocol version is
//! refused too until this module is updated for it.

use crate::cert::{Identity, default_provider};
use crate::common::{Result, TunnelError};
use rustls::server::ServerConfig;
use rustls::{PeerIncompatible, ProtocolVersion};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;
use tracing::debug;

/// The only protocol version a connection may end up with
pub const MINIMUM_TLS_VERSION: ProtocolVersion = ProtocolVersion::TLSv1_3;

/// ALPN identifier for HTTP/2, advertised by the multiplexed tunnel listener
pub const ALPN_H2: &[u8] = b"h2";

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds a [`TlsServerPolicy`] from a resolved identity
#[derive(Debug, Clone)]
pub struct TlsPolicyBuilder {
    alpn_protocols: Vec<Vec<u8>>,
    handshake_timeout: Duration,
}

impl Default for TlsPolicyBuilder {
    fn default() -> Self {
        Self {
            alpn_protocols: Vec::new(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl TlsPolicyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// ALPN protocols to advertise, most preferred first
    #[must_use]
    pub fn alpn_protocols(mut self, protocols: Vec<Vec<u8>>) -> Self {
        self.alpn_protocols = protocols;
        self
    }

    /// Upper bound on a single handshake
    #[must_use]
    pub const fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Build the server policy for `identity`
    pub fn build(&self, identity: &Identity) -> Result<TlsServerPolicy> {
        let mut config = ServerConfig::builder_with_provider(Arc::new(default_provider()))
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_no_client_auth()
            .with_single_cert(
                identity.cert_chain().to_vec(),
                identity.private_key().clone_key(),
            )?;
        config.alpn_protocols.clone_from(&self.alpn_protocols);

        Ok(TlsServerPolicy {
            identity: identity.clone(),
            config: Arc::new(config),
            minimum_version: MINIMUM_TLS_VERSION,
            handshake_timeout: self.handshake_timeout,
        })
    }
}

/// Immutable TLS settings shared by every connection of a listener
#[derive(Debug, Clone)]
pub struct TlsServerPolicy {
    identity: Identity,
    config: Arc<ServerConfig>,
    minimum_version: ProtocolVersion,
    handshake_timeout: Duration,
}

impl TlsServerPolicy {
    /// Identity presented in every handshake
    pub const fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Underlying rustls configuration
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.config)
    }

    pub const fn minimum_version(&self) -> ProtocolVersion {
        self.minimum_version
    }

    /// Copy of this policy advertising `protocols` over ALPN
    #[must_use]
    pub fn with_alpn_protocols(&self, protocols: Vec<Vec<u8>>) -> Self {
        let mut config = (*self.config).clone();
        config.alpn_protocols = protocols;
        Self {
            config: Arc::new(config),
            ..self.clone()
        }
    }

    /// Run the server handshake on `stream` and enforce the version check
    ///
    /// # Errors
    ///
    /// [`TunnelError::TlsVersionRejected`] when the client could not (or did
    /// not) agree on TLS 1.3, [`TunnelError::Timeout`] when the handshake took
    /// too long, [`TunnelError::Handshake`] for any other handshake failure.
    pub async fn accept<IO>(&self, stream: IO) -> Result<TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let acceptor = TlsAcceptor::from(self.server_config());
        let tls_stream = timeout(self.handshake_timeout, acceptor.accept(stream))
            .await
            .map_err(|_| TunnelError::Timeout("TLS handshake".into()))?
            .map_err(handshake_error)?;

        let (_, connection) = tls_stream.get_ref();
        verify_negotiated_version(connection.protocol_version(), self.minimum_version)?;
        debug!(
            alpn = ?connection.alpn_protocol().map(String::from_utf8_lossy),
            "TLS handshake completed"
        );

        Ok(tls_stream)
    }
}

/// Reject any connection state whose version is not exactly `minimum`
pub fn verify_negotiated_version(
    negotiated: Option<ProtocolVersion>,
    minimum: ProtocolVersion,
) -> Result<()> {
    match negotiated {
        Some(version) if version == minimum => Ok(()),
        Some(version) => Err(TunnelError::TlsVersionRejected(format!("{version:?}"))),
        None => Err(TunnelError::TlsVersionRejected("none negotiated".into())),
    }
}

/// Classify a failed handshake, singling out clients that never offered TLS 1.3
fn handshake_error(err: std::io::Error) -> TunnelError {
    let rustls_error = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>());

    match rustls_error {
        Some(rustls::Error::PeerIncompatible(
            PeerIncompatible::Tls12NotOffered
            | PeerIncompatible::Tls12NotOfferedOrEnabled
            | PeerIncompatible::SupportedVersionsExtensionRequired,
        )) => TunnelError::TlsVersionRejected("client did not offer TLSv1_3".into()),
        Some(other) => TunnelError::Handshake(other.to_string()),
        None => TunnelError::Handshake(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::{IdentitySource, generate_certificate};
    use rustls::pki_types::ServerName;
    use rustls::{ClientConfig, RootCertStore, SupportedProtocolVersion};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_rustls::TlsConnector;

    fn identity() -> Identity {
        let generated = generate_certificate("localhost", None).unwrap();
        Identity::from_pem(
            generated.cert_pem.as_bytes(),
            generated.key_pem.as_bytes(),
            IdentitySource::Ephemeral,
        )
        .unwrap()
    }

    fn connector(
        identity: &Identity,
        versions: &[&'static SupportedProtocolVersion],
    ) -> TlsConnector {
        let mut roots = RootCertStore::empty();
        roots.add(identity.certificate_der().clone()).unwrap();
        let config = ClientConfig::builder_with_provider(Arc::new(default_provider()))
            .with_protocol_versions(versions)
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    }

    #[test]
    fn test_version_check_is_strict_equality() {
        assert!(
            verify_negotiated_version(Some(ProtocolVersion::TLSv1_3), MINIMUM_TLS_VERSION).is_ok()
        );

        for version in [
            ProtocolVersion::TLSv1_2,
            ProtocolVersion::TLSv1_0,
            ProtocolVersion::Unknown(0x0305),
        ] {
            let err = verify_negotiated_version(Some(version), MINIMUM_TLS_VERSION).unwrap_err();
            assert!(matches!(err, TunnelError::TlsVersionRejected(_)), "{version:?}");
        }

        let err = verify_negotiated_version(None, MINIMUM_TLS_VERSION).unwrap_err();
        assert!(err.to_string().starts_with("unsafe tls version"));
    }

    #[test]
    fn test_build_fixes_minimum_version() {
        let policy = TlsPolicyBuilder::new().build(&identity()).unwrap();
        assert_eq!(policy.minimum_version(), ProtocolVersion::TLSv1_3);
        assert!(policy.server_config().alpn_protocols.is_empty());

        let h2 = policy.with_alpn_protocols(vec![ALPN_H2.to_vec()]);
        assert_eq!(h2.server_config().alpn_protocols, vec![b"h2".to_vec()]);
        assert!(policy.server_config().alpn_protocols.is_empty());
    }

    #[tokio::test]
    async fn test_tls13_handshake_succeeds() {
        let identity = identity();
        let policy = TlsPolicyBuilder::new().build(&identity).unwrap();
        let connector = connector(&identity, &[&rustls::version::TLS13]);
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);

        let client = tokio::spawn(async move {
            let name = ServerName::try_from("localhost").unwrap();
            let mut tls = connector.connect(name, client_io).await.unwrap();
            assert_eq!(tls.get_ref().1.protocol_version(), Some(ProtocolVersion::TLSv1_3));
            tls.write_all(b"ping").await.unwrap();
            tls.shutdown().await.unwrap();
        });

        let mut server = policy.accept(server_io).await.unwrap();
        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"ping");
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_tls12_client_is_rejected() {
        let identity = identity();
        let policy = TlsPolicyBuilder::new().build(&identity).unwrap();
        let connector = connector(&identity, &[&rustls::version::TLS12]);
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);

        let client = tokio::spawn(async move {
            let name = ServerName::try_from("localhost").unwrap();
            connector.connect(name, client_io).await
        });

        let err = policy.accept(server_io).await.unwrap_err();
        assert!(matches!(err, TunnelError::TlsVersionRejected(_)), "{err}");
        assert!(client.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let policy = TlsPolicyBuilder::new()
            .handshake_timeout(Duration::from_millis(50))
            .build(&identity())
            .unwrap();
        let (_client_io, server_io) = tokio::io::duplex(1024);

        let err = policy.accept(server_io).await.unwrap_err();
        assert!(matches!(err, TunnelError::Timeout(_)));
    }
}
