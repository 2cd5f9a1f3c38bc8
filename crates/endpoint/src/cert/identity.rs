//! The serving identity: certificate chain plus matching private key

use crate::cert::info::CertificateInfo;
use crate::common::{Result, TunnelError};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Where the active identity came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentitySource {
    /// PEM material passed in directly (environment or config)
    Inline,
    /// Generated at startup, never persisted
    Ephemeral,
    /// PEM files on disk
    Disk,
}

impl IdentitySource {
    /// Short lowercase name used in error messages
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inline => "inline",
            Self::Ephemeral => "ephemeral",
            Self::Disk => "disk",
        }
    }
}

impl fmt::Display for IdentitySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Certificate chain and private key presented during the TLS handshake
///
/// Built once at startup and never mutated afterwards.
pub struct Identity {
    cert_chain: Vec<CertificateDer<'static>>,
    private_key: PrivateKeyDer<'static>,
    source: IdentitySource,
}

impl Identity {
    /// Parse a PEM certificate chain and PEM private key
    ///
    /// The key may be PKCS#8, PKCS#1 or SEC1. Fails with
    /// [`TunnelError::InvalidKeyPair`] when either block is missing or
    /// malformed, or when the key does not belong to the leaf certificate.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8], source: IdentitySource) -> Result<Self> {
        let cert_chain = CertificateDer::pem_slice_iter(cert_pem)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| invalid(source, format!("failed to parse certificate PEM: {e}")))?;
        if cert_chain.is_empty() {
            return Err(invalid(source, "no certificate found"));
        }

        let private_key = PrivateKeyDer::from_pem_slice(key_pem)
            .map_err(|e| invalid(source, format!("failed to parse private key PEM: {e}")))?;

        let identity = Self {
            cert_chain,
            private_key,
            source,
        };
        identity.certified_key(&default_provider())?;
        Ok(identity)
    }

    /// Load a PEM certificate chain and private key from two files
    pub fn from_pem_files(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
        let read = |path: &Path| {
            std::fs::read(path).map_err(|e| {
                invalid(
                    IdentitySource::Disk,
                    format!("failed to read {}: {e}", path.display()),
                )
            })
        };
        let cert_pem = read(cert_path.as_ref())?;
        let key_pem = read(key_path.as_ref())?;
        Self::from_pem(&cert_pem, &key_pem, IdentitySource::Disk)
    }

    /// Leaf certificate
    pub fn certificate_der(&self) -> &CertificateDer<'static> {
        &self.cert_chain[0]
    }

    /// Full chain, leaf first
    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.cert_chain
    }

    /// Private key matching the leaf certificate
    pub fn private_key(&self) -> &PrivateKeyDer<'static> {
        &self.private_key
    }

    /// Which resolution branch produced this identity
    pub const fn source(&self) -> IdentitySource {
        self.source
    }

    /// Parsed view of the leaf certificate
    pub fn certificate_info(&self) -> Result<CertificateInfo> {
        CertificateInfo::from_der(self.certificate_der())
            .map_err(|e| invalid(self.source, format!("failed to parse certificate: {e}")))
    }

    /// Load the key with `provider` and check it belongs to the leaf certificate
    pub fn certified_key(&self, provider: &CryptoProvider) -> Result<Arc<CertifiedKey>> {
        let signing_key = provider
            .key_provider
            .load_private_key(self.private_key.clone_key())
            .map_err(|e| invalid(self.source, format!("unsupported private key: {e}")))?;

        let certified = CertifiedKey::new(self.cert_chain.clone(), signing_key);
        certified.keys_match().map_err(|e| {
            invalid(
                self.source,
                format!("private key does not match certificate: {e}"),
            )
        })?;

        Ok(Arc::new(certified))
    }
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            private_key: self.private_key.clone_key(),
            source: self.source,
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("source", &self.source)
            .field("chain_len", &self.cert_chain.len())
            .finish_non_exhaustive()
    }
}

/// The crypto provider every TLS object in this crate is built with
pub fn default_provider() -> CryptoProvider {
    rustls::crypto::ring::default_provider()
}

fn invalid(source: IdentitySource, reason: impl Into<String>) -> TunnelError {
    TunnelError::InvalidKeyPair {
        origin: source.as_str(),
        reason: reason.into(),
    }
}
