//! Resolution of the serving identity from competing credential sources
//!
//! Sources are tried in [`RESOLUTION_ORDER`]; the first one whose predicate
//! holds produces the identity and no other source is consulted. When none
//! applies the inputs are incomplete and resolution fails.

use crate::cert::ephemeral::generate_certificate;
use crate::cert::identity::{Identity, IdentitySource};
use crate::common::{EventSink, Result, TunnelError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Order in which credential sources are considered
pub const RESOLUTION_ORDER: [IdentitySource; 3] = [
    IdentitySource::Inline,
    IdentitySource::Ephemeral,
    IdentitySource::Disk,
];

/// Raw credential inputs as configured
///
/// Empty strings mean "not supplied".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialInputs {
    /// Inline PEM certificate chain
    pub inline_cert: String,
    /// Inline PEM private key
    pub inline_key: String,
    /// Path to a PEM certificate chain
    pub cert_path: String,
    /// Path to a PEM private key
    pub key_path: String,
    /// DNS name for a generated certificate
    pub server_name: String,
}

impl CredentialInputs {
    fn has_inline_pair(&self) -> bool {
        !self.inline_cert.is_empty() && !self.inline_key.is_empty()
    }

    fn has_inline_part(&self) -> bool {
        !self.inline_cert.is_empty() || !self.inline_key.is_empty()
    }

    fn has_disk_pair(&self) -> bool {
        !self.cert_path.is_empty() && !self.key_path.is_empty()
    }

    fn has_disk_part(&self) -> bool {
        !self.cert_path.is_empty() || !self.key_path.is_empty()
    }
}

impl IdentitySource {
    /// Whether this source can serve the given inputs
    pub fn applies(self, inputs: &CredentialInputs) -> bool {
        match self {
            Self::Inline => inputs.has_inline_pair(),
            Self::Ephemeral => !inputs.has_inline_part() && !inputs.has_disk_part(),
            Self::Disk => inputs.has_disk_pair(),
        }
    }
}

/// Resolves the identity the endpoint presents
#[derive(Clone)]
pub struct CertificateProvisioner {
    sink: Arc<dyn EventSink>,
}

impl CertificateProvisioner {
    /// Create a provisioner reporting the ephemeral-identity warning to `sink`
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    /// Pick the first applicable source and resolve the identity from it
    pub fn resolve(&self, inputs: &CredentialInputs) -> Result<Identity> {
        let source = select_source(inputs).ok_or(TunnelError::MissingCredential)?;
        debug!(%source, "resolving serving identity");
        self.resolve_from(source, inputs)
    }

    /// Resolve using one specific source, regardless of the priority order
    pub fn resolve_from(
        &self,
        source: IdentitySource,
        inputs: &CredentialInputs,
    ) -> Result<Identity> {
        match source {
            IdentitySource::Inline => resolve_inline(inputs),
            IdentitySource::Ephemeral => resolve_ephemeral(inputs, self.sink.as_ref()),
            IdentitySource::Disk => resolve_disk(inputs),
        }
    }
}

impl std::fmt::Debug for CertificateProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateProvisioner").finish_non_exhaustive()
    }
}

/// First source in [`RESOLUTION_ORDER`] that applies to `inputs`
pub fn select_source(inputs: &CredentialInputs) -> Option<IdentitySource> {
    RESOLUTION_ORDER
        .into_iter()
        .find(|source| source.applies(inputs))
}

fn resolve_inline(inputs: &CredentialInputs) -> Result<Identity> {
    Identity::from_pem(
        inputs.inline_cert.as_bytes(),
        inputs.inline_key.as_bytes(),
        IdentitySource::Inline,
    )
}

fn resolve_ephemeral(inputs: &CredentialInputs, sink: &dyn EventSink) -> Result<Identity> {
    let generated = generate_certificate(&inputs.server_name, None)?;
    sink.ephemeral_identity(&generated.dns_name);
    Identity::from_pem(
        generated.cert_pem.as_bytes(),
        generated.key_pem.as_bytes(),
        IdentitySource::Ephemeral,
    )
}

fn resolve_disk(inputs: &CredentialInputs) -> Result<Identity> {
    Identity::from_pem_files(&inputs.cert_path, &inputs.key_path)
}
