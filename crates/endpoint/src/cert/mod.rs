//! Serving identity: generation, loading and source resolution

pub mod ephemeral;
pub mod identity;
pub mod info;
pub mod provisioner;

pub use ephemeral::{GeneratedCertificate, generate_certificate, random_server_name};
pub use identity::{Identity, IdentitySource, default_provider};
pub use info::CertificateInfo;
pub use provisioner::{CertificateProvisioner, CredentialInputs, RESOLUTION_ORDER, select_source};
