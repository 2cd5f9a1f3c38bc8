//! TLS-terminating tunnel endpoint
//!
//! Startup runs strictly in sequence:
//! - resolve the serving identity ([`cert::CertificateProvisioner`]), generating an
//!   ephemeral self-signed one when nothing is configured
//! - build the TLS 1.3 only policy ([`policy::TlsPolicyBuilder`])
//! - parse the destination string ([`routes::RouteTable`])
//! - bind and serve, either relaying raw decrypted bytes to one destination or
//!   serving the multiplexed tunnel with one addon per route
//!   ([`server::EndpointDispatcher`])

pub mod cert;
pub mod common;
pub mod policy;
pub mod routes;
pub mod server;
pub mod transport;
pub mod tunnel;

// Re-export common types at crate root
pub use common::error;
pub use error::{Result, TunnelError};

pub use cert::{CertificateProvisioner, CredentialInputs, Identity, IdentitySource};
pub use common::{EventSink, RecordingSink, TracingSink};
pub use policy::{TlsPolicyBuilder, TlsServerPolicy};
pub use routes::{RouteEntry, RouteTable};
pub use server::{EndpointConfig, EndpointDispatcher, EndpointMode};
pub use transport::{DstTransportHandler, TransportHandler};
pub use tunnel::{TunnelFrame, TunnelServer, register_tunnel_addon};
