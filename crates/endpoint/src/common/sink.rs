//! Operational event sink
//!
//! The endpoint core reports exactly two kinds of events: the use of an
//! ephemeral identity at startup and the failure of an individual connection.
//! Both go through [`EventSink`] so callers and tests can observe them without
//! installing a global subscriber.

use super::error::{ConnectionAddrs, TunnelError};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{error, warn};

/// Receiver of operational events raised by the endpoint core
pub trait EventSink: Send + Sync + 'static {
    /// A self-signed identity was generated because no credentials were configured
    fn ephemeral_identity(&self, dns_name: &str);

    /// A single connection failed; the listener keeps running
    fn connection_error(&self, addrs: ConnectionAddrs, error: &TunnelError);
}

/// Default sink forwarding events to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn ephemeral_identity(&self, dns_name: &str) {
        warn!(
            dns_name,
            "you are using a temporary certificate with dns name: {}", dns_name
        );
    }

    fn connection_error(&self, addrs: ConnectionAddrs, error: &TunnelError) {
        error!(
            peer = %addrs.peer,
            local = %addrs.local,
            "connection {} <-> {}: {}",
            addrs.peer,
            addrs.local,
            error
        );
    }
}

/// Event captured by [`RecordingSink`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedEvent {
    /// Ephemeral identity in use, with its DNS name
    EphemeralIdentity(String),
    /// Connection failure, rendered error text
    ConnectionError(ConnectionAddrs, String),
}

/// Sink that keeps every event in memory
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl RecordingSink {
    /// Create an empty recording sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded events in arrival order
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of ephemeral-identity warnings seen
    pub fn ephemeral_warnings(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, RecordedEvent::EphemeralIdentity(_)))
            .count()
    }

    /// Rendered text of every connection error seen
    pub fn connection_errors(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                RecordedEvent::ConnectionError(_, msg) => Some(msg),
                RecordedEvent::EphemeralIdentity(_) => None,
            })
            .collect()
    }

    fn push(&self, event: RecordedEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl EventSink for RecordingSink {
    fn ephemeral_identity(&self, dns_name: &str) {
        self.push(RecordedEvent::EphemeralIdentity(dns_name.to_string()));
    }

    fn connection_error(&self, addrs: ConnectionAddrs, error: &TunnelError) {
        self.push(RecordedEvent::ConnectionError(addrs, error.to_string()));
    }
}
