//! Common types and utilities shared by every endpoint component
pub mod error;
pub mod sink;

pub use error::{ConnectionAddrs, GenerationError, Result, TunnelError};
pub use sink::{EventSink, RecordedEvent, RecordingSink, TracingSink};
