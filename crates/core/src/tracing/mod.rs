//! Shared tracing functionality for tlsmux
//!
//! Subscriber setup for binaries plus a prelude of the macros every crate uses.

pub mod config;
pub mod init;

pub use config::{InstrumentationConfig, LogFormat};
pub use init::init_tracing;

pub mod prelude {
    // Re-export common tracing macros and types
    pub use tracing::{Instrument, debug, error, info, instrument, trace, warn};
}
