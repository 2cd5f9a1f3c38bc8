//! Shared configuration and tracing utilities for tlsmux

pub mod tracing;
pub mod validation;

pub use validation::{ValidateConfig, validators};
