//! AIRI SDK
//!
//! Shared library providing the wire protocol and error types for AIRI
//! components. This crate is used by the engine (server and client sides)
//! and by anything else that needs to speak the companion protocol.

/// Error types and handling
pub mod errors;

/// Duplex channel wire protocol
pub mod protocol;

// Re-export commonly used types
pub use errors::{AiriErrorExt, EngineError};
pub use protocol::{DecodeError, MemoryStats, Message};
