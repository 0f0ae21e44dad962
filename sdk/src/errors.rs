//! Error types and handling
//!
//! This module provides the error types used throughout the AIRI engine.
//! All errors implement the `AiriErrorExt` trait which provides user-friendly
//! hints and indicates whether errors are recoverable.
//!
//! # Containment
//!
//! None of these errors is fatal to the process:
//! - Transport and decode failures stay inside the session channel and
//!   reach the peer as an `error` message
//! - Persistence failures stay inside the exchange and memory ledger and
//!   only degrade the affected step
//! - All messages are safe to display to end users

use thiserror::Error;

/// Trait for AIRI error extensions
///
/// This trait provides additional context for errors, including user-friendly
/// hints and recoverability information. All engine errors implement this trait.
pub trait AiriErrorExt {
    /// Returns a user-friendly hint for the error
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors can be retried or worked around. Non-recoverable
    /// errors typically require a configuration change.
    fn is_recoverable(&self) -> bool;
}

/// Main engine error type
///
/// # Error Categories
///
/// - **Configuration**: Invalid or missing configuration
/// - **Connection**: The duplex transport could not be established
/// - **Channel**: Writes attempted on a channel that is not open
/// - **Decode**: Inbound payloads that are not valid messages
/// - **Persistence**: Store failures (database, in-memory)
/// - **Memory**: Unknown memory items, invalid importance scores
///
/// # Examples
///
/// ```
/// use sdk::errors::{AiriErrorExt, EngineError};
///
/// let error = EngineError::ChannelClosed;
/// println!("Hint: {}", error.user_hint());
/// assert!(error.is_recoverable());
///
/// let fatal_error = EngineError::Config("bad port".to_string());
/// assert!(!fatal_error.is_recoverable());
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Transport errors
    #[error("Connect error: {0}")]
    Connect(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Channel not open")]
    ChannelNotOpen,

    #[error("Send error: {0}")]
    Send(String),

    // Protocol errors
    #[error("Decode error: {0}")]
    Decode(String),

    // Persistence errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    // Memory ledger errors
    #[error("Memory item not found: {0}")]
    MemoryNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AiriErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Config(_) => "Check your config.toml file for errors",

            Self::Connect(_) => "Could not reach the server. Is it running?",
            Self::ChannelClosed => "The connection was closed. Waiting to reconnect",
            Self::ChannelNotOpen => "Not connected yet. Try again shortly",
            Self::Send(_) => "Failed to deliver the message. Try again",

            Self::Decode(_) => "Received a message that could not be understood",

            Self::Persistence(_) => "Storage operation failed. Conversation continues",

            Self::MemoryNotFound(_) => "No memory exists with that id",
            Self::InvalidInput(_) => "The request contained an invalid value",

            Self::Network(_) => "Network operation failed. Check your connection",

            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Config(_))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}
