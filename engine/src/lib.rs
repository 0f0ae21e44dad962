//! AIRI Engine Library
//!
//! This library provides the core functionality of the AIRI companion:
//! the server-side conversation exchange and memory ledger, and the
//! client-side session channel and reconnect supervisor.
//! It is used by both the main binary and integration tests.

/// Configuration management module
pub mod config;

/// Database persistence module
pub mod db;

/// Persistence store abstraction
pub mod store;

/// Short-term / long-term memory accounting
pub mod memory;

/// Duplex session channel over WebSocket
pub mod channel;

/// Connection lifecycle and reconnect backoff
pub mod supervisor;

/// Conversation round-trips
pub mod conversation;

/// HTTP and WebSocket server
pub mod server;

/// Telemetry and Observability
pub mod telemetry;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;
