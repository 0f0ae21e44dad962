//! CLI interface for AIRI
//!
//! This module provides the command-line interface using clap's derive API.
//! It defines the server, the interactive client and the store inspection
//! commands.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// AIRI companion engine
///
/// Runs the AIRI conversation server, or connects to one as a
/// self-reconnecting chat client.
#[derive(Parser, Debug)]
#[command(name = "airi")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP and WebSocket server
    Serve {
        /// Keep everything in memory instead of the SQLite database
        #[arg(long)]
        ephemeral: bool,
    },

    /// Chat with a running server; each stdin line is sent as text input
    Chat {
        /// Server WebSocket URL (defaults to [client].url)
        #[arg(long)]
        url: Option<String>,
    },

    /// Show memory counts for a user
    Stats {
        /// Username
        user: String,
    },

    /// Promote a memory to long-term
    Promote {
        /// Memory ID
        memory_id: String,
    },

    /// List a user's conversations, most recently active first
    Conversations {
        /// Username
        user: String,

        /// Number of conversations to show
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Show the messages of a conversation, oldest first
    History {
        /// Conversation ID
        conversation_id: String,

        /// Number of messages to show
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// List a user's memories, most recently accessed first
    Memories(MemoriesArgs),
}

#[derive(Args, Debug)]
pub struct MemoriesArgs {
    /// Username
    pub user: String,

    /// Only long-term memories
    #[arg(long, conflicts_with = "short_term")]
    pub long_term: bool,

    /// Only short-term memories
    #[arg(long)]
    pub short_term: bool,

    /// Number of memories to show
    #[arg(short, long, default_value = "20")]
    pub limit: usize,
}
