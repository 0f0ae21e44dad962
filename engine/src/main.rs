// AIRI companion engine
// Main entry point for the airi binary

use airi_engine::cli::{Cli, Command};
use airi_engine::config::Config;
use airi_engine::handlers::{
    handle_chat, handle_conversations, handle_history, handle_memories, handle_promote, handle_serve, handle_stats,
    OutputFormat,
};
use airi_engine::telemetry::init_telemetry_with_level;
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration (or use custom path if provided)
    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // --log wins over the config; RUST_LOG wins over both
    init_telemetry_with_level(cli.log.as_deref().unwrap_or(&config.core.log_level));

    let version = env!("CARGO_PKG_VERSION");
    let commit = env!("GIT_COMMIT_HASH");
    let timestamp = env!("BUILD_TIMESTAMP");

    tracing::info!("AIRI Engine v{} ({} - {})", version, commit, timestamp);

    // Determine output format
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    // Handle commands
    match cli.command {
        Command::Serve { ephemeral } => {
            tracing::info!("Starting server...");
            handle_serve(&config, ephemeral).await
        }

        Command::Chat { url } => handle_chat(&config, url, format).await,

        Command::Stats { user } => {
            tracing::info!("Showing memory stats for {}", user);
            handle_stats(user, &config, format).await
        }

        Command::Promote { memory_id } => {
            tracing::info!("Promoting memory {}", memory_id);
            handle_promote(memory_id, &config, format).await
        }

        Command::Conversations { user, limit } => {
            tracing::info!("Listing conversations for {}", user);
            handle_conversations(user, limit, &config, format).await
        }

        Command::History {
            conversation_id,
            limit,
        } => {
            tracing::info!("Showing last {} messages of {}", limit, conversation_id);
            handle_history(conversation_id, limit, &config, format).await
        }

        Command::Memories(args) => {
            tracing::info!("Listing memories for {}", args.user);
            handle_memories(args, &config, format).await
        }
    }
}
