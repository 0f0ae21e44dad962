//! Command handlers for CLI operations
//!
//! This module implements the handlers for all CLI commands:
//! - serve: Run the HTTP and WebSocket server
//! - chat: Interactive client through the reconnect supervisor
//! - stats: Memory counts for a user
//! - promote: Move a memory to long-term
//! - conversations: A user's conversations
//! - history: Messages of a conversation
//! - memories: List a user's memories

use anyhow::{Context, Result};
use sdk::errors::AiriErrorExt;
use sdk::protocol::Message;
use serde_json::json;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::channel::WsConnector;
use crate::cli::MemoriesArgs;
use crate::config::Config;
use crate::conversation::RandomTemplates;
use crate::db::{Database, SqliteStore};
use crate::memory::{MemoryLedger, MemorySnapshot};
use crate::server::{self, AppState, ProviderKeys};
use crate::store::{InMemoryStore, MemoryType, PersistenceStore, User};
use crate::supervisor::{ReconnectSupervisor, SupervisorConfig, SupervisorEvent};

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

/// Run the server until SIGTERM or Ctrl-C
///
/// With `ephemeral` nothing touches disk; otherwise the SQLite database in
/// the data directory backs every conversation and memory.
pub async fn handle_serve(config: &Config, ephemeral: bool) -> Result<()> {
    let database = if ephemeral {
        tracing::info!("Running with an in-memory store; nothing will be persisted");
        None
    } else {
        Some(Arc::new(
            Database::new(&config.db_path())
                .await
                .context("Failed to open database")?,
        ))
    };

    let store: Arc<dyn PersistenceStore> = match &database {
        Some(db) => Arc::new(SqliteStore::new(Arc::clone(db))),
        None => Arc::new(InMemoryStore::new()),
    };

    let replies = Arc::new(RandomTemplates::new(config.responder.character_name.clone()));
    let state = AppState::new(config, store, replies, ProviderKeys::from_env());

    server::run(config, state).await?;

    if let Some(db) = database {
        db.flush_wal().await?;
    }
    Ok(())
}

/// Chat with a server through the reconnect supervisor
///
/// Each stdin line becomes an `input:text`. Lines typed while disconnected
/// are dropped with a notice. Ends on EOF or Ctrl-C.
pub async fn handle_chat(config: &Config, url: Option<String>, format: OutputFormat) -> Result<()> {
    let mut supervisor_config = SupervisorConfig::from_client(&config.client);
    if let Some(url) = url {
        supervisor_config.endpoint = url;
    }

    let connector = WsConnector::new(config.client.connect_timeout());
    let (supervisor, mut events) = ReconnectSupervisor::start(connector, supervisor_config);

    if let OutputFormat::Text = format {
        println!("Connecting to {} (Ctrl-D to quit)", supervisor.endpoint());
    }
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => print_event(&event, format)?,
                None => break,
            },
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                if let Err(e) = supervisor.send(&Message::text(text)).await {
                    eprintln!("Message not sent: {} ({})", e.user_hint(), e);
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    supervisor.teardown().await;
    Ok(())
}

fn print_event(event: &SupervisorEvent, format: OutputFormat) -> Result<()> {
    if let OutputFormat::Json = format {
        if let SupervisorEvent::Message(msg) = event {
            println!("{}", msg.encode()?);
        }
        return Ok(());
    }

    match event {
        SupervisorEvent::Connected => println!("* connected"),
        SupervisorEvent::Disconnected(reason) => println!("* disconnected ({:?})", reason),
        SupervisorEvent::ConnectFailed(detail) => println!("* connect failed: {}", detail),
        SupervisorEvent::ReconnectScheduled { attempt, delay } => {
            println!("* reconnecting in {:.1}s (attempt {})", delay.as_secs_f64(), attempt)
        }
        SupervisorEvent::Stopped => println!("* stopped"),
        SupervisorEvent::Message(msg) => match msg {
            Message::Connected(c) => println!("* {}", c.message),
            Message::AiResponse(r) => {
                println!("AIRI: {}", r.content);
                if let Some(stats) = r.metadata.memory_stats {
                    println!(
                        "      [memory: {} short-term, {} long-term]",
                        stats.short_term, stats.long_term
                    );
                }
            }
            Message::Error(e) => println!("! {}", e.message),
            Message::Pong(_) => tracing::debug!("Keepalive pong received"),
            other => tracing::debug!("Ignoring {} from server", other.kind()),
        },
    }
    Ok(())
}

/// Show memory counts for a user
pub async fn handle_stats(user: String, config: &Config, format: OutputFormat) -> Result<()> {
    let (db, store) = open_store(config).await?;
    let user = find_user(&db, &user).await?;
    let ledger = MemoryLedger::new(store, config.memory.clone());

    let snapshot = ledger
        .snapshot(&user.id)
        .await
        .context("Failed to read memory stats")?;
    print_snapshot(&user.username, &snapshot, config, format)
}

/// Promote a memory to long-term
pub async fn handle_promote(memory_id: String, config: &Config, format: OutputFormat) -> Result<()> {
    let (_db, store) = open_store(config).await?;
    let ledger = MemoryLedger::new(store, config.memory.clone());

    let snapshot = ledger
        .promote(&memory_id)
        .await
        .with_context(|| format!("Failed to promote memory {}", memory_id))?;

    if let OutputFormat::Text = format {
        println!("✓ Memory {} is now long-term", memory_id);
        println!();
    }
    print_snapshot(&snapshot.user_id, &snapshot, config, format)
}

fn print_snapshot(
    label: &str,
    snapshot: &MemorySnapshot,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let stats = snapshot.stats();
    match format {
        OutputFormat::Text => {
            println!("Memory for {}:", label);
            println!(
                "  Short-term: {} (ceiling {})",
                stats.short_term, config.memory.short_term_ceiling
            );
            println!(
                "  Long-term:  {} (display ceiling {})",
                stats.long_term, config.memory.long_term_ceiling
            );
            println!("  Total:      {}", stats.total);
        }
        OutputFormat::Json => {
            let output = json!({
                "user_id": snapshot.user_id,
                "stats": stats,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

/// List a user's conversations
pub async fn handle_conversations(
    user: String,
    limit: usize,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let (db, store) = open_store(config).await?;
    let user = find_user(&db, &user).await?;

    let conversations = store
        .list_conversations(&user.id, limit as i64)
        .await
        .context("Failed to list conversations")?;

    match format {
        OutputFormat::Text => {
            if conversations.is_empty() {
                println!("No conversations for {}", user.username);
                return Ok(());
            }

            println!("Conversations for {}:", user.username);
            println!();

            for conversation in conversations {
                println!("{}  {}", conversation.id, conversation.title);
                println!("  Started:     {}", format_millis(conversation.created_at));
                println!("  Last active: {}", format_millis(conversation.updated_at));
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "user": user.username,
                "conversations": conversations,
                "count": conversations.len(),
                "limit": limit
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Show the messages of a conversation
pub async fn handle_history(
    conversation_id: String,
    limit: usize,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let (_db, store) = open_store(config).await?;

    let records = store
        .list_exchanges(&conversation_id, limit as i64)
        .await
        .context("Failed to fetch conversation history")?;

    match format {
        OutputFormat::Text => {
            if records.is_empty() {
                println!("No messages in conversation {}", conversation_id);
                return Ok(());
            }

            println!("Conversation {} ({} messages):", conversation_id, records.len());
            println!();

            for record in records {
                println!(
                    "[{}] {}: {}",
                    format_millis(record.created_at),
                    record.sender.as_str(),
                    record.content
                );
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "conversation_id": conversation_id,
                "messages": records,
                "count": records.len(),
                "limit": limit
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// List a user's memories
pub async fn handle_memories(args: MemoriesArgs, config: &Config, format: OutputFormat) -> Result<()> {
    let (db, store) = open_store(config).await?;
    let user = find_user(&db, &args.user).await?;

    let memory_type = if args.long_term {
        Some(MemoryType::LongTerm)
    } else if args.short_term {
        Some(MemoryType::ShortTerm)
    } else {
        None
    };

    // Long-term listings never exceed the display ceiling
    let limit = match memory_type {
        Some(MemoryType::LongTerm) => args.limit.min(config.memory.long_term_ceiling as usize),
        _ => args.limit,
    };

    let memories = store
        .list_memories(&user.id, memory_type, limit as i64)
        .await
        .context("Failed to list memories")?;

    match format {
        OutputFormat::Text => {
            if memories.is_empty() {
                println!("No memories for {}", user.username);
                return Ok(());
            }

            println!("Memories for {}:", user.username);
            println!();

            for memory in memories {
                println!("Memory ID: {}", memory.id);
                println!("  Type: {}", memory.memory_type.as_str());
                println!("  Importance: {:.2}", memory.importance_score);
                println!("  Content: {}", memory.content);
                println!("  Last accessed: {}", format_millis(memory.accessed_at));
                println!();
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "user": user.username,
                "memories": memories,
                "count": memories.len(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

async fn open_store(config: &Config) -> Result<(Arc<Database>, Arc<dyn PersistenceStore>)> {
    let db = Arc::new(
        Database::new(&config.db_path())
            .await
            .context("Failed to open database")?,
    );
    let store: Arc<dyn PersistenceStore> = Arc::new(SqliteStore::new(Arc::clone(&db)));
    Ok((db, store))
}

async fn find_user(db: &Database, username: &str) -> Result<User> {
    db.conversations()
        .find_user(username)
        .await?
        .with_context(|| format!("User '{}' not found", username))
}

fn format_millis(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}
