//! Conversation Exchange
//!
//! Turns one inbound client message into at most one outbound reply.
//!
//! For `input:text` the exchange runs seven steps:
//!
//! 1. persist the user's message
//! 2. record a short-term memory of it
//! 3. choose a reply through the [`ReplyStrategy`]
//! 4. persist the reply
//! 5. record a short-term memory of the reply
//! 6. read the user's memory snapshot
//! 7. emit `ai_response`
//!
//! Persistence and ledger failures are logged into the [`ExchangeReport`]
//! and never stop the remaining steps. Only a failed reply (step 3) changes
//! the outcome: the client gets `error` instead of `ai_response`.

use sdk::errors::EngineError;
use sdk::protocol::{AiResponse, Authenticated, Message, MemoryStats, ResponseMetadata};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::ResponderConfig;
use crate::memory::{MemoryLedger, MemorySnapshot};
use crate::store::{CharacterState, PersistenceStore, Sender};

pub mod reply;

pub use reply::{FixedTemplate, RandomTemplates, ReplyStrategy};

/// Error text sent when no reply could be produced
pub const REPLY_FAILURE: &str = "Failed to generate AI response";

/// Fixed acknowledgement for voice input
pub const VOICE_ACK: &str = "I heard your voice message! Voice processing is working.";

const CONVERSATION_TITLE: &str = "AIRI Chat";

/// Who a connection talks as, and where its messages go
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub conversation_id: String,
}

/// Outcome of one exchange step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "detail")]
pub enum StepOutcome {
    Done,
    Failed(String),
    Skipped,
}

impl StepOutcome {
    fn from_result<T>(step: &str, result: &Result<T, EngineError>) -> Self {
        match result {
            Ok(_) => StepOutcome::Done,
            Err(e) => {
                warn!("Exchange step '{}' failed: {}", step, e);
                StepOutcome::Failed(e.to_string())
            }
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, StepOutcome::Done)
    }
}

/// Per-step outcomes of one text exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExchangeReport {
    pub save_input: StepOutcome,
    pub remember_input: StepOutcome,
    pub choose_reply: StepOutcome,
    pub save_reply: StepOutcome,
    pub remember_reply: StepOutcome,
    pub read_snapshot: StepOutcome,
}

impl Default for ExchangeReport {
    fn default() -> Self {
        Self {
            save_input: StepOutcome::Skipped,
            remember_input: StepOutcome::Skipped,
            choose_reply: StepOutcome::Skipped,
            save_reply: StepOutcome::Skipped,
            remember_reply: StepOutcome::Skipped,
            read_snapshot: StepOutcome::Skipped,
        }
    }
}

impl ExchangeReport {
    /// True when every step completed
    pub fn is_clean(&self) -> bool {
        self.steps().iter().all(|(_, outcome)| outcome.is_done())
    }

    pub fn steps(&self) -> [(&'static str, &StepOutcome); 6] {
        [
            ("save_input", &self.save_input),
            ("remember_input", &self.remember_input),
            ("choose_reply", &self.choose_reply),
            ("save_reply", &self.save_reply),
            ("remember_reply", &self.remember_reply),
            ("read_snapshot", &self.read_snapshot),
        ]
    }
}

/// Server-side handler for client messages
pub struct ConversationExchange {
    store: Arc<dyn PersistenceStore>,
    ledger: Arc<MemoryLedger>,
    replies: Arc<dyn ReplyStrategy>,
    responder: ResponderConfig,
}

impl ConversationExchange {
    pub fn new(
        store: Arc<dyn PersistenceStore>,
        ledger: Arc<MemoryLedger>,
        replies: Arc<dyn ReplyStrategy>,
        responder: ResponderConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            replies,
            responder,
        }
    }

    /// Resolve `username`, open a fresh conversation and seed the
    /// character state on first contact.
    pub async fn open_session(&self, username: &str) -> Result<Session, EngineError> {
        let user = self.store.ensure_user(username).await?;
        let conversation = self
            .store
            .create_conversation(&user.id, CONVERSATION_TITLE)
            .await?;

        if self.store.get_character_state(&user.id).await?.is_none() {
            let state = CharacterState::new(&user.id, &self.responder.character_name);
            self.store.save_character_state(&state).await?;
            debug!("Seeded character state for {}", username);
        }

        info!(
            "Session opened for {} (conversation {})",
            username, conversation.id
        );
        Ok(Session {
            user_id: user.id,
            conversation_id: conversation.id,
        })
    }

    /// Handle one inbound message. Returns the reply to send, if any.
    pub async fn handle(&self, session: &Session, msg: Message) -> Option<Message> {
        match msg {
            Message::Ping(_) => Some(Message::pong_now()),
            Message::InputText(input) => Some(self.handle_text(session, &input.text).await.0),
            Message::InputVoice(_) => Some(self.handle_voice()),
            Message::Authenticate(_) => Some(Message::Authenticated(Authenticated {
                authenticated: true,
            })),
            other => {
                debug!("Ignoring server-bound message '{}' from client", other.kind());
                None
            }
        }
    }

    /// Run the full text exchange
    pub async fn handle_text(&self, session: &Session, text: &str) -> (Message, ExchangeReport) {
        info!("Text input: {}", text);
        let mut report = ExchangeReport::default();
        let mut latest: Option<MemorySnapshot> = None;

        let saved = self
            .store
            .save_exchange(
                &session.conversation_id,
                Sender::User,
                text,
                "text",
                serde_json::json!({}),
            )
            .await;
        report.save_input = StepOutcome::from_result("save_input", &saved);

        let remembered = self
            .ledger
            .record_utterance(
                &session.user_id,
                Some(&session.conversation_id),
                Sender::User,
                text,
            )
            .await;
        report.remember_input = StepOutcome::from_result("remember_input", &remembered);
        if let Ok(snapshot) = remembered {
            latest = Some(snapshot);
        }

        let reply = self.replies.reply(text);
        report.choose_reply = StepOutcome::from_result("choose_reply", &reply);
        let reply = match reply {
            Ok(reply) => reply,
            Err(_) => return (Message::error(REPLY_FAILURE), report),
        };

        let saved = self
            .store
            .save_exchange(
                &session.conversation_id,
                Sender::Airi,
                &reply,
                "text",
                serde_json::json!({
                    "provider": self.responder.provider,
                    "model": self.responder.model,
                }),
            )
            .await;
        report.save_reply = StepOutcome::from_result("save_reply", &saved);

        let remembered = self
            .ledger
            .record_utterance(
                &session.user_id,
                Some(&session.conversation_id),
                Sender::Airi,
                &reply,
            )
            .await;
        report.remember_reply = StepOutcome::from_result("remember_reply", &remembered);
        if let Ok(snapshot) = remembered {
            latest = Some(snapshot);
        }

        let snapshot = self.ledger.snapshot(&session.user_id).await;
        report.read_snapshot = StepOutcome::from_result("read_snapshot", &snapshot);
        if let Ok(snapshot) = snapshot {
            latest = Some(snapshot);
        }

        let memory_stats: Option<MemoryStats> = latest.as_ref().map(MemorySnapshot::stats);

        let response = Message::AiResponse(AiResponse {
            content: reply,
            timestamp: sdk::protocol::now_millis(),
            metadata: ResponseMetadata {
                provider: self.responder.provider.clone(),
                model: Some(self.responder.model.clone()),
                transcription: None,
                memory_stats,
            },
        });

        if !report.is_clean() {
            warn!("Exchange completed with failed steps: {:?}", report);
        }
        (response, report)
    }

    /// Fixed acknowledgement; voice payloads are not persisted
    pub fn handle_voice(&self) -> Message {
        info!("Voice input received");
        Message::AiResponse(AiResponse {
            content: VOICE_ACK.to_string(),
            timestamp: sdk::protocol::now_millis(),
            metadata: ResponseMetadata {
                provider: "voice".to_string(),
                model: None,
                transcription: Some(true),
                memory_stats: None,
            },
        })
    }
}
