//! Reply selection
//!
//! Replies are canned templates that echo the user's text. The strategy is
//! injected so tests can pin the template.

use rand::Rng;
use sdk::errors::EngineError;

/// Number of built-in reply templates
pub const TEMPLATE_COUNT: usize = 4;

/// Render template `index` for `text`, or `None` if the index is out of range
pub fn render_template(index: usize, text: &str, character_name: &str) -> Option<String> {
    let reply = match index {
        0 => format!(
            "Hello! You said: \"{}\". I'm {} and I'm working perfectly with enhanced features!",
            text, character_name
        ),
        1 => format!(
            "I understand you're saying: \"{}\". My voice and memory systems are active!",
            text
        ),
        2 => format!(
            "Thanks for the message: \"{}\". I can remember our conversation and speak back to you!",
            text
        ),
        3 => format!(
            "You wrote: \"{}\". I'm ready to chat, remember everything, and use my voice!",
            text
        ),
        _ => return None,
    };
    Some(reply)
}

/// Produces the agent's reply to a user utterance
pub trait ReplyStrategy: Send + Sync {
    fn reply(&self, text: &str) -> Result<String, EngineError>;
}

/// Uniform choice among the built-in templates
#[derive(Debug, Clone)]
pub struct RandomTemplates {
    character_name: String,
}

impl RandomTemplates {
    pub fn new(character_name: impl Into<String>) -> Self {
        Self {
            character_name: character_name.into(),
        }
    }
}

impl ReplyStrategy for RandomTemplates {
    fn reply(&self, text: &str) -> Result<String, EngineError> {
        let index = rand::thread_rng().gen_range(0..TEMPLATE_COUNT);
        render_template(index, text, &self.character_name)
            .ok_or_else(|| EngineError::InvalidInput(format!("no reply template {}", index)))
    }
}

/// Always the same template
#[derive(Debug, Clone)]
pub struct FixedTemplate {
    index: usize,
    character_name: String,
}

impl FixedTemplate {
    pub fn new(index: usize, character_name: impl Into<String>) -> Self {
        Self {
            index,
            character_name: character_name.into(),
        }
    }
}

impl ReplyStrategy for FixedTemplate {
    fn reply(&self, text: &str) -> Result<String, EngineError> {
        render_template(self.index, text, &self.character_name)
            .ok_or_else(|| EngineError::InvalidInput(format!("no reply template {}", self.index)))
    }
}
