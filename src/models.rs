//! Shared data records passed between the gateway, the turn pipeline and
//! the external stores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A character as stored by the character store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Character {
    pub id: i64,
    pub name: String,
    /// Persona description injected into the system prompt
    pub persona_prompt: String,
}

/// Voice selection for speech synthesis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VoiceProfile {
    pub voice_type: String,
    pub speed_ratio: f32,
}

/// Author of one chat message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message of a generation request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// One completed user-utterance-to-reply cycle, as persisted.
///
/// Created once per delivered turn and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationTurn {
    pub id: Uuid,
    pub session_id: String,
    pub user_id: i64,
    pub character_id: i64,
    /// Empty for fallback turns where nothing intelligible was heard
    pub user_text: String,
    pub ai_text: String,
    /// Location of the archived reply audio; `None` until something archives it
    pub audio_ref: Option<String>,
    pub message_type: String,
    pub created_at: DateTime<Utc>,
}

impl ConversationTurn {
    pub const VOICE: &'static str = "voice";

    pub fn voice(
        session_id: &str,
        user_id: i64,
        character_id: i64,
        user_text: impl Into<String>,
        ai_text: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.to_string(),
            user_id,
            character_id,
            user_text: user_text.into(),
            ai_text: ai_text.into(),
            audio_ref: None,
            message_type: Self::VOICE.to_string(),
            created_at: Utc::now(),
        }
    }
}
