//! # External Collaborators
//!
//! The turn pipeline talks to the outside world only through the traits in
//! this module, so every stage can be swapped for a scripted double in tests.
//!
//! ## Key Components:
//! - **Transcriber**: Audio bytes to text (see `transcription::client`)
//! - **Generator**: Chat messages to a reply (`llm`)
//! - **Synthesizer**: Reply text to audio (`tts`)
//! - **CharacterStore / ConversationStore**: Read personas, read and write turns (`store`)
//!
//! ## Key Rust Concepts:
//! - **async-trait**: Async methods on object-safe traits, held as `Arc<dyn Trait>`
//! - **Send + Sync bounds**: Implementations are shared across tokio tasks

pub mod llm; // OpenAI-compatible chat completions client
pub mod retry; // Per-call timeout and bounded retry
pub mod store; // In-memory character and conversation stores
pub mod tts; // Text-to-speech client

use crate::models::{Character, ChatMessage, ConversationTurn, VoiceProfile};
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// Failure of an upstream backend call.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendError {
    /// No credentials or endpoint configured for this backend
    NotConfigured(&'static str),
    Timeout { service: &'static str, after: Duration },
    /// Connection refused, reset, TLS failure, ...
    Transport(String),
    /// Non-2xx HTTP status
    Status { status: u16, body: String },
    /// Backend answered with something we could not interpret
    Protocol(String),
}

impl BackendError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            BackendError::NotConfigured(_) => false,
            BackendError::Timeout { .. } | BackendError::Transport(_) => true,
            BackendError::Status { status, .. } => *status == 429 || *status >= 500,
            BackendError::Protocol(_) => true,
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::NotConfigured(service) => write!(f, "{} backend is not configured", service),
            BackendError::Timeout { service, after } => {
                write!(f, "{} backend timed out after {:?}", service, after)
            }
            BackendError::Transport(msg) => write!(f, "transport error: {}", msg),
            BackendError::Status { status, body } => write!(f, "HTTP {}: {}", status, body),
            BackendError::Protocol(msg) => write!(f, "unexpected backend response: {}", msg),
        }
    }
}

impl std::error::Error for BackendError {}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            BackendError::Protocol(err.to_string())
        } else {
            BackendError::Transport(err.to_string())
        }
    }
}

/// Failure of a character or conversation store.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    NotFound(String),
    Unavailable(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound(what) => write!(f, "{} not found", what),
            StoreError::Unavailable(msg) => write!(f, "store unavailable: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

/// Which call site a generation request comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationMode {
    /// Realtime call: short, spoken-register replies
    Voice,
    /// Text chat: normal length replies
    Chat,
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Returns `Ok("")` when no speech was recognised.
    async fn transcribe(&self, audio: &[u8]) -> Result<String, BackendError>;
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        mode: GenerationMode,
    ) -> Result<String, BackendError>;
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &VoiceProfile) -> Result<Vec<u8>, BackendError>;
}

#[async_trait]
pub trait CharacterStore: Send + Sync {
    async fn load_character(&self, character_id: i64) -> Result<Character, StoreError>;
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Most recent turns first.
    async fn load_history(
        &self,
        user_id: i64,
        character_id: i64,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, StoreError>;

    async fn save_turn(&self, turn: ConversationTurn) -> Result<(), StoreError>;
}
