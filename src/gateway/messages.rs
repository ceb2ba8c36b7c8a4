//! Realtime connection envelopes.
//!
//! ## Message Format:
//! Every text frame carries one JSON envelope: `{"type", "session_id", "data"}`.
//! - **Client → Server**: `start_call`, `audio_chunk`, `voice_end`, `stop_call`, `ping`
//! - **Server → Client**: `call_started`, `ai_response`, `call_stopped`, `pong`, `error`

use crate::pipeline::TurnEvent;
use actix::prelude::*;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Envelope as received from the client. `kind` is kept as a string so
/// unknown message types can be ignored instead of failing to parse.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerEventKind {
    CallStarted,
    AiResponse,
    CallStopped,
    Pong,
    Error,
}

/// Envelope sent to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerEnvelope {
    #[serde(rename = "type")]
    pub kind: ServerEventKind,
    pub session_id: String,
    pub data: Value,
}

impl ServerEnvelope {
    pub fn call_started(session_id: &str, character_id: i64, character_name: &str, resumed: bool) -> Self {
        Self {
            kind: ServerEventKind::CallStarted,
            session_id: session_id.to_string(),
            data: json!({
                "session_id": session_id,
                "character_id": character_id,
                "character_name": character_name,
                "resumed": resumed,
            }),
        }
    }

    pub fn call_stopped(session_id: &str, success: bool, message: Option<&str>) -> Self {
        let mut data = json!({ "success": success });
        if let Some(message) = message {
            data["message"] = json!(message);
        }
        Self {
            kind: ServerEventKind::CallStopped,
            session_id: session_id.to_string(),
            data,
        }
    }

    pub fn pong(session_id: &str) -> Self {
        Self {
            kind: ServerEventKind::Pong,
            session_id: session_id.to_string(),
            data: json!({ "timestamp": Utc::now().timestamp_millis() }),
        }
    }

    pub fn error(session_id: &str, message: impl Into<String>) -> Self {
        Self {
            kind: ServerEventKind::Error,
            session_id: session_id.to_string(),
            data: json!({ "error": message.into() }),
        }
    }

    /// Wire form of a finished turn.
    pub fn from_turn(event: TurnEvent) -> Self {
        match event {
            TurnEvent::Reply {
                session_id,
                user_text,
                ai_text,
                audio,
                fallback,
            } => Self {
                kind: ServerEventKind::AiResponse,
                data: json!({
                    "user_text": user_text,
                    "ai_text": ai_text,
                    "audio_data": STANDARD.encode(&audio),
                    "is_complete": true,
                    "fallback": fallback,
                }),
                session_id,
            },
            TurnEvent::Failed {
                session_id,
                message,
                ai_text,
            } => {
                let mut envelope = Self::error(&session_id, message);
                if let Some(text) = ai_text {
                    envelope.data["ai_text"] = json!(text);
                }
                envelope
            }
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Actor message: push an envelope to the connection.
#[derive(Message)]
#[rtype(result = "()")]
pub struct ServerEvent(pub ServerEnvelope);

#[derive(Debug, Deserialize)]
pub struct StartCallData {
    /// Must match the authenticated user when present
    #[serde(default)]
    pub user_id: Option<i64>,
    pub character_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct AudioChunkData {
    pub audio_data: Vec<i64>,
}
