//! # Call Controller
//!
//! Interprets client envelopes for one authenticated user. The connection
//! actor owns the socket; this type owns the decisions, so the whole message
//! flow can be exercised without a WebSocket.
//!
//! ## Dispatch Rules:
//! - **start_call**: Load the character, create (or resume) the session
//! - **audio_chunk**: Append to the session buffer
//! - **voice_end**: Flush the buffer and start a turn in the background
//! - **stop_call**: Deactivate and deregister
//! - **ping**: Reply with `pong`
//! - Anything else is ignored

use super::messages::{AudioChunkData, ClientEnvelope, ServerEnvelope, StartCallData};
use crate::audio::processor::{bytes_from_values, duration_seconds};
use crate::audio::{AudioAccumulator, CallSession, SessionError, SessionRegistry};
use crate::config::AudioConfig;
use crate::pipeline::persona::PersonaCatalog;
use crate::pipeline::TurnOrchestrator;
use crate::services::{CharacterStore, StoreError};
use crate::state::{AppState, CallMetrics};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How a message changed the connection's current session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionChange {
    Unchanged,
    Started(String),
    Stopped,
}

/// Result of one client message: envelopes to send back right away, plus
/// the session bookkeeping the connection must do.
#[derive(Debug)]
pub struct Dispatch {
    pub replies: Vec<ServerEnvelope>,
    pub session: SessionChange,
}

impl Dispatch {
    fn reply(envelope: ServerEnvelope) -> Self {
        Self {
            replies: vec![envelope],
            session: SessionChange::Unchanged,
        }
    }

    fn silent() -> Self {
        Self {
            replies: Vec::new(),
            session: SessionChange::Unchanged,
        }
    }
}

#[derive(Clone)]
pub struct CallController {
    registry: Arc<SessionRegistry>,
    accumulator: AudioAccumulator,
    characters: Arc<dyn CharacterStore>,
    personas: Arc<PersonaCatalog>,
    orchestrator: Arc<TurnOrchestrator>,
    metrics: Arc<CallMetrics>,
    audio_format: AudioConfig,
}

impl CallController {
    pub fn new(
        registry: Arc<SessionRegistry>,
        characters: Arc<dyn CharacterStore>,
        personas: Arc<PersonaCatalog>,
        orchestrator: Arc<TurnOrchestrator>,
        metrics: Arc<CallMetrics>,
        audio_format: AudioConfig,
    ) -> Self {
        Self {
            accumulator: AudioAccumulator::new(Arc::clone(&registry)),
            registry,
            characters,
            personas,
            orchestrator,
            metrics,
            audio_format,
        }
    }

    pub fn from_state(state: &AppState) -> Self {
        let services = &state.services;
        Self {
            registry: Arc::clone(&services.registry),
            accumulator: services.accumulator.clone(),
            characters: Arc::clone(&services.characters),
            personas: Arc::clone(&services.personas),
            orchestrator: Arc::clone(&services.orchestrator),
            metrics: Arc::clone(&state.metrics),
            audio_format: state.config.audio.clone(),
        }
    }

    /// Handle one client envelope.
    ///
    /// ## Parameters:
    /// - `user_id`: Identity authenticated at upgrade time
    /// - `current`: Session this connection currently owns, if any
    /// - `envelope`: The parsed client message
    pub async fn dispatch(&self, user_id: i64, current: Option<&str>, envelope: ClientEnvelope) -> Dispatch {
        // Messages without a session id address the connection's current call
        let target = if envelope.session_id.is_empty() {
            current.unwrap_or_default().to_string()
        } else {
            envelope.session_id.clone()
        };

        match envelope.kind.as_str() {
            "start_call" => self.start_call(user_id, current, &envelope).await,
            "audio_chunk" => self.audio_chunk(user_id, &target, &envelope),
            "voice_end" => self.voice_end(user_id, &target),
            "stop_call" => self.stop_call(user_id, current, &target),
            "ping" => Dispatch::reply(ServerEnvelope::pong(&target)),
            other => {
                debug!(user_id, kind = other, "Ignoring unknown message type");
                Dispatch::silent()
            }
        }
    }

    /// Stop a session on behalf of its connection. Returns false if it was
    /// already gone.
    pub fn force_stop(&self, session_id: &str) -> bool {
        match self.registry.remove(session_id) {
            Some(session) => {
                self.metrics.call_stopped();
                info!(
                    session_id,
                    user_id = session.user_id,
                    character_id = session.character_id,
                    "Call stopped"
                );
                true
            }
            None => false,
        }
    }

    async fn start_call(&self, user_id: i64, current: Option<&str>, envelope: &ClientEnvelope) -> Dispatch {
        let data: StartCallData = match serde_json::from_value(envelope.data.clone()) {
            Ok(data) => data,
            Err(err) => {
                return Dispatch::reply(ServerEnvelope::error(
                    &envelope.session_id,
                    format!("Invalid start_call data: {}", err),
                ))
            }
        };
        if data.user_id.is_some_and(|claimed| claimed != user_id) {
            warn!(user_id, claimed = ?data.user_id, "start_call for a different user");
            return Dispatch::reply(ServerEnvelope::error(
                &envelope.session_id,
                "user_id does not match the authenticated user",
            ));
        }

        let session_id = if envelope.session_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            envelope.session_id.clone()
        };

        let character = match self.characters.load_character(data.character_id).await {
            Ok(character) => character,
            Err(StoreError::NotFound(_)) => {
                return Dispatch::reply(ServerEnvelope::error(
                    &session_id,
                    format!("Character {} not found", data.character_id),
                ))
            }
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "Character lookup failed");
                return Dispatch::reply(ServerEnvelope::error(&session_id, "Could not load character"));
            }
        };
        let persona = Arc::new(self.personas.resolve(&character));

        // One call per connection: starting another replaces the old one
        if let Some(previous) = current.filter(|previous| *previous != session_id) {
            self.force_stop(previous);
        }

        match self.registry.create(&session_id, user_id, character.id, persona) {
            Ok((session, resumed)) => {
                if resumed {
                    debug!(session_id = %session_id, "Duplicate start_call, resuming live session");
                } else {
                    self.metrics.call_started();
                    info!(
                        session_id = %session_id,
                        user_id,
                        character_id = character.id,
                        "Call started"
                    );
                }
                Dispatch {
                    replies: vec![ServerEnvelope::call_started(
                        &session_id,
                        session.character_id,
                        &session.persona.name,
                        resumed,
                    )],
                    session: SessionChange::Started(session_id),
                }
            }
            Err(err) => {
                warn!(session_id = %session_id, user_id, error = %err, "Could not start call");
                Dispatch::reply(ServerEnvelope::error(&session_id, err.to_string()))
            }
        }
    }

    fn audio_chunk(&self, user_id: i64, session_id: &str, envelope: &ClientEnvelope) -> Dispatch {
        if let Err(err) = self.owned_session(user_id, session_id) {
            return Dispatch::reply(ServerEnvelope::error(session_id, err.to_string()));
        }
        let chunk = match serde_json::from_value::<AudioChunkData>(envelope.data.clone())
            .map_err(|err| format!("Invalid audio_chunk data: {}", err))
            .and_then(|data| bytes_from_values(&data.audio_data))
        {
            Ok(chunk) => chunk,
            Err(message) => return Dispatch::reply(ServerEnvelope::error(session_id, message)),
        };

        match self.accumulator.append(session_id, &chunk) {
            Ok(_) => Dispatch::silent(),
            Err(err) => Dispatch::reply(ServerEnvelope::error(session_id, err.to_string())),
        }
    }

    fn voice_end(&self, user_id: i64, session_id: &str) -> Dispatch {
        let session = match self.owned_session(user_id, session_id) {
            Ok(session) => session,
            Err(err) => return Dispatch::reply(ServerEnvelope::error(session_id, err.to_string())),
        };

        match self.accumulator.flush_on_end_of_utterance(session_id) {
            Ok(Some(ticket)) => {
                info!(
                    session_id,
                    turn_id = ticket.turn_id,
                    bytes = ticket.audio.len(),
                    seconds = duration_seconds(ticket.audio.len(), &self.audio_format),
                    "End of utterance, starting turn"
                );
                self.orchestrator.spawn_turn(session, ticket);
                Dispatch::silent()
            }
            Ok(None) => {
                debug!(session_id, "voice_end with nothing buffered");
                Dispatch::silent()
            }
            Err(err @ SessionError::TurnInProgress(_)) => {
                self.metrics.turn_rejected();
                warn!(
                    session_id,
                    buffered = session.buffered_bytes(),
                    "voice_end while the previous turn is running, keeping audio for the next one"
                );
                Dispatch::reply(ServerEnvelope::error(session_id, err.to_string()))
            }
            Err(err) => Dispatch::reply(ServerEnvelope::error(session_id, err.to_string())),
        }
    }

    fn stop_call(&self, user_id: i64, current: Option<&str>, session_id: &str) -> Dispatch {
        let owned = self.owned_session(user_id, session_id).is_ok();
        if !owned || !self.force_stop(session_id) {
            return Dispatch::reply(ServerEnvelope::call_stopped(
                session_id,
                false,
                Some("No active call to stop"),
            ));
        }

        Dispatch {
            replies: vec![ServerEnvelope::call_stopped(session_id, true, None)],
            session: if current == Some(session_id) {
                SessionChange::Stopped
            } else {
                SessionChange::Unchanged
            },
        }
    }

    /// Active session that belongs to `user_id`.
    fn owned_session(&self, user_id: i64, session_id: &str) -> Result<Arc<CallSession>, SessionError> {
        if session_id.is_empty() {
            return Err(SessionError::NotFound(String::from("(none)")));
        }
        let session = self.registry.get_active(session_id)?;
        if session.user_id != user_id {
            return Err(SessionError::OwnedByAnotherUser(session_id.to_string()));
        }
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::messages::ServerEventKind;
    use crate::pipeline::testing::{
        harness, FixedSynthesizer, Harness, ScriptedGenerator, ScriptedTranscriber, TEST_USER,
    };
    use crate::pipeline::TurnEvent;
    use crate::services::store::InMemoryCharacterStore;
    use serde_json::json;
    use tokio::sync::Notify;

    fn controller(h: &Harness, max_sessions: usize) -> CallController {
        CallController::new(
            Arc::new(SessionRegistry::new(max_sessions)),
            Arc::new(InMemoryCharacterStore::with_builtin_characters()),
            Arc::new(PersonaCatalog::builtin()),
            Arc::clone(&h.orchestrator),
            Arc::clone(&h.metrics),
            AudioConfig {
                sample_rate: 16_000,
                channels: 1,
                bit_depth: 16,
            },
        )
    }

    fn envelope(kind: &str, session_id: &str, data: serde_json::Value) -> ClientEnvelope {
        ClientEnvelope {
            kind: kind.to_string(),
            session_id: session_id.to_string(),
            data,
        }
    }

    fn chunk(session_id: &str, len: usize) -> ClientEnvelope {
        envelope("audio_chunk", session_id, json!({ "audio_data": vec![1; len] }))
    }

    async fn start(c: &CallController, session_id: &str, character_id: i64) -> Dispatch {
        c.dispatch(
            TEST_USER,
            None,
            envelope(
                "start_call",
                session_id,
                json!({"user_id": TEST_USER, "character_id": character_id}),
            ),
        )
        .await
    }

    #[tokio::test]
    async fn test_start_stream_and_end_utterance() {
        let h = harness(
            ScriptedTranscriber::text("How far is the moon?"),
            ScriptedGenerator::reply("Farther than any wine cup can reach."),
            FixedSynthesizer::audio(vec![5, 5]),
        );
        let c = controller(&h, 10);

        let started = start(&c, "call-A", 3).await;
        assert_eq!(started.session, SessionChange::Started("call-A".into()));
        assert_eq!(started.replies[0].kind, ServerEventKind::CallStarted);
        assert_eq!(started.replies[0].data["character_name"], "Li Bai");
        assert_eq!(started.replies[0].data["resumed"], false);

        // Duplicate start_call resumes instead of creating a second session
        let again = start(&c, "call-A", 3).await;
        assert_eq!(again.replies[0].data["resumed"], true);
        assert_eq!(c.registry.active_count(), 1);

        for _ in 0..4 {
            let out = c.dispatch(TEST_USER, Some("call-A"), chunk("call-A", 1000)).await;
            assert!(out.replies.is_empty());
        }
        let session = c.registry.get("call-A").unwrap();
        assert_eq!(session.buffered_bytes(), 4000);

        let out = c.dispatch(TEST_USER, Some("call-A"), envelope("voice_end", "", json!(null))).await;
        assert!(out.replies.is_empty());
        assert_eq!(session.buffered_bytes(), 0);

        let events = h.sink.wait_for(1).await;
        assert!(matches!(
            &events[0],
            TurnEvent::Reply { user_text, fallback: false, .. } if user_text == "How far is the moon?"
        ));
        assert_eq!(h.metrics.snapshot().turns_started, 1);
        assert!(!session.turn_in_flight());
    }

    #[tokio::test]
    async fn test_silence_gets_the_characters_noise_reply() {
        let h = harness(
            ScriptedTranscriber::text(""),
            ScriptedGenerator::reply("unused"),
            FixedSynthesizer::audio(vec![1]),
        );
        let c = controller(&h, 10);
        start(&c, "call-B", 2).await;

        c.dispatch(TEST_USER, Some("call-B"), chunk("call-B", 320)).await;
        c.dispatch(TEST_USER, Some("call-B"), envelope("voice_end", "call-B", json!({}))).await;

        let events = h.sink.wait_for(1).await;
        let noise = c.registry.get("call-B").unwrap().persona.noise_reply.clone();
        assert_eq!(
            events[0],
            TurnEvent::Reply {
                session_id: "call-B".into(),
                user_text: String::new(),
                ai_text: noise,
                audio: vec![1],
                fallback: true,
            }
        );
    }

    #[tokio::test]
    async fn test_second_voice_end_is_rejected_while_turn_runs() {
        let gate = Arc::new(Notify::new());
        let h = harness(
            ScriptedTranscriber::gated(gate.clone(), "Tell me about Hogwarts"),
            ScriptedGenerator::reply("It's the finest school of witchcraft and wizardry."),
            FixedSynthesizer::audio(vec![3]),
        );
        let c = controller(&h, 10);
        start(&c, "call-C", 4).await;
        let session = c.registry.get("call-C").unwrap();

        c.dispatch(TEST_USER, Some("call-C"), chunk("call-C", 100)).await;
        c.dispatch(TEST_USER, Some("call-C"), envelope("voice_end", "", json!(null))).await;
        assert!(session.turn_in_flight());

        // Audio for the next utterance keeps arriving during the turn
        c.dispatch(TEST_USER, Some("call-C"), chunk("call-C", 50)).await;
        let rejected = c.dispatch(TEST_USER, Some("call-C"), envelope("voice_end", "", json!(null))).await;
        assert_eq!(rejected.replies[0].kind, ServerEventKind::Error);
        assert_eq!(session.buffered_bytes(), 50);
        assert_eq!(h.metrics.snapshot().turns_rejected, 1);

        gate.notify_one();
        assert_eq!(h.sink.wait_for(1).await.len(), 1);
        assert!(!session.turn_in_flight());

        // The held-back audio becomes the next turn
        gate.notify_one();
        c.dispatch(TEST_USER, Some("call-C"), envelope("voice_end", "", json!(null))).await;
        assert_eq!(h.sink.wait_for(2).await.len(), 2);
        assert_eq!(h.metrics.snapshot().turns_started, 2);
    }

    #[tokio::test]
    async fn test_stop_without_session_reports_failure() {
        let h = harness(
            ScriptedTranscriber::text("unused"),
            ScriptedGenerator::reply("unused"),
            FixedSynthesizer::audio(vec![1]),
        );
        let c = controller(&h, 10);

        let out = c.dispatch(TEST_USER, None, envelope("stop_call", "", json!(null))).await;
        assert_eq!(out.replies[0].kind, ServerEventKind::CallStopped);
        assert_eq!(out.replies[0].data["success"], false);
        assert_eq!(out.session, SessionChange::Unchanged);

        start(&c, "call-D", 1).await;
        let out = c.dispatch(TEST_USER, Some("call-D"), envelope("stop_call", "", json!(null))).await;
        assert_eq!(out.replies[0].data["success"], true);
        assert_eq!(out.session, SessionChange::Stopped);
        assert!(c.registry.get("call-D").is_none());
        assert!(!c.force_stop("call-D"));
    }

    #[tokio::test]
    async fn test_rejections_become_error_events() {
        let h = harness(
            ScriptedTranscriber::text("unused"),
            ScriptedGenerator::reply("unused"),
            FixedSynthesizer::audio(vec![1]),
        );
        let c = controller(&h, 1);

        let unknown = start(&c, "call-E", 99).await;
        assert_eq!(unknown.replies[0].kind, ServerEventKind::Error);
        assert_eq!(unknown.session, SessionChange::Unchanged);

        let no_session = c.dispatch(TEST_USER, None, chunk("missing", 10)).await;
        assert_eq!(no_session.replies[0].kind, ServerEventKind::Error);

        start(&c, "call-E", 1).await;
        let bad_values = c
            .dispatch(
                TEST_USER,
                Some("call-E"),
                envelope("audio_chunk", "call-E", json!({"audio_data": [1, 300]})),
            )
            .await;
        assert_eq!(bad_values.replies[0].kind, ServerEventKind::Error);

        let other_user = c.dispatch(TEST_USER + 1, None, chunk("call-E", 10)).await;
        assert_eq!(other_user.replies[0].kind, ServerEventKind::Error);

        // Capacity of one is already taken by call-E
        let full = c
            .dispatch(
                TEST_USER + 1,
                None,
                envelope("start_call", "call-F", json!({"character_id": 1})),
            )
            .await;
        assert_eq!(full.replies[0].kind, ServerEventKind::Error);

        let ignored = c.dispatch(TEST_USER, Some("call-E"), envelope("subscribe", "", json!({}))).await;
        assert!(ignored.replies.is_empty());

        let pong = c.dispatch(TEST_USER, Some("call-E"), envelope("ping", "", json!(null))).await;
        assert_eq!(pong.replies[0].kind, ServerEventKind::Pong);
        assert_eq!(pong.replies[0].session_id, "call-E");
    }

    #[tokio::test]
    async fn test_new_call_on_same_connection_stops_the_old_one() {
        let h = harness(
            ScriptedTranscriber::text("unused"),
            ScriptedGenerator::reply("unused"),
            FixedSynthesizer::audio(vec![1]),
        );
        let c = controller(&h, 10);
        start(&c, "first", 1).await;

        let out = c
            .dispatch(
                TEST_USER,
                Some("first"),
                envelope("start_call", "second", json!({"character_id": 2})),
            )
            .await;

        assert_eq!(out.session, SessionChange::Started("second".into()));
        assert!(c.registry.get("first").is_none());
        assert_eq!(h.metrics.snapshot().calls_stopped, 1);
    }
}
