//! # Turn Orchestrator
//!
//! Runs one utterance through recognition, generation, synthesis and
//! persistence, then hands the result to the delivery sink.
//!
//! ## Turn States:
//! ```text
//! Transcribing ─ok─> ComposingPrompt ─> Generating ─> Synthesizing ─> Persisting ─> Delivered
//!      │                                                  ▲
//!      └─error / too short─> FallbackResponse ────────────┘
//! ```
//!
//! ## Failure Policy:
//! - **Recognition**: never fatal, the character's noise reply is spoken instead
//! - **Generation**: fatal, an error event is sent and nothing is stored
//! - **Synthesis**: fatal, the error event carries the generated text
//! - **Persistence**: logged only, the reply is still delivered
//!
//! Whatever happens, the session's turn slot is released when the run ends.
//! A run that outlives `turn_timeout` is aborted by its watchdog, which
//! reports the failure in its place.

use super::delivery::{DeliverySink, TurnEvent};
use super::prompt;
use crate::audio::{CallSession, TurnTicket};
use crate::config::AppConfig;
use crate::models::ConversationTurn;
use crate::services::{BackendError, ConversationStore, GenerationMode, Generator, Synthesizer, Transcriber};
use crate::state::CallMetrics;
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Tunables for one turn, taken from the `call` and `llm` config sections.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub history_turns: usize,
    pub min_transcript_chars: usize,
    pub temperature: f32,
    pub turn_timeout: Duration,
}

impl From<&AppConfig> for PipelineSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            history_turns: config.call.history_turns,
            min_transcript_chars: config.call.min_transcript_chars,
            temperature: config.llm.temperature,
            turn_timeout: config.call.turn_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStage {
    Transcribing,
    ComposingPrompt,
    Generating,
    FallbackResponse,
    Synthesizing,
    Persisting,
    Delivered,
}

impl fmt::Display for TurnStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TurnStage::Transcribing => "transcribing",
            TurnStage::ComposingPrompt => "composing_prompt",
            TurnStage::Generating => "generating",
            TurnStage::FallbackResponse => "fallback_response",
            TurnStage::Synthesizing => "synthesizing",
            TurnStage::Persisting => "persisting",
            TurnStage::Delivered => "delivered",
        };
        f.write_str(name)
    }
}

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Delivered { fallback: bool },
    Failed { stage: TurnStage },
    /// The watchdog released the slot first; nothing was sent
    Expired,
}

/// Reply ready to be sent to the caller.
struct Reply {
    user_text: String,
    ai_text: String,
    audio: Vec<u8>,
    fallback: bool,
}

/// Turn-fatal failure. `message` goes to the caller, `cause` to the log.
struct TurnFailure {
    stage: TurnStage,
    message: &'static str,
    cause: String,
    ai_text: Option<String>,
}

impl TurnFailure {
    fn generation(cause: impl Into<String>) -> Self {
        Self {
            stage: TurnStage::Generating,
            message: "Failed to generate a reply, please try again",
            cause: cause.into(),
            ai_text: None,
        }
    }

    fn synthesis(err: BackendError, ai_text: String) -> Self {
        Self {
            stage: TurnStage::Synthesizing,
            message: "Reply text was generated but speech synthesis failed",
            cause: err.to_string(),
            ai_text: Some(ai_text),
        }
    }
}

pub struct TurnOrchestrator {
    transcriber: Arc<dyn Transcriber>,
    generator: Arc<dyn Generator>,
    synthesizer: Arc<dyn Synthesizer>,
    conversations: Arc<dyn ConversationStore>,
    sink: Arc<dyn DeliverySink>,
    metrics: Arc<CallMetrics>,
    settings: PipelineSettings,
}

impl TurnOrchestrator {
    pub fn new(
        transcriber: Arc<dyn Transcriber>,
        generator: Arc<dyn Generator>,
        synthesizer: Arc<dyn Synthesizer>,
        conversations: Arc<dyn ConversationStore>,
        sink: Arc<dyn DeliverySink>,
        metrics: Arc<CallMetrics>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            transcriber,
            generator,
            synthesizer,
            conversations,
            sink,
            metrics,
            settings,
        }
    }

    /// Start a turn in the background and return immediately.
    ///
    /// Also arms the session's watchdog. If the run has not finished after
    /// `turn_timeout` the watchdog aborts it, frees the turn slot and sends
    /// the caller an error event.
    pub fn spawn_turn(self: &Arc<Self>, session: Arc<CallSession>, ticket: TurnTicket) {
        self.metrics.turn_started();
        let turn_id = ticket.turn_id;

        let run = {
            let orchestrator = Arc::clone(self);
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                orchestrator.run_turn(&session, ticket).await;
            })
        };

        let watchdog = {
            let orchestrator = Arc::clone(self);
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                tokio::time::sleep(orchestrator.settings.turn_timeout).await;
                orchestrator.expire(&session, turn_id);
            })
        };
        session.arm_turn(turn_id, run, watchdog);
    }

    fn expire(&self, session: &CallSession, turn_id: u64) {
        if !session.expire_turn(turn_id) {
            return;
        }
        warn!(
            session_id = %session.session_id,
            turn_id,
            timeout_secs = self.settings.turn_timeout.as_secs(),
            "Turn did not finish in time, aborted"
        );
        self.sink.deliver(TurnEvent::Failed {
            session_id: session.session_id.clone(),
            message: "Reply took too long, please try again".to_string(),
            ai_text: None,
        });
        self.metrics.turn_failed();
    }

    /// Run one turn to completion and deliver its result.
    pub async fn run_turn(&self, session: &CallSession, ticket: TurnTicket) -> TurnOutcome {
        let started = Instant::now();
        let turn_id = ticket.turn_id;
        debug!(
            session_id = %session.session_id,
            turn_id,
            bytes = ticket.audio.len(),
            "Starting turn"
        );

        let (event, outcome) = match self.respond(session, &ticket.audio).await {
            Ok(reply) => {
                let fallback = reply.fallback;
                let event = TurnEvent::Reply {
                    session_id: session.session_id.clone(),
                    user_text: reply.user_text,
                    ai_text: reply.ai_text,
                    audio: reply.audio,
                    fallback,
                };
                (event, TurnOutcome::Delivered { fallback })
            }
            Err(failure) => {
                error!(
                    session_id = %session.session_id,
                    turn_id,
                    stage = %failure.stage,
                    error = %failure.cause,
                    "Turn failed"
                );
                let event = TurnEvent::Failed {
                    session_id: session.session_id.clone(),
                    message: failure.message.to_string(),
                    ai_text: failure.ai_text,
                };
                (event, TurnOutcome::Failed { stage: failure.stage })
            }
        };

        if !session.complete_turn(turn_id) {
            debug!(session_id = %session.session_id, turn_id, "Turn already expired, dropping result");
            return TurnOutcome::Expired;
        }
        self.sink.deliver(event);

        match outcome {
            TurnOutcome::Delivered { fallback } => {
                self.metrics.turn_delivered(fallback);
                info!(
                    session_id = %session.session_id,
                    turn_id,
                    stage = %TurnStage::Delivered,
                    fallback,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Turn delivered"
                );
            }
            TurnOutcome::Failed { .. } => self.metrics.turn_failed(),
            TurnOutcome::Expired => {}
        }
        outcome
    }

    async fn respond(&self, session: &CallSession, audio: &[u8]) -> Result<Reply, TurnFailure> {
        let (user_text, ai_text, fallback) = match self.transcribe(session, audio).await {
            Some(heard) => {
                let reply = self.generate_reply(session, &heard).await?;
                (heard, reply, false)
            }
            None => {
                debug!(session_id = %session.session_id, stage = %TurnStage::FallbackResponse, "Using noise reply");
                (String::new(), session.persona.noise_reply.clone(), true)
            }
        };

        let audio = match self.synthesizer.synthesize(&ai_text, &session.persona.voice).await {
            Ok(audio) => audio,
            Err(err) => return Err(TurnFailure::synthesis(err, ai_text)),
        };

        let turn = ConversationTurn::voice(
            &session.session_id,
            session.user_id,
            session.character_id,
            user_text.clone(),
            ai_text.clone(),
        );
        if let Err(err) = self.conversations.save_turn(turn).await {
            warn!(
                session_id = %session.session_id,
                stage = %TurnStage::Persisting,
                error = %err,
                "Failed to save conversation turn, delivering anyway"
            );
        }

        Ok(Reply {
            user_text,
            ai_text,
            audio,
            fallback,
        })
    }

    /// `None` means "answer with the noise reply".
    async fn transcribe(&self, session: &CallSession, audio: &[u8]) -> Option<String> {
        match self.transcriber.transcribe(audio).await {
            Ok(text) => {
                let text = text.trim();
                if text.chars().count() < self.settings.min_transcript_chars {
                    debug!(
                        session_id = %session.session_id,
                        transcript = text,
                        "Transcript too short, treating as noise"
                    );
                    return None;
                }
                session.record_transcript(text);
                info!(session_id = %session.session_id, transcript = text, "Heard user");
                Some(text.to_string())
            }
            Err(err) => {
                warn!(
                    session_id = %session.session_id,
                    stage = %TurnStage::Transcribing,
                    error = %err,
                    "Transcription failed, falling back to noise reply"
                );
                None
            }
        }
    }

    async fn generate_reply(&self, session: &CallSession, user_text: &str) -> Result<String, TurnFailure> {
        let window = self.settings.history_turns;
        let history = match self
            .conversations
            .load_history(session.user_id, session.character_id, window)
            .await
        {
            Ok(history) => history,
            Err(err) => {
                warn!(
                    session_id = %session.session_id,
                    stage = %TurnStage::ComposingPrompt,
                    error = %err,
                    "Could not load history, continuing without it"
                );
                Vec::new()
            }
        };

        let messages = prompt::compose(&session.persona, &history, window, user_text, Utc::now());
        let raw = self
            .generator
            .generate(&messages, self.settings.temperature, GenerationMode::Voice)
            .await
            .map_err(|err| TurnFailure::generation(err.to_string()))?;

        let reply = prompt::clean_reply(&raw);
        if reply.is_empty() {
            return Err(TurnFailure::generation("reply was empty after clean-up"));
        }
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::{
        harness, test_session, FailingConversationStore, FixedSynthesizer, RecordingSink, ScriptedGenerator,
        ScriptedTranscriber,
    };
    use crate::services::ConversationStore;

    fn ticket(session: &CallSession) -> TurnTicket {
        session.append_audio(&[0u8; 640]).unwrap();
        session.begin_turn().unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_successful_turn_is_delivered_and_persisted() {
        let h = harness(
            ScriptedTranscriber::text("What is the moon like tonight?"),
            ScriptedGenerator::reply("(looks up) Bright as frost on the ground."),
            FixedSynthesizer::audio(vec![7, 7, 7]),
        );
        let session = test_session("s-1", 3);
        let ticket = ticket(&session);

        let outcome = h.orchestrator.run_turn(&session, ticket).await;

        assert_eq!(outcome, TurnOutcome::Delivered { fallback: false });
        let events = h.sink.events();
        assert_eq!(
            events,
            vec![TurnEvent::Reply {
                session_id: "s-1".into(),
                user_text: "What is the moon like tonight?".into(),
                ai_text: "Bright as frost on the ground.".into(),
                audio: vec![7, 7, 7],
                fallback: false,
            }]
        );
        let stored = h.store.load_history(7, 3, 10).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].message_type, ConversationTurn::VOICE);
        assert_eq!(stored[0].audio_ref, None);
        assert!(!session.turn_in_flight());
        assert_eq!(session.last_text(), "");
    }

    #[tokio::test]
    async fn test_transcription_error_uses_noise_reply() {
        let h = harness(
            ScriptedTranscriber::error(BackendError::Transport("connection refused".into())),
            ScriptedGenerator::reply("unused"),
            FixedSynthesizer::audio(vec![1]),
        );
        let session = test_session("s-2", 2);
        let ticket = ticket(&session);

        let outcome = h.orchestrator.run_turn(&session, ticket).await;

        assert_eq!(outcome, TurnOutcome::Delivered { fallback: true });
        match &h.sink.events()[0] {
            TurnEvent::Reply { user_text, ai_text, fallback, .. } => {
                assert_eq!(user_text, "");
                assert_eq!(ai_text, &session.persona.noise_reply);
                assert!(fallback);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(h.generator.calls(), 0);
        assert_eq!(h.synthesizer.texts(), vec![session.persona.noise_reply.clone()]);
        assert_eq!(h.store.turn_count(7, 2), 1);
    }

    #[tokio::test]
    async fn test_one_character_transcript_is_noise() {
        let h = harness(
            ScriptedTranscriber::text(" 嗯 "),
            ScriptedGenerator::reply("unused"),
            FixedSynthesizer::audio(vec![1]),
        );
        let session = test_session("s-3", 1);
        let ticket = ticket(&session);

        let outcome = h.orchestrator.run_turn(&session, ticket).await;
        assert_eq!(outcome, TurnOutcome::Delivered { fallback: true });
        assert_eq!(h.generator.calls(), 0);
    }

    #[tokio::test]
    async fn test_generation_failure_reports_error_and_stores_nothing() {
        let h = harness(
            ScriptedTranscriber::text("Tell me a story"),
            ScriptedGenerator::error(BackendError::Status {
                status: 500,
                body: "boom".into(),
            }),
            FixedSynthesizer::audio(vec![1]),
        );
        let session = test_session("s-4", 4);
        let ticket = ticket(&session);

        let outcome = h.orchestrator.run_turn(&session, ticket).await;

        assert_eq!(outcome, TurnOutcome::Failed { stage: TurnStage::Generating });
        assert!(matches!(&h.sink.events()[0], TurnEvent::Failed { ai_text: None, .. }));
        assert_eq!(h.store.turn_count(7, 4), 0);
        assert!(h.synthesizer.texts().is_empty());
        assert!(!session.turn_in_flight());
        assert_eq!(h.metrics.snapshot().failed_turns, 1);
    }

    #[tokio::test]
    async fn test_reply_of_only_stage_directions_is_a_generation_failure() {
        let h = harness(
            ScriptedTranscriber::text("Hello there"),
            ScriptedGenerator::reply("*waves* (smiles)"),
            FixedSynthesizer::audio(vec![1]),
        );
        let session = test_session("s-5", 1);
        let ticket = ticket(&session);

        let outcome = h.orchestrator.run_turn(&session, ticket).await;
        assert_eq!(outcome, TurnOutcome::Failed { stage: TurnStage::Generating });
    }

    #[tokio::test]
    async fn test_synthesis_failure_keeps_generated_text() {
        let h = harness(
            ScriptedTranscriber::text("Sing for me"),
            ScriptedGenerator::reply("La la la"),
            FixedSynthesizer::error(BackendError::Timeout {
                service: "tts",
                after: Duration::from_secs(5),
            }),
        );
        let session = test_session("s-6", 3);
        let ticket = ticket(&session);

        let outcome = h.orchestrator.run_turn(&session, ticket).await;

        assert_eq!(outcome, TurnOutcome::Failed { stage: TurnStage::Synthesizing });
        assert!(matches!(
            &h.sink.events()[0],
            TurnEvent::Failed { ai_text: Some(text), .. } if text == "La la la"
        ));
        assert_eq!(h.store.turn_count(7, 3), 0);
    }

    #[tokio::test]
    async fn test_persistence_failure_still_delivers() {
        let sink = Arc::new(RecordingSink::default());
        let metrics = Arc::new(CallMetrics::default());
        let orchestrator = TurnOrchestrator::new(
            Arc::new(ScriptedTranscriber::text("Good evening")),
            Arc::new(ScriptedGenerator::reply("Good evening to you")),
            Arc::new(FixedSynthesizer::audio(vec![9])),
            Arc::new(FailingConversationStore),
            sink.clone(),
            metrics.clone(),
            crate::pipeline::testing::settings(),
        );
        let session = test_session("s-7", 1);
        let ticket = ticket(&session);

        let outcome = orchestrator.run_turn(&session, ticket).await;

        assert_eq!(outcome, TurnOutcome::Delivered { fallback: false });
        assert_eq!(sink.events().len(), 1);
        assert_eq!(metrics.snapshot().turns_delivered, 1);
    }

    #[tokio::test]
    async fn test_history_reaches_the_generator() {
        let h = harness(
            ScriptedTranscriber::text("Do you remember me?"),
            ScriptedGenerator::reply("Of course I do"),
            FixedSynthesizer::audio(vec![1]),
        );
        h.store.insert(ConversationTurn::voice("old", 7, 3, "Hi Li Bai", "Greetings, friend"));
        let session = test_session("s-8", 3);
        let ticket = ticket(&session);

        h.orchestrator.run_turn(&session, ticket).await;

        let prompt = h.generator.last_messages();
        let contents: Vec<&str> = prompt.iter().skip(1).map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["Hi Li Bai", "Greetings, friend", "Do you remember me?"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_frees_a_stuck_turn() {
        let h = harness(
            ScriptedTranscriber::stalled(),
            ScriptedGenerator::reply("unused"),
            FixedSynthesizer::audio(vec![1]),
        );
        let session = Arc::new(test_session("s-9", 1));
        let ticket = ticket(&session);

        h.orchestrator.spawn_turn(Arc::clone(&session), ticket);
        assert!(session.turn_in_flight());

        tokio::time::sleep(h.orchestrator.settings.turn_timeout + Duration::from_secs(1)).await;

        assert!(!session.turn_in_flight());
        assert!(matches!(
            h.sink.events().as_slice(),
            [TurnEvent::Failed { ai_text: None, .. }]
        ));
        let counters = h.metrics.snapshot();
        assert_eq!(counters.turns_started, 1);
        assert_eq!(counters.failed_turns, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_turn_never_runs_alongside_the_next() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let h = harness(
            ScriptedTranscriber::gated(gate.clone(), "Are you still there?"),
            ScriptedGenerator::reply("Still here"),
            FixedSynthesizer::audio(vec![5]),
        );
        let session = Arc::new(test_session("s-10", 1));

        let first = ticket(&session);
        h.orchestrator.spawn_turn(Arc::clone(&session), first);
        tokio::time::sleep(h.orchestrator.settings.turn_timeout + Duration::from_secs(1)).await;
        assert_eq!(h.sink.events().len(), 1);

        let second = ticket(&session);
        h.orchestrator.spawn_turn(Arc::clone(&session), second);
        gate.notify_one();

        let events = h.sink.wait_for(2).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(h.sink.events().len(), 2);
        assert!(matches!(events[0], TurnEvent::Failed { .. }));
        assert!(matches!(events[1], TurnEvent::Reply { fallback: false, .. }));
        assert_eq!(h.generator.calls(), 1);
        let counters = h.metrics.snapshot();
        assert_eq!(counters.turns_started, 2);
        assert_eq!(counters.turns_delivered, 1);
        assert_eq!(counters.failed_turns, 1);
    }

    #[tokio::test]
    async fn test_result_of_an_expired_turn_is_dropped() {
        let h = harness(
            ScriptedTranscriber::text("Hello"),
            ScriptedGenerator::reply("Hi"),
            FixedSynthesizer::audio(vec![1]),
        );
        let session = test_session("s-11", 1);
        let ticket = ticket(&session);
        assert!(session.expire_turn(ticket.turn_id));

        let outcome = h.orchestrator.run_turn(&session, ticket).await;

        assert_eq!(outcome, TurnOutcome::Expired);
        assert!(h.sink.events().is_empty());
    }
}
