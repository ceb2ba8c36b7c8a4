//! Scripted collaborators for pipeline and gateway tests.

use super::delivery::{DeliverySink, TurnEvent};
use super::orchestrator::{PipelineSettings, TurnOrchestrator};
use super::persona::PersonaCatalog;
use crate::audio::CallSession;
use crate::models::{ChatMessage, ConversationTurn, VoiceProfile};
use crate::services::store::{builtin_characters, InMemoryConversationStore};
use crate::services::{
    BackendError, ConversationStore, GenerationMode, Generator, StoreError, Synthesizer, Transcriber,
};
use crate::state::CallMetrics;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

pub const TEST_USER: i64 = 7;

pub fn settings() -> PipelineSettings {
    PipelineSettings {
        history_turns: 4,
        min_transcript_chars: 2,
        temperature: 0.7,
        turn_timeout: Duration::from_secs(5),
    }
}

/// Session for [`TEST_USER`] talking to one of the built-in characters.
pub fn test_session(session_id: &str, character_id: i64) -> CallSession {
    let character = builtin_characters()
        .into_iter()
        .find(|c| c.id == character_id)
        .expect("built-in character");
    let persona = PersonaCatalog::builtin().resolve(&character);
    CallSession::new(session_id, TEST_USER, character_id, Arc::new(persona))
}

enum Script {
    Text(String),
    Error(BackendError),
    Stalled,
    /// Wait for the gate, then answer
    Gated(Arc<Notify>, String),
}

pub struct ScriptedTranscriber {
    script: Script,
}

impl ScriptedTranscriber {
    pub fn text(text: &str) -> Self {
        Self { script: Script::Text(text.to_string()) }
    }

    pub fn error(err: BackendError) -> Self {
        Self { script: Script::Error(err) }
    }

    /// Never answers.
    pub fn stalled() -> Self {
        Self { script: Script::Stalled }
    }

    pub fn gated(gate: Arc<Notify>, text: &str) -> Self {
        Self { script: Script::Gated(gate, text.to_string()) }
    }
}

#[async_trait]
impl Transcriber for ScriptedTranscriber {
    async fn transcribe(&self, _audio: &[u8]) -> Result<String, BackendError> {
        match &self.script {
            Script::Text(text) => Ok(text.clone()),
            Script::Error(err) => Err(err.clone()),
            Script::Stalled => std::future::pending().await,
            Script::Gated(gate, text) => {
                gate.notified().await;
                Ok(text.clone())
            }
        }
    }
}

pub struct ScriptedGenerator {
    reply: Result<String, BackendError>,
    seen: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedGenerator {
    pub fn reply(text: &str) -> Self {
        Self { reply: Ok(text.to_string()), seen: Mutex::default() }
    }

    pub fn error(err: BackendError) -> Self {
        Self { reply: Err(err), seen: Mutex::default() }
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn last_messages(&self) -> Vec<ChatMessage> {
        self.seen.lock().unwrap().last().cloned().unwrap_or_default()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        _temperature: f32,
        _mode: GenerationMode,
    ) -> Result<String, BackendError> {
        self.seen.lock().unwrap().push(messages.to_vec());
        self.reply.clone()
    }
}

pub struct FixedSynthesizer {
    audio: Result<Vec<u8>, BackendError>,
    texts: Mutex<Vec<String>>,
}

impl FixedSynthesizer {
    pub fn audio(bytes: Vec<u8>) -> Self {
        Self { audio: Ok(bytes), texts: Mutex::default() }
    }

    pub fn error(err: BackendError) -> Self {
        Self { audio: Err(err), texts: Mutex::default() }
    }

    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Synthesizer for FixedSynthesizer {
    async fn synthesize(&self, text: &str, _voice: &VoiceProfile) -> Result<Vec<u8>, BackendError> {
        self.texts.lock().unwrap().push(text.to_string());
        self.audio.clone()
    }
}

pub struct FailingConversationStore;

#[async_trait]
impl ConversationStore for FailingConversationStore {
    async fn load_history(&self, _: i64, _: i64, _: usize) -> Result<Vec<ConversationTurn>, StoreError> {
        Err(StoreError::Unavailable("database offline".into()))
    }

    async fn save_turn(&self, _turn: ConversationTurn) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("database offline".into()))
    }
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<TurnEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<TurnEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Poll until `count` events have arrived or a second has passed.
    pub async fn wait_for(&self, count: usize) -> Vec<TurnEvent> {
        for _ in 0..100 {
            if self.events.lock().unwrap().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.events()
    }
}

impl DeliverySink for RecordingSink {
    fn deliver(&self, event: TurnEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub struct Harness {
    pub orchestrator: Arc<TurnOrchestrator>,
    pub sink: Arc<RecordingSink>,
    pub store: Arc<InMemoryConversationStore>,
    pub metrics: Arc<CallMetrics>,
    pub generator: Arc<ScriptedGenerator>,
    pub synthesizer: Arc<FixedSynthesizer>,
}

pub fn harness(
    transcriber: ScriptedTranscriber,
    generator: ScriptedGenerator,
    synthesizer: FixedSynthesizer,
) -> Harness {
    let sink = Arc::new(RecordingSink::default());
    let store = Arc::new(InMemoryConversationStore::new());
    let metrics = Arc::new(CallMetrics::default());
    let generator = Arc::new(generator);
    let synthesizer = Arc::new(synthesizer);

    let orchestrator = Arc::new(TurnOrchestrator::new(
        Arc::new(transcriber),
        generator.clone(),
        synthesizer.clone(),
        store.clone(),
        sink.clone(),
        metrics.clone(),
        settings(),
    ));

    Harness {
        orchestrator,
        sink,
        store,
        metrics,
        generator,
        synthesizer,
    }
}
