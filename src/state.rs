//! # Application State Management
//!
//! Shared state handed to every HTTP handler and every call connection.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - Every handler and every connection actor holds a clone of `AppState`
//! - Cloning only bumps reference counts; the registry, hub and backends are shared
//!
//! ### Trait objects at the seams
//! - Backends are held as `Arc<dyn Transcriber>` and friends
//! - Production wiring uses the HTTP/WebSocket clients, tests pass scripted doubles
//!
//! ### RwLock for counters
//! - Call metrics are written by turn tasks and read by `/health`
//! - Locks are held only for the increment or the snapshot copy

use crate::audio::{AudioAccumulator, SessionRegistry};
use crate::config::AppConfig;
use crate::gateway::ConnectionHub;
use crate::pipeline::persona::PersonaCatalog;
use crate::pipeline::{DeliverySink, PipelineSettings, TurnOrchestrator};
use crate::services::llm::ChatCompletionsClient;
use crate::services::store::{InMemoryCharacterStore, InMemoryConversationStore};
use crate::services::tts::SpeechClient;
use crate::services::{CharacterStore, ConversationStore, Generator, Synthesizer, Transcriber};
use crate::transcription::StreamingAsrClient;
use anyhow::Result;
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

/// The main application state shared across handlers and connections.
#[derive(Clone)]
pub struct AppState {
    /// Validated at startup and never mutated afterwards
    pub config: Arc<AppConfig>,

    pub services: CallServices,

    pub metrics: Arc<CallMetrics>,

    /// When the server started (never changes)
    pub start_time: Instant,
}

/// External collaborators the call pipeline depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub transcriber: Arc<dyn Transcriber>,
    pub generator: Arc<dyn Generator>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub characters: Arc<dyn CharacterStore>,
    pub conversations: Arc<dyn ConversationStore>,
}

impl Collaborators {
    /// Real backends built from configuration.
    ///
    /// ## Parameters:
    /// - `config`: Validated application configuration
    ///
    /// ## Returns:
    /// - `Ok(Collaborators)`: Clients for recognition, generation and synthesis
    ///   plus the in-memory stores
    /// - `Err`: The shared HTTP client could not be built
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        // One connection pool for generation and synthesis
        let http = reqwest::Client::builder()
            .user_agent(concat!("voice-call-backend/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            transcriber: Arc::new(StreamingAsrClient::new(config.asr.clone(), config.audio.clone())),
            generator: Arc::new(ChatCompletionsClient::new(http.clone(), config.llm.clone())),
            synthesizer: Arc::new(SpeechClient::new(http, config.tts.clone())),
            characters: Arc::new(InMemoryCharacterStore::with_builtin_characters()),
            conversations: Arc::new(InMemoryConversationStore::new()),
        })
    }
}

/// Everything a call needs at runtime, wired together once at startup.
#[derive(Clone)]
pub struct CallServices {
    pub registry: Arc<SessionRegistry>,
    pub accumulator: AudioAccumulator,
    pub hub: ConnectionHub,
    pub orchestrator: Arc<TurnOrchestrator>,
    pub personas: Arc<PersonaCatalog>,
    pub characters: Arc<dyn CharacterStore>,
    pub synthesizer: Arc<dyn Synthesizer>,
}

impl CallServices {
    /// Wire the registry, hub and orchestrator around the given collaborators.
    ///
    /// Turn results are delivered to `sink`, which is the connection hub in
    /// production.
    pub fn assemble(
        config: &AppConfig,
        collaborators: Collaborators,
        hub: ConnectionHub,
        sink: Arc<dyn DeliverySink>,
        metrics: Arc<CallMetrics>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.performance.max_concurrent_sessions));
        let orchestrator = Arc::new(TurnOrchestrator::new(
            Arc::clone(&collaborators.transcriber),
            Arc::clone(&collaborators.generator),
            Arc::clone(&collaborators.synthesizer),
            Arc::clone(&collaborators.conversations),
            sink,
            metrics,
            PipelineSettings::from(config),
        ));

        Self {
            accumulator: AudioAccumulator::new(Arc::clone(&registry)),
            registry,
            hub,
            orchestrator,
            personas: Arc::new(PersonaCatalog::builtin()),
            characters: collaborators.characters,
            synthesizer: collaborators.synthesizer,
        }
    }
}

impl AppState {
    /// Create the production state: real backends, results delivered through the hub.
    pub fn new(config: AppConfig) -> Result<Self> {
        let collaborators = Collaborators::from_config(&config)?;
        Ok(Self::with_collaborators(config, collaborators))
    }

    /// Create state around caller-supplied collaborators.
    pub fn with_collaborators(config: AppConfig, collaborators: Collaborators) -> Self {
        let metrics = Arc::new(CallMetrics::default());
        let hub = ConnectionHub::new();
        let services = CallServices::assemble(
            &config,
            collaborators,
            hub.clone(),
            Arc::new(hub),
            Arc::clone(&metrics),
        );

        Self {
            config: Arc::new(config),
            services,
            metrics,
            start_time: Instant::now(),
        }
    }

    /// Get server uptime in seconds.
    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Counters for call and turn activity, exposed by `/health`.
#[derive(Debug, Default)]
pub struct CallMetrics {
    counters: RwLock<CallCounters>,
}

/// Point-in-time copy of [`CallMetrics`].
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct CallCounters {
    pub calls_started: u64,
    pub calls_stopped: u64,
    pub greetings_served: u64,
    pub turns_started: u64,
    pub turns_rejected: u64,
    pub turns_delivered: u64,
    pub fallback_turns: u64,
    pub failed_turns: u64,
}

impl CallMetrics {
    fn update(&self, apply: impl FnOnce(&mut CallCounters)) {
        let mut counters = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        apply(&mut counters);
    }

    pub fn call_started(&self) {
        self.update(|c| c.calls_started += 1);
    }

    pub fn call_stopped(&self) {
        self.update(|c| c.calls_stopped += 1);
    }

    pub fn greeting_served(&self) {
        self.update(|c| c.greetings_served += 1);
    }

    pub fn turn_started(&self) {
        self.update(|c| c.turns_started += 1);
    }

    /// A `voice_end` arrived while the previous turn was still running.
    pub fn turn_rejected(&self) {
        self.update(|c| c.turns_rejected += 1);
    }

    /// ## Parameters:
    /// - `fallback`: Whether the canned noise reply was spoken
    pub fn turn_delivered(&self, fallback: bool) {
        self.update(|c| {
            c.turns_delivered += 1;
            if fallback {
                c.fallback_turns += 1;
            }
        });
    }

    pub fn turn_failed(&self) {
        self.update(|c| c.failed_turns += 1);
    }

    pub fn snapshot(&self) -> CallCounters {
        self.counters.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_turns_count_as_delivered() {
        let metrics = CallMetrics::default();
        metrics.turn_started();
        metrics.turn_delivered(true);
        metrics.turn_started();
        metrics.turn_failed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.turns_started, 2);
        assert_eq!(snapshot.turns_delivered, 1);
        assert_eq!(snapshot.fallback_turns, 1);
        assert_eq!(snapshot.failed_turns, 1);
    }
}
