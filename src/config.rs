//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Converts between Rust structs and TOML / environment data
//! - **derive macros**: Generate Debug, Clone, Serialize, Deserialize
//! - **impl blocks**: Add methods to structs
//! - **Result<T, E>**: Error handling that forces you to handle potential failures
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Deployment shortcuts (HOST, PORT, AI_API_KEY, ASR_API_KEY, TTS_API_KEY, ...)
//! 2. Environment variables (APP_SERVER__PORT, APP_CALL__HISTORY_TURNS, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use crate::transcription::client::AudioEncoding;
use anyhow::Result; // Better error handling with context
use serde::{Deserialize, Serialize}; // For converting to/from TOML, JSON, etc.
use std::env; // For reading environment variables
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Each upstream provider (recognition, generation, synthesis) has its own
/// endpoint, credentials and retry budget, so each gets its own section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub audio: AudioConfig,
    pub asr: AsrConfig,
    pub llm: LlmConfig,
    pub tts: TtsConfig,
    pub call: CallConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16, // u16 = unsigned 16-bit integer (0-65535), perfect for port numbers
}

/// Realtime connection authentication.
///
/// An empty `access_token` accepts any non-empty token; otherwise the token
/// supplied on the upgrade query string must match exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub access_token: String,
}

/// Format of the raw PCM the client streams over `audio_chunk`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
}

/// Timeout and bounded retry budget for one upstream backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub timeout_secs: u64,
    pub attempts: u32,
    pub retry_delay_ms: u64,
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Longest one call can take: every attempt timing out, plus the pauses between them.
    pub fn worst_case(&self) -> Duration {
        self.timeout() * self.attempts + self.retry_delay() * self.attempts.saturating_sub(1)
    }
}

/// Streaming speech recognition backend (binary WebSocket protocol).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsrConfig {
    pub url: String,
    pub api_key: String,
    pub model_name: String,
    pub uid: String,
    /// Bytes of PCM per audio-only frame (3200 = 100 ms at 16 kHz mono 16-bit)
    pub chunk_bytes: usize,
    pub backend: BackendConfig,
}

/// OpenAI-compatible chat completions backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub voice_max_tokens: u32,
    pub chat_max_tokens: u32,
    pub backend: BackendConfig,
}

/// Text-to-speech backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    pub base_url: String,
    pub api_key: String,
    pub encoding: String,
    /// Longer replies are truncated (with "...") before synthesis
    pub max_chars: usize,
    pub backend: BackendConfig,
}

/// Realtime call behaviour.
///
/// ## Fields:
/// - `heartbeat_interval_secs`: How often the gateway pings the client
/// - `client_timeout_secs`: Read deadline, refreshed by any inbound frame
/// - `history_turns`: Prior turns included in the prompt
/// - `min_transcript_chars`: Shorter transcripts are treated as noise
/// - `turn_timeout_secs`: Watchdog that frees a stuck turn slot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
    pub history_turns: usize,
    pub min_transcript_chars: usize,
    pub turn_timeout_secs: u64,
}

impl CallConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }

    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.turn_timeout_secs)
    }
}

/// Performance tuning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(), // Localhost only (safe for development)
                port: 8080,
            },
            auth: AuthConfig {
                access_token: String::new(),
            },
            audio: AudioConfig {
                sample_rate: 16_000,
                channels: 1,
                bit_depth: 16,
            },
            asr: AsrConfig {
                url: "wss://openai.qiniu.com/v1/voice/asr".to_string(),
                api_key: String::new(),
                model_name: "asr".to_string(),
                uid: "voice_call_backend".to_string(),
                chunk_bytes: 3200,
                backend: BackendConfig {
                    timeout_secs: 8,
                    attempts: 2,
                    retry_delay_ms: 1000,
                },
            },
            llm: LlmConfig {
                base_url: "https://openai.qiniu.com/v1".to_string(),
                api_key: String::new(),
                model: "qwen3-max".to_string(),
                temperature: 0.7,
                voice_max_tokens: 80,
                chat_max_tokens: 512,
                backend: BackendConfig {
                    timeout_secs: 10,
                    attempts: 2,
                    retry_delay_ms: 500,
                },
            },
            tts: TtsConfig {
                base_url: "https://openai.qiniu.com/v1".to_string(),
                api_key: String::new(),
                encoding: "mp3".to_string(),
                max_chars: 100,
                backend: BackendConfig {
                    timeout_secs: 5,
                    attempts: 2,
                    retry_delay_ms: 500,
                },
            },
            call: CallConfig {
                heartbeat_interval_secs: 120, // ping every 2 minutes
                client_timeout_secs: 300,     // 5 minute read deadline
                history_turns: 4,
                min_transcript_chars: 2,
                turn_timeout_secs: 90,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 100,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_LLM__MODEL=qwen-plus`: Override generation model
    /// - `APP_CALL__HISTORY_TURNS=6`: Larger prompt window
    /// - `AI_API_KEY=...`: Key for generation (and recognition/synthesis unless set separately)
    /// - `HOST=0.0.0.0` / `PORT=3000`: Deployment platform conventions
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            // 1. Start with defaults
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // 2. Load from config.toml file (if it exists)
            .add_source(config::File::with_name("config").required(false))
            // 3. APP_-prefixed environment variables, "__" between nesting levels
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        // Provider credentials: one shared AI key, optionally split per service
        if let Ok(key) = env::var("AI_API_KEY") {
            settings = settings.set_override("llm.api_key", key)?;
        }
        if let Ok(base_url) = env::var("AI_BASE_URL") {
            settings = settings
                .set_override("llm.base_url", base_url.clone())?
                .set_override("tts.base_url", base_url)?;
        }
        if let Ok(model) = env::var("AI_MODEL") {
            settings = settings.set_override("llm.model", model)?;
        }
        if let Ok(key) = env::var("ASR_API_KEY") {
            settings = settings.set_override("asr.api_key", key)?;
        }
        if let Ok(key) = env::var("TTS_API_KEY") {
            settings = settings.set_override("tts.api_key", key)?;
        }

        let mut config: AppConfig = settings.build()?.try_deserialize()?;

        // Fall back to the shared key when a per-service key is still empty
        if let Ok(key) = env::var("AI_API_KEY") {
            if config.asr.api_key.is_empty() {
                config.asr.api_key = key.clone();
            }
            if config.tts.api_key.is_empty() {
                config.tts.api_key = key;
            }
        }

        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Catching configuration errors at startup is much friendlier than a
    /// failed call half way through a conversation.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.asr.chunk_bytes == 0 {
            return Err(anyhow::anyhow!("ASR chunk size must be greater than 0"));
        }

        if self.audio.sample_rate == 0 || self.audio.channels == 0 || self.audio.bit_depth != 16 {
            return Err(anyhow::anyhow!(
                "Audio format must be 16-bit PCM with a non-zero sample rate and channel count"
            ));
        }

        for (name, backend) in [
            ("asr", &self.asr.backend),
            ("llm", &self.llm.backend),
            ("tts", &self.tts.backend),
        ] {
            if backend.attempts == 0 {
                return Err(anyhow::anyhow!("{} backend needs at least one attempt", name));
            }
            if backend.timeout_secs == 0 {
                return Err(anyhow::anyhow!("{} backend timeout must be greater than 0", name));
            }
        }

        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(anyhow::anyhow!("Temperature must be between 0 and 2"));
        }

        if self.call.heartbeat_interval_secs == 0
            || self.call.heartbeat_interval_secs >= self.call.client_timeout_secs
        {
            return Err(anyhow::anyhow!(
                "Heartbeat interval must be non-zero and shorter than the client timeout"
            ));
        }

        let budget = self.turn_budget();
        if self.call.turn_timeout() < budget {
            return Err(anyhow::anyhow!(
                "Turn timeout ({}s) must cover the backend retry budgets ({}s)",
                self.call.turn_timeout_secs,
                budget.as_secs_f64()
            ));
        }

        Ok(())
    }

    /// Worst case for one turn: recognition once per audio format guess,
    /// then generation and synthesis.
    pub fn turn_budget(&self) -> Duration {
        self.asr.backend.worst_case() * AudioEncoding::GUESSES.len() as u32
            + self.llm.backend.worst_case()
            + self.tts.backend.worst_case()
    }
}
