//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix, `__` between section and field)
//! - Provider keys under their conventional names (DEEPGRAM_API_KEY, GROQ_API_KEY)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Well-known variables (HOST, PORT, DEEPGRAM_API_KEY, GROQ_API_KEY)
//! 2. Environment variables (APP_SERVER__PORT, APP_SESSION__DEBOUNCE_MS, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! ## Sections:
//! - **server**: where the HTTP/WebSocket listener binds
//! - **transcription**: live speech-to-text connection parameters
//! - **synthesis**: text-to-speech voice and input limits
//! - **reasoning**: chat-completions backend used to answer each turn
//! - **session**: timing and sizing of the per-connection orchestration
//! - **performance**: global limits

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// Every section derives `Serialize` so the defaults can be fed back into the
/// `config` builder as the lowest-priority source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub transcription: TranscriptionConfig,
    pub synthesis: SynthesisConfig,
    pub reasoning: ReasoningConfig,
    pub session: SessionConfig,
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
    pub port: u16,
}

/// Live transcription (Deepgram listen API) settings.
///
/// These are the fixed parameters every session opens its transcription
/// source with: model, language, punctuation and the endpointing window that
/// decides when a segment becomes final.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    /// API key; empty means the source cannot be opened
    pub api_key: String,
    /// WebSocket endpoint of the listen API
    pub url: String,
    pub model: String,
    pub language: String,
    pub punctuate: bool,
    pub smart_format: bool,
    pub interim_results: bool,
    pub vad_events: bool,
    /// Silence (ms) after which the provider finalizes a segment
    pub endpointing_ms: u32,
    /// Interval for KeepAlive messages while no audio is flowing
    pub keepalive_secs: u64,
}

/// Speech synthesis (Deepgram speak API) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    pub api_key: String,
    pub url: String,
    /// Voice model, e.g. "aura-asteria-en"
    pub model: String,
    /// Output encoding of the audio chunks sent to the peer
    pub encoding: String,
    pub sample_rate: u32,
    /// Character budget for the speech input (provider hard limit is 2000)
    pub max_chars: usize,
    /// Sentence budget for the speech input
    pub max_sentences: usize,
}

/// Reasoning backend (OpenAI-compatible chat completions) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningConfig {
    pub api_key: String,
    /// Base URL; `/chat/completions` is appended
    pub url: String,
    pub model: String,
    pub temperature: f32,
    pub system_prompt: String,
    /// How many history entries are forwarded with each request
    pub history_window: usize,
    pub timeout_secs: u64,
}

/// Per-session orchestration tuning.
///
/// ## Timing contracts:
/// - `debounce_ms`: minimum gap between two accepted interruptions
/// - `queue_poll_ms`: how long the transcript consumer waits before re-checking for shutdown
/// - `cancel_grace_ms`: upper bound on waiting for a cancelled task before it is aborted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub debounce_ms: u64,
    pub queue_poll_ms: u64,
    /// Capacity of the transcript hand-off queue
    pub queue_capacity: usize,
    /// Capacity of the socket → ingest loop frame channel
    pub inbound_buffer_frames: usize,
    /// Number of recent memory entries fetched for each turn
    pub history_limit: usize,
    /// Number of related memories fetched for each turn (0 disables the lookup)
    pub relevant_memory_limit: usize,
    pub cancel_grace_ms: u64,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
}

/// Performance tuning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Maximum number of voice sessions served at the same time
    pub max_concurrent_sessions: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            transcription: TranscriptionConfig {
                api_key: String::new(),
                url: "wss://api.deepgram.com/v1/listen".to_string(),
                model: "nova-2".to_string(),
                language: "en-US".to_string(),
                punctuate: true,
                smart_format: true,
                interim_results: true,
                vad_events: true,
                endpointing_ms: 300,
                keepalive_secs: 5,
            },
            synthesis: SynthesisConfig {
                api_key: String::new(),
                url: "https://api.deepgram.com/v1/speak".to_string(),
                model: "aura-asteria-en".to_string(),
                encoding: "linear16".to_string(),
                sample_rate: 24000,
                max_chars: 1500,
                max_sentences: 5,
            },
            reasoning: ReasoningConfig {
                api_key: String::new(),
                url: "https://api.groq.com/openai/v1".to_string(),
                model: "openai/gpt-oss-120b".to_string(),
                temperature: 0.7,
                system_prompt: "You are a friendly customer support voice assistant. \
                    Keep answers short and conversational; they will be spoken aloud."
                    .to_string(),
                history_window: 10,
                timeout_secs: 30,
            },
            session: SessionConfig {
                debounce_ms: 500,
                queue_poll_ms: 1000,
                queue_capacity: 256,
                inbound_buffer_frames: 256,
                history_limit: 20,
                relevant_memory_limit: 0,
                cancel_grace_ms: 2000,
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_SESSION__DEBOUNCE_MS=750`: Widen the interruption debounce
    /// - `APP_SYNTHESIS__MODEL=aura-luna-en`: Pick another voice
    /// - `DEEPGRAM_API_KEY=...`: Used for both transcription and synthesis
    /// - `GROQ_API_KEY=...`: Reasoning backend key
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            // Double underscore keeps snake_case field names intact (APP_SESSION__DEBOUNCE_MS)
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }
        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }
        if let Ok(key) = env::var("DEEPGRAM_API_KEY") {
            settings = settings.set_override("transcription.api_key", key.clone())?;
            settings = settings.set_override("synthesis.api_key", key)?;
        }
        if let Ok(key) = env::var("GROQ_API_KEY") {
            settings = settings.set_override("reasoning.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Missing API keys are not rejected here: the server still starts, and the
    /// affected collaborator reports itself as not configured (visible on
    /// `/health` and as an `error` record when a voice session opens).
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.session.debounce_ms == 0 {
            return Err(anyhow::anyhow!("Interruption debounce must be greater than 0"));
        }

        if self.session.queue_poll_ms == 0 {
            return Err(anyhow::anyhow!("Queue poll timeout must be greater than 0"));
        }

        if self.session.queue_capacity == 0 || self.session.inbound_buffer_frames == 0 {
            return Err(anyhow::anyhow!("Session buffers must have a capacity greater than 0"));
        }

        if self.synthesis.max_chars == 0 || self.synthesis.max_sentences == 0 {
            return Err(anyhow::anyhow!("Speech budget must allow at least one sentence and one character"));
        }

        if self.transcription.model.trim().is_empty()
            || self.synthesis.model.trim().is_empty()
            || self.reasoning.model.trim().is_empty()
        {
            return Err(anyhow::anyhow!("Model names cannot be empty"));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the runtime-tunable fields are accepted: session timing, speech
    /// budget and voice, and the reasoning history window. Fields that are only
    /// read at startup (bind address, API keys, endpoints) are left untouched.
    /// For example, `{"session": {"debounce_ms": 750}}` changes only the debounce.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(session) = partial_config.get("session") {
            if let Some(v) = session.get("debounce_ms").and_then(|v| v.as_u64()) {
                self.session.debounce_ms = v;
            }
            if let Some(v) = session.get("queue_poll_ms").and_then(|v| v.as_u64()) {
                self.session.queue_poll_ms = v;
            }
            if let Some(v) = session.get("history_limit").and_then(|v| v.as_u64()) {
                self.session.history_limit = v as usize;
            }
            if let Some(v) = session.get("relevant_memory_limit").and_then(|v| v.as_u64()) {
                self.session.relevant_memory_limit = v as usize;
            }
            if let Some(v) = session.get("cancel_grace_ms").and_then(|v| v.as_u64()) {
                self.session.cancel_grace_ms = v;
            }
        }

        if let Some(synthesis) = partial_config.get("synthesis") {
            if let Some(model) = synthesis.get("model").and_then(|v| v.as_str()) {
                self.synthesis.model = model.to_string();
            }
            if let Some(v) = synthesis.get("max_chars").and_then(|v| v.as_u64()) {
                self.synthesis.max_chars = v as usize;
            }
            if let Some(v) = synthesis.get("max_sentences").and_then(|v| v.as_u64()) {
                self.synthesis.max_sentences = v as usize;
            }
        }

        if let Some(reasoning) = partial_config.get("reasoning") {
            if let Some(v) = reasoning.get("history_window").and_then(|v| v.as_u64()) {
                self.reasoning.history_window = v as usize;
            }
            if let Some(v) = reasoning.get("temperature").and_then(|v| v.as_f64()) {
                self.reasoning.temperature = v as f32;
            }
        }

        self.validate()?;
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.session.debounce_ms)
    }

    pub fn queue_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.session.queue_poll_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.session.cancel_grace_ms)
    }
}
