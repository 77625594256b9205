//! # External Collaborators
//!
//! The voice session treats everything outside real-time orchestration as an
//! external service reached through a narrow contract. Each contract is a
//! trait here; the concrete adapters live in the submodules and are injected
//! into the session controller through [`Services`], so tests can swap in
//! doubles.
//!
//! ## Contracts:
//! - **TranscriptionProvider / TranscriptionSource**: live speech-to-text; final
//!   transcripts are pushed onto the session's transcription queue
//! - **ReasoningService**: turn-based text generation
//! - **MemoryStore**: append/read conversation entries
//! - **SpeechSynthesizer**: text → lazy, finite stream of audio chunks

pub mod memory;
pub mod reasoning;
pub mod synthesis;
pub mod transcription;

use crate::config::{AppConfig, SynthesisConfig, TranscriptionConfig};
use crate::error::{MemoryError, ReasoningError, SynthesisError, TranscriptionError};
use crate::voice::queue::TranscriptSender;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Who said a remembered line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Agent => "agent",
        }
    }
}

/// One stored conversation line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Conversation memory.
///
/// `session_id` is the conversation namespace; entries of one conversation are
/// never visible from another.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn append(&self, session_id: &str, text: &str, role: Role) -> Result<MemoryEntry, MemoryError>;

    /// The newest `limit` entries, oldest first.
    async fn recent(&self, session_id: &str, limit: usize) -> Result<Vec<MemoryEntry>, MemoryError>;

    /// Entries related to `query`, best match first. Stores without a
    /// similarity index return nothing.
    async fn relevant(
        &self,
        _session_id: &str,
        _query: &str,
        _limit: usize,
    ) -> Result<Vec<MemoryEntry>, MemoryError> {
        Ok(Vec::new())
    }

    /// Drop a conversation, returning how many entries were removed.
    async fn clear(&self, session_id: &str) -> Result<usize, MemoryError>;
}

/// Context gathered by the pipeline's fetch stage.
#[derive(Debug, Clone, Default)]
pub struct ReasoningContext {
    /// Recent conversation, oldest first
    pub history: Vec<MemoryEntry>,
    /// Related older memories, best match first
    pub relevant: Vec<MemoryEntry>,
    /// Per-session override of how many history entries reach the request
    pub history_window: Option<usize>,
    /// Per-session override of the sampling temperature
    pub temperature: Option<f32>,
}

#[async_trait]
pub trait ReasoningService: Send + Sync {
    async fn reason(&self, text: &str, context: &ReasoningContext) -> Result<String, ReasoningError>;
}

/// Opaque encoded audio, forwarded to the peer as one binary frame.
pub type AudioChunk = Vec<u8>;

/// Lazy synthesized audio for one turn. Finite; not restartable mid-stream.
pub type AudioStream = BoxStream<'static, Result<AudioChunk, SynthesisError>>;

/// Voice parameters handed to the synthesizer with each request.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceConfig {
    pub model: String,
    pub encoding: String,
    pub sample_rate: u32,
}

impl From<&SynthesisConfig> for VoiceConfig {
    fn from(config: &SynthesisConfig) -> Self {
        Self {
            model: config.model.clone(),
            encoding: config.encoding.clone(),
            sample_rate: config.sample_rate,
        }
    }
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &VoiceConfig) -> Result<AudioStream, SynthesisError>;
}

/// Fixed parameters a session opens its transcription source with.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptionOptions {
    pub model: String,
    pub language: String,
    pub punctuate: bool,
    pub smart_format: bool,
    pub interim_results: bool,
    pub vad_events: bool,
    pub endpointing_ms: u32,
}

impl From<&TranscriptionConfig> for TranscriptionOptions {
    fn from(config: &TranscriptionConfig) -> Self {
        Self {
            model: config.model.clone(),
            language: config.language.clone(),
            punctuate: config.punctuate,
            smart_format: config.smart_format,
            interim_results: config.interim_results,
            vad_events: config.vad_events,
            endpointing_ms: config.endpointing_ms,
        }
    }
}

/// Opens one live transcription connection per session.
#[async_trait]
pub trait TranscriptionProvider: Send + Sync {
    /// Open a source that pushes final transcripts into `transcripts`.
    async fn open(
        &self,
        options: &TranscriptionOptions,
        transcripts: TranscriptSender,
    ) -> Result<Box<dyn TranscriptionSource>, TranscriptionError>;
}

/// An open transcription connection, owned by the session's ingest loop.
#[async_trait]
pub trait TranscriptionSource: Send {
    async fn send_audio(&mut self, chunk: Vec<u8>) -> Result<(), TranscriptionError>;

    /// Release the connection. Must be safe to call more than once.
    async fn close(&mut self);
}

/// The collaborator set injected into every voice session.
#[derive(Clone)]
pub struct Services {
    pub transcription: Arc<dyn TranscriptionProvider>,
    pub reasoning: Arc<dyn ReasoningService>,
    pub memory: Arc<dyn MemoryStore>,
    pub synthesis: Arc<dyn SpeechSynthesizer>,
}

impl Services {
    /// Build the production adapters from configuration.
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        Ok(Self {
            transcription: Arc::new(transcription::DeepgramTranscriber::new(&config.transcription)),
            reasoning: Arc::new(reasoning::ChatCompletionsClient::new(&config.reasoning)?),
            memory: Arc::new(memory::InMemoryStore::new()),
            synthesis: Arc::new(synthesis::DeepgramSpeechClient::new(&config.synthesis)?),
        })
    }
}
