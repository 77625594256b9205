//! Collaborator doubles for exercising sessions and pipelines without network
//! services.

use crate::error::{MemoryError, ReasoningError, SynthesisError, TranscriptionError};
use crate::services::{
    AudioStream, MemoryEntry, MemoryStore, ReasoningContext, ReasoningService, Role, Services,
    SpeechSynthesizer, TranscriptionOptions, TranscriptionProvider, TranscriptionSource, VoiceConfig,
};
use crate::voice::queue::{PushError, TranscriptEvent, TranscriptSender};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::{stream, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn services(
    transcription: ScriptedTranscription,
    reasoning: MockReasoning,
    memory: Arc<RecordingMemory>,
    synthesis: MockSynthesizer,
) -> Services {
    Services {
        transcription: Arc::new(transcription),
        reasoning: Arc::new(reasoning),
        memory,
        synthesis: Arc::new(synthesis),
    }
}

#[derive(Clone)]
enum Reply {
    Fixed(String),
    Echo,
    Fail(ReasoningError),
}

/// Reasoning double: fixed reply, echo, or fixed failure, optionally slow.
#[derive(Clone)]
pub struct MockReasoning {
    reply: Reply,
    delay: Duration,
    contexts: Arc<Mutex<Vec<ReasoningContext>>>,
}

impl MockReasoning {
    fn with_reply(reply: Reply) -> Self {
        Self {
            reply,
            delay: Duration::ZERO,
            contexts: Arc::default(),
        }
    }

    pub fn replying(text: &str) -> Self {
        Self::with_reply(Reply::Fixed(text.to_string()))
    }

    /// Replies `reply to: <utterance>`.
    pub fn echo() -> Self {
        Self::with_reply(Reply::Echo)
    }

    pub fn failing(err: ReasoningError) -> Self {
        Self::with_reply(Reply::Fail(err))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn contexts(&self) -> Vec<ReasoningContext> {
        self.contexts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReasoningService for MockReasoning {
    async fn reason(&self, text: &str, context: &ReasoningContext) -> Result<String, ReasoningError> {
        self.contexts.lock().unwrap().push(context.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.reply {
            Reply::Fixed(reply) => Ok(reply.clone()),
            Reply::Echo => Ok(format!("reply to: {text}")),
            Reply::Fail(err) => Err(err.clone()),
        }
    }
}

/// Synthesis double yielding a fixed chunk list, optionally paced and
/// optionally failing after the last chunk.
#[derive(Clone)]
pub struct MockSynthesizer {
    chunks: Vec<Vec<u8>>,
    pace: Duration,
    fail_with: Option<String>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl MockSynthesizer {
    pub fn chunks(chunks: Vec<Vec<u8>>) -> Self {
        Self {
            chunks,
            pace: Duration::ZERO,
            fail_with: None,
            requests: Arc::default(),
        }
    }

    /// Each chunk becomes available `pace` after the previous one.
    pub fn paced(chunks: Vec<Vec<u8>>, pace: Duration) -> Self {
        Self {
            pace,
            ..Self::chunks(chunks)
        }
    }

    pub fn failing_after(chunks: Vec<Vec<u8>>, message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Self::chunks(chunks)
        }
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechSynthesizer for MockSynthesizer {
    async fn synthesize(&self, text: &str, _voice: &VoiceConfig) -> Result<AudioStream, SynthesisError> {
        self.requests.lock().unwrap().push(text.to_string());

        let mut items: Vec<Result<Vec<u8>, SynthesisError>> = self.chunks.iter().cloned().map(Ok).collect();
        if let Some(message) = &self.fail_with {
            items.push(Err(SynthesisError::Stream(message.clone())));
        }
        let pace = self.pace;
        Ok(stream::iter(items)
            .then(move |item| async move {
                if !pace.is_zero() {
                    tokio::time::sleep(pace).await;
                }
                item
            })
            .boxed())
    }
}

/// Memory double that keeps everything and can be inspected.
#[derive(Default)]
pub struct RecordingMemory {
    entries: Mutex<HashMap<String, Vec<MemoryEntry>>>,
    appends: AtomicUsize,
}

impl RecordingMemory {
    pub fn seed(&self, session_id: &str, role: Role, text: &str) {
        self.push(session_id, role, text);
    }

    fn push(&self, session_id: &str, role: Role, text: &str) -> MemoryEntry {
        let mut entries = self.entries.lock().unwrap();
        let list = entries.entry(session_id.to_string()).or_default();
        let entry = MemoryEntry {
            id: format!("{session_id}-{}", list.len()),
            role,
            text: text.to_string(),
            timestamp: Utc::now(),
        };
        list.push(entry.clone());
        entry
    }

    pub fn texts(&self, session_id: &str) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .get(session_id)
            .map(|list| list.iter().map(|e| e.text.clone()).collect())
            .unwrap_or_default()
    }

    pub fn texts_by(&self, session_id: &str, role: Role) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .get(session_id)
            .map(|list| list.iter().filter(|e| e.role == role).map(|e| e.text.clone()).collect())
            .unwrap_or_default()
    }

    pub fn append_count(&self) -> usize {
        self.appends.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MemoryStore for RecordingMemory {
    async fn append(&self, session_id: &str, text: &str, role: Role) -> Result<MemoryEntry, MemoryError> {
        self.appends.fetch_add(1, Ordering::SeqCst);
        Ok(self.push(session_id, role, text))
    }

    async fn recent(&self, session_id: &str, limit: usize) -> Result<Vec<MemoryEntry>, MemoryError> {
        let entries = self.entries.lock().unwrap();
        let list = entries.get(session_id).cloned().unwrap_or_default();
        let skip = list.len().saturating_sub(limit);
        Ok(list.into_iter().skip(skip).collect())
    }

    async fn clear(&self, session_id: &str) -> Result<usize, MemoryError> {
        Ok(self.entries.lock().unwrap().remove(session_id).map_or(0, |l| l.len()))
    }
}

#[derive(Default)]
struct TranscriptionState {
    sender: Mutex<Option<TranscriptSender>>,
    audio: Mutex<Vec<Vec<u8>>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
    dead: AtomicBool,
    open_error: Mutex<Option<String>>,
}

/// Transcription double: tests play the recognizer by calling `say`.
#[derive(Clone, Default)]
pub struct ScriptedTranscription {
    state: Arc<TranscriptionState>,
}

impl ScriptedTranscription {
    /// Every `open` fails with a connection error.
    pub fn failing(message: &str) -> Self {
        let transcription = Self::default();
        *transcription.state.open_error.lock().unwrap() = Some(message.to_string());
        transcription
    }

    /// Deliver a final transcript, as the recognizer would.
    pub fn say(&self, text: &str) -> Result<(), PushError> {
        match self.state.sender.lock().unwrap().as_ref() {
            Some(sender) => sender.push(TranscriptEvent::final_text(text)),
            None => Err(PushError::Closed),
        }
    }

    /// Simulate the upstream connection dropping.
    pub fn disconnect(&self) {
        self.state.dead.store(true, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.state.sender.lock().unwrap().is_some()
    }

    pub fn audio_received(&self) -> Vec<Vec<u8>> {
        self.state.audio.lock().unwrap().clone()
    }

    pub fn open_count(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TranscriptionProvider for ScriptedTranscription {
    async fn open(
        &self,
        _options: &TranscriptionOptions,
        transcripts: TranscriptSender,
    ) -> Result<Box<dyn TranscriptionSource>, TranscriptionError> {
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.state.open_error.lock().unwrap().clone() {
            return Err(TranscriptionError::Connect(message));
        }
        *self.state.sender.lock().unwrap() = Some(transcripts);
        Ok(Box::new(ScriptedSource {
            state: self.state.clone(),
            closed: false,
        }))
    }
}

struct ScriptedSource {
    state: Arc<TranscriptionState>,
    closed: bool,
}

#[async_trait]
impl TranscriptionSource for ScriptedSource {
    async fn send_audio(&mut self, chunk: Vec<u8>) -> Result<(), TranscriptionError> {
        if self.closed || self.state.dead.load(Ordering::SeqCst) {
            return Err(TranscriptionError::Closed);
        }
        self.state.audio.lock().unwrap().push(chunk);
        Ok(())
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        self.state.sender.lock().unwrap().take();
    }
}
