//! # Response Pipeline
//!
//! One user turn, from accepted transcript to spoken reply:
//!
//! ```text
//! Fetch ──► Reason ──► Synthesize ──► Terminal
//!   │          │            │
//!   └──────────┴────────────┴──► Cancelled (interrupt or teardown)
//! ```
//!
//! ## Stages:
//! - **Fetch**: recent conversation (and, if enabled, related older memories)
//! - **Reason**: the reasoning call runs as its own task so it can be dropped
//!   the moment the turn is cancelled. Failures become a spoken fallback reply.
//! - **Synthesize**: the reply is cleaned for speech and streamed to the peer
//!   chunk by chunk from a separate synthesis task, bracketed by `tts_start`
//!   and `tts_end` (or `tts_error`).
//!
//! ## Cancellation:
//! Every await races the turn's cancellation token, and the interruption
//! signal is checked between stages and before each audio chunk. A cancelled
//! turn sends nothing further and writes nothing to memory. The agent reply is
//! committed to memory only once it has been fully delivered, so an
//! interrupted reply leaves no trace in the conversation history.

use crate::error::{ReasoningError, SynthesisError};
use crate::services::{ReasoningContext, Role, Services, SpeechSynthesizer, VoiceConfig};
use crate::voice::interrupt::InterruptionSignal;
use crate::voice::protocol::{PeerSink, ServerMessage};
use crate::voice::speech_text::prepare_for_speech;
use crate::voice::tasks::{ActiveTask, ActiveTasks};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const STALE_SYNTHESIS_GRACE: Duration = Duration::from_millis(500);

pub const FALLBACK_REPLY: &str = "I'm sorry, I encountered an error. Please try again.";
pub const RATE_LIMITED_REPLY: &str = "I'm currently experiencing high demand. Please try again in a few minutes!";

/// Reply spoken in place of a failed reasoning call.
pub fn fallback_reply(error: &ReasoningError) -> &'static str {
    match error {
        ReasoningError::RateLimited => RATE_LIMITED_REPLY,
        _ => FALLBACK_REPLY,
    }
}

/// One accepted user utterance and the response generated for it.
#[derive(Debug, Clone)]
pub struct PipelineTurn {
    pub turn_id: u64,
    pub user_text: String,
    pub started_at: DateTime<Utc>,
    pub cancel: CancellationToken,
}

impl PipelineTurn {
    pub fn new(turn_id: u64, user_text: impl Into<String>) -> Self {
        Self {
            turn_id,
            user_text: user_text.into(),
            started_at: Utc::now(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStage {
    Fetch,
    Reason,
    Synthesize,
    Terminal,
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The reply (real or fallback) was delivered; `spoken` is false when
    /// synthesis failed or was skipped.
    Completed { fallback: bool, spoken: bool },
    /// Cancelled while in the given stage; nothing further was sent.
    Cancelled(TurnStage),
}

/// Per-turn tunables, fixed for the lifetime of a session.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub history_limit: usize,
    pub relevant_memory_limit: usize,
    /// History entries forwarded to reasoning, out of the `history_limit` fetched
    pub history_window: usize,
    pub temperature: f32,
    pub voice: VoiceConfig,
    pub max_speech_chars: usize,
    pub max_speech_sentences: usize,
}

/// How the synthesis task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SpeechOutcome {
    Completed { chunks: usize },
    Failed(String),
    Interrupted,
}

/// Runs turns for one session. Shared by every turn of that session.
pub struct ResponsePipeline {
    conversation_id: String,
    services: Services,
    peer: PeerSink,
    signal: Arc<InterruptionSignal>,
    tasks: Arc<ActiveTasks>,
    settings: PipelineSettings,
}

impl ResponsePipeline {
    pub fn new(
        conversation_id: impl Into<String>,
        services: Services,
        peer: PeerSink,
        signal: Arc<InterruptionSignal>,
        tasks: Arc<ActiveTasks>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            services,
            peer,
            signal,
            tasks,
            settings,
        }
    }

    fn halted(&self, turn: &PipelineTurn) -> bool {
        turn.cancel_requested() || self.signal.is_raised()
    }

    /// Drive `turn` to Terminal or to cancellation.
    pub async fn run(&self, turn: PipelineTurn) -> TurnOutcome {
        let outcome = self.execute(&turn).await;
        match &outcome {
            TurnOutcome::Cancelled(stage) => {
                debug!(turn_id = turn.turn_id, ?stage, "turn cancelled");
            }
            TurnOutcome::Completed { fallback, spoken } => {
                let elapsed = Utc::now() - turn.started_at;
                info!(
                    turn_id = turn.turn_id,
                    fallback,
                    spoken,
                    elapsed_ms = elapsed.num_milliseconds(),
                    "turn completed"
                );
            }
        }
        outcome
    }

    async fn execute(&self, turn: &PipelineTurn) -> TurnOutcome {
        // Fetch
        if self.halted(turn) {
            return TurnOutcome::Cancelled(TurnStage::Fetch);
        }
        let context = match self.fetch_context(turn).await {
            Some(context) => context,
            None => return TurnOutcome::Cancelled(TurnStage::Fetch),
        };

        // Reason
        let result = tokio::select! {
            biased;
            _ = turn.cancel.cancelled() => return TurnOutcome::Cancelled(TurnStage::Reason),
            result = self.reason(turn, context) => result,
        };
        let Some(result) = result else {
            return TurnOutcome::Cancelled(TurnStage::Reason);
        };
        if self.halted(turn) {
            return TurnOutcome::Cancelled(TurnStage::Reason);
        }

        let (reply, fallback, fatal) = match result {
            Ok(reply) => (reply, false, false),
            Err(err) => {
                warn!(turn_id = turn.turn_id, "reasoning failed: {}", err);
                (fallback_reply(&err).to_string(), true, err.is_fatal())
            }
        };

        if self.peer.send(ServerMessage::AgentResponse { text: reply.clone() }).is_err() {
            return TurnOutcome::Cancelled(TurnStage::Reason);
        }

        if fatal {
            // Nothing downstream can succeed; keep the notice and stop here.
            if !self.persist_reply(turn, &reply).await {
                return TurnOutcome::Cancelled(TurnStage::Reason);
            }
            return TurnOutcome::Completed { fallback, spoken: false };
        }

        // Synthesize
        if self.halted(turn) {
            return TurnOutcome::Cancelled(TurnStage::Synthesize);
        }
        let speech = self.speak(turn, &reply).await;
        let spoken = match speech {
            SpeechOutcome::Interrupted => return TurnOutcome::Cancelled(TurnStage::Synthesize),
            _ if self.halted(turn) => return TurnOutcome::Cancelled(TurnStage::Synthesize),
            SpeechOutcome::Completed { chunks } => {
                debug!(turn_id = turn.turn_id, chunks, "speech delivered");
                true
            }
            SpeechOutcome::Failed(_) => false,
        };

        // Terminal
        if !self.persist_reply(turn, &reply).await {
            return TurnOutcome::Cancelled(TurnStage::Terminal);
        }
        let closing = match speech {
            SpeechOutcome::Failed(message) => ServerMessage::TtsError { message },
            _ => ServerMessage::TtsEnd,
        };
        let _ = self.peer.send(closing);

        TurnOutcome::Completed { fallback, spoken }
    }

    /// Gather history and related memories. Store failures degrade to an empty
    /// context; `None` means the turn was cancelled.
    async fn fetch_context(&self, turn: &PipelineTurn) -> Option<ReasoningContext> {
        let memory = &self.services.memory;

        let history = tokio::select! {
            biased;
            _ = turn.cancel.cancelled() => return None,
            history = memory.recent(&self.conversation_id, self.settings.history_limit) => history,
        };
        let history = history.unwrap_or_else(|err| {
            warn!(turn_id = turn.turn_id, "history unavailable: {}", err);
            Vec::new()
        });

        let mut relevant = Vec::new();
        if self.settings.relevant_memory_limit > 0 {
            let found = tokio::select! {
                biased;
                _ = turn.cancel.cancelled() => return None,
                found = memory.relevant(
                    &self.conversation_id,
                    &turn.user_text,
                    self.settings.relevant_memory_limit,
                ) => found,
            };
            match found {
                Ok(entries) => {
                    relevant = entries
                        .into_iter()
                        .filter(|entry| !history.iter().any(|h| h.id == entry.id))
                        .collect();
                }
                Err(err) => warn!(turn_id = turn.turn_id, "related memories unavailable: {}", err),
            }
        }

        if self.halted(turn) {
            return None;
        }
        Some(ReasoningContext {
            history,
            relevant,
            history_window: Some(self.settings.history_window),
            temperature: Some(self.settings.temperature),
        })
    }

    /// Run the reasoning call as its own task; `None` when it was cancelled.
    async fn reason(
        &self,
        turn: &PipelineTurn,
        context: ReasoningContext,
    ) -> Option<Result<String, ReasoningError>> {
        let reasoning = self.services.reasoning.clone();
        let text = turn.user_text.clone();
        let mut call = tokio::spawn(async move { reasoning.reason(&text, &context).await });

        let joined = tokio::select! {
            biased;
            _ = turn.cancel.cancelled() => {
                call.abort();
                return None;
            }
            joined = &mut call => joined,
        };

        match joined {
            Ok(result) => Some(result),
            Err(err) if err.is_cancelled() => None,
            Err(err) => Some(Err(ReasoningError::Transport(format!("reasoning task failed: {err}")))),
        }
    }

    /// Stream the spoken form of `reply` through the synthesis slot.
    async fn speak(&self, turn: &PipelineTurn, reply: &str) -> SpeechOutcome {
        let text = prepare_for_speech(
            reply,
            self.settings.max_speech_chars,
            self.settings.max_speech_sentences,
        );

        if self.peer.send(ServerMessage::TtsStart).is_err() {
            return SpeechOutcome::Interrupted;
        }

        let token = turn.cancel.child_token();
        let (done_tx, done_rx) = oneshot::channel();
        let stream = SpeechStream {
            synthesizer: self.services.synthesis.clone(),
            voice: self.settings.voice.clone(),
            peer: self.peer.clone(),
            signal: self.signal.clone(),
            cancel: token.clone(),
            turn_id: turn.turn_id,
        };
        let task = ActiveTask::spawn(turn.turn_id, token, async move {
            let outcome = stream.run(text).await;
            let _ = done_tx.send(outcome);
        });
        if let Some(stale) = self.tasks.synthesis.install(task) {
            stale.cancel_and_wait(STALE_SYNTHESIS_GRACE).await;
        }

        let outcome = tokio::select! {
            biased;
            _ = turn.cancel.cancelled() => return SpeechOutcome::Interrupted,
            outcome = done_rx => outcome.unwrap_or(SpeechOutcome::Interrupted),
        };

        // The synthesis task has reported; wait for it to exit so the slot is
        // empty before this turn ends.
        if let Some(task) = self.tasks.synthesis.take() {
            task.join().await;
        }
        outcome
    }

    async fn persist_reply(&self, turn: &PipelineTurn, reply: &str) -> bool {
        let stored = tokio::select! {
            biased;
            _ = turn.cancel.cancelled() => return false,
            stored = self.services.memory.append(&self.conversation_id, reply, Role::Agent) => stored,
        };
        if let Err(err) = stored {
            warn!(turn_id = turn.turn_id, "could not store agent reply: {}", err);
        }
        true
    }
}

/// The synthesis sub-task of one turn.
struct SpeechStream {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    voice: VoiceConfig,
    peer: PeerSink,
    signal: Arc<InterruptionSignal>,
    cancel: CancellationToken,
    turn_id: u64,
}

impl SpeechStream {
    fn halted(&self) -> bool {
        self.cancel.is_cancelled() || self.signal.is_raised()
    }

    async fn run(self, text: String) -> SpeechOutcome {
        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return SpeechOutcome::Interrupted,
            opened = self.synthesizer.synthesize(&text, &self.voice) => opened,
        };
        let mut audio = match opened {
            Ok(audio) => audio,
            Err(err) => return self.failed(err),
        };

        let mut chunks = 0;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return SpeechOutcome::Interrupted,
                next = audio.next() => next,
            };
            match next {
                None => return SpeechOutcome::Completed { chunks },
                Some(Ok(chunk)) => {
                    if self.halted() {
                        return SpeechOutcome::Interrupted;
                    }
                    if chunk.is_empty() {
                        continue;
                    }
                    if self.peer.send_audio(chunk).is_err() {
                        return SpeechOutcome::Interrupted;
                    }
                    chunks += 1;
                }
                Some(Err(err)) => return self.failed(err),
            }
        }
    }

    fn failed(&self, err: SynthesisError) -> SpeechOutcome {
        warn!(turn_id = self.turn_id, "speech synthesis failed: {}", err);
        SpeechOutcome::Failed(err.to_string())
    }
}
