//! # Voice Session Controller
//!
//! Owns one client connection from `ready` to close.
//!
//! ## Tasks per session:
//! - **Ingest loop** (runs inside [`SessionController::run`]): reads client
//!   frames, answers `ping`, ends on `stop`, forwards audio to the
//!   transcription source while it is live.
//! - **Queue consumer**: pops final transcripts and runs the turn-start
//!   sequence for each.
//! - **Pipeline task**: at most one [`PipelineTurn`] at a time.
//! - **Synthesis task**: at most one, owned by the running turn.
//!
//! ## Turn start:
//! 1. Interrupt the active response, if any, and wait for it to unwind
//! 2. Send `transcription` with the utterance
//! 3. Append the utterance to memory
//! 4. Spawn the pipeline task and record it as active
//!
//! A final transcript that lands inside the debounce window while a response
//! is still active is logged and dropped, so a single utterance split into
//! several segments never yields two concurrent responses.
//!
//! ## Teardown:
//! On `stop` or disconnect: stop the consumer, cancel and await the pipeline
//! and synthesis tasks, close the transcription source, close the connection.
//! Teardown runs once; later calls return immediately.

use crate::config::AppConfig;
use crate::error::TranscriptionError;
use crate::services::{Role, Services, TranscriptionOptions, TranscriptionSource, VoiceConfig};
use crate::voice::interrupt::{InterruptOutcome, InterruptionCoordinator, InterruptionSignal};
use crate::voice::pipeline::{PipelineSettings, PipelineTurn, ResponsePipeline};
use crate::voice::protocol::{ClientControl, Connection, Inbound, InboundFrame, PeerSink, ServerMessage};
use crate::voice::queue::{transcription_queue, Pop, TranscriptReceiver};
use crate::voice::tasks::{ActiveTask, ActiveTasks};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const READY_MESSAGE: &str = "Voice agent ready";

/// Session tunables, captured from configuration when the session starts.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub debounce: Duration,
    pub queue_poll: Duration,
    pub queue_capacity: usize,
    pub cancel_grace: Duration,
    pub transcription: TranscriptionOptions,
    pub pipeline: PipelineSettings,
}

impl SessionSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            debounce: config.debounce(),
            queue_poll: config.queue_poll_timeout(),
            queue_capacity: config.session.queue_capacity,
            cancel_grace: config.cancel_grace(),
            transcription: TranscriptionOptions::from(&config.transcription),
            pipeline: PipelineSettings {
                history_limit: config.session.history_limit,
                relevant_memory_limit: config.session.relevant_memory_limit,
                history_window: config.reasoning.history_window,
                temperature: config.reasoning.temperature,
                voice: VoiceConfig::from(&config.synthesis),
                max_speech_chars: config.synthesis.max_chars,
                max_speech_sentences: config.synthesis.max_sentences,
            },
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    ClientStop,
    Disconnected,
    SetupFailed,
}

/// What a finished session did, for logging and metrics.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: String,
    pub conversation_id: String,
    pub end: SessionEnd,
    pub turns: u64,
    pub interruptions: u64,
    pub duration: Duration,
}

/// Runs voice sessions against an injected collaborator set.
#[derive(Clone)]
pub struct SessionController {
    services: Services,
    settings: SessionSettings,
}

impl SessionController {
    pub fn new(services: Services, settings: SessionSettings) -> Self {
        Self { services, settings }
    }

    /// Serve one connection until the client stops or goes away.
    pub async fn run(&self, conversation_id: &str, connection: Connection) -> SessionSummary {
        let session_id = Uuid::new_v4().to_string();
        let span = info_span!("voice_session", %session_id, %conversation_id);
        self.serve(session_id, conversation_id.to_string(), connection)
            .instrument(span)
            .await
    }

    async fn serve(&self, session_id: String, conversation_id: String, connection: Connection) -> SessionSummary {
        let started = Instant::now();
        let Connection { mut inbound, peer } = connection;
        let (transcripts, queue) = transcription_queue(self.settings.queue_capacity);

        let source = match self
            .services
            .transcription
            .open(&self.settings.transcription, transcripts)
            .await
        {
            Ok(source) => source,
            Err(err) => {
                error!("failed to start transcription: {}", err);
                let _ = peer.send(ServerMessage::Error {
                    message: format!("Failed to start transcription: {err}"),
                });
                peer.close();
                return SessionSummary {
                    session_id,
                    conversation_id,
                    end: SessionEnd::SetupFailed,
                    turns: 0,
                    interruptions: 0,
                    duration: started.elapsed(),
                };
            }
        };

        let session = Arc::new(Session::new(
            session_id,
            conversation_id,
            self.services.clone(),
            peer,
            self.settings.clone(),
        ));
        let mut source = Some(source);

        let _ = session.peer.send(ServerMessage::Ready {
            message: READY_MESSAGE.to_string(),
        });
        info!("voice session ready");

        session.start_consumer(queue);
        let end = session.ingest(&mut inbound, &mut source).await;
        session.teardown(&mut source).await;

        let summary = session.summary(end, started.elapsed());
        info!(
            end = ?summary.end,
            turns = summary.turns,
            interruptions = summary.interruptions,
            duration_ms = summary.duration.as_millis() as u64,
            "voice session closed"
        );
        summary
    }
}

/// State of one live connection.
struct Session {
    id: String,
    conversation_id: String,
    services: Services,
    peer: PeerSink,
    settings: SessionSettings,
    tasks: Arc<ActiveTasks>,
    coordinator: InterruptionCoordinator,
    pipeline: Arc<ResponsePipeline>,
    turns: AtomicU64,
    stt_live: AtomicBool,
    shutdown: CancellationToken,
    consumer: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Session {
    fn new(
        id: String,
        conversation_id: String,
        services: Services,
        peer: PeerSink,
        settings: SessionSettings,
    ) -> Self {
        let signal = Arc::new(InterruptionSignal::new());
        let tasks = Arc::new(ActiveTasks::default());
        let coordinator = InterruptionCoordinator::new(
            settings.debounce,
            settings.cancel_grace,
            signal.clone(),
            tasks.clone(),
            peer.clone(),
        );
        let pipeline = Arc::new(ResponsePipeline::new(
            conversation_id.clone(),
            services.clone(),
            peer.clone(),
            signal,
            tasks.clone(),
            settings.pipeline.clone(),
        ));

        Self {
            id,
            conversation_id,
            services,
            peer,
            settings,
            tasks,
            coordinator,
            pipeline,
            turns: AtomicU64::new(0),
            stt_live: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
            consumer: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn start_consumer(self: &Arc<Self>, queue: TranscriptReceiver) {
        let session = self.clone();
        let handle = tokio::spawn(
            async move { session.consume(queue).await }.instrument(tracing::Span::current()),
        );
        *self.consumer.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Read client frames until `stop` or disconnect.
    async fn ingest(
        &self,
        inbound: &mut Inbound,
        source: &mut Option<Box<dyn TranscriptionSource>>,
    ) -> SessionEnd {
        while let Some(frame) = inbound.recv().await {
            match frame {
                InboundFrame::Audio(chunk) => self.forward_audio(source, chunk).await,
                InboundFrame::Text(text) => match ClientControl::decode(&text) {
                    Some(ClientControl::Stop) => {
                        info!("client requested stop");
                        return SessionEnd::ClientStop;
                    }
                    Some(ClientControl::Ping) => {
                        let _ = self.peer.send(ServerMessage::Pong);
                    }
                    None => debug!("ignoring unrecognized control frame"),
                },
                InboundFrame::Close => return SessionEnd::Disconnected,
            }
        }
        SessionEnd::Disconnected
    }

    async fn forward_audio(&self, source: &mut Option<Box<dyn TranscriptionSource>>, chunk: Vec<u8>) {
        if !self.stt_live.load(Ordering::SeqCst) {
            return;
        }
        let Some(source) = source.as_mut() else {
            return;
        };
        match source.send_audio(chunk).await {
            Ok(()) => {}
            Err(TranscriptionError::Closed) => {
                warn!("transcription source closed, dropping further audio");
                self.stt_live.store(false, Ordering::SeqCst);
            }
            Err(err) => warn!("failed to forward audio: {}", err),
        }
    }

    /// Sequential consumer of final transcripts.
    async fn consume(self: Arc<Self>, mut queue: TranscriptReceiver) {
        loop {
            let popped = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                popped = queue.pop(self.settings.queue_poll) => popped,
            };
            self.tasks.reap_finished().await;

            match popped {
                Pop::Timeout => continue,
                Pop::Closed => {
                    warn!("transcription stream ended");
                    self.stt_live.store(false, Ordering::SeqCst);
                    break;
                }
                Pop::Event(event) => {
                    let text = event.text.trim();
                    if !event.is_final || text.is_empty() {
                        continue;
                    }
                    self.start_turn(text.to_string()).await;
                }
            }
        }
        debug!("transcript consumer stopped");
    }

    async fn start_turn(&self, text: String) {
        if self.coordinator.interrupt_if_active().await == InterruptOutcome::Debounced {
            // No new turn, but the words stay in the conversation for the next one
            info!(text = %text, "transcript arrived inside the debounce window of an active response, no new turn");
            if let Err(err) = self
                .services
                .memory
                .append(&self.conversation_id, &text, Role::User)
                .await
            {
                warn!("could not store debounced utterance: {}", err);
            }
            return;
        }
        self.tasks.reap_finished().await;
        if self.shutdown.is_cancelled() {
            return;
        }

        let turn_id = self.turns.fetch_add(1, Ordering::SeqCst) + 1;
        self.coordinator.begin_turn();
        info!(turn_id, "user: {}", text);

        if self.peer.send(ServerMessage::Transcription { text: text.clone() }).is_err() {
            return;
        }
        if let Err(err) = self
            .services
            .memory
            .append(&self.conversation_id, &text, Role::User)
            .await
        {
            warn!(turn_id, "could not store user utterance: {}", err);
        }

        let turn = PipelineTurn::new(turn_id, text);
        let cancel = turn.cancel.clone();
        let pipeline = self.pipeline.clone();
        let task = ActiveTask::spawn(
            turn_id,
            cancel,
            async move {
                pipeline.run(turn).await;
            }
            .instrument(tracing::Span::current()),
        );
        if let Some(previous) = self.tasks.pipeline.install(task) {
            previous.cancel_and_wait(self.settings.cancel_grace).await;
        }
    }

    /// Release everything the session holds. Only the first call does work.
    async fn teardown(&self, source: &mut Option<Box<dyn TranscriptionSource>>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shutdown.cancel();
        let consumer = self.consumer.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(mut consumer) = consumer {
            // The consumer may be mid interrupt, which is itself bounded by the grace.
            let bound = self.settings.cancel_grace * 3;
            if tokio::time::timeout(bound, &mut consumer).await.is_err() {
                warn!("transcript consumer did not stop in {:?}, aborting", bound);
                consumer.abort();
            }
        }

        self.coordinator.shutdown().await;

        if let Some(mut source) = source.take() {
            source.close().await;
        }
        self.stt_live.store(false, Ordering::SeqCst);
        self.peer.close();
        debug!(session_id = %self.id, "session torn down");
    }

    fn summary(&self, end: SessionEnd, duration: Duration) -> SessionSummary {
        SessionSummary {
            session_id: self.id.clone(),
            conversation_id: self.conversation_id.clone(),
            end,
            turns: self.turns.load(Ordering::SeqCst),
            interruptions: self.coordinator.interruptions(),
            duration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReasoningError;
    use crate::services::TranscriptionProvider;
    use crate::voice::pipeline::FALLBACK_REPLY;
    use crate::voice::protocol::{inbound_channel, InboundSender, OutboundFrame};
    use crate::voice::testing::{
        services, MockReasoning, MockSynthesizer, RecordingMemory, ScriptedTranscription,
    };
    use tokio::sync::mpsc::UnboundedReceiver;

    const CONVERSATION: &str = "conv-42";

    fn settings() -> SessionSettings {
        SessionSettings {
            debounce: Duration::from_millis(500),
            queue_poll: Duration::from_millis(50),
            queue_capacity: 16,
            cancel_grace: Duration::from_millis(500),
            transcription: TranscriptionOptions {
                model: "nova-2".into(),
                language: "en-US".into(),
                punctuate: true,
                smart_format: true,
                interim_results: true,
                vad_events: true,
                endpointing_ms: 300,
            },
            pipeline: PipelineSettings {
                history_limit: 20,
                relevant_memory_limit: 0,
                history_window: 10,
                temperature: 0.7,
                voice: VoiceConfig {
                    model: "aura-asteria-en".into(),
                    encoding: "linear16".into(),
                    sample_rate: 24000,
                },
                max_speech_chars: 1500,
                max_speech_sentences: 5,
            },
        }
    }

    struct Client {
        tx: InboundSender,
        rx: UnboundedReceiver<OutboundFrame>,
        run: JoinHandle<SessionSummary>,
        transcription: ScriptedTranscription,
        memory: Arc<RecordingMemory>,
        seen: Vec<OutboundFrame>,
    }

    impl Client {
        /// Receive frames until one matches, returning it. Panics after 3s.
        async fn until(&mut self, wanted: impl Fn(&OutboundFrame) -> bool) -> OutboundFrame {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
            loop {
                let frame = tokio::time::timeout_at(deadline, self.rx.recv())
                    .await
                    .expect("timed out waiting for frame")
                    .expect("outbound channel closed");
                self.seen.push(frame.clone());
                if wanted(&frame) {
                    return frame;
                }
            }
        }

        async fn until_message(&mut self, message: ServerMessage) {
            self.until(|f| *f == OutboundFrame::Message(message.clone())).await;
        }

        async fn ready(&mut self) {
            self.until(|f| matches!(f, OutboundFrame::Message(ServerMessage::Ready { .. }))).await;
        }

        /// Drain what is left after a short pause.
        async fn settle(&mut self, pause: Duration) {
            tokio::time::sleep(pause).await;
            while let Ok(frame) = self.rx.try_recv() {
                self.seen.push(frame);
            }
        }

        fn kinds(&self) -> Vec<&'static str> {
            self.seen
                .iter()
                .map(|f| match f {
                    OutboundFrame::Message(m) => m.kind(),
                    OutboundFrame::Audio(_) => "audio",
                    OutboundFrame::Close => "close",
                })
                .collect()
        }

        fn count(&self, kind: &str) -> usize {
            self.kinds().iter().filter(|k| **k == kind).count()
        }

        async fn stop(self) -> (SessionSummary, Vec<OutboundFrame>, ScriptedTranscription, Arc<RecordingMemory>) {
            let Client {
                tx,
                mut rx,
                run,
                transcription,
                memory,
                mut seen,
            } = self;
            let _ = tx.push(InboundFrame::Text(r#"{"type":"stop"}"#.into()));
            let summary = tokio::time::timeout(Duration::from_secs(5), run)
                .await
                .expect("session did not stop")
                .expect("session panicked");
            while let Ok(frame) = rx.try_recv() {
                seen.push(frame);
            }
            (summary, seen, transcription, memory)
        }
    }

    fn start(reasoning: MockReasoning, synthesis: MockSynthesizer) -> Client {
        start_with(ScriptedTranscription::default(), reasoning, synthesis)
    }

    fn start_with(transcription: ScriptedTranscription, reasoning: MockReasoning, synthesis: MockSynthesizer) -> Client {
        let memory = Arc::new(RecordingMemory::default());
        let controller = SessionController::new(
            services(transcription.clone(), reasoning, memory.clone(), synthesis),
            settings(),
        );
        let (tx, inbound) = inbound_channel(64);
        let (peer, rx) = PeerSink::channel();
        let run = tokio::spawn(async move { controller.run(CONVERSATION, Connection { inbound, peer }).await });
        Client {
            tx,
            rx,
            run,
            transcription,
            memory,
            seen: Vec::new(),
        }
    }

    fn message(message: ServerMessage) -> OutboundFrame {
        OutboundFrame::Message(message)
    }

    #[tokio::test]
    async fn test_scenario_a_single_turn_ordering() {
        let mut client = start(
            MockReasoning::replying("Your order shipped yesterday."),
            MockSynthesizer::chunks(vec![vec![1, 1], vec![2, 2]]),
        );
        client.ready().await;
        client.transcription.say("What is my order status?").unwrap();
        client.until_message(ServerMessage::TtsEnd).await;

        let (summary, frames, _, memory) = client.stop().await;
        assert_eq!(
            frames[..7],
            [
                message(ServerMessage::Ready {
                    message: READY_MESSAGE.into()
                }),
                message(ServerMessage::Transcription {
                    text: "What is my order status?".into()
                }),
                message(ServerMessage::AgentResponse {
                    text: "Your order shipped yesterday.".into()
                }),
                message(ServerMessage::TtsStart),
                OutboundFrame::Audio(vec![1, 1]),
                OutboundFrame::Audio(vec![2, 2]),
                message(ServerMessage::TtsEnd),
            ]
        );
        assert!(!frames.contains(&message(ServerMessage::Interrupt)));
        assert_eq!(frames.last(), Some(&OutboundFrame::Close));
        assert_eq!(
            memory.texts(CONVERSATION),
            vec!["What is my order status?".to_string(), "Your order shipped yesterday.".to_string()]
        );
        assert_eq!(summary.end, SessionEnd::ClientStop);
        assert_eq!(summary.turns, 1);
        assert_eq!(summary.interruptions, 0);
    }

    #[tokio::test]
    async fn test_scenario_b_barge_in_during_synthesis() {
        let synthesis = MockSynthesizer::paced(vec![vec![1]; 20], Duration::from_millis(100));
        let mut client = start(MockReasoning::echo(), synthesis);
        client.ready().await;

        client.transcription.say("Tell me about my order").unwrap();
        client.until(|f| matches!(f, OutboundFrame::Audio(_))).await;
        tokio::time::sleep(Duration::from_millis(600)).await;
        client.transcription.say("Actually cancel that").unwrap();

        client
            .until_message(ServerMessage::Transcription {
                text: "Actually cancel that".into(),
            })
            .await;
        client
            .until_message(ServerMessage::AgentResponse {
                text: "reply to: Actually cancel that".into(),
            })
            .await;

        let kinds = client.kinds();
        let interrupt = kinds.iter().position(|k| *k == "interrupt").expect("no interrupt");
        let second = kinds.iter().rposition(|k| *k == "transcription").unwrap();
        assert!(interrupt < second);
        // The first response was cut short: no tts_end before the interrupt.
        assert!(!kinds[..interrupt].contains(&"tts_end"));
        let audio_before = kinds[..interrupt].iter().filter(|k| **k == "audio").count();
        assert!(audio_before >= 1 && audio_before < 20);

        let (summary, _, _, memory) = client.stop().await;
        assert_eq!(summary.interruptions, 1);
        // The interrupted reply never reached memory.
        assert!(memory
            .texts_by(CONVERSATION, Role::Agent)
            .iter()
            .all(|t| t != "reply to: Tell me about my order"));
        assert_eq!(
            memory.texts_by(CONVERSATION, Role::User),
            vec!["Tell me about my order".to_string(), "Actually cancel that".to_string()]
        );
    }

    #[tokio::test]
    async fn test_scenario_c_debounce_swallows_rapid_transcript_but_keeps_its_text() {
        let reasoning = MockReasoning::echo().with_delay(Duration::from_secs(2));
        let mut client = start(reasoning.clone(), MockSynthesizer::chunks(vec![vec![1]]));
        client.ready().await;

        client.transcription.say("first").unwrap();
        client
            .until_message(ServerMessage::Transcription { text: "first".into() })
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        client.transcription.say("second").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        client.transcription.say("third").unwrap();
        client.settle(Duration::from_millis(300)).await;

        assert_eq!(client.count("interrupt"), 1);
        assert_eq!(client.count("transcription"), 2);
        assert!(!client
            .seen
            .contains(&message(ServerMessage::Transcription { text: "third".into() })));
        assert_eq!(client.count("agent_response"), 0);

        let (summary, _, _, memory) = client.stop().await;
        assert_eq!(summary.turns, 2);
        assert_eq!(summary.interruptions, 1);
        // The swallowed segment starts no turn but is still remembered
        assert_eq!(
            memory.texts_by(CONVERSATION, Role::User),
            vec!["first".to_string(), "second".to_string(), "third".to_string()]
        );
        assert_eq!(memory.append_count(), 3);
    }

    #[tokio::test]
    async fn test_scenario_d_reasoning_failure_still_speaks_fallback() {
        let mut client = start(
            MockReasoning::failing(ReasoningError::Transport("connection reset".into())),
            MockSynthesizer::chunks(vec![vec![5]]),
        );
        client.ready().await;
        client.transcription.say("hello?").unwrap();
        client.until_message(ServerMessage::TtsEnd).await;

        assert_eq!(
            client.kinds(),
            vec!["ready", "transcription", "agent_response", "tts_start", "audio", "tts_end"]
        );
        assert_eq!(
            client.seen[2],
            message(ServerMessage::AgentResponse {
                text: FALLBACK_REPLY.into()
            })
        );
        let (_, _, _, memory) = client.stop().await;
        assert_eq!(memory.texts_by(CONVERSATION, Role::Agent), vec![FALLBACK_REPLY.to_string()]);
    }

    #[tokio::test]
    async fn test_transcripts_spaced_past_debounce_each_interrupt() {
        let reasoning = MockReasoning::echo().with_delay(Duration::from_secs(3));
        let mut client = start(reasoning, MockSynthesizer::chunks(vec![]));
        client.ready().await;

        client.transcription.say("one").unwrap();
        client.until_message(ServerMessage::Transcription { text: "one".into() }).await;
        client.transcription.say("two").unwrap();
        client.until_message(ServerMessage::Transcription { text: "two".into() }).await;
        tokio::time::sleep(Duration::from_millis(600)).await;
        client.transcription.say("three").unwrap();
        client.until_message(ServerMessage::Transcription { text: "three".into() }).await;

        assert_eq!(client.count("interrupt"), 2);
        let (summary, _, _, _) = client.stop().await;
        assert_eq!(summary.interruptions, 2);
    }

    #[tokio::test]
    async fn test_transcript_after_completed_turn_sends_no_interrupt() {
        let mut client = start(MockReasoning::echo(), MockSynthesizer::chunks(vec![vec![1]]));
        client.ready().await;

        client.transcription.say("first").unwrap();
        client.until_message(ServerMessage::TtsEnd).await;
        client.transcription.say("second").unwrap();
        client
            .until_message(ServerMessage::AgentResponse {
                text: "reply to: second".into(),
            })
            .await;
        client.until_message(ServerMessage::TtsEnd).await;

        assert_eq!(client.count("interrupt"), 0);
        assert_eq!(client.count("tts_end"), 2);
        client.stop().await;
    }

    #[tokio::test]
    async fn test_ping_pong_and_malformed_control_frames() {
        let mut client = start(MockReasoning::echo(), MockSynthesizer::chunks(vec![]));
        client.ready().await;

        client.tx.push(InboundFrame::Text("definitely not json".into())).unwrap();
        client.tx.push(InboundFrame::Text(r#"{"type":"unknown"}"#.into())).unwrap();
        client.tx.push(InboundFrame::Text(r#"{"type":"ping"}"#.into())).unwrap();
        client.until_message(ServerMessage::Pong).await;

        assert_eq!(client.kinds(), vec!["ready", "pong"]);
        client.stop().await;
    }

    #[tokio::test]
    async fn test_audio_forwarded_only_while_source_is_live() {
        let mut client = start(MockReasoning::echo(), MockSynthesizer::chunks(vec![]));
        client.ready().await;

        client.tx.push(InboundFrame::Audio(vec![1, 2, 3])).unwrap();
        client.tx.push(InboundFrame::Audio(vec![4, 5])).unwrap();
        client.settle(Duration::from_millis(50)).await;
        client.transcription.disconnect();
        client.tx.push(InboundFrame::Audio(vec![6])).unwrap();
        client.tx.push(InboundFrame::Audio(vec![7])).unwrap();
        client.settle(Duration::from_millis(50)).await;

        let (_, _, transcription, _) = client.stop().await;
        assert_eq!(transcription.audio_received(), vec![vec![1, 2, 3], vec![4, 5]]);
    }

    #[tokio::test]
    async fn test_setup_failure_sends_error_then_closes() {
        let client = start_with(
            ScriptedTranscription::failing("401 Unauthorized"),
            MockReasoning::echo(),
            MockSynthesizer::chunks(vec![]),
        );
        let Client { mut rx, run, .. } = client;

        let summary = tokio::time::timeout(Duration::from_secs(2), run).await.unwrap().unwrap();
        assert_eq!(summary.end, SessionEnd::SetupFailed);

        match rx.recv().await {
            Some(OutboundFrame::Message(ServerMessage::Error { message })) => {
                assert!(message.contains("401 Unauthorized"))
            }
            other => panic!("expected error record, got {other:?}"),
        }
        assert_eq!(rx.recv().await, Some(OutboundFrame::Close));
    }

    #[tokio::test]
    async fn test_disconnect_mid_turn_tears_down_cleanly() {
        let synthesis = MockSynthesizer::paced(vec![vec![1]; 50], Duration::from_millis(50));
        let mut client = start(MockReasoning::echo(), synthesis);
        client.ready().await;
        client.transcription.say("keep talking").unwrap();
        client.until(|f| matches!(f, OutboundFrame::Audio(_))).await;

        client.tx.push(InboundFrame::Close).unwrap();
        let summary = tokio::time::timeout(Duration::from_secs(3), &mut client.run)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.end, SessionEnd::Disconnected);

        client.settle(Duration::from_millis(100)).await;
        assert_eq!(client.seen.last(), Some(&OutboundFrame::Close));
        assert_eq!(client.count("tts_end"), 0);
        assert_eq!(client.count("interrupt"), 0);
        assert_eq!(client.transcription.close_count(), 1);
        assert!(!client.transcription.is_open());
        assert!(client.memory.texts_by(CONVERSATION, Role::Agent).is_empty());
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let transcription = ScriptedTranscription::default();
        let memory = Arc::new(RecordingMemory::default());
        let (peer, mut rx) = PeerSink::channel();
        let session = Arc::new(Session::new(
            "s-1".into(),
            CONVERSATION.into(),
            services(
                transcription.clone(),
                MockReasoning::echo().with_delay(Duration::from_secs(5)),
                memory,
                MockSynthesizer::chunks(vec![]),
            ),
            peer,
            settings(),
        ));
        let (transcripts, queue) = transcription_queue(4);
        let mut source = Some(
            transcription
                .open(&settings().transcription, transcripts)
                .await
                .unwrap(),
        );
        session.start_consumer(queue);
        session.start_turn("hello".into()).await;
        assert!(session.tasks.any_active());

        session.teardown(&mut source).await;
        session.teardown(&mut source).await;

        assert!(!session.tasks.any_active());
        assert_eq!(transcription.close_count(), 1);
        let mut closes = 0;
        while let Ok(frame) = rx.try_recv() {
            if frame == OutboundFrame::Close {
                closes += 1;
            }
        }
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn test_at_most_one_pipeline_across_rapid_turns() {
        let reasoning = MockReasoning::echo().with_delay(Duration::from_millis(300));
        let mut client = start(reasoning.clone(), MockSynthesizer::paced(vec![vec![1]; 5], Duration::from_millis(50)));
        client.ready().await;

        for text in ["a", "b", "c", "d"] {
            client.transcription.say(text).unwrap();
            tokio::time::sleep(Duration::from_millis(550)).await;
        }
        client.settle(Duration::from_millis(1500)).await;

        // Every tts_start is closed (by tts_end or an interrupt) before the next opens.
        let mut open = false;
        for kind in client.kinds() {
            match kind {
                "tts_start" => {
                    assert!(!open, "two synthesis brackets open at once");
                    open = true;
                }
                "tts_end" | "interrupt" => open = false,
                _ => {}
            }
        }
        client.stop().await;
    }

    #[test]
    fn test_settings_follow_runtime_reasoning_updates() {
        let mut config = AppConfig::default();
        config
            .update_from_json(r#"{"reasoning": {"history_window": 1, "temperature": 0.2}}"#)
            .unwrap();
        let settings = SessionSettings::from_config(&config);
        assert_eq!(settings.pipeline.history_window, 1);
        assert_eq!(settings.pipeline.temperature, 0.2);
    }
}
