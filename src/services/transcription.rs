//! # Deepgram Live Transcription
//!
//! One WebSocket per voice session to Deepgram's `/v1/listen` endpoint.
//!
//! ## Connection tasks:
//! - **Writer**: forwards microphone audio as binary frames. While no audio
//!   arrives it sends `KeepAlive` so Deepgram does not time the stream out,
//!   and on close it sends `CloseStream` so pending audio is still finalized.
//! - **Reader**: parses `Results` messages and pushes final, non-empty
//!   transcripts onto the session's queue. Interim results, `SpeechStarted`
//!   and metadata are dropped here. Voice activity alone never interrupts a
//!   response; only transcribed speech does.

use crate::config::TranscriptionConfig;
use crate::error::TranscriptionError;
use crate::services::{TranscriptionOptions, TranscriptionProvider, TranscriptionSource};
use crate::voice::queue::{PushError, TranscriptEvent, TranscriptSender};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

const AUTHORIZATION_HEADER: &str = "Authorization";
const KEEPALIVE_MESSAGE: &str = r#"{"type":"KeepAlive"}"#;
const CLOSE_STREAM_MESSAGE: &str = r#"{"type":"CloseStream"}"#;
const AUDIO_BUFFER_FRAMES: usize = 64;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct DeepgramTranscriber {
    api_key: String,
    url: String,
    keepalive: Duration,
}

impl DeepgramTranscriber {
    pub fn new(config: &TranscriptionConfig) -> Self {
        Self {
            api_key: config.api_key.clone(),
            url: config.url.clone(),
            keepalive: Duration::from_secs(config.keepalive_secs.max(1)),
        }
    }

    fn build_request(&self, options: &TranscriptionOptions) -> Result<Request, TranscriptionError> {
        let mut request = listen_url(&self.url, options)
            .into_client_request()
            .map_err(|e| TranscriptionError::Connect(e.to_string()))?;
        let token = format!("Token {}", self.api_key)
            .parse()
            .map_err(|_| TranscriptionError::Connect("API key is not a valid header value".into()))?;
        request.headers_mut().insert(AUTHORIZATION_HEADER, token);
        Ok(request)
    }
}

/// Streaming endpoint URL with the session's recognition parameters.
pub fn listen_url(base: &str, options: &TranscriptionOptions) -> String {
    format!(
        "{}?model={}&language={}&punctuate={}&smart_format={}&interim_results={}&vad_events={}&endpointing={}",
        base,
        options.model,
        options.language,
        options.punctuate,
        options.smart_format,
        options.interim_results,
        options.vad_events,
        options.endpointing_ms
    )
}

#[async_trait]
impl TranscriptionProvider for DeepgramTranscriber {
    async fn open(
        &self,
        options: &TranscriptionOptions,
        transcripts: TranscriptSender,
    ) -> Result<Box<dyn TranscriptionSource>, TranscriptionError> {
        if self.api_key.is_empty() {
            return Err(TranscriptionError::NotConfigured("DEEPGRAM_API_KEY is not set".into()));
        }

        let request = self.build_request(options)?;
        let (stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TranscriptionError::Connect(e.to_string()))?;
        info!(model = %options.model, language = %options.language, "transcription stream opened");

        let (write, read) = stream.split();
        let (commands, command_rx) = mpsc::channel(AUDIO_BUFFER_FRAMES);

        let writer = tokio::spawn(write_loop(write, command_rx, self.keepalive));
        let reader = tokio::spawn(read_loop(read, transcripts));

        Ok(Box::new(DeepgramSource {
            commands,
            writer: Some(writer),
            reader: Some(reader),
            closed: false,
        }))
    }
}

enum WriterCommand {
    Audio(Vec<u8>),
    Close,
}

async fn write_loop<S>(mut write: S, mut commands: mpsc::Receiver<WriterCommand>, keepalive: Duration)
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    loop {
        let command = match tokio::time::timeout(keepalive, commands.recv()).await {
            Ok(command) => command,
            Err(_) => {
                if let Err(e) = write.send(Message::Text(KEEPALIVE_MESSAGE.to_string())).await {
                    warn!("transcription keepalive failed: {}", e);
                    break;
                }
                continue;
            }
        };

        match command {
            Some(WriterCommand::Audio(chunk)) => {
                if let Err(e) = write.send(Message::Binary(chunk)).await {
                    warn!("failed to send audio to transcription: {}", e);
                    break;
                }
            }
            Some(WriterCommand::Close) | None => {
                if let Err(e) = write.send(Message::Text(CLOSE_STREAM_MESSAGE.to_string())).await {
                    debug!("CloseStream not delivered: {}", e);
                }
                let _ = write.close().await;
                break;
            }
        }
    }
    debug!("transcription writer stopped");
}

async fn read_loop<S, E>(mut read: S, transcripts: TranscriptSender)
where
    S: futures_util::Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    while let Some(message) = read.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                warn!("transcription stream error: {}", e);
                break;
            }
        };

        match message {
            Message::Text(text) => {
                let Some(event) = parse_listen_message(&text) else {
                    continue;
                };
                if !event.is_final {
                    continue;
                }
                debug!("final transcript: {}", event.text);
                match transcripts.push(event) {
                    Ok(()) => {}
                    Err(PushError::QueueFull) => warn!("transcription queue full, transcript dropped"),
                    Err(PushError::Closed) => break,
                }
            }
            Message::Close(frame) => {
                info!("transcription stream closed: {:?}", frame);
                break;
            }
            _ => {}
        }
    }
    debug!("transcription reader stopped");
}

#[derive(Debug, Deserialize)]
struct ListenMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    is_final: Option<bool>,
    #[serde(default)]
    channel: Option<ListenChannel>,
}

#[derive(Debug, Deserialize)]
struct ListenChannel {
    #[serde(default)]
    alternatives: Vec<ListenAlternative>,
}

#[derive(Debug, Deserialize)]
struct ListenAlternative {
    #[serde(default)]
    transcript: String,
}

/// Extract a transcript from a `Results` message. Everything else, and
/// results with an empty transcript, yield `None`.
fn parse_listen_message(text: &str) -> Option<TranscriptEvent> {
    let message: ListenMessage = serde_json::from_str(text).ok()?;
    if message.kind != "Results" {
        return None;
    }
    let transcript = message.channel?.alternatives.into_iter().next()?.transcript;
    let transcript = transcript.trim();
    if transcript.is_empty() {
        return None;
    }
    Some(TranscriptEvent {
        text: transcript.to_string(),
        is_final: message.is_final.unwrap_or(true),
    })
}

struct DeepgramSource {
    commands: mpsc::Sender<WriterCommand>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    closed: bool,
}

#[async_trait]
impl TranscriptionSource for DeepgramSource {
    async fn send_audio(&mut self, chunk: Vec<u8>) -> Result<(), TranscriptionError> {
        if self.closed {
            return Err(TranscriptionError::Closed);
        }
        self.commands
            .send(WriterCommand::Audio(chunk))
            .await
            .map_err(|_| TranscriptionError::Closed)
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.commands.send(WriterCommand::Close).await;

        if let Some(mut writer) = self.writer.take() {
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut writer).await.is_err() {
                writer.abort();
            }
        }
        // Deepgram flushes remaining results and then closes its side.
        if let Some(mut reader) = self.reader.take() {
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut reader).await.is_err() {
                reader.abort();
            }
        }
        info!("transcription stream closed");
    }
}

impl Drop for DeepgramSource {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}
