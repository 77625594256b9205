//! # Voice WebSocket Protocol
//!
//! One socket carries two kinds of frames:
//! - **Text frames**: JSON control records with a `type` discriminant
//! - **Binary frames**: raw audio (client → server: microphone audio for
//!   transcription; server → client: synthesized speech)
//!
//! ## Server → Client records:
//! | type           | payload   | when                                  |
//! |----------------|-----------|---------------------------------------|
//! | ready          | message   | transcription source is up            |
//! | transcription  | text      | a final transcript starts a turn      |
//! | agent_response | text      | reasoning finished (or fell back)     |
//! | tts_start      |           | before the first audio chunk          |
//! | tts_end        |           | after the last audio chunk            |
//! | tts_error      | message   | synthesis failed                      |
//! | interrupt      |           | the active response was cancelled     |
//! | pong           |           | reply to `ping`                       |
//! | error          | message   | the session could not be set up       |
//!
//! ## Client → Server records:
//! `stop` ends the session, `ping` asks for a `pong`. Anything else, including
//! text that is not JSON, is ignored.

use crate::services::AudioChunk;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Control records sent to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Ready { message: String },
    Transcription { text: String },
    AgentResponse { text: String },
    TtsStart,
    TtsEnd,
    TtsError { message: String },
    Interrupt,
    Pong,
    Error { message: String },
}

impl ServerMessage {
    pub fn to_json(&self) -> String {
        // Every variant is plain strings and unit tags; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"error","message":"encoding failure"}"#.to_string())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Ready { .. } => "ready",
            ServerMessage::Transcription { .. } => "transcription",
            ServerMessage::AgentResponse { .. } => "agent_response",
            ServerMessage::TtsStart => "tts_start",
            ServerMessage::TtsEnd => "tts_end",
            ServerMessage::TtsError { .. } => "tts_error",
            ServerMessage::Interrupt => "interrupt",
            ServerMessage::Pong => "pong",
            ServerMessage::Error { .. } => "error",
        }
    }
}

/// Control records the client may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientControl {
    Stop,
    Ping,
}

impl ClientControl {
    /// Decode a text frame. Malformed or unknown records yield `None`.
    pub fn decode(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        let value: serde_json::Value = serde_json::from_str(text).ok()?;
        match value.get("type").and_then(|t| t.as_str())? {
            "stop" => Some(ClientControl::Stop),
            "ping" => Some(ClientControl::Ping),
            _ => None,
        }
    }
}

/// A frame read off the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    Audio(Vec<u8>),
    Close,
}

/// A frame to write to the socket.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Message(ServerMessage),
    Audio(AudioChunk),
    /// Close the connection once everything queued before it is written.
    Close,
}

/// The peer went away; nothing more can be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("peer connection closed")]
pub struct PeerClosed;

/// The single outbound sink of a connection.
///
/// Every component writes through a clone of the same channel, and the
/// socket writer drains it in order, so frames are never interleaved
/// mid-write.
#[derive(Debug, Clone)]
pub struct PeerSink {
    tx: mpsc::UnboundedSender<OutboundFrame>,
}

impl PeerSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, message: ServerMessage) -> Result<(), PeerClosed> {
        self.tx.send(OutboundFrame::Message(message)).map_err(|_| PeerClosed)
    }

    pub fn send_audio(&self, chunk: AudioChunk) -> Result<(), PeerClosed> {
        self.tx.send(OutboundFrame::Audio(chunk)).map_err(|_| PeerClosed)
    }

    pub fn close(&self) {
        let _ = self.tx.send(OutboundFrame::Close);
    }
}

/// The session is gone, or the audio buffer is full; the frame was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InboundRejected {
    #[error("inbound audio buffer full")]
    AudioBufferFull,
    #[error("session no longer reading")]
    Closed,
}

/// Write half of a connection's inbound side, held by the socket bridge.
///
/// Audio goes through a bounded buffer and is dropped when that buffer is
/// full. `stop`, `ping` and close travel on a separate unbounded lane, so a
/// stalled audio path can never swallow them. Text that is not a known
/// control record is discarded here and never buffered.
#[derive(Debug, Clone)]
pub struct InboundSender {
    audio: mpsc::Sender<Vec<u8>>,
    control: mpsc::UnboundedSender<InboundFrame>,
}

impl InboundSender {
    pub fn push(&self, frame: InboundFrame) -> Result<(), InboundRejected> {
        match frame {
            InboundFrame::Audio(chunk) => self.audio.try_send(chunk).map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => InboundRejected::AudioBufferFull,
                mpsc::error::TrySendError::Closed(_) => InboundRejected::Closed,
            }),
            InboundFrame::Text(text) if ClientControl::decode(&text).is_none() => Ok(()),
            control => self.control.send(control).map_err(|_| InboundRejected::Closed),
        }
    }
}

/// Read half of a connection's inbound side, owned by the session.
#[derive(Debug)]
pub struct Inbound {
    audio: mpsc::Receiver<Vec<u8>>,
    control: mpsc::UnboundedReceiver<InboundFrame>,
}

impl Inbound {
    /// Next frame, control records first. `None` once the sender is gone.
    pub async fn recv(&mut self) -> Option<InboundFrame> {
        tokio::select! {
            biased;
            frame = self.control.recv() => frame,
            chunk = self.audio.recv() => match chunk {
                Some(chunk) => Some(InboundFrame::Audio(chunk)),
                None => self.control.recv().await,
            },
        }
    }
}

/// Inbound lanes with room for `audio_capacity` buffered audio frames.
pub fn inbound_channel(audio_capacity: usize) -> (InboundSender, Inbound) {
    let (audio_tx, audio_rx) = mpsc::channel(audio_capacity.max(1));
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    (
        InboundSender {
            audio: audio_tx,
            control: control_tx,
        },
        Inbound {
            audio: audio_rx,
            control: control_rx,
        },
    )
}

/// Both directions of one client connection, as seen by the session.
#[derive(Debug)]
pub struct Connection {
    pub inbound: Inbound,
    pub peer: PeerSink,
}
