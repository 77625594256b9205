//! # Voice Sessions
//!
//! Real-time duplex orchestration for one WebSocket client: audio in,
//! transcripts to the reasoning service, synthesized speech out, with
//! barge-in.
//!
//! ## Modules:
//! - **protocol**: wire records and the connection's outbound sink
//! - **queue**: transcript hand-off from the transcription source
//! - **tasks**: pipeline/synthesis task slots with bounded cancellation
//! - **interrupt**: barge-in detection, debounce and cancellation fan-out
//! - **pipeline**: the per-turn Fetch → Reason → Synthesize state machine
//! - **speech_text**: markdown stripping and length budgeting for speech
//! - **session**: the per-connection controller tying it all together

pub mod interrupt;
pub mod pipeline;
pub mod protocol;
pub mod queue;
pub mod session;
pub mod speech_text;
pub mod tasks;

#[cfg(test)]
pub(crate) mod testing;

pub use protocol::{inbound_channel, Connection, Inbound, InboundFrame, InboundRejected, InboundSender, OutboundFrame, PeerSink};
pub use session::{SessionController, SessionEnd, SessionSettings, SessionSummary};
