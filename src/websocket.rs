//! # Voice WebSocket Endpoint
//!
//! `GET /ws/voice/{conversation_id}` upgrades into one duplex voice session.
//!
//! The actor here is only the socket bridge. It does not orchestrate anything:
//! - **Inbound**: binary frames go into a bounded audio lane that drops
//!   chunks when full; `stop`, `ping` and close take an unbounded control
//!   lane the session's ingest loop reads first
//! - **Outbound**: every component of the session writes through one
//!   `PeerSink`; the actor drains it in order with `ctx.text` / `ctx.binary`
//! - **Session**: `SessionController::run` executes on its own task and owns
//!   the session slot until teardown has finished
//!
//! ## Heartbeat:
//! The actor sends protocol-level pings every `heartbeat_interval_secs` and
//! drops clients that have been silent for `client_timeout_secs`.

use crate::error::AppError;
use crate::state::{AppState, SessionPermit};
use crate::voice::{inbound_channel, Connection, Inbound, InboundFrame, InboundRejected, InboundSender, OutboundFrame, PeerSink};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

/// Socket bridge for one voice session.
pub struct VoiceWebSocket {
    conversation_id: String,
    state: web::Data<AppState>,
    permit: Option<SessionPermit>,
    inbound: InboundSender,
    /// Taken when the actor starts and the session is spawned
    pending: Option<Inbound>,
    last_heartbeat: Instant,
    heartbeat_interval: Duration,
    client_timeout: Duration,
}

impl VoiceWebSocket {
    pub fn new(conversation_id: String, state: web::Data<AppState>, permit: SessionPermit) -> Self {
        let config = state.get_config();
        let (inbound, pending) = inbound_channel(config.session.inbound_buffer_frames);
        Self {
            conversation_id,
            state,
            permit: Some(permit),
            inbound,
            pending: Some(pending),
            last_heartbeat: Instant::now(),
            heartbeat_interval: Duration::from_secs(config.session.heartbeat_interval_secs.max(1)),
            client_timeout: Duration::from_secs(config.session.client_timeout_secs.max(1)),
        }
    }

    /// Hand a frame to the session without blocking the actor. Only audio
    /// can be dropped here.
    fn forward(&self, frame: InboundFrame) {
        match self.inbound.push(frame) {
            Ok(()) => {}
            Err(InboundRejected::AudioBufferFull) => {
                warn!(conversation_id = %self.conversation_id, "inbound audio buffer full, dropping chunk");
            }
            // The session already ended; nothing left to feed
            Err(InboundRejected::Closed) => {}
        }
    }

    fn spawn_session(&mut self, peer: PeerSink) {
        let Some(inbound) = self.pending.take() else {
            return;
        };
        let controller = self.state.session_controller();
        let state = self.state.clone();
        let permit = self.permit.take();
        let conversation_id = self.conversation_id.clone();

        tokio::spawn(async move {
            let summary = controller.run(&conversation_id, Connection { inbound, peer }).await;
            state.record_session(&summary);
            drop(permit);
        });
    }
}

impl Actor for VoiceWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(conversation_id = %self.conversation_id, "voice socket connected");

        let (peer, outbound) = PeerSink::channel();
        ctx.add_stream(UnboundedReceiverStream::new(outbound));
        self.spawn_session(peer);

        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!(conversation_id = %act.conversation_id, "voice socket heartbeat timeout, closing connection");
                act.forward(InboundFrame::Close);
                ctx.close(Some(ws::CloseCode::Away.into()));
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // Dropping the sender ends the ingest loop even if the Close frame was lost
        self.forward(InboundFrame::Close);
        info!(conversation_id = %self.conversation_id, "voice socket stopped");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for VoiceWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.forward(InboundFrame::Text(text.to_string()));
            }
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                self.forward(InboundFrame::Audio(data.to_vec()));
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("voice socket closed by client: {:?}", reason);
                self.forward(InboundFrame::Close);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("voice socket protocol error: {}", err);
                self.forward(InboundFrame::Close);
                ctx.stop();
            }
        }
    }
}

impl StreamHandler<OutboundFrame> for VoiceWebSocket {
    fn handle(&mut self, frame: OutboundFrame, ctx: &mut Self::Context) {
        match frame {
            OutboundFrame::Message(message) => {
                debug!(kind = message.kind(), "sending control record");
                ctx.text(message.to_json());
            }
            OutboundFrame::Audio(chunk) => ctx.binary(chunk),
            OutboundFrame::Close => {
                ctx.close(Some(ws::CloseCode::Normal.into()));
                ctx.stop();
            }
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        // Every sink clone is gone: the session is over
        ctx.stop();
    }
}

/// Upgrade handler for `GET /ws/voice/{conversation_id}`.
///
/// Refuses the upgrade with 503 when every session slot is taken.
pub async fn voice_session(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    let conversation_id = path.into_inner();
    if conversation_id.trim().is_empty() {
        return Err(AppError::BadRequest("Conversation id cannot be empty".into()).into());
    }

    let Some(permit) = state.try_acquire_session() else {
        warn!(%conversation_id, "voice session refused, all slots taken");
        return Err(AppError::Unavailable("Too many active voice sessions".into()).into());
    };

    ws::start(VoiceWebSocket::new(conversation_id, state, permit), &req, stream)
}
