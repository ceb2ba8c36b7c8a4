//! # Realtime Call WebSocket
//!
//! One actor per connected caller. Clients connect to
//! `/api/streaming-voice-calls/ws?token=...&user_id=...` and exchange JSON
//! envelopes (see `gateway::messages`).
//!
//! ## Connection Lifecycle:
//! 1. **Upgrade**: Query credentials are checked before the handshake (401 otherwise)
//! 2. **start_call**: The connection takes ownership of a session and registers with the hub
//! 3. **Streaming**: `audio_chunk` / `voice_end` feed the session; turn results arrive
//!    asynchronously through the hub as [`ServerEvent`] messages
//! 4. **Close**: Stop, disconnect or heartbeat timeout force-stops the session exactly once
//!
//! ## Key Rust Concepts:
//! - **Actor model**: Socket state lives in the actor, no locks needed for it
//! - **ctx.wait**: Async dispatch holds back the next frame until the current one is handled,
//!   so messages from one client are processed in order

use crate::auth::{authenticate_query, CallQuery};
use crate::gateway::{CallController, ClientEnvelope, ConnectionHub, Dispatch, ServerEnvelope, ServerEvent, SessionChange};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// WebSocket actor for one realtime call connection.
pub struct CallSocket {
    /// Identifies this connection in the hub
    connection_id: Uuid,

    /// Authenticated at upgrade time
    user_id: i64,

    /// Session this connection currently owns
    session_id: Option<String>,

    controller: CallController,
    hub: ConnectionHub,

    heartbeat_interval: Duration,
    client_timeout: Duration,

    /// Last time anything arrived from the client
    last_heartbeat: Instant,
}

impl CallSocket {
    pub fn new(user_id: i64, state: &AppState) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            user_id,
            session_id: None,
            controller: CallController::from_state(state),
            hub: state.services.hub.clone(),
            heartbeat_interval: state.config.call.heartbeat_interval(),
            client_timeout: state.config.call.client_timeout(),
            last_heartbeat: Instant::now(),
        }
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, envelope: &ServerEnvelope) {
        match envelope.to_json() {
            Ok(json) => ctx.text(json),
            Err(err) => error!(connection_id = %self.connection_id, error = %err, "Failed to encode event"),
        }
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let envelope = match serde_json::from_str::<ClientEnvelope>(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                let session_id = self.session_id.clone().unwrap_or_default();
                self.send(ctx, &ServerEnvelope::error(&session_id, format!("Invalid message: {}", err)));
                return;
            }
        };

        let controller = self.controller.clone();
        let user_id = self.user_id;
        let current = self.session_id.clone();
        let dispatch = async move { controller.dispatch(user_id, current.as_deref(), envelope).await };

        ctx.wait(dispatch.into_actor(self).map(|dispatch, act, ctx| act.apply(dispatch, ctx)));
    }

    /// Apply session bookkeeping from a dispatch, then send its replies.
    fn apply(&mut self, dispatch: Dispatch, ctx: &mut ws::WebsocketContext<Self>) {
        match dispatch.session {
            SessionChange::Started(session_id) => {
                if let Some(previous) = self.session_id.replace(session_id.clone()) {
                    if previous != session_id {
                        self.hub.unregister(&previous, self.connection_id);
                    }
                }
                self.hub
                    .register(&session_id, self.connection_id, ctx.address().recipient());
            }
            SessionChange::Stopped => {
                if let Some(previous) = self.session_id.take() {
                    self.hub.unregister(&previous, self.connection_id);
                }
            }
            SessionChange::Unchanged => {}
        }

        for reply in &dispatch.replies {
            self.send(ctx, reply);
        }
    }
}

impl Actor for CallSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(connection_id = %self.connection_id, user_id = self.user_id, "Call connection opened");

        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!(connection_id = %act.connection_id, "Client heartbeat timed out, closing connection");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(session_id) = self.session_id.take() {
            // A newer connection that resumed the session owns it now
            if !self.hub.unregister(&session_id, self.connection_id) {
                debug!(connection_id = %self.connection_id, session_id = %session_id, "Session moved to another connection, leaving it running");
            } else if self.controller.force_stop(&session_id) {
                info!(connection_id = %self.connection_id, session_id = %session_id, "Connection closed during call, session stopped");
            }
        }
        info!(connection_id = %self.connection_id, "Call connection closed");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for CallSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let msg = match msg {
            Ok(msg) => msg,
            Err(err) => {
                error!(connection_id = %self.connection_id, error = %err, "WebSocket protocol error");
                ctx.stop();
                return;
            }
        };
        self.last_heartbeat = Instant::now();

        match msg {
            ws::Message::Text(text) => self.handle_text(&text, ctx),
            ws::Message::Binary(data) => {
                warn!(connection_id = %self.connection_id, bytes = data.len(), "Ignoring binary frame, audio must be sent as audio_chunk");
            }
            ws::Message::Ping(data) => ctx.pong(&data),
            ws::Message::Pong(_) => {}
            ws::Message::Close(reason) => {
                debug!(connection_id = %self.connection_id, ?reason, "Client closed connection");
                ctx.close(reason);
                ctx.stop();
            }
            ws::Message::Continuation(_) => {
                warn!(connection_id = %self.connection_id, "Received unexpected continuation frame");
            }
            ws::Message::Nop => {}
        }
    }
}

/// Turn results and other server-initiated events.
impl Handler<ServerEvent> for CallSocket {
    type Result = ();

    fn handle(&mut self, msg: ServerEvent, ctx: &mut Self::Context) {
        self.send(ctx, &msg.0);
    }
}

/// WebSocket upgrade endpoint.
///
/// ## Returns:
/// - **401**: Missing/invalid token or user id (checked before the handshake)
/// - **101**: Upgraded, handled by [`CallSocket`] from here on
pub async fn call_websocket(
    req: HttpRequest,
    stream: web::Payload,
    query: web::Query<CallQuery>,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let user_id = authenticate_query(&query, &app_state.config.auth)?;
    debug!(user_id, peer = ?req.connection_info().peer_addr(), "Call connection request");

    ws::start(CallSocket::new(user_id, &app_state), &req, stream)
}
