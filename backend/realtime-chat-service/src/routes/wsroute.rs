use crate::error::AppError;
use crate::middleware::auth::bearer_token;
use crate::middleware::guards::requested_device;
use crate::models::{ConnectionId, DeviceIdentity};
use crate::state::AppState;
use crate::websocket::handlers::handle_inbound;
use crate::websocket::message_types::{WsInboundEvent, WsOutboundEvent};
use crate::websocket::DisconnectReason;
use actix::{Actor, ActorContext, AsyncContext, StreamHandler};
use actix_web::{get, web, Error, HttpRequest, HttpResponse, ResponseError};
use actix_web_actors::ws;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

// WebSocket Actor
struct WsSession {
    connection_id: ConnectionId,
    identity: DeviceIdentity,
    state: AppState,
    hb: Instant,
    heartbeat: Duration,
    outbound: Option<UnboundedReceiver<WsOutboundEvent>>,
    // Commands are handled one at a time, in arrival order
    inbound: Option<UnboundedSender<WsInboundEvent>>,
}

impl WsSession {
    fn new(
        connection_id: ConnectionId,
        identity: DeviceIdentity,
        state: AppState,
        outbound: UnboundedReceiver<WsOutboundEvent>,
    ) -> Self {
        Self {
            connection_id,
            identity,
            heartbeat: state.config.heartbeat_interval,
            state,
            hb: Instant::now(),
            outbound: Some(outbound),
            inbound: None,
        }
    }

    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(self.heartbeat / 2, |act, ctx| {
            if Instant::now().duration_since(act.hb) > act.heartbeat * 2 {
                tracing::warn!(
                    connection_id = %act.connection_id,
                    "WebSocket heartbeat failed, disconnecting"
                );
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn touch(&mut self) {
        self.hb = Instant::now();
        let registry = self.state.registry.clone();
        let connection_id = self.connection_id;
        actix::spawn(async move {
            registry.touch(connection_id).await;
        });
    }

    fn start_inbound_worker(&mut self) {
        let (tx, mut rx) = unbounded_channel::<WsInboundEvent>();
        self.inbound = Some(tx);

        let state = self.state.clone();
        let connection_id = self.connection_id;
        let identity = self.identity.clone();
        actix::spawn(async move {
            while let Some(event) = rx.recv().await {
                handle_inbound(&state, connection_id, &identity, event).await;
            }
        });
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::info!(
            connection_id = %self.connection_id,
            user_id = %self.identity.user_id,
            device_id = %self.identity.device_id,
            "WebSocket session started"
        );

        self.hb(ctx);
        self.start_inbound_worker();

        // Registry events (including the queued flush) arrive on this stream.
        // It ends when the registry drops the connection, which stops the actor.
        if let Some(rx) = self.outbound.take() {
            ctx.add_stream(UnboundedReceiverStream::new(rx));
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        tracing::info!(
            connection_id = %self.connection_id,
            user_id = %self.identity.user_id,
            "WebSocket session stopped"
        );

        self.inbound.take();
        let registry = self.state.registry.clone();
        let connection_id = self.connection_id;
        actix::spawn(async move {
            registry
                .deregister_with(connection_id, DisconnectReason::Closed)
                .await;
        });
    }
}

// Outbound events pushed through the registry
impl StreamHandler<WsOutboundEvent> for WsSession {
    fn handle(&mut self, event: WsOutboundEvent, ctx: &mut Self::Context) {
        match serde_json::to_string(&event) {
            Ok(text) => ctx.text(text),
            Err(e) => tracing::error!(
                connection_id = %self.connection_id,
                event = event.event_type(),
                error = %e,
                "failed to encode outbound event"
            ),
        }
    }
}

// Handle WebSocket protocol messages
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.touch();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.touch();
            }
            Ok(ws::Message::Text(text)) => {
                self.hb = Instant::now();
                match serde_json::from_str::<WsInboundEvent>(&text) {
                    Ok(event) => {
                        if let Some(inbound) = &self.inbound {
                            let _ = inbound.send(event);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            connection_id = %self.connection_id,
                            error = %e,
                            "malformed socket event, closing connection"
                        );
                        let reply = WsOutboundEvent::Error {
                            request: "unknown".to_string(),
                            code: "bad_request".to_string(),
                            message: format!("malformed event: {e}"),
                            retryable: false,
                        };
                        if let Ok(text) = serde_json::to_string(&reply) {
                            ctx.text(text);
                        }
                        ctx.close(Some(ws::CloseReason {
                            code: ws::CloseCode::Invalid,
                            description: Some("malformed event".to_string()),
                        }));
                        ctx.stop();
                    }
                }
            }
            Ok(ws::Message::Binary(_)) => {
                tracing::warn!("Binary WebSocket messages not supported");
            }
            Ok(ws::Message::Close(reason)) => {
                tracing::info!(
                    connection_id = %self.connection_id,
                    "WebSocket close message received: {:?}",
                    reason
                );
                ctx.close(reason);
                ctx.stop();
            }
            Err(e) => {
                tracing::warn!(connection_id = %self.connection_id, error = %e, "WebSocket protocol error");
                ctx.stop();
            }
            _ => {}
        }
    }
}

/// Authenticate the handshake; nothing is registered for a rejected token
fn authenticate(
    params: &WsParams,
    req: &HttpRequest,
    state: &AppState,
) -> Result<DeviceIdentity, AppError> {
    let token = params
        .token
        .clone()
        .or_else(|| bearer_token(req))
        .ok_or(AppError::Unauthorized)?;
    let device = requested_device(req);
    state.jwt.identity(&token, device.as_deref())
}

// HTTP handler
#[get("/ws")]
pub async fn ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    query: web::Query<WsParams>,
) -> Result<HttpResponse, Error> {
    let params = query.into_inner();

    let identity = match authenticate(&params, &req, &state) {
        Ok(identity) => identity,
        Err(e) => {
            tracing::warn!("WebSocket connection rejected: {e}");
            return Ok(e.error_response());
        }
    };

    let (tx, rx) = unbounded_channel();
    let connection_id = match state.registry.register(identity.clone(), tx).await {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!(
                user_id = %identity.user_id,
                device_id = %identity.device_id,
                "WebSocket registration refused: {e}"
            );
            return Ok(e.error_response());
        }
    };

    let session = WsSession::new(connection_id, identity, state.get_ref().clone(), rx);
    match ws::start(session, &req, stream) {
        Ok(resp) => Ok(resp),
        Err(e) => {
            state.registry.deregister(connection_id).await;
            Err(e)
        }
    }
}
