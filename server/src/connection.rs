use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use actix::{Actor, ActorContext, AsyncContext, Handler, Message, Running, StreamHandler};
use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use actix_web_actors::ws::CloseCode;

use system::{ClientMessage, ConnectionId, ProtocolError, ServerMessage, ServerPayload};

use crate::config::ServerConfig;
use crate::registry::{report_disconnect, ConnectionCommand, ServerCommand, ServerTx};
use crate::transport::{self, CloseReason, ConnectionHandle, Outgoing};

static CONNECTION_IDS: AtomicU32 = AtomicU32::new(1);

fn next_connection_id() -> ConnectionId {
    loop {
        let id = CONNECTION_IDS.fetch_add(1, Ordering::Relaxed);
        if id != 0 {
            break id;
        }
    }
}

/// Frames are answered in the encoding the client used last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Json,
    Bincode,
}

#[derive(Message)]
#[rtype(result = "()")]
struct Egress(Outgoing);

struct ConnectionActor {
    id: ConnectionId,
    srv_tx: ServerTx,
    handle: Option<ConnectionHandle>,
    queue_capacity: usize,
    handshake_timeout: Duration,
    encoding: Encoding,
    joined: bool,
}

impl ConnectionActor {
    fn new(srv_tx: ServerTx, config: &ServerConfig) -> Self {
        Self {
            id: next_connection_id(),
            srv_tx,
            handle: None,
            queue_capacity: config.outbound_queue_capacity,
            handshake_timeout: config.handshake_timeout(),
            encoding: Encoding::Json,
            joined: false,
        }
    }

    /// Ingress is best effort: a full registry queue closes the connection
    /// and the client comes back through reconnection.
    fn send_to_registry(&self, command: ConnectionCommand, ctx: &mut ws::WebsocketContext<Self>) {
        if let Err(err) = self.srv_tx.try_send(ServerCommand::Connection(command)) {
            log::warn!("Connection {}: registry unavailable ({}), closing", self.id, err);
            ctx.close(Some(ws::CloseReason {
                code: CloseCode::Again,
                description: Some("server busy".into()),
            }));
            ctx.stop();
        }
    }

    fn ingress(
        &mut self,
        parsed: Result<ClientMessage, ProtocolError>,
        ctx: &mut ws::WebsocketContext<Self>,
    ) {
        match parsed {
            Ok(message) => {
                log::debug!(
                    "Ingress {} {} from connection {}",
                    message.payload.name(),
                    message.id,
                    self.id
                );
                self.send_to_registry(
                    ConnectionCommand::Message {
                        from: self.id,
                        message,
                    },
                    ctx,
                );
            }
            Err(err) => {
                log::warn!("Connection {}: {}", self.id, err);
                self.write(&ServerMessage::error("", err.code(), err), ctx);
            }
        }
    }

    /// The handshake is over once the session admitted us.
    fn observe_egress(&mut self, message: &ServerMessage) {
        if matches!(
            message.payload,
            ServerPayload::Joined(_) | ServerPayload::Resumed(_)
        ) {
            self.joined = true;
        }
    }

    fn handshake_expired(&self) -> bool {
        !self.joined
    }

    fn write(&self, message: &ServerMessage, ctx: &mut ws::WebsocketContext<Self>) {
        match self.encoding {
            Encoding::Json => match message.to_json() {
                Ok(text) => ctx.text(text),
                Err(err) => log::error!("Failed to encode {}: {}", message.payload.name(), err),
            },
            Encoding::Bincode => match message.to_bincode() {
                Ok(bytes) => ctx.binary(bytes),
                Err(err) => log::error!("Failed to encode {}: {}", message.payload.name(), err),
            },
        }
    }
}

impl Actor for ConnectionActor {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let (handle, mut receiver) = transport::open(self.id, self.queue_capacity);
        self.handle = Some(handle.clone());
        self.send_to_registry(
            ConnectionCommand::Connect {
                connection_id: self.id,
                handle,
            },
            ctx,
        );

        let addr = ctx.address().recipient();
        let id = self.id;
        tokio::spawn(async move {
            log::debug!("Connection {} egress started", id);
            while let Some(outgoing) = receiver.recv().await {
                addr.do_send(Egress(outgoing));
            }
            log::debug!("Connection {} egress terminated", id);
        });

        ctx.run_later(self.handshake_timeout, |act, ctx| {
            if act.handshake_expired() {
                log::info!("Connection {} did not join in time", act.id);
                ctx.close(Some(ws::CloseReason {
                    code: CloseCode::Policy,
                    description: Some("handshake timeout".into()),
                }));
                ctx.stop();
            }
        });
    }

    fn stopping(&mut self, _: &mut Self::Context) -> Running {
        report_disconnect(&self.srv_tx, self.id);
        Running::Stop
    }

    fn stopped(&mut self, _: &mut Self::Context) {
        if let Some(handle) = self.handle.take() {
            handle.close(CloseReason::Normal);
        }
    }
}

/// Ingress
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ConnectionActor {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let msg = match msg {
            Ok(msg) => msg,
            Err(err) => {
                log::warn!("Connection {}: websocket error: {}", self.id, err);
                ctx.stop();
                return;
            }
        };
        match msg {
            ws::Message::Ping(bytes) => ctx.pong(&bytes),
            ws::Message::Pong(_) | ws::Message::Nop => {}
            ws::Message::Text(text) => {
                self.encoding = Encoding::Json;
                self.ingress(ClientMessage::from_json(&text), ctx);
            }
            ws::Message::Binary(bytes) => {
                log::debug!("Ingress size: {}", bytes.len());
                self.encoding = Encoding::Bincode;
                self.ingress(ClientMessage::from_bincode(&bytes), ctx);
            }
            ws::Message::Continuation(_) => {
                log::warn!("Connection {}: fragmented frames are not supported", self.id);
                ctx.close(Some(ws::CloseReason {
                    code: CloseCode::Unsupported,
                    description: None,
                }));
                ctx.stop();
            }
            ws::Message::Close(reason) => {
                ctx.close(reason);
                ctx.stop();
            }
        }
    }
}

/// Egress
impl Handler<Egress> for ConnectionActor {
    type Result = ();

    fn handle(&mut self, msg: Egress, ctx: &mut ws::WebsocketContext<Self>) -> Self::Result {
        match msg.0 {
            Outgoing::Message(message) => {
                log::debug!("Egress {} to connection {}", message.payload.name(), self.id);
                self.observe_egress(&message);
                self.write(&message, ctx);
            }
            Outgoing::Close(reason) => {
                let code = match reason {
                    CloseReason::Normal => CloseCode::Normal,
                    CloseReason::Lagging => CloseCode::Again,
                    CloseReason::Replaced => CloseCode::Policy,
                    CloseReason::SessionReset => CloseCode::Restart,
                };
                ctx.close(Some(ws::CloseReason {
                    code,
                    description: Some(reason.name().into()),
                }));
                ctx.stop();
            }
        }
    }
}

pub async fn ws_index(
    req: HttpRequest,
    stream: web::Payload,
    srv_tx: web::Data<ServerTx>,
    config: web::Data<ServerConfig>,
) -> Result<HttpResponse, Error> {
    ws::start(
        ConnectionActor::new(srv_tx.get_ref().clone(), config.get_ref()),
        &req,
        stream,
    )
}
