//! One tokio task per live document. The task owns the `system::Session`,
//! so every mutation of a document goes through exactly one sequential path.

use std::sync::Arc;

use tokio::sync::mpsc::{channel, Sender, UnboundedSender};
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};

use system::{
    Ack, Admission, Catchup, ClientId, ClientMessage, ClientPayload, ConnectionId, DocumentId,
    JoinRequest, Joined, MutationOutcome, Point, ProtocolError, Resumed, ServerMessage,
    ServerPayload, Session, SessionError, SessionId, SessionSummary, Shape, ShapeOpKind,
    ShapeUpdate, SnapshotChunk,
};

use crate::broadcast::Broadcaster;
use crate::config::ServerConfig;
use crate::transport::{CloseReason, ConnectionHandle};

#[derive(Debug)]
pub enum SessionCommand {
    Join {
        connection_id: ConnectionId,
        handle: ConnectionHandle,
        message: ClientMessage,
    },
    Inbound {
        connection_id: ConnectionId,
        handle: ConnectionHandle,
        message: ClientMessage,
    },
    Disconnected {
        connection_id: ConnectionId,
    },
    Describe {
        tx: oneshot::Sender<SessionSummary>,
    },
    Shutdown,
}

pub type SessionTx = Sender<SessionCommand>;

/// What a session tells the registry about itself.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotice {
    JoinHandled {
        document_id: DocumentId,
        session_id: SessionId,
        connection_id: ConnectionId,
        admitted: bool,
    },
    /// No members for longer than the session grace.
    Idle {
        document_id: DocumentId,
        session_id: SessionId,
    },
    /// The session broke an invariant and has closed all of its members.
    Reset {
        document_id: DocumentId,
        session_id: SessionId,
    },
}

pub type NoticeTx = UnboundedSender<SessionNotice>;

struct SessionActor {
    session: Session,
    members: Broadcaster,
    notices: NoticeTx,
    idle_reported: bool,
    reset: bool,
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}

impl SessionActor {
    fn new(session: Session, notices: NoticeTx) -> Self {
        Self {
            session,
            members: Broadcaster::new(),
            notices,
            idle_reported: false,
            reset: false,
        }
    }

    fn document_id(&self) -> DocumentId {
        self.session.document_id().to_string()
    }

    fn notify(&self, notice: SessionNotice) {
        if self.notices.send(notice).is_err() {
            log::debug!("Registry is gone, session {} keeps quiet", self.session.id());
        }
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Join {
                connection_id,
                handle,
                message,
            } => {
                self.idle_reported = false;
                let admitted = self.handle_join(connection_id, &handle, message);
                self.notify(SessionNotice::JoinHandled {
                    document_id: self.document_id(),
                    session_id: self.session.id(),
                    connection_id,
                    admitted,
                });
            }
            SessionCommand::Inbound {
                connection_id,
                handle,
                message,
            } => self.handle_inbound(connection_id, &handle, message),
            SessionCommand::Disconnected { connection_id } => {
                if let Some(client_id) = self.session.client_for_connection(connection_id) {
                    self.lose_member(client_id);
                }
            }
            SessionCommand::Describe { tx } => {
                let _ = tx.send(self.session.summary());
            }
            SessionCommand::Shutdown => {}
        }
    }

    fn handle_join(
        &mut self,
        connection_id: ConnectionId,
        handle: &ConnectionHandle,
        message: ClientMessage,
    ) -> bool {
        if self.reset {
            self.reject_after_reset(handle);
            return false;
        }
        let join = match &message.payload {
            ClientPayload::Join(join) => join.clone(),
            other => {
                let code = ProtocolError::Unexpected(other.name()).code();
                self.reply_error(handle, &message, code, "expected join");
                return false;
            }
        };
        if join.viewport.map_or(false, |v| !v.is_valid()) {
            let err = ProtocolError::InvalidViewport;
            self.reply_error(handle, &message, err.code(), err);
            return false;
        }

        match self.session.add_member(connection_id, &join, now()) {
            Ok(admission) => {
                self.admit(handle, &message, &join, admission);
                true
            }
            Err(err) if err.is_fatal() => {
                self.tear_down(&err);
                self.reject_after_reset(handle);
                false
            }
            Err(err) => {
                log::warn!(
                    "Join of {} to {} rejected: {}",
                    join.user_id,
                    self.session.document_id(),
                    err
                );
                self.reply_error(handle, &message, err.code(), err);
                false
            }
        }
    }

    /// Sends the catch-up of a new or resumed member. It always fits the
    /// member's outbound queue: snapshot chunks grow as needed and a replay
    /// that would not fit becomes a snapshot.
    fn admit(
        &mut self,
        handle: &ConnectionHandle,
        message: &ClientMessage,
        join: &JoinRequest,
        admission: Admission,
    ) {
        let client_id = admission.client_id;
        if let Some(previous) = self.members.attach(client_id, handle.clone()) {
            if previous.id() != handle.id() {
                log::info!(
                    "Client {} moved from connection {} to {}",
                    client_id,
                    previous.id(),
                    handle.id()
                );
                previous.close(CloseReason::Replaced);
            }
        }

        let room = handle.room().max(1);
        let catchup = match admission.catchup {
            Catchup::Replay { updates, .. } if updates.len() >= room => {
                log::info!(
                    "Replay of {} updates overflows client {}, sending a snapshot",
                    updates.len(),
                    client_id
                );
                let viewport = self.session.member(client_id).and_then(|m| m.viewport);
                self.session.snapshot_catchup(viewport.as_ref())
            }
            catchup => catchup,
        };

        let document_id = self.document_id();
        let members = self.session.presence_snapshot();
        let reply = |server_seq: u64, payload: ServerPayload| ServerMessage {
            sender_id: Some(client_id),
            client_seq: message.client_seq,
            server_seq: Some(server_seq),
            ..ServerMessage::new(document_id.clone(), payload)
        };

        let mut outgoing = Vec::new();
        match catchup {
            Catchup::Snapshot {
                mut visible,
                mut rest,
                server_seq,
            } => {
                if room == 1 {
                    visible.append(&mut rest);
                }
                outgoing.push(reply(
                    server_seq,
                    ServerPayload::Joined(Joined {
                        client_id,
                        session_id: self.session.id(),
                        snapshot: visible,
                        server_seq,
                        members,
                        complete: rest.is_empty(),
                    }),
                ));
                outgoing.extend(
                    self.snapshot_chunks(rest, server_seq, false, room - 1)
                        .into_iter()
                        .map(|chunk| reply(server_seq, ServerPayload::Snapshot(chunk))),
                );
            }
            Catchup::Replay { updates, server_seq } => {
                outgoing.push(reply(
                    server_seq,
                    ServerPayload::Resumed(Resumed {
                        client_id,
                        session_id: self.session.id(),
                        server_seq,
                        replayed: updates.len(),
                        members,
                    }),
                ));
                outgoing.extend(
                    updates
                        .iter()
                        .map(|update| ServerMessage::update(document_id.clone(), update)),
                );
            }
        }
        log::debug!(
            "Client {} ({}) catches up with {} messages",
            client_id,
            join.display_name,
            outgoing.len()
        );

        for message in outgoing {
            if self.members.send_to(client_id, message).is_err() {
                self.lose_member(client_id);
                return;
            }
        }

        if let Some(event) = self.session.presence_joined(client_id) {
            let message = ServerMessage::new(document_id, ServerPayload::Presence(event));
            self.broadcast(message, Some(client_id));
        }
    }

    /// Splits `shapes` into at most `budget` `snapshot` chunks, going past
    /// the configured chunk size when it has to. With `always` an empty
    /// snapshot still produces one (final) chunk.
    fn snapshot_chunks(
        &self,
        shapes: Vec<Shape>,
        server_seq: u64,
        always: bool,
        budget: usize,
    ) -> Vec<SnapshotChunk> {
        let size = self
            .session
            .config()
            .snapshot_chunk_size
            .max(shapes.len().div_ceil(budget.max(1)))
            .max(1);
        let mut chunks = shapes
            .chunks(size)
            .map(|shapes| SnapshotChunk {
                shapes: shapes.to_vec(),
                server_seq,
                last: false,
            })
            .collect::<Vec<_>>();
        if chunks.is_empty() && always {
            chunks.push(SnapshotChunk {
                shapes: Vec::new(),
                server_seq,
                last: false,
            });
        }
        if let Some(last) = chunks.last_mut() {
            last.last = true;
        }
        chunks
    }

    fn handle_inbound(
        &mut self,
        connection_id: ConnectionId,
        handle: &ConnectionHandle,
        message: ClientMessage,
    ) {
        if self.reset {
            self.reject_after_reset(handle);
            return;
        }
        let client_id = match self.session.client_for_connection(connection_id) {
            Some(client_id) => client_id,
            None => {
                let err = ProtocolError::NotJoined;
                self.reply_error(handle, &message, err.code(), err);
                return;
            }
        };
        let document_id = self.document_id();

        match &message.payload {
            ClientPayload::Mutate(op) => {
                match self
                    .session
                    .apply_mutation(client_id, &message.id, message.client_seq, op)
                {
                    Ok(MutationOutcome::Accepted(update)) => {
                        let ack = ServerMessage {
                            sender_id: Some(client_id),
                            client_seq: message.client_seq,
                            server_seq: Some(update.server_seq),
                            ..ServerMessage::new(
                                document_id.clone(),
                                ServerPayload::Ack(Ack::Applied {
                                    server_seq: update.server_seq,
                                    shape: Some(update.shape.clone()),
                                }),
                            )
                        };
                        self.send_or_lose(client_id, ack);
                        let update = ServerMessage::update(document_id, &update);
                        self.broadcast(update, Some(client_id));
                    }
                    Ok(MutationOutcome::Duplicate { server_seq, shape }) => {
                        let ack = match server_seq {
                            Some(server_seq) => Ack::Applied { server_seq, shape },
                            None => Ack::NoOp,
                        };
                        let ack = ServerPayload::Ack(ack);
                        let ack = self.reply(&message, client_id, server_seq, ack);
                        self.send_or_lose(client_id, ack);
                    }
                    Ok(MutationOutcome::NoOp) => {
                        let ack = ServerPayload::Ack(Ack::NoOp);
                        let ack = self.reply(&message, client_id, None, ack);
                        self.send_or_lose(client_id, ack);
                    }
                    Ok(MutationOutcome::Stale(tombstone)) => {
                        let correction = ServerPayload::Update(ShapeUpdate {
                            shape_op: ShapeOpKind::Delete,
                            shape: tombstone,
                        });
                        let correction = self.reply(&message, client_id, None, correction);
                        self.send_or_lose(client_id, correction);
                    }
                    Err(err) if err.is_fatal() => self.tear_down(&err),
                    Err(err) => {
                        log::warn!(
                            "Mutation {} from client {} rejected: {}",
                            message.id,
                            client_id,
                            err
                        );
                        self.reply_error(handle, &message, err.code(), err);
                    }
                }
            }
            ClientPayload::Cursor(cursor) => {
                let point = Point::new(cursor.x, cursor.y);
                if !point.is_finite() || cursor.viewport.map_or(false, |v| !v.is_valid()) {
                    let err = ProtocolError::InvalidViewport;
                    self.reply_error(handle, &message, err.code(), err);
                    return;
                }
                self.session
                    .update_cursor(client_id, point, cursor.viewport, now());
            }
            ClientPayload::Ping => {
                let pong = self.reply(&message, client_id, None, ServerPayload::Pong);
                self.send_or_lose(client_id, pong);
            }
            ClientPayload::SnapshotRequest => {
                let viewport = self.session.member(client_id).and_then(|m| m.viewport);
                if let Catchup::Snapshot {
                    mut visible,
                    rest,
                    server_seq,
                } = self.session.snapshot_catchup(viewport.as_ref())
                {
                    visible.extend(rest);
                    let budget = handle.room();
                    for chunk in self.snapshot_chunks(visible, server_seq, true, budget) {
                        let chunk = ServerPayload::Snapshot(chunk);
                        let reply = self.reply(&message, client_id, Some(server_seq), chunk);
                        if !self.send_or_lose(client_id, reply) {
                            break;
                        }
                    }
                }
            }
            ClientPayload::Leave => {
                self.session.remove_member(client_id, now());
                if let Some(handle) = self.members.detach(client_id) {
                    handle.close(CloseReason::Normal);
                }
                let left = self.session.presence_left(client_id);
                let left = ServerMessage::new(document_id, ServerPayload::Presence(left));
                self.broadcast(left, None);
            }
            ClientPayload::Join(_) => {
                let err = ProtocolError::AlreadyJoined;
                self.reply_error(handle, &message, err.code(), err);
            }
        }
    }

    fn reply(
        &self,
        to: &ClientMessage,
        client_id: ClientId,
        server_seq: Option<u64>,
        payload: ServerPayload,
    ) -> ServerMessage {
        ServerMessage {
            sender_id: Some(client_id),
            client_seq: to.client_seq,
            server_seq,
            ..ServerMessage::new(self.session.document_id(), payload)
        }
    }

    /// Errors go to the offending connection only.
    fn reply_error(
        &self,
        handle: &ConnectionHandle,
        to: &ClientMessage,
        code: &str,
        message: impl ToString,
    ) {
        let error = ServerMessage {
            client_seq: to.client_seq,
            ..ServerMessage::error(self.session.document_id(), code, message)
        };
        if let Err(err) = handle.send(error) {
            log::debug!("Error reply to connection {} lost: {}", handle.id(), err);
        }
    }

    fn reject_after_reset(&self, handle: &ConnectionHandle) {
        let error = ServerMessage::error(
            self.session.document_id(),
            "session_reset",
            "session was reset, join again",
        );
        handle.close_with(error, CloseReason::SessionReset);
    }

    /// Returns false if the member was lost on the way.
    fn send_or_lose(&mut self, client_id: ClientId, message: ServerMessage) -> bool {
        if self.members.send_to(client_id, message).is_err() {
            self.lose_member(client_id);
            return false;
        }
        true
    }

    fn broadcast(&mut self, message: ServerMessage, exclude: Option<ClientId>) {
        let mut pending = vec![(Arc::new(message), exclude)];
        while let Some((message, exclude)) = pending.pop() {
            for client_id in self.members.broadcast(message, exclude) {
                if let Some(left) = self.disconnect(client_id) {
                    pending.push((Arc::new(left), Some(client_id)));
                }
            }
        }
    }

    /// Transport failure or close: the member keeps its slot for the
    /// reconnection grace window and the others see it go.
    fn lose_member(&mut self, client_id: ClientId) {
        if let Some(left) = self.disconnect(client_id) {
            self.broadcast(left, Some(client_id));
        }
    }

    fn disconnect(&mut self, client_id: ClientId) -> Option<ServerMessage> {
        if let Some(handle) = self.members.detach(client_id) {
            handle.close(CloseReason::Normal);
        }
        if !self.session.disconnect_member(client_id, now()) {
            return None;
        }
        let left = self.session.presence_left(client_id);
        Some(ServerMessage::new(self.session.document_id(), ServerPayload::Presence(left)))
    }

    fn tick(&mut self) {
        if self.reset {
            return;
        }
        let now = now();
        let outcome = self.session.tick(now);
        for event in outcome.cursors {
            let client_id = event.client_id;
            let message = ServerMessage {
                sender_id: Some(client_id),
                ..ServerMessage::new(self.session.document_id(), ServerPayload::Presence(event))
            };
            self.broadcast(message, Some(client_id));
        }
        for client_id in outcome.expired {
            self.members.detach(client_id);
        }

        if !self.idle_reported && self.session.is_expired(now) {
            self.idle_reported = true;
            log::info!(
                "Session {} for {} is idle",
                self.session.id(),
                self.session.document_id()
            );
            self.notify(SessionNotice::Idle {
                document_id: self.document_id(),
                session_id: self.session.id(),
            });
        }
    }

    fn tear_down(&mut self, err: &SessionError) {
        log::error!(
            "Session {} for {} reset: {}",
            self.session.id(),
            self.session.document_id(),
            err
        );
        self.reset = true;
        let error = ServerMessage::error(self.session.document_id(), err.code(), err);
        self.members.close_all(error, CloseReason::SessionReset);
        self.notify(SessionNotice::Reset {
            document_id: self.document_id(),
            session_id: self.session.id(),
        });
    }
}

pub fn spawn_session(session: Session, config: &ServerConfig, notices: NoticeTx) -> SessionTx {
    let (tx, mut rx) = channel::<SessionCommand>(config.session_queue_capacity);
    let tick_interval = config.tick_interval();

    tokio::spawn(async move {
        let mut actor = SessionActor::new(session, notices);
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        log::debug!("Session task for {} started", actor.session.document_id());

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(command) => actor.handle_command(command),
                },
                _ = ticker.tick() => actor.tick(),
            }
        }

        actor.members.close_all(
            ServerMessage::error(actor.session.document_id(), "session_closed", "session closed"),
            CloseReason::Normal,
        );
        log::info!(
            "Session {} for {} closed at seq {}",
            actor.session.id(),
            actor.session.document_id(),
            actor.session.server_seq()
        );
    });

    tx
}
