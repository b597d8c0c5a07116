//! The router task in front of all sessions.
//!
//! Connections talk to the registry; the registry owns the
//! `document_id -> session` map and forwards traffic of joined connections
//! to their session task. Sessions report back through `SessionNotice`s.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{channel, unbounded_channel, Sender};
use tokio::sync::oneshot;

use system::{
    ClientMessage, ClientPayload, ConnectionId, DocumentId, ProtocolError, ServerMessage, Session,
    SessionId, SessionSummary,
};

use crate::config::ServerConfig;
use crate::session_actor::{spawn_session, NoticeTx, SessionCommand, SessionNotice, SessionTx};
use crate::transport::ConnectionHandle;

#[derive(Debug)]
pub enum ConnectionCommand {
    Connect {
        connection_id: ConnectionId,
        handle: ConnectionHandle,
    },
    Message {
        from: ConnectionId,
        message: ClientMessage,
    },
    Disconnect {
        from: ConnectionId,
    },
}

#[derive(Debug)]
pub enum AdminCommand {
    ListSessions {
        tx: oneshot::Sender<Vec<SessionSummary>>,
    },
    DescribeSession {
        document_id: DocumentId,
        tx: oneshot::Sender<Option<SessionSummary>>,
    },
}

#[derive(Debug)]
pub enum ServerCommand {
    Connection(ConnectionCommand),
    Admin(AdminCommand),
}

pub type ServerTx = Sender<ServerCommand>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("document id must not be empty")]
    EmptyDocumentId,

    #[error("too many open sessions ({limit})")]
    TooManySessions { limit: usize },

    #[error("session is not available, join again")]
    SessionUnavailable,

    #[error("session is busy, try again")]
    SessionBusy,
}

impl RegistryError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyDocumentId => "invalid_document",
            Self::TooManySessions { .. } => "too_many_sessions",
            Self::SessionUnavailable => "session_unavailable",
            Self::SessionBusy => "session_busy",
        }
    }
}

struct SessionEntry {
    session_id: SessionId,
    tx: SessionTx,
    /// Joins forwarded to the session and not yet answered.
    pending_joins: usize,
}

struct ConnectionEntry {
    handle: ConnectionHandle,
    document_id: Option<DocumentId>,
}

struct Registry {
    config: ServerConfig,
    sessions: HashMap<DocumentId, SessionEntry>,
    connections: HashMap<ConnectionId, ConnectionEntry>,
    notices: NoticeTx,
}

impl Registry {
    fn new(config: ServerConfig, notices: NoticeTx) -> Self {
        Self {
            config,
            sessions: HashMap::new(),
            connections: HashMap::new(),
            notices,
        }
    }

    fn handle_command(&mut self, command: ServerCommand) {
        match command {
            ServerCommand::Connection(command) => self.handle_connection_command(command),
            ServerCommand::Admin(command) => self.handle_admin_command(command),
        }
    }

    fn handle_connection_command(&mut self, command: ConnectionCommand) {
        match command {
            ConnectionCommand::Connect {
                connection_id,
                handle,
            } => {
                log::debug!("Connection {} registered", connection_id);
                self.connections.insert(
                    connection_id,
                    ConnectionEntry {
                        handle,
                        document_id: None,
                    },
                );
            }
            ConnectionCommand::Message { from, message } => self.route(from, message),
            ConnectionCommand::Disconnect { from } => {
                let entry = match self.connections.remove(&from) {
                    Some(entry) => entry,
                    None => return,
                };
                log::debug!("Connection {} unregistered", from);
                if let Some(document_id) = entry.document_id {
                    if let Some(session) = self.sessions.get(&document_id) {
                        let command = SessionCommand::Disconnected {
                            connection_id: from,
                        };
                        deliver(&session.tx, command);
                    }
                }
            }
        }
    }

    fn route(&mut self, from: ConnectionId, message: ClientMessage) {
        let (handle, document_id) = match self.connections.get(&from) {
            Some(entry) => (entry.handle.clone(), entry.document_id.clone()),
            None => {
                log::warn!("Message from unknown connection {}", from);
                return;
            }
        };

        let is_join = matches!(message.payload, ClientPayload::Join(_));
        match (is_join, document_id) {
            (true, None) => self.join(from, handle, message),
            (true, Some(_)) => {
                let err = ProtocolError::AlreadyJoined;
                reply_error(&handle, &message, err.code(), err);
            }
            (false, Some(document_id)) => {
                let tx = match self.sessions.get(&document_id) {
                    Some(session) => session.tx.clone(),
                    None => {
                        self.unroute(from);
                        let err = RegistryError::SessionUnavailable;
                        reply_error(&handle, &message, err.code(), err);
                        return;
                    }
                };
                let command = SessionCommand::Inbound {
                    connection_id: from,
                    handle,
                    message,
                };
                match tx.try_send(command) {
                    Ok(()) => {}
                    Err(TrySendError::Full(SessionCommand::Inbound {
                        handle, message, ..
                    })) => {
                        log::warn!("Session for {} is busy, refusing {}", document_id, message.id);
                        let err = RegistryError::SessionBusy;
                        reply_error(&handle, &message, err.code(), err);
                    }
                    Err(_) => log::warn!("Session for {} is gone", document_id),
                }
            }
            (false, None) => {
                let err = ProtocolError::NotJoined;
                reply_error(&handle, &message, err.code(), err);
            }
        }
    }

    fn join(&mut self, from: ConnectionId, handle: ConnectionHandle, message: ClientMessage) {
        let document_id = message.session_id.clone();
        let tx = match self.get_or_create_session(&document_id) {
            Ok(tx) => tx,
            Err(err) => {
                log::warn!(
                    "Join of connection {} to {:?} refused: {}",
                    from,
                    document_id,
                    err
                );
                reply_error(&handle, &message, err.code(), err);
                return;
            }
        };

        if let Some(entry) = self.connections.get_mut(&from) {
            entry.document_id = Some(document_id.clone());
        }
        if let Some(session) = self.sessions.get_mut(&document_id) {
            session.pending_joins += 1;
        }

        let command = SessionCommand::Join {
            connection_id: from,
            handle: handle.clone(),
            message,
        };
        match tx.try_send(command) {
            Ok(()) => {}
            Err(TrySendError::Full(SessionCommand::Join { message, .. })) => {
                log::warn!("Session for {} is busy, join of {} refused", document_id, from);
                if let Some(session) = self.sessions.get_mut(&document_id) {
                    session.pending_joins = session.pending_joins.saturating_sub(1);
                }
                self.unroute(from);
                let err = RegistryError::SessionBusy;
                reply_error(&handle, &message, err.code(), err);
            }
            Err(_) => {
                log::warn!("Session for {} died before the join arrived", document_id);
                self.sessions.remove(&document_id);
                self.unroute(from);
                let err = RegistryError::SessionUnavailable;
                let _ = handle.send(ServerMessage::error(document_id, err.code(), err));
            }
        }
    }

    fn get_or_create_session(&mut self, document_id: &str) -> Result<SessionTx, RegistryError> {
        if document_id.is_empty() {
            return Err(RegistryError::EmptyDocumentId);
        }
        if let Some(session) = self.sessions.get(document_id) {
            return Ok(session.tx.clone());
        }
        if self.sessions.len() >= self.config.max_sessions {
            return Err(RegistryError::TooManySessions {
                limit: self.config.max_sessions,
            });
        }

        let session = Session::new(
            document_id,
            self.config.engine.clone(),
            tokio::time::Instant::now().into_std(),
        );
        let session_id = session.id();
        let tx = spawn_session(session, &self.config, self.notices.clone());
        self.sessions.insert(
            document_id.to_string(),
            SessionEntry {
                session_id,
                tx: tx.clone(),
                pending_joins: 0,
            },
        );
        Ok(tx)
    }

    fn handle_notice(&mut self, notice: SessionNotice) {
        match notice {
            SessionNotice::JoinHandled {
                document_id,
                session_id,
                connection_id,
                admitted,
            } => {
                if let Some(session) = self.sessions.get_mut(&document_id) {
                    if session.session_id == session_id {
                        session.pending_joins = session.pending_joins.saturating_sub(1);
                    }
                }
                if !admitted {
                    self.unroute(connection_id);
                }
            }
            SessionNotice::Idle {
                document_id,
                session_id,
            } => {
                let idle = self.sessions.get(&document_id).map_or(false, |session| {
                    session.session_id == session_id && session.pending_joins == 0
                });
                if idle {
                    self.close_session(&document_id);
                }
            }
            SessionNotice::Reset {
                document_id,
                session_id,
            } => {
                let current = self
                    .sessions
                    .get(&document_id)
                    .map_or(false, |session| session.session_id == session_id);
                if current {
                    self.close_session(&document_id);
                }
            }
        }
    }

    fn close_session(&mut self, document_id: &str) {
        let session = match self.sessions.remove(document_id) {
            Some(session) => session,
            None => return,
        };
        for entry in self.connections.values_mut() {
            if entry.document_id.as_deref() == Some(document_id) {
                entry.document_id = None;
            }
        }
        log::info!("Dropping session {} for {}", session.session_id, document_id);
        deliver(&session.tx, SessionCommand::Shutdown);
    }

    fn unroute(&mut self, connection_id: ConnectionId) {
        if let Some(entry) = self.connections.get_mut(&connection_id) {
            entry.document_id = None;
        }
    }

    fn handle_admin_command(&mut self, command: AdminCommand) {
        match command {
            AdminCommand::ListSessions { tx } => {
                let sessions = self
                    .sessions
                    .values()
                    .map(|session| session.tx.clone())
                    .collect::<Vec<_>>();
                // Sessions answer on their own schedule; don't hold up routing.
                tokio::spawn(async move {
                    let mut summaries = Vec::with_capacity(sessions.len());
                    for session in sessions {
                        if let Some(summary) = describe(&session).await {
                            summaries.push(summary);
                        }
                    }
                    summaries.sort_by(|a, b| a.document_id.cmp(&b.document_id));
                    let _ = tx.send(summaries);
                });
            }
            AdminCommand::DescribeSession { document_id, tx } => {
                let session = self.sessions.get(&document_id).map(|s| s.tx.clone());
                tokio::spawn(async move {
                    let summary = match session {
                        Some(session) => describe(&session).await,
                        None => None,
                    };
                    let _ = tx.send(summary);
                });
            }
        }
    }
}

/// Hands `command` to a session without ever blocking the router. A full
/// queue moves the send to its own task, so the command is late but never
/// lost.
fn deliver(session: &SessionTx, command: SessionCommand) {
    match session.try_send(command) {
        Ok(()) => {}
        Err(TrySendError::Full(command)) => {
            let session = session.clone();
            tokio::spawn(async move {
                let _ = session.send(command).await;
            });
        }
        Err(TrySendError::Closed(_)) => log::debug!("Session is gone, command dropped"),
    }
}

/// Reports a closed connection to the registry. Unlike ingress traffic
/// this is never dropped when the registry queue is full.
pub fn report_disconnect(srv_tx: &ServerTx, from: ConnectionId) {
    let command = ServerCommand::Connection(ConnectionCommand::Disconnect { from });
    match srv_tx.try_send(command) {
        Ok(()) => {}
        Err(TrySendError::Full(command)) => {
            log::debug!("Registry queue full, disconnect of {} waits", from);
            let srv_tx = srv_tx.clone();
            tokio::spawn(async move {
                if srv_tx.send(command).await.is_err() {
                    log::debug!("Registry stopped before disconnect of {}", from);
                }
            });
        }
        Err(TrySendError::Closed(_)) => {
            log::debug!("Registry stopped, disconnect of {} dropped", from)
        }
    }
}

async fn describe(session: &SessionTx) -> Option<SessionSummary> {
    let (tx, rx) = oneshot::channel();
    session.send(SessionCommand::Describe { tx }).await.ok()?;
    rx.await.ok()
}

fn reply_error(
    handle: &ConnectionHandle,
    to: &ClientMessage,
    code: &str,
    message: impl ToString,
) {
    let error = ServerMessage {
        client_seq: to.client_seq,
        ..ServerMessage::error(to.session_id.clone(), code, message)
    };
    if let Err(err) = handle.send(error) {
        log::debug!("Error reply to connection {} lost: {}", handle.id(), err);
    }
}

pub fn spawn_server(config: ServerConfig) -> ServerTx {
    let (srv_tx, mut srv_rx) = channel::<ServerCommand>(config.registry_queue_capacity);

    tokio::spawn(async move {
        let (notice_tx, mut notice_rx) = unbounded_channel::<SessionNotice>();
        let mut registry = Box::new(Registry::new(config, notice_tx));

        loop {
            tokio::select! {
                command = srv_rx.recv() => match command {
                    Some(command) => registry.handle_command(command),
                    None => break,
                },
                Some(notice) = notice_rx.recv() => registry.handle_notice(notice),
            }
        }
        log::info!("Registry stopped with {} sessions", registry.sessions.len());
    });

    srv_tx
}

#[cfg(test)]
mod tests {
    use system::EngineConfig;
    use tokio::sync::mpsc::{Receiver, UnboundedReceiver};

    use super::*;
    use crate::transport::{open, ConnectionReceiver, Outgoing};

    const DOC: &str = "doc-1";

    fn registry() -> (Registry, UnboundedReceiver<SessionNotice>) {
        let (notice_tx, notice_rx) = unbounded_channel();
        (Registry::new(ServerConfig::default(), notice_tx), notice_rx)
    }

    /// A session entry whose queue nobody drains until the test says so.
    fn stalled_session(registry: &mut Registry, capacity: usize) -> Receiver<SessionCommand> {
        let (tx, rx) = channel(capacity);
        let session_id = Session::new(DOC, EngineConfig::default(), std::time::Instant::now()).id();
        registry.sessions.insert(
            DOC.to_string(),
            SessionEntry {
                session_id,
                tx,
                pending_joins: 0,
            },
        );
        rx
    }

    fn connect(registry: &mut Registry, connection_id: ConnectionId) -> ConnectionReceiver {
        let (handle, receiver) = open(connection_id, 8);
        registry.handle_connection_command(ConnectionCommand::Connect {
            connection_id,
            handle,
        });
        receiver
    }

    fn route_to_doc(registry: &mut Registry, connection_id: ConnectionId) {
        if let Some(entry) = registry.connections.get_mut(&connection_id) {
            entry.document_id = Some(DOC.to_string());
        }
    }

    fn message(from: ConnectionId, payload: ClientPayload) -> ConnectionCommand {
        ConnectionCommand::Message {
            from,
            message: ClientMessage::new(DOC, payload),
        }
    }

    fn join(name: &str) -> ClientPayload {
        ClientPayload::Join(system::JoinRequest {
            user_id: name.to_lowercase(),
            display_name: name.into(),
            viewport: None,
            resume: None,
        })
    }

    fn error_code(item: Option<Outgoing>) -> String {
        match item {
            Some(Outgoing::Message(message)) => match &message.payload {
                system::ServerPayload::Error(error) => error.code.clone(),
                other => panic!("expected an error, got {:?}", other),
            },
            other => panic!("expected a message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn it_refuses_traffic_to_a_busy_session_without_blocking() {
        let (mut registry, _notices) = registry();
        let mut session_rx = stalled_session(&mut registry, 1);
        let mut rx_a = connect(&mut registry, 1);
        let mut rx_b = connect(&mut registry, 2);
        route_to_doc(&mut registry, 1);
        route_to_doc(&mut registry, 2);

        registry.handle_connection_command(message(1, ClientPayload::Ping));
        registry.handle_connection_command(message(1, ClientPayload::Ping));
        assert_eq!(error_code(rx_a.try_recv()), "session_busy");
        assert!(rx_b.try_recv().is_none());

        assert!(matches!(
            session_rx.try_recv(),
            Ok(SessionCommand::Inbound {
                connection_id: 1,
                ..
            })
        ));
        registry.handle_connection_command(message(2, ClientPayload::Ping));
        assert!(rx_b.try_recv().is_none());
        assert!(session_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn it_refuses_a_join_to_a_busy_session_and_forgets_it() {
        let (mut registry, _notices) = registry();
        let mut session_rx = stalled_session(&mut registry, 1);
        let _rx_a = connect(&mut registry, 1);
        let mut rx_b = connect(&mut registry, 2);

        registry.handle_connection_command(message(1, join("A")));
        registry.handle_connection_command(message(2, join("B")));
        assert_eq!(error_code(rx_b.try_recv()), "session_busy");
        assert_eq!(registry.connections[&2].document_id, None);
        assert_eq!(registry.sessions[DOC].pending_joins, 1);

        assert!(matches!(
            session_rx.try_recv(),
            Ok(SessionCommand::Join {
                connection_id: 1,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn it_never_drops_a_disconnect_for_a_busy_session() {
        let (mut registry, _notices) = registry();
        let mut session_rx = stalled_session(&mut registry, 1);
        let _rx_a = connect(&mut registry, 1);
        let _rx_b = connect(&mut registry, 2);
        route_to_doc(&mut registry, 1);
        route_to_doc(&mut registry, 2);

        registry.handle_connection_command(message(1, ClientPayload::Ping));
        registry.handle_connection_command(ConnectionCommand::Disconnect { from: 2 });
        assert!(!registry.connections.contains_key(&2));

        assert!(matches!(
            session_rx.recv().await,
            Some(SessionCommand::Inbound { .. })
        ));
        assert!(matches!(
            session_rx.recv().await,
            Some(SessionCommand::Disconnected { connection_id: 2 })
        ));
    }

    #[tokio::test]
    async fn it_queues_a_disconnect_behind_a_full_registry() {
        let (srv_tx, mut srv_rx) = channel::<ServerCommand>(1);
        srv_tx
            .try_send(ServerCommand::Connection(ConnectionCommand::Disconnect {
                from: 1,
            }))
            .expect("room for one");

        report_disconnect(&srv_tx, 2);

        for expected in [1, 2] {
            match srv_rx.recv().await {
                Some(ServerCommand::Connection(ConnectionCommand::Disconnect { from })) => {
                    assert_eq!(from, expected)
                }
                other => panic!("expected a disconnect, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn it_replaces_a_reset_session_on_the_next_join() {
        let (mut registry, _notices) = registry();
        let tx = registry.get_or_create_session(DOC).expect("created");
        let reset_id = registry.sessions[DOC].session_id;
        let mut rx_a = connect(&mut registry, 1);
        route_to_doc(&mut registry, 1);

        // A reset notice of an older session is ignored.
        registry.handle_notice(SessionNotice::Reset {
            document_id: DOC.to_string(),
            session_id: Session::new(DOC, EngineConfig::default(), std::time::Instant::now()).id(),
        });
        assert!(registry.sessions.contains_key(DOC));

        registry.handle_notice(SessionNotice::Reset {
            document_id: DOC.to_string(),
            session_id: reset_id,
        });
        assert!(registry.sessions.is_empty());
        assert_eq!(registry.connections[&1].document_id, None);
        tx.closed().await;

        registry.handle_connection_command(message(1, join("A")));
        let fresh_id = registry.sessions[DOC].session_id;
        assert_ne!(fresh_id, reset_id);

        let joined = loop {
            match rx_a.recv().await {
                Some(Outgoing::Message(message)) => {
                    if let system::ServerPayload::Joined(joined) = &message.payload {
                        break joined.clone();
                    }
                }
                other => panic!("expected joined, got {:?}", other),
            }
        };
        assert_eq!(joined.session_id, fresh_id);
    }
}
