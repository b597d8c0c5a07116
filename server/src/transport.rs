//! Bounded outbound queue between a session and one WebSocket connection.
//!
//! The session side holds a `ConnectionHandle` and never waits on it. The
//! WebSocket actor drains the matching `ConnectionReceiver`.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use system::{ConnectionId, ServerMessage};
use thiserror::Error;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client left or the socket went away.
    Normal,
    /// The client could not keep up with ordered updates.
    Lagging,
    /// A resume of the same member arrived on another connection.
    Replaced,
    /// The session hit an invariant violation and was dropped.
    SessionReset,
}

impl CloseReason {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Lagging => "lagging",
            Self::Replaced => "replaced",
            Self::SessionReset => "session_reset",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("connection is closed")]
    Closed,

    #[error("connection fell behind and was closed")]
    Lagging,
}

impl SendError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Lagging => "lagging",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Message(Arc<ServerMessage>),
    Close(CloseReason),
}

#[derive(Debug)]
struct Queue {
    items: VecDeque<Outgoing>,
    closed: bool,
}

#[derive(Debug)]
struct Shared {
    id: ConnectionId,
    capacity: usize,
    queue: Mutex<Queue>,
    notify: Notify,
}

#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

#[derive(Debug)]
pub struct ConnectionReceiver {
    shared: Arc<Shared>,
}

pub fn open(id: ConnectionId, capacity: usize) -> (ConnectionHandle, ConnectionReceiver) {
    let shared = Arc::new(Shared {
        id,
        capacity: capacity.max(1),
        queue: Mutex::new(Queue {
            items: VecDeque::with_capacity(capacity.min(64)),
            closed: false,
        }),
        notify: Notify::new(),
    });
    (
        ConnectionHandle {
            shared: shared.clone(),
        },
        ConnectionReceiver { shared },
    )
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn send(&self, message: impl Into<Arc<ServerMessage>>) -> Result<(), SendError> {
        let message = message.into();
        let mut queue = self.shared.queue.lock();
        if queue.closed {
            return Err(SendError::Closed);
        }

        if queue.items.len() >= self.shared.capacity {
            let ephemeral = queue.items.iter().position(|item| match item {
                Outgoing::Message(m) => m.payload.is_ephemeral(),
                Outgoing::Close(_) => false,
            });
            match ephemeral {
                Some(index) => {
                    queue.items.remove(index);
                    log::debug!("Connection {}: dropped an ephemeral message", self.shared.id);
                }
                None => {
                    log::warn!(
                        "Connection {}: outbound queue full ({}), closing",
                        self.shared.id,
                        self.shared.capacity
                    );
                    Self::close_locked(&mut queue, None, CloseReason::Lagging);
                    drop(queue);
                    self.shared.notify.notify_one();
                    return Err(SendError::Lagging);
                }
            }
        }

        queue.items.push_back(Outgoing::Message(message));
        drop(queue);
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Discards whatever is still queued and tells the receiver to close.
    pub fn close(&self, reason: CloseReason) {
        self.close_inner(None, reason);
    }

    /// Like `close`, but `last_words` still goes out before the close.
    pub fn close_with(&self, last_words: impl Into<Arc<ServerMessage>>, reason: CloseReason) {
        self.close_inner(Some(last_words.into()), reason);
    }

    fn close_inner(&self, last_words: Option<Arc<ServerMessage>>, reason: CloseReason) {
        let mut queue = self.shared.queue.lock();
        if queue.closed {
            return;
        }
        Self::close_locked(&mut queue, last_words, reason);
        drop(queue);
        self.shared.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.queue.lock().closed
    }

    pub fn queued(&self) -> usize {
        self.shared.queue.lock().items.len()
    }

    /// How many more messages fit before the queue overflows.
    pub fn room(&self) -> usize {
        let queue = self.shared.queue.lock();
        self.shared.capacity.saturating_sub(queue.items.len())
    }

    fn close_locked(
        queue: &mut Queue,
        last_words: Option<Arc<ServerMessage>>,
        reason: CloseReason,
    ) {
        queue.items.clear();
        if let Some(message) = last_words {
            queue.items.push_back(Outgoing::Message(message));
        }
        queue.items.push_back(Outgoing::Close(reason));
        queue.closed = true;
    }
}

impl ConnectionReceiver {
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    /// Next outgoing item. Returns `None` once the handle was closed and
    /// the close itself has been handed out.
    pub async fn recv(&mut self) -> Option<Outgoing> {
        loop {
            {
                let mut queue = self.shared.queue.lock();
                if let Some(item) = queue.items.pop_front() {
                    return Some(item);
                }
                if queue.closed {
                    return None;
                }
            }
            self.shared.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<Outgoing> {
        self.shared.queue.lock().items.pop_front()
    }
}

impl Drop for ConnectionReceiver {
    fn drop(&mut self) {
        let mut queue = self.shared.queue.lock();
        queue.closed = true;
        queue.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use system::{Ack, PresenceEvent, ServerPayload};

    fn ack() -> ServerMessage {
        ServerMessage::new("doc-1", ServerPayload::Ack(Ack::NoOp))
    }

    fn presence(x: f32) -> ServerMessage {
        ServerMessage::new(
            "doc-1",
            ServerPayload::Presence(PresenceEvent {
                client_id: 1,
                display_name: None,
                x: Some(x),
                y: Some(0.0),
                viewport: None,
                left: false,
            }),
        )
    }

    fn payload(item: Option<Outgoing>) -> ServerPayload {
        match item {
            Some(Outgoing::Message(message)) => message.payload.clone(),
            other => panic!("expected a message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn it_delivers_in_order() {
        let (handle, mut receiver) = open(1, 8);
        handle.send(ack()).expect("send");
        handle.send(presence(1.0)).expect("send");
        assert_eq!(payload(receiver.recv().await).name(), "ack");
        assert_eq!(payload(receiver.recv().await).name(), "presence");
        assert_eq!(receiver.id(), handle.id());
    }

    #[tokio::test]
    async fn it_wakes_a_waiting_receiver() {
        let (handle, mut receiver) = open(1, 8);
        let waiter = tokio::spawn(async move { receiver.recv().await });
        tokio::task::yield_now().await;
        handle.send(ack()).expect("send");
        let item = waiter.await.expect("join");
        assert_eq!(payload(item).name(), "ack");
    }

    #[test]
    fn it_drops_ephemeral_messages_first_on_overflow() {
        let (handle, mut receiver) = open(1, 2);
        handle.send(presence(1.0)).expect("send");
        handle.send(ack()).expect("send");
        handle.send(ack()).expect("presence makes room");
        assert_eq!(handle.queued(), 2);
        assert_eq!(payload(receiver.try_recv()).name(), "ack");
        assert_eq!(payload(receiver.try_recv()).name(), "ack");
    }

    #[tokio::test]
    async fn it_closes_a_lagging_connection() {
        let (handle, mut receiver) = open(1, 2);
        handle.send(ack()).expect("send");
        handle.send(ack()).expect("send");
        assert_eq!(handle.send(ack()), Err(SendError::Lagging));
        assert!(handle.is_closed());
        assert_eq!(handle.send(ack()), Err(SendError::Closed));

        assert_eq!(receiver.recv().await, Some(Outgoing::Close(CloseReason::Lagging)));
        assert_eq!(receiver.recv().await, None);
    }

    #[tokio::test]
    async fn it_rejects_sends_after_close() {
        let (handle, mut receiver) = open(1, 4);
        handle.send(ack()).expect("send");
        handle.close(CloseReason::Normal);
        handle.close(CloseReason::Lagging);
        assert_eq!(handle.send(ack()), Err(SendError::Closed));
        assert_eq!(receiver.recv().await, Some(Outgoing::Close(CloseReason::Normal)));
        assert_eq!(receiver.recv().await, None);
    }

    #[tokio::test]
    async fn it_keeps_the_last_words_of_a_close() {
        let (handle, mut receiver) = open(1, 4);
        handle.send(presence(1.0)).expect("send");
        handle.close_with(ack(), CloseReason::SessionReset);
        assert_eq!(payload(receiver.recv().await).name(), "ack");
        assert_eq!(receiver.recv().await, Some(Outgoing::Close(CloseReason::SessionReset)));
    }

    #[test]
    fn it_reports_the_room_left() {
        let (handle, mut receiver) = open(1, 3);
        assert_eq!(handle.room(), 3);
        handle.send(ack()).expect("send");
        handle.send(presence(1.0)).expect("send");
        assert_eq!(handle.room(), 1);
        receiver.try_recv();
        assert_eq!(handle.room(), 2);
    }

    #[test]
    fn it_closes_when_the_receiver_goes_away() {
        let (handle, receiver) = open(1, 4);
        drop(receiver);
        assert_eq!(handle.send(ack()), Err(SendError::Closed));
    }
}
