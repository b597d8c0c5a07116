use std::collections::BTreeMap;
use std::sync::Arc;

use system::{ClientId, ServerMessage};

use crate::transport::{CloseReason, ConnectionHandle, SendError};

/// Fan-out of a session's outgoing traffic to its online members.
///
/// Sends never block and are never retried. Members whose send fails are
/// detached and returned to the caller.
#[derive(Debug, Default)]
pub struct Broadcaster {
    members: BTreeMap<ClientId, ConnectionHandle>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the handle previously attached for `client_id`, if any.
    pub fn attach(
        &mut self,
        client_id: ClientId,
        handle: ConnectionHandle,
    ) -> Option<ConnectionHandle> {
        self.members.insert(client_id, handle)
    }

    pub fn detach(&mut self, client_id: ClientId) -> Option<ConnectionHandle> {
        self.members.remove(&client_id)
    }

    pub fn handle(&self, client_id: ClientId) -> Option<&ConnectionHandle> {
        self.members.get(&client_id)
    }

    pub fn send_to(
        &mut self,
        client_id: ClientId,
        message: impl Into<Arc<ServerMessage>>,
    ) -> Result<(), SendError> {
        let result = match self.members.get(&client_id) {
            Some(handle) => handle.send(message),
            None => Err(SendError::Closed),
        };
        if result.is_err() {
            self.members.remove(&client_id);
        }
        result
    }

    pub fn broadcast(
        &mut self,
        message: impl Into<Arc<ServerMessage>>,
        exclude: Option<ClientId>,
    ) -> Vec<ClientId> {
        let message = message.into();
        let failed = self
            .members
            .iter()
            .filter(|(client_id, _)| Some(**client_id) != exclude)
            .filter_map(|(client_id, handle)| match handle.send(message.clone()) {
                Ok(()) => None,
                Err(err) => {
                    log::warn!("Broadcast to client {} failed: {}", client_id, err);
                    Some(*client_id)
                }
            })
            .collect::<Vec<_>>();
        for client_id in &failed {
            self.members.remove(client_id);
        }
        failed
    }

    /// Sends `last_words` to everyone, then closes and forgets all handles.
    pub fn close_all(&mut self, last_words: impl Into<Arc<ServerMessage>>, reason: CloseReason) {
        let message = last_words.into();
        for (_, handle) in std::mem::take(&mut self.members) {
            handle.close_with(message.clone(), reason);
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
