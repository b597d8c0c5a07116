use crate::mutation::AcceptedUpdate;
use crate::types::ServerSeq;
use std::collections::VecDeque;

/// Ring buffer of the most recent accepted updates of a session.
#[derive(Debug, Clone)]
pub struct ReplayLog {
    entries: VecDeque<AcceptedUpdate>,
    capacity: usize,
}

impl ReplayLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn push(&mut self, update: AcceptedUpdate) {
        if self.capacity == 0 {
            return;
        }
        debug_assert!(self
            .entries
            .back()
            .map_or(true, |last| last.server_seq + 1 == update.server_seq));
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(update);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn first_seq(&self) -> Option<ServerSeq> {
        self.entries.front().map(|u| u.server_seq)
    }

    pub fn get(&self, server_seq: ServerSeq) -> Option<&AcceptedUpdate> {
        let first = self.first_seq()?;
        if server_seq < first {
            return None;
        }
        self.entries.get((server_seq - first) as usize)
    }

    /// Every update after `last_seen` up to `current`, or `None` when the
    /// log no longer holds all of them.
    pub fn since(&self, last_seen: ServerSeq, current: ServerSeq) -> Option<Vec<AcceptedUpdate>> {
        if last_seen > current {
            return None;
        }
        if last_seen == current {
            return Some(Vec::new());
        }
        let first = self.first_seq()?;
        if first > last_seen + 1 {
            return None;
        }
        let missing = self
            .entries
            .iter()
            .filter(|u| u.server_seq > last_seen)
            .cloned()
            .collect::<Vec<_>>();
        if missing.len() as u64 == current - last_seen {
            Some(missing)
        } else {
            None
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
