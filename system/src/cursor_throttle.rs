use crate::geometry::Point;
use crate::types::ClientId;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Pending {
    point: Point,
    deadline: Instant,
}

/// Coalesces pointer moves so each client emits at most one cursor event
/// per interval, always carrying the latest point.
#[derive(Debug, Clone)]
pub struct CursorThrottler {
    interval: Duration,
    pending: BTreeMap<ClientId, Pending>,
}

impl CursorThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            pending: BTreeMap::new(),
        }
    }

    /// The first point of a quiet period arms a deadline one interval out;
    /// later points before that deadline only replace the pending point.
    pub fn schedule(&mut self, client_id: ClientId, point: Point, now: Instant) {
        let interval = self.interval;
        self.pending
            .entry(client_id)
            .and_modify(|pending| pending.point = point)
            .or_insert(Pending {
                point,
                deadline: now + interval,
            });
    }

    /// Pending points whose deadline passed, in client id order.
    pub fn due(&mut self, now: Instant) -> Vec<(ClientId, Point)> {
        let due = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(client_id, pending)| (*client_id, pending.point))
            .collect::<Vec<_>>();
        for (client_id, _) in &due {
            self.pending.remove(client_id);
        }
        due
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|pending| pending.deadline).min()
    }

    pub fn forget(&mut self, client_id: ClientId) {
        self.pending.remove(&client_id);
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }
}
