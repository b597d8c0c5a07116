//! Per-member connection lifecycle.
//!
//! ```text
//! Connected ──close──► Disconnected ──resume──► Reconnecting ──► Connected
//!                           │                        │
//!                           └──── grace elapsed ─────┴──► Expired ──► Removed
//! ```

use crate::mutation::AcceptedUpdate;
use crate::replay_log::ReplayLog;
use crate::types::{ClientId, ServerSeq};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    Connected,
    Disconnected { since: Instant },
    Reconnecting { since: Instant },
    Expired,
    Removed,
}

impl MemberState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected { .. } => "disconnected",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Expired => "expired",
            Self::Removed => "removed",
        }
    }
}

/// How a resuming member catches up.
#[derive(Debug, Clone, PartialEq)]
pub enum ResumePlan {
    /// Exactly the updates it missed, in order.
    Replay(Vec<AcceptedUpdate>),
    /// Too far behind (or unknown); send a full snapshot.
    Snapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeRejected {
    UnknownMember,
    AlreadyConnected,
    GraceElapsed,
}

#[derive(Debug, Clone)]
pub struct ReconnectionManager {
    grace: Duration,
    replay_threshold: u64,
    states: BTreeMap<ClientId, MemberState>,
}

impl ReconnectionManager {
    pub fn new(grace: Duration, replay_threshold: u64) -> Self {
        Self {
            grace,
            replay_threshold,
            states: BTreeMap::new(),
        }
    }

    pub fn state(&self, client_id: ClientId) -> Option<MemberState> {
        self.states.get(&client_id).copied()
    }

    pub fn connected(&mut self, client_id: ClientId) {
        self.states.insert(client_id, MemberState::Connected);
    }

    /// Returns false if the member was not connected.
    pub fn disconnected(&mut self, client_id: ClientId, now: Instant) -> bool {
        match self.states.get_mut(&client_id) {
            Some(state) if *state == MemberState::Connected => {
                *state = MemberState::Disconnected { since: now };
                true
            }
            _ => false,
        }
    }

    pub fn begin_resume(
        &mut self,
        client_id: ClientId,
        now: Instant,
    ) -> Result<(), ResumeRejected> {
        let grace = self.grace;
        let state = self
            .states
            .get_mut(&client_id)
            .ok_or(ResumeRejected::UnknownMember)?;
        match *state {
            MemberState::Disconnected { since } | MemberState::Reconnecting { since } => {
                if now.saturating_duration_since(since) > grace {
                    *state = MemberState::Expired;
                    Err(ResumeRejected::GraceElapsed)
                } else {
                    *state = MemberState::Reconnecting { since };
                    Ok(())
                }
            }
            MemberState::Connected => Err(ResumeRejected::AlreadyConnected),
            MemberState::Expired | MemberState::Removed => Err(ResumeRejected::GraceElapsed),
        }
    }

    pub fn resumed(&mut self, client_id: ClientId) {
        if let Some(state) = self.states.get_mut(&client_id) {
            if let MemberState::Reconnecting { .. } = state {
                *state = MemberState::Connected;
            }
        }
    }

    /// Moves members whose grace window elapsed to `Expired` and returns them.
    pub fn expire(&mut self, now: Instant) -> Vec<ClientId> {
        let grace = self.grace;
        let mut expired = Vec::new();
        for (client_id, state) in self.states.iter_mut() {
            match *state {
                MemberState::Disconnected { since } | MemberState::Reconnecting { since }
                    if now.saturating_duration_since(since) > grace =>
                {
                    *state = MemberState::Expired;
                    expired.push(*client_id);
                }
                _ => {}
            }
        }
        expired
    }

    /// Forgets the member. Its state reads `Removed` until the slot is reused.
    pub fn removed(&mut self, client_id: ClientId) {
        self.states.insert(client_id, MemberState::Removed);
    }

    /// Drops `Removed` entries.
    pub fn prune(&mut self) {
        self.states.retain(|_, state| *state != MemberState::Removed);
    }

    pub fn plan_resume(
        &self,
        last_seen: ServerSeq,
        current: ServerSeq,
        log: &ReplayLog,
    ) -> ResumePlan {
        if last_seen > current || current - last_seen > self.replay_threshold {
            return ResumePlan::Snapshot;
        }
        match log.since(last_seen, current) {
            Some(updates) => ResumePlan::Replay(updates),
            None => ResumePlan::Snapshot,
        }
    }

    pub fn states(&self) -> impl Iterator<Item = (&ClientId, &MemberState)> {
        self.states.iter()
    }
}
