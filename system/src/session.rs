//! The sequential core of a collaboration session.
//!
//! A `Session` owns the canonical shapes, the roster, the cursor throttler,
//! the replay log and the reconnection state of one document. Nothing here
//! is shared: whoever owns the `Session` value is the single writer, and
//! every accepted mutation gets its `server_seq` from this one place.

use std::collections::{HashMap, VecDeque};
use std::num::Wrapping;
use std::time::Instant;

use crate::config::EngineConfig;
use crate::cursor_throttle::CursorThrottler;
use crate::error::SessionError;
use crate::geometry::{Point, Viewport};
use crate::message::{JoinRequest, PresenceEvent};
use crate::mutation::{AcceptedUpdate, ShapeOp};
use crate::presence::{Member, PresenceInfo, PresenceTracker};
use crate::reconnection::{MemberState, ReconnectionManager, ResumePlan, ResumeRejected};
use crate::replay_log::ReplayLog;
use crate::shape::Shape;
use crate::shape_store::{Prepared, ShapeStore, StoreSnapshot};
use crate::types::*;
use serde::Serialize;

/// How a member admitted by `add_member` catches up with the session.
#[derive(Debug, Clone, PartialEq)]
pub enum Catchup {
    /// Shapes near the member's viewport first, the rest afterwards. Both
    /// belong to the snapshot at `server_seq`.
    Snapshot {
        visible: Vec<Shape>,
        rest: Vec<Shape>,
        server_seq: ServerSeq,
    },
    /// Updates the member missed while away.
    Replay {
        updates: Vec<AcceptedUpdate>,
        server_seq: ServerSeq,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub client_id: ClientId,
    pub resumed: bool,
    /// A previous connection of the same member that is now superseded.
    pub replaced: Option<ConnectionId>,
    pub catchup: Catchup,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    Accepted(AcceptedUpdate),
    /// Seen before; nothing was applied again.
    Duplicate {
        server_seq: Option<ServerSeq>,
        shape: Option<Shape>,
    },
    NoOp,
    /// Upsert against a delete the client had not seen. Carries the tombstone.
    Stale(Shape),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickOutcome {
    pub cursors: Vec<PresenceEvent>,
    pub expired: Vec<ClientId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemberSummary {
    pub client_id: ClientId,
    pub user_id: UserId,
    pub display_name: String,
    pub state: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub document_id: DocumentId,
    pub created_at: Timestamp,
    pub server_seq: ServerSeq,
    pub shapes: usize,
    pub tombstones: usize,
    pub replay_log: usize,
    pub members: Vec<MemberSummary>,
}

#[derive(Debug, Clone)]
struct RecentMutations {
    order: VecDeque<(ClientId, MessageId)>,
    outcomes: HashMap<(ClientId, MessageId), Option<ServerSeq>>,
    capacity: usize,
}

impl RecentMutations {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            outcomes: HashMap::new(),
            capacity,
        }
    }

    fn get(&self, client_id: ClientId, message_id: &str) -> Option<Option<ServerSeq>> {
        self.outcomes
            .get(&(client_id, message_id.to_string()))
            .copied()
    }

    fn remember(&mut self, client_id: ClientId, message_id: &str, server_seq: Option<ServerSeq>) {
        if self.capacity == 0 {
            return;
        }
        let key = (client_id, message_id.to_string());
        if self.outcomes.insert(key.clone(), server_seq).is_none() {
            self.order.push_back(key);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.outcomes.remove(&oldest);
            }
        }
    }
}

pub struct Session {
    id: SessionId,
    document_id: DocumentId,
    created_at: Timestamp,
    config: EngineConfig,
    store: ShapeStore,
    presence: PresenceTracker,
    throttler: CursorThrottler,
    replay_log: ReplayLog,
    reconnection: ReconnectionManager,
    recent: RecentMutations,
    client_id_source: Wrapping<ClientId>,
    empty_since: Option<Instant>,
}

impl Session {
    pub fn new(document_id: impl Into<DocumentId>, config: EngineConfig, now: Instant) -> Self {
        let document_id = document_id.into();
        let id = uuid::Uuid::new_v4();
        log::info!("Session {} created for document {}", id, document_id);
        Self {
            id,
            document_id,
            created_at: now_millis(),
            store: ShapeStore::new(&config),
            presence: PresenceTracker::new(),
            throttler: CursorThrottler::new(config.cursor_interval()),
            replay_log: ReplayLog::new(config.replay_log_capacity),
            reconnection: ReconnectionManager::new(
                config.reconnect_grace(),
                config.replay_threshold,
            ),
            recent: RecentMutations::new(config.dedupe_window),
            client_id_source: Wrapping(0),
            empty_since: Some(now),
            config,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn server_seq(&self) -> ServerSeq {
        self.store.server_seq()
    }

    pub fn store(&self) -> &ShapeStore {
        &self.store
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.store.snapshot()
    }

    pub fn member(&self, client_id: ClientId) -> Option<&Member> {
        self.presence.get(client_id)
    }

    pub fn member_state(&self, client_id: ClientId) -> Option<MemberState> {
        self.reconnection.state(client_id)
    }

    pub fn client_for_connection(&self, connection: ConnectionId) -> Option<ClientId> {
        self.presence.find_by_connection(connection)
    }

    pub fn presence_snapshot(&self) -> Vec<PresenceInfo> {
        self.presence.presence_snapshot()
    }

    /// Online members with their connections.
    pub fn online_members(&self) -> impl Iterator<Item = (ClientId, ConnectionId)> + '_ {
        self.presence
            .members()
            .filter_map(|m| m.connection.map(|c| (m.client_id, c)))
    }

    /// Admits a member, either as a newcomer or by resuming a slot it held
    /// before a disconnect.
    pub fn add_member(
        &mut self,
        connection: ConnectionId,
        join: &JoinRequest,
        now: Instant,
    ) -> Result<Admission, SessionError> {
        let timestamp = now_millis();

        if let Some(resume) = &join.resume {
            if resume.session_id == self.id {
                if let Some(admission) = self.try_resume(connection, join, now, timestamp)? {
                    return Ok(admission);
                }
            } else {
                log::debug!(
                    "Resume for session {} arrived at {}, joining fresh",
                    resume.session_id,
                    self.id
                );
            }
        }

        if self.presence.len() >= self.config.max_members {
            return Err(SessionError::SessionFull {
                limit: self.config.max_members,
            });
        }

        let client_id = self.new_client_id();
        self.presence.insert(Member {
            client_id,
            user_id: join.user_id.clone(),
            display_name: join.display_name.clone(),
            connection: Some(connection),
            viewport: join.viewport,
            cursor: None,
            last_seen: timestamp,
        });
        self.reconnection.connected(client_id);
        self.empty_since = None;
        log::info!(
            "Client {} ({}) joined session {} at seq {}",
            client_id,
            join.display_name,
            self.id,
            self.server_seq()
        );

        Ok(Admission {
            client_id,
            resumed: false,
            replaced: None,
            catchup: self.snapshot_catchup(join.viewport.as_ref()),
        })
    }

    fn try_resume(
        &mut self,
        connection: ConnectionId,
        join: &JoinRequest,
        now: Instant,
        timestamp: Timestamp,
    ) -> Result<Option<Admission>, SessionError> {
        let resume = match &join.resume {
            Some(resume) => resume,
            None => return Ok(None),
        };
        let client_id = resume.client_id;

        let mut replaced = None;
        match self.reconnection.begin_resume(client_id, now) {
            Ok(()) => {}
            Err(ResumeRejected::AlreadyConnected) => {
                // The old socket has not reported its close yet.
                replaced = self.member(client_id).and_then(|m| m.connection);
                self.reconnection.disconnected(client_id, now);
                if self.reconnection.begin_resume(client_id, now).is_err() {
                    return Ok(None);
                }
            }
            Err(ResumeRejected::GraceElapsed) => {
                log::info!("Client {} resumed too late, joining fresh", client_id);
                self.drop_member(client_id, now);
                return Ok(None);
            }
            Err(ResumeRejected::UnknownMember) => return Ok(None),
        }

        let member = match self.presence.get_mut(client_id) {
            Some(member) => member,
            None => return Err(SessionError::UnknownMember(client_id)),
        };
        member.connection = Some(connection);
        member.display_name = join.display_name.clone();
        member.last_seen = timestamp;
        if join.viewport.is_some() {
            member.viewport = join.viewport;
        }
        self.reconnection.resumed(client_id);
        self.empty_since = None;

        let current = self.server_seq();
        let catchup = match self
            .reconnection
            .plan_resume(resume.last_server_seq, current, &self.replay_log)
        {
            ResumePlan::Replay(updates) => Catchup::Replay {
                updates,
                server_seq: current,
            },
            ResumePlan::Snapshot => self.snapshot_catchup(join.viewport.as_ref()),
        };
        log::info!(
            "Client {} resumed session {} from seq {} (current {})",
            client_id,
            self.id,
            resume.last_server_seq,
            current
        );

        Ok(Some(Admission {
            client_id,
            resumed: true,
            replaced,
            catchup,
        }))
    }

    /// Explicit leave: the member's slot goes away immediately.
    pub fn remove_member(&mut self, client_id: ClientId, now: Instant) -> Option<Member> {
        let member = self.drop_member(client_id, now);
        if let Some(member) = &member {
            log::info!("Client {} ({}) left session {}", client_id, member.display_name, self.id);
        }
        member
    }

    /// Transport went away; the slot is held for the reconnection grace
    /// window. Returns false if the member was not online.
    pub fn disconnect_member(&mut self, client_id: ClientId, now: Instant) -> bool {
        let member = match self.presence.get_mut(client_id) {
            Some(member) if member.connection.is_some() => member,
            _ => return false,
        };
        member.connection = None;
        self.throttler.forget(client_id);
        self.reconnection.disconnected(client_id, now);
        log::info!("Client {} disconnected from session {}", client_id, self.id);
        true
    }

    fn drop_member(&mut self, client_id: ClientId, now: Instant) -> Option<Member> {
        let member = self.presence.remove(client_id);
        self.throttler.forget(client_id);
        self.reconnection.removed(client_id);
        self.reconnection.prune();
        if self.presence.is_empty() && self.empty_since.is_none() {
            self.empty_since = Some(now);
        }
        member
    }

    /// Runs a client mutation through the sequential path. Fatal errors
    /// mean the session state can no longer be trusted.
    pub fn apply_mutation(
        &mut self,
        sender: ClientId,
        message_id: &str,
        client_seq: Option<ClientSeq>,
        op: &ShapeOp,
    ) -> Result<MutationOutcome, SessionError> {
        if self.presence.get(sender).is_none() {
            return Err(SessionError::UnknownMember(sender));
        }
        let timestamp = now_millis();
        self.presence.touch(sender, timestamp);

        if let Some(server_seq) = self.recent.get(sender, message_id) {
            log::debug!("Duplicate mutation {} from client {}", message_id, sender);
            let shape = server_seq
                .and_then(|seq| self.replay_log.get(seq))
                .map(|update| update.shape.clone());
            return Ok(MutationOutcome::Duplicate { server_seq, shape });
        }

        match self.store.prepare(op, timestamp)? {
            Prepared::Accept { op, shape } => {
                let update = AcceptedUpdate {
                    server_seq: self.store.server_seq() + 1,
                    sender_id: sender,
                    message_id: message_id.to_string(),
                    client_seq,
                    op,
                    shape,
                };
                self.store.apply_accepted(&update)?;
                self.replay_log.push(update.clone());
                self.recent
                    .remember(sender, message_id, Some(update.server_seq));
                Ok(MutationOutcome::Accepted(update))
            }
            Prepared::NoOp => {
                self.recent.remember(sender, message_id, None);
                Ok(MutationOutcome::NoOp)
            }
            Prepared::Stale(tombstone) => {
                log::debug!(
                    "Stale upsert of {} from client {}, tombstone v{}",
                    tombstone.id,
                    sender,
                    tombstone.version
                );
                Ok(MutationOutcome::Stale(tombstone))
            }
        }
    }

    pub fn update_viewport(&mut self, client_id: ClientId, viewport: Viewport) -> bool {
        self.presence
            .update_viewport(client_id, viewport, now_millis())
    }

    /// Records the pointer position; the broadcast goes out from `tick`.
    pub fn update_cursor(
        &mut self,
        client_id: ClientId,
        point: Point,
        viewport: Option<Viewport>,
        now: Instant,
    ) -> bool {
        let timestamp = now_millis();
        if !self.presence.update_cursor(client_id, point, timestamp) {
            return false;
        }
        if let Some(viewport) = viewport {
            self.presence.update_viewport(client_id, viewport, timestamp);
        }
        self.throttler.schedule(client_id, point, now);
        true
    }

    pub fn next_cursor_deadline(&self) -> Option<Instant> {
        self.throttler.next_deadline()
    }

    /// Periodic housekeeping: due cursor events, expired reconnection slots,
    /// old tombstones.
    pub fn tick(&mut self, now: Instant) -> TickOutcome {
        let cursors = self
            .throttler
            .due(now)
            .into_iter()
            .filter_map(|(client_id, point)| {
                self.presence.get(client_id).map(|member| PresenceEvent {
                    client_id,
                    display_name: Some(member.display_name.clone()),
                    x: Some(point.x),
                    y: Some(point.y),
                    viewport: member.viewport,
                    left: false,
                })
            })
            .collect();

        let expired = self.reconnection.expire(now);
        for client_id in &expired {
            log::info!("Client {} reconnection window expired", client_id);
            self.drop_member(*client_id, now);
        }

        self.store.purge_tombstones(now_millis());

        TickOutcome { cursors, expired }
    }

    /// True once the session had no members for longer than its grace.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.empty_since.map_or(false, |since| {
            now.saturating_duration_since(since) > self.config.session_grace()
        })
    }

    pub fn is_empty(&self) -> bool {
        self.presence.is_empty()
    }

    pub fn presence_left(&self, client_id: ClientId) -> PresenceEvent {
        PresenceEvent {
            client_id,
            display_name: None,
            x: None,
            y: None,
            viewport: None,
            left: true,
        }
    }

    pub fn presence_joined(&self, client_id: ClientId) -> Option<PresenceEvent> {
        self.presence.get(client_id).map(|member| PresenceEvent {
            client_id,
            display_name: Some(member.display_name.clone()),
            x: member.cursor.map(|c| c.x),
            y: member.cursor.map(|c| c.y),
            viewport: member.viewport,
            left: false,
        })
    }

    /// Full resync for a member that asked for it.
    pub fn snapshot_catchup(&self, viewport: Option<&Viewport>) -> Catchup {
        match viewport {
            Some(viewport) => {
                let (visible, rest) = self.store.partition_by_viewport(viewport);
                Catchup::Snapshot {
                    visible,
                    rest,
                    server_seq: self.server_seq(),
                }
            }
            None => {
                let snapshot = self.store.snapshot();
                Catchup::Snapshot {
                    visible: snapshot.shapes,
                    rest: Vec::new(),
                    server_seq: snapshot.server_seq,
                }
            }
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id,
            document_id: self.document_id.clone(),
            created_at: self.created_at,
            server_seq: self.server_seq(),
            shapes: self.store.live_count(),
            tombstones: self.store.tombstone_count(),
            replay_log: self.replay_log.len(),
            members: self
                .presence
                .members()
                .map(|m| MemberSummary {
                    client_id: m.client_id,
                    user_id: m.user_id.clone(),
                    display_name: m.display_name.clone(),
                    state: self
                        .reconnection
                        .state(m.client_id)
                        .map_or("unknown", |s| s.name()),
                })
                .collect(),
        }
    }

    fn new_client_id(&mut self) -> ClientId {
        loop {
            self.client_id_source += Wrapping(1);
            let candidate = self.client_id_source.0;
            if candidate != 0 && self.presence.get(candidate).is_none() {
                break candidate;
            }
        }
    }
}
