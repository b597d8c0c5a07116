use crate::geometry::{Point, Viewport};
use crate::types::{ClientId, ConnectionId, Timestamp, UserId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A participant of a session, online or holding a reconnection slot.
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub client_id: ClientId,
    pub user_id: UserId,
    pub display_name: String,
    pub connection: Option<ConnectionId>,
    pub viewport: Option<Viewport>,
    pub cursor: Option<Point>,
    pub last_seen: Timestamp,
}

impl Member {
    pub fn is_online(&self) -> bool {
        self.connection.is_some()
    }
}

/// What other members get to see of a member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceInfo {
    pub client_id: ClientId,
    pub user_id: UserId,
    pub display_name: String,
    pub cursor: Option<Point>,
    pub viewport: Option<Viewport>,
}

impl From<&Member> for PresenceInfo {
    fn from(member: &Member) -> Self {
        Self {
            client_id: member.client_id,
            user_id: member.user_id.clone(),
            display_name: member.display_name.clone(),
            cursor: member.cursor,
            viewport: member.viewport,
        }
    }
}

/// Roster of a session together with each member's cursor and viewport.
#[derive(Debug, Clone, Default)]
pub struct PresenceTracker {
    members: BTreeMap<ClientId, Member>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, member: Member) {
        self.members.insert(member.client_id, member);
    }

    pub fn remove(&mut self, client_id: ClientId) -> Option<Member> {
        self.members.remove(&client_id)
    }

    pub fn get(&self, client_id: ClientId) -> Option<&Member> {
        self.members.get(&client_id)
    }

    pub fn get_mut(&mut self, client_id: ClientId) -> Option<&mut Member> {
        self.members.get_mut(&client_id)
    }

    pub fn find_by_connection(&self, connection: ConnectionId) -> Option<ClientId> {
        self.members
            .values()
            .find(|m| m.connection == Some(connection))
            .map(|m| m.client_id)
    }

    pub fn update_viewport(
        &mut self,
        client_id: ClientId,
        viewport: Viewport,
        now: Timestamp,
    ) -> bool {
        match self.members.get_mut(&client_id) {
            Some(member) => {
                member.viewport = Some(viewport);
                member.last_seen = now;
                true
            }
            None => false,
        }
    }

    pub fn update_cursor(&mut self, client_id: ClientId, point: Point, now: Timestamp) -> bool {
        match self.members.get_mut(&client_id) {
            Some(member) => {
                member.cursor = Some(point);
                member.last_seen = now;
                true
            }
            None => false,
        }
    }

    pub fn touch(&mut self, client_id: ClientId, now: Timestamp) {
        if let Some(member) = self.members.get_mut(&client_id) {
            member.last_seen = now;
        }
    }

    /// Online members, ordered by client id.
    pub fn presence_snapshot(&self) -> Vec<PresenceInfo> {
        self.members
            .values()
            .filter(|m| m.is_online())
            .map(PresenceInfo::from)
            .collect()
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    pub fn online_count(&self) -> usize {
        self.members.values().filter(|m| m.is_online()).count()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(client_id: ClientId, connection: Option<ConnectionId>) -> Member {
        Member {
            client_id,
            user_id: format!("user-{}", client_id),
            display_name: format!("User {}", client_id),
            connection,
            viewport: None,
            cursor: None,
            last_seen: 0,
        }
    }

    #[test]
    fn it_lists_only_online_members_in_order() {
        let mut presence = PresenceTracker::new();
        presence.insert(member(3, Some(30)));
        presence.insert(member(1, Some(10)));
        presence.insert(member(2, None));

        let ids = presence
            .presence_snapshot()
            .iter()
            .map(|p| p.client_id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(presence.find_by_connection(30), Some(3));
    }

    #[test]
    fn it_keeps_the_latest_cursor_and_viewport() {
        let mut presence = PresenceTracker::new();
        presence.insert(member(1, Some(10)));

        assert!(presence.update_cursor(1, Point::new(1.0, 2.0), 5));
        assert!(presence.update_cursor(1, Point::new(3.0, 4.0), 6));
        assert!(presence.update_viewport(1, Viewport::new(0.0, 0.0, 800.0, 600.0), 7));
        assert!(!presence.update_cursor(9, Point::new(0.0, 0.0), 8));

        let info = &presence.presence_snapshot()[0];
        assert_eq!(info.cursor, Some(Point::new(3.0, 4.0)));
        assert_eq!(info.viewport.map(|v| v.width), Some(800.0));
        assert_eq!(presence.get(1).map(|m| m.last_seen), Some(7));
    }
}
