use serde::{Deserialize, Serialize};

pub type ConnectionId = u32;
pub type ClientId = u32;
pub type SessionId = uuid::Uuid;
pub type DocumentId = String;
pub type ShapeId = String;
pub type UserId = String;
pub type MessageId = String;
pub type ServerSeq = u64;
pub type ClientSeq = u64;

/// Milliseconds since the unix epoch.
pub type Timestamp = i64;

pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

pub fn new_message_id() -> MessageId {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl std::default::Default for Color {
    fn default() -> Self {
        Self { r: 0, g: 0, b: 0 }
    }
}
