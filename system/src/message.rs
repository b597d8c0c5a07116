use crate::error::ProtocolError;
use crate::geometry::Viewport;
use crate::mutation::{AcceptedUpdate, ShapeOp, ShapeOpKind};
use crate::presence::PresenceInfo;
use crate::shape::Shape;
use crate::types::*;
use serde::{Deserialize, Serialize};

/// Envelope of everything a client sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    pub id: MessageId,
    /// The document the client works on.
    pub session_id: DocumentId,
    #[serde(default)]
    pub sender_id: Option<ClientId>,
    #[serde(default)]
    pub client_seq: Option<ClientSeq>,
    #[serde(default)]
    pub timestamp: Timestamp,
    pub payload: ClientPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientPayload {
    Join(JoinRequest),
    Leave,
    Mutate(ShapeOp),
    Cursor(CursorMove),
    Ping,
    SnapshotRequest,
}

impl ClientPayload {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Join(_) => "join",
            Self::Leave => "leave",
            Self::Mutate(_) => "mutate",
            Self::Cursor(_) => "cursor",
            Self::Ping => "ping",
            Self::SnapshotRequest => "snapshot_request",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default)]
    pub viewport: Option<Viewport>,
    #[serde(default)]
    pub resume: Option<ResumeRequest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeRequest {
    pub client_id: ClientId,
    pub session_id: SessionId,
    pub last_server_seq: ServerSeq,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorMove {
    pub x: f32,
    pub y: f32,
    #[serde(default)]
    pub viewport: Option<Viewport>,
}

/// Envelope of everything the server sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    pub id: MessageId,
    pub session_id: DocumentId,
    pub sender_id: Option<ClientId>,
    pub client_seq: Option<ClientSeq>,
    pub server_seq: Option<ServerSeq>,
    pub timestamp: Timestamp,
    pub payload: ServerPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerPayload {
    Joined(Joined),
    Snapshot(SnapshotChunk),
    Resumed(Resumed),
    Update(ShapeUpdate),
    Ack(Ack),
    Presence(PresenceEvent),
    Error(ErrorPayload),
    Pong,
}

impl ServerPayload {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Joined(_) => "joined",
            Self::Snapshot(_) => "snapshot",
            Self::Resumed(_) => "resumed",
            Self::Update(_) => "update",
            Self::Ack(_) => "ack",
            Self::Presence(_) => "presence",
            Self::Error(_) => "error",
            Self::Pong => "pong",
        }
    }

    /// Messages a slow consumer may lose without diverging.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, Self::Presence(_) | Self::Pong)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Joined {
    pub client_id: ClientId,
    pub session_id: SessionId,
    /// Shapes around the client's viewport, or all of them.
    pub snapshot: Vec<Shape>,
    pub server_seq: ServerSeq,
    pub members: Vec<PresenceInfo>,
    /// False when `snapshot` chunks with the remaining shapes follow.
    pub complete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotChunk {
    pub shapes: Vec<Shape>,
    pub server_seq: ServerSeq,
    pub last: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resumed {
    pub client_id: ClientId,
    pub session_id: SessionId,
    pub server_seq: ServerSeq,
    /// Number of `update` messages that follow.
    pub replayed: usize,
    pub members: Vec<PresenceInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeUpdate {
    pub shape_op: ShapeOpKind,
    pub shape: Shape,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ack {
    /// The mutation was accepted (now or, for a duplicate, earlier).
    Applied {
        server_seq: ServerSeq,
        shape: Option<Shape>,
    },
    /// Nothing to do, e.g. deleting a shape that is already gone.
    NoOp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub client_id: ClientId,
    pub display_name: Option<String>,
    pub x: Option<f32>,
    pub y: Option<f32>,
    pub viewport: Option<Viewport>,
    pub left: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

impl ClientMessage {
    pub fn new(session_id: impl Into<DocumentId>, payload: ClientPayload) -> Self {
        Self {
            id: new_message_id(),
            session_id: session_id.into(),
            sender_id: None,
            client_seq: None,
            timestamp: now_millis(),
            payload,
        }
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_bincode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_bincode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(bincode::serialize(self)?)
    }
}

impl ServerMessage {
    pub fn new(session_id: impl Into<DocumentId>, payload: ServerPayload) -> Self {
        Self {
            id: new_message_id(),
            session_id: session_id.into(),
            sender_id: None,
            client_seq: None,
            server_seq: None,
            timestamp: now_millis(),
            payload,
        }
    }

    pub fn update(session_id: impl Into<DocumentId>, update: &AcceptedUpdate) -> Self {
        Self {
            sender_id: Some(update.sender_id),
            server_seq: Some(update.server_seq),
            ..Self::new(
                session_id,
                ServerPayload::Update(ShapeUpdate {
                    shape_op: update.op,
                    shape: update.shape.clone(),
                }),
            )
        }
    }

    pub fn error(session_id: impl Into<DocumentId>, code: &str, message: impl ToString) -> Self {
        Self::new(
            session_id,
            ServerPayload::Error(ErrorPayload {
                code: code.to_string(),
                message: message.to_string(),
            }),
        )
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_bincode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_bincode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(bincode::serialize(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::{ShapeDraft, ShapeKind};

    #[test]
    fn it_parses_a_minimal_json_join() {
        let text = r#"{
            "id": "m-1",
            "session_id": "doc-1",
            "payload": { "join": { "user_id": "u-1", "display_name": "Ann" } }
        }"#;
        let message = ClientMessage::from_json(text).expect("valid join");
        assert_eq!(message.session_id, "doc-1");
        assert_eq!(message.client_seq, None);
        match message.payload {
            ClientPayload::Join(join) => {
                assert_eq!(join.display_name, "Ann");
                assert!(join.resume.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn it_parses_unit_and_tagged_payloads() {
        let leave = ClientMessage::from_json(r#"{"id":"m","session_id":"d","payload":"leave"}"#)
            .expect("valid leave");
        assert_eq!(leave.payload, ClientPayload::Leave);

        let mutate = ClientMessage::from_json(
            r#"{"id":"m","session_id":"d","client_seq":4,"payload":{"mutate":{"upsert":{
                "id":"s1","kind":{"ellipse":{"cx":1,"cy":2,"rx":3,"ry":4,"fill":null}}}}}}"#,
        )
        .expect("valid mutate");
        assert_eq!(mutate.client_seq, Some(4));
        assert_eq!(mutate.payload.name(), "mutate");
    }

    #[test]
    fn it_reports_malformed_frames_as_protocol_errors() {
        let err = ClientMessage::from_json(r#"{"id":"m","payload":{"teleport":{}}}"#)
            .expect_err("unknown type");
        assert_eq!(err.code(), "malformed");

        let err = ClientMessage::from_bincode(&[1, 2, 3]).expect_err("garbage");
        assert_eq!(err.code(), "malformed");
    }

    #[test]
    fn it_carries_a_mutation_through_a_binary_frame() {
        let mut message = ClientMessage::new(
            "doc-1",
            ClientPayload::Mutate(ShapeOp::Upsert(ShapeDraft {
                id: "s1".into(),
                kind: ShapeKind::Text {
                    x: 0.0,
                    y: 0.0,
                    width: 100.0,
                    height: 20.0,
                    content: "Hello".into(),
                    font_size: 14.0,
                },
                base_version: Some(3),
            })),
        );
        message.client_seq = Some(9);

        let bytes = message.to_bincode().expect("encodes");
        assert_eq!(ClientMessage::from_bincode(&bytes).expect("decodes"), message);
    }

    #[test]
    fn it_marks_presence_as_ephemeral() {
        let presence = ServerPayload::Presence(PresenceEvent {
            client_id: 1,
            display_name: None,
            x: Some(1.0),
            y: Some(2.0),
            viewport: None,
            left: false,
        });
        assert!(presence.is_ephemeral());
        assert!(!ServerPayload::Ack(Ack::NoOp).is_ephemeral());
    }
}
