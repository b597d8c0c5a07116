use crate::error::MutationError;
use crate::shape::{validate_shape_id, Shape, ShapeDraft};
use crate::types::{ClientId, ClientSeq, MessageId, ServerSeq, ShapeId};
use serde::{Deserialize, Serialize};

/// A shape change requested by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeOp {
    Upsert(ShapeDraft),
    Delete {
        id: ShapeId,
        #[serde(default)]
        base_version: Option<u64>,
    },
}

impl ShapeOp {
    pub fn shape_id(&self) -> &str {
        match self {
            Self::Upsert(draft) => &draft.id,
            Self::Delete { id, .. } => id,
        }
    }

    pub fn kind(&self) -> ShapeOpKind {
        match self {
            Self::Upsert(_) => ShapeOpKind::Upsert,
            Self::Delete { .. } => ShapeOpKind::Delete,
        }
    }

    pub fn validate(&self) -> Result<(), MutationError> {
        match self {
            Self::Upsert(draft) => draft.validate(),
            Self::Delete { id, .. } => validate_shape_id(id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeOpKind {
    Upsert,
    Delete,
}

/// A mutation that went through the session's sequential path. `shape` is
/// the canonical state of the shape after the mutation (a tombstone for
/// deletes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptedUpdate {
    pub server_seq: ServerSeq,
    pub sender_id: ClientId,
    pub message_id: MessageId,
    pub client_seq: Option<ClientSeq>,
    pub op: ShapeOpKind,
    pub shape: Shape,
}
