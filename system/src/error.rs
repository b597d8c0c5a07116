//! Error types shared by the engine and the server.
//!
//! Every error that can reach a client carries a stable `code()` which ends
//! up in the `error{code, message}` wire payload.

use crate::types::{ClientId, ServerSeq};
use thiserror::Error;

/// A mutation the engine refuses to apply. Only the sender hears about it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MutationError {
    #[error("shape id must not be empty")]
    EmptyShapeId,

    #[error("shape id is longer than {0} bytes")]
    ShapeIdTooLong(usize),

    #[error("non-finite value in {0}")]
    NonFinite(&'static str),

    #[error("negative size in {0}")]
    NegativeSize(&'static str),

    #[error("path needs at least one point")]
    EmptyPath,
}

impl MutationError {
    #[inline]
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyShapeId => "empty_shape_id",
            Self::ShapeIdTooLong(_) => "shape_id_too_long",
            Self::NonFinite(_) => "non_finite",
            Self::NegativeSize(_) => "negative_size",
            Self::EmptyPath => "empty_path",
        }
    }
}

/// Malformed or out-of-place traffic on a connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid json frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid binary frame: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("connection has not joined a session")]
    NotJoined,

    #[error("connection already joined a session")]
    AlreadyJoined,

    #[error("{0} is not valid here")]
    Unexpected(&'static str),

    #[error("invalid viewport")]
    InvalidViewport,
}

impl ProtocolError {
    #[inline]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Json(_) | Self::Bincode(_) => "malformed",
            Self::NotJoined => "not_joined",
            Self::AlreadyJoined => "already_joined",
            Self::Unexpected(_) => "unexpected_message",
            Self::InvalidViewport => "invalid_viewport",
        }
    }
}

/// Failures of the per-session sequential path.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("malformed mutation: {0}")]
    Malformed(#[from] MutationError),

    #[error("session is full ({limit} members)")]
    SessionFull { limit: usize },

    #[error("unknown member {0}")]
    UnknownMember(ClientId),

    #[error("server_seq regression: expected {expected}, got {actual}")]
    SeqRegression {
        expected: ServerSeq,
        actual: ServerSeq,
    },

    #[error("version regression on shape {shape_id}: {current} -> {proposed}")]
    VersionRegression {
        shape_id: String,
        current: u64,
        proposed: u64,
    },
}

impl SessionError {
    #[inline]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Malformed(e) => e.code(),
            Self::SessionFull { .. } => "session_full",
            Self::UnknownMember(_) => "unknown_member",
            Self::SeqRegression { .. } | Self::VersionRegression { .. } => "session_reset",
        }
    }

    /// Invariant violations tear the whole session down.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SeqRegression { .. } | Self::VersionRegression { .. }
        )
    }
}
