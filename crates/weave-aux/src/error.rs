use weave_core::{AtomId, ErrorCode, WeaveError};

use crate::op::OpKind;

/// Errors raised by AUX document operations.
///
/// Every variant except [`AuxError::Weave`] is raised before any atom is
/// created.
#[derive(Debug, thiserror::Error)]
pub enum AuxError {
    #[error(transparent)]
    Weave(#[from] WeaveError),

    /// The operation is not valid against its target.
    #[error("malformed {kind} operation on {cause}: {reason}")]
    Malformed {
        kind: OpKind,
        cause: AtomId,
        reason: String,
    },

    #[error("file '{0}' not found")]
    FileNotFound(String),

    #[error("tag '{tag}' not found on file '{file}'")]
    TagNotFound { file: String, tag: String },

    /// The target atom has been deleted.
    #[error("{0} is deleted")]
    Tombstoned(AtomId),
}

impl AuxError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Weave(err) => err.code(),
            Self::Malformed { .. } => ErrorCode::MalformedOperation,
            Self::FileNotFound(_) => ErrorCode::FileNotFound,
            Self::TagNotFound { .. } => ErrorCode::TagNotFound,
            Self::Tombstoned(_) => ErrorCode::TombstonedCause,
        }
    }

    pub(crate) fn malformed(kind: OpKind, cause: AtomId, reason: impl Into<String>) -> Self {
        Self::Malformed {
            kind,
            cause,
            reason: reason.into(),
        }
    }
}
