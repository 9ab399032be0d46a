use std::fmt;

use crate::atom::AtomId;

/// Machine-readable error codes shared by every crate in the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigParseError,
    OrphanAtom,
    RootExists,
    MissingRoot,
    ChecksumMismatch,
    MalformedOperation,
    FileNotFound,
    TagNotFound,
    TombstonedCause,
    FormulaFailed,
    Divergence,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigParseError => "E1001",
            Self::OrphanAtom => "E2001",
            Self::RootExists => "E2002",
            Self::MissingRoot => "E2003",
            Self::ChecksumMismatch => "E2004",
            Self::MalformedOperation => "E3001",
            Self::FileNotFound => "E3002",
            Self::TagNotFound => "E3003",
            Self::TombstonedCause => "E3004",
            Self::FormulaFailed => "E4001",
            Self::Divergence => "E5001",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConfigParseError => "Config file parse error",
            Self::OrphanAtom => "Atom references an unknown cause",
            Self::RootExists => "Weave already has a root atom",
            Self::MissingRoot => "Weave has no root atom",
            Self::ChecksumMismatch => "Atom checksum mismatch",
            Self::MalformedOperation => "Malformed operation",
            Self::FileNotFound => "File not found",
            Self::TagNotFound => "Tag not found",
            Self::TombstonedCause => "Cause has been deleted",
            Self::FormulaFailed => "Formula evaluation failed",
            Self::Divergence => "Replicas diverged",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint for the caller.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigParseError => Some("Fix syntax in the weave config file and retry."),
            Self::OrphanAtom => {
                Some("Request the missing causal ancestors from the sender, then redeliver.")
            }
            Self::RootExists => Some("Fork or import the existing tree instead of creating a second root."),
            Self::MissingRoot => Some("Create the root atom or import a stored tree first."),
            Self::ChecksumMismatch => Some("Drop the atom and resync from a trusted peer."),
            Self::MalformedOperation | Self::TombstonedCause => {
                Some("Re-read the current state and retry with a fresh cause.")
            }
            Self::FileNotFound | Self::TagNotFound => None,
            Self::FormulaFailed => Some("Inspect the tag formula; other tags are unaffected."),
            Self::Divergence => Some("Report a bug with the simulation seed that reproduces it."),
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Errors raised by weave and tree operations.
#[derive(Debug, thiserror::Error)]
pub enum WeaveError {
    /// The atom's cause is not present in the weave.
    #[error("atom {atom} references unknown cause {cause}")]
    OrphanAtom { atom: AtomId, cause: AtomId },

    /// A second root atom was offered to a weave that already has one.
    #[error("weave already has root {existing}; rejected root {rejected}")]
    RootExists { existing: AtomId, rejected: AtomId },

    /// A non-root operation was attempted on an empty weave.
    #[error("weave has no root atom")]
    MissingRoot,

    /// The stored checksum does not match the atom's content.
    #[error("atom {atom} checksum mismatch: stored={stored} expected={expected}")]
    ChecksumMismatch {
        atom: AtomId,
        stored: String,
        expected: String,
    },

    /// Canonical JSON encoding of an atom failed.
    #[error("failed to encode atom: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WeaveError {
    /// Machine-readable code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::OrphanAtom { .. } => ErrorCode::OrphanAtom,
            Self::RootExists { .. } => ErrorCode::RootExists,
            Self::MissingRoot => ErrorCode::MissingRoot,
            Self::ChecksumMismatch { .. } => ErrorCode::ChecksumMismatch,
            Self::Serialization(_) => ErrorCode::InternalUnexpected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ErrorCode, WeaveError};
    use crate::atom::{AtomId, SiteId};
    use std::collections::HashSet;

    #[test]
    fn all_codes_are_unique() {
        let all = [
            ErrorCode::ConfigParseError,
            ErrorCode::OrphanAtom,
            ErrorCode::RootExists,
            ErrorCode::MissingRoot,
            ErrorCode::ChecksumMismatch,
            ErrorCode::MalformedOperation,
            ErrorCode::FileNotFound,
            ErrorCode::TagNotFound,
            ErrorCode::TombstonedCause,
            ErrorCode::FormulaFailed,
            ErrorCode::Divergence,
            ErrorCode::InternalUnexpected,
        ];

        let mut seen = HashSet::new();
        for code in all {
            assert!(seen.insert(code.code()), "duplicate code {}", code.code());
        }
    }

    #[test]
    fn code_format_is_machine_friendly() {
        let code = ErrorCode::OrphanAtom.code();
        assert_eq!(code.len(), 5);
        assert!(code.starts_with('E'));
        assert!(code.chars().skip(1).all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn orphan_error_reports_both_ids() {
        let err = WeaveError::OrphanAtom {
            atom: AtomId::new(SiteId(2), 7, 0),
            cause: AtomId::new(SiteId(1), 3, 0),
        };
        let text = err.to_string();
        assert!(text.contains("2@7"), "{text}");
        assert!(text.contains("1@3"), "{text}");
        assert_eq!(err.code(), ErrorCode::OrphanAtom);
    }
}
