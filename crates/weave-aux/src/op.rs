//! AUX operation payloads.
//!
//! The document tree built from these ops is:
//!
//! ```text
//! root
//! └── file { id }                      (whole-file delete tombstones it)
//!     └── tag { name }                 (whole-tag delete, name edits)
//!         └── value { value }          (newest value wins)
//!             └── insert / ranged delete (text splices)
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Priority for delete atoms: they sort ahead of every other sibling.
pub const DELETE_PRIORITY: u32 = 1;

/// Priority for inserts that edit a tag name. Sorting them ahead of value
/// atoms keeps value garbage collection from reaching them.
pub const NAME_INSERT_PRIORITY: u32 = 2;

/// One AUX operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuxOp {
    Root,
    File {
        id: String,
    },
    Tag {
        name: String,
    },
    Value {
        value: Value,
    },
    /// Splice `text` into the parent segment after its first `index` chars.
    Insert {
        index: usize,
        text: String,
    },
    /// Tombstone the parent. With a range, only the parent segment's own
    /// chars in `start..end` (missing bounds mean the segment edges).
    Delete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end: Option<usize>,
    },
}

/// Payload-free discriminant of [`AuxOp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Root,
    File,
    Tag,
    Value,
    Insert,
    Delete,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Root => "root",
            Self::File => "file",
            Self::Tag => "tag",
            Self::Value => "value",
            Self::Insert => "insert",
            Self::Delete => "delete",
        };
        f.write_str(s)
    }
}

impl AuxOp {
    #[must_use]
    pub const fn kind(&self) -> OpKind {
        match self {
            Self::Root => OpKind::Root,
            Self::File { .. } => OpKind::File,
            Self::Tag { .. } => OpKind::Tag,
            Self::Value { .. } => OpKind::Value,
            Self::Insert { .. } => OpKind::Insert,
            Self::Delete { .. } => OpKind::Delete,
        }
    }

    /// A delete without a range: tombstones the whole parent.
    #[must_use]
    pub const fn is_whole_delete(&self) -> bool {
        matches!(
            self,
            Self::Delete {
                start: None,
                end: None
            }
        )
    }

    /// A delete that removes chars from the parent's own text.
    #[must_use]
    pub const fn is_ranged_delete(&self) -> bool {
        matches!(self, Self::Delete { .. }) && !self.is_whole_delete()
    }

    /// Own text of a segment atom: tag name, insert text, or a value's text
    /// form. `None` for ops that carry no editable text.
    #[must_use]
    pub fn segment_text(&self) -> Option<String> {
        match self {
            Self::Tag { name } => Some(name.clone()),
            Self::Insert { text, .. } => Some(text.clone()),
            Self::Value { value } => Some(crate::value::text_form(value)),
            _ => None,
        }
    }
}
