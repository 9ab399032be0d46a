use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bot::{AuxState, Bot};

/// Inbound document change, produced by UI handlers or decoded from the
/// network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FileEvent {
    FileAdded {
        file: Bot,
    },
    FileUpdated {
        id: String,
        tags: BTreeMap<String, Value>,
    },
    FileRemoved {
        id: String,
    },
    /// Several events applied as one batch.
    Transaction {
        events: Vec<FileEvent>,
    },
    /// Add or update every bot of a snapshot depending on whether it exists.
    ApplyState {
        state: AuxState,
    },
}

impl FileEvent {
    pub fn updated(id: impl Into<String>, tags: impl IntoIterator<Item = (String, Value)>) -> Self {
        Self::FileUpdated {
            id: id.into(),
            tags: tags.into_iter().collect(),
        }
    }
}
