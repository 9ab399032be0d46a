use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::atom::{Atom, SiteId};
use crate::error::WeaveError;
use crate::version::SiteVersion;

/// Current layout of [`StoredCausalTree`].
pub const STORED_FORMAT_VERSION: u32 = 1;

/// Serializable snapshot of a causal tree.
///
/// The weave is stored in weave order, which is a causally valid delivery
/// order, so loading it back is a single pass. Garbage-collection tombstones
/// are not part of the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCausalTree<O> {
    pub format_version: u32,
    /// Site of the replica that exported the snapshot.
    pub site: SiteId,
    /// Every site that has authored an atom known to the exporter.
    pub known_sites: Vec<SiteId>,
    pub version: SiteVersion,
    pub weave: Vec<Atom<O>>,
}

impl<O: Serialize> StoredCausalTree<O> {
    /// Encode as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`WeaveError::Serialization`] if a payload cannot be encoded.
    pub fn to_json(&self) -> Result<String, WeaveError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl<O: DeserializeOwned> StoredCausalTree<O> {
    /// Decode from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`WeaveError::Serialization`] on malformed input.
    pub fn from_json(text: &str) -> Result<Self, WeaveError> {
        Ok(serde_json::from_str(text)?)
    }
}
