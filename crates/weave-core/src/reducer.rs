//! The reducer contract that folds atoms into materialized state.
//!
//! A reducer is handed the weave (read-only), the atoms that changed, and the
//! previous state and metadata by value; it returns the new pair. It must not
//! consult anything besides its inputs. Metadata is a derived cache (for
//! example `document id → atom id` lookups) and must be reconstructible by
//! reducing the whole weave from scratch.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::atom::Atom;
use crate::version::SiteVersion;
use crate::weave::Weave;

/// Whether the atoms handed to [`AtomReducer::reduce`] were added or
/// physically removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Added,
    Removed,
}

/// Pluggable fold over weave atoms.
pub trait AtomReducer {
    /// Operation payload carried by atoms.
    type Op: Clone + Serialize + DeserializeOwned;
    /// Materialized state.
    type State: Clone + Default;
    /// Reducer-private derived cache.
    type Metadata: Clone + Default;

    /// Fold `atoms` into `state`.
    ///
    /// On a full rebuild `atoms` is the entire weave in weave order and the
    /// inputs are defaults; during live operation it is the batch of newly
    /// inserted (or collected) atoms.
    fn reduce(
        &self,
        weave: &Weave<Self::Op>,
        atoms: &[Atom<Self::Op>],
        change: Change,
        state: Self::State,
        metadata: Self::Metadata,
    ) -> (Self::State, Self::Metadata);

    /// Garbage-collection hook run after atoms were added.
    ///
    /// Implementations call [`Weave::remove_before`] for atoms that supersede
    /// older history and return everything removed. Collection must never
    /// change the reduced state. The default collects nothing.
    fn collect_garbage(
        &self,
        weave: &mut Weave<Self::Op>,
        added: &[Atom<Self::Op>],
        horizon: Option<&SiteVersion>,
    ) -> Vec<Atom<Self::Op>> {
        let _ = (weave, added, horizon);
        Vec::new()
    }
}
