//! weave-core: causal-tree CRDT primitives.
//!
//! A causal tree is a replicated log of immutable [`atom::Atom`]s. Each atom
//! names the atom it was created against, so the set of atoms forms a tree.
//! The [`weave::Weave`] stores that tree flattened in a deterministic order;
//! a pluggable [`reducer::AtomReducer`] folds it into application state; and
//! [`tree::CausalTree`] ties both together with a Lamport clock, batching,
//! garbage collection and change notifications.
//!
//! # Conventions
//!
//! - **Errors**: library operations return [`error::WeaveError`]; only
//!   configuration loading uses `anyhow::Result`.
//! - **Logging**: `tracing` macros. `trace!` per atom placement, `debug!`
//!   per batch, `info!` for garbage collection, `warn!` for rejected input.

pub mod atom;
pub mod config;
pub mod error;
pub mod notify;
pub mod reducer;
pub mod tree;
pub mod version;
pub mod weave;

pub use atom::{Atom, AtomId, SiteId, weave_order};
pub use config::{GcPolicy, PrecalcConfig, TreeConfig, WeaveConfig, load_config};
pub use error::{ErrorCode, WeaveError};
pub use notify::{SubscriptionId, Subscribers};
pub use reducer::{AtomReducer, Change};
pub use tree::{AddedAtoms, CausalTree, StoredCausalTree, TreeEvent};
pub use version::SiteVersion;
pub use weave::{Placement, Span, Weave};
