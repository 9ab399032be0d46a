//! weave-aux: the bot/tag document model on a causal tree.
//!
//! Documents ("bots") are file atoms under the root; each tag is a tag atom
//! under a file and its value is the newest value atom under the tag. Tag
//! names and values are editable as text through insert and ranged-delete
//! atoms. [`reducer::AuxReducer`] materializes the weave into an
//! [`bot::AuxState`], and [`tree::AuxTree`] provides the editing operations.

pub mod bot;
pub mod diff;
pub mod error;
pub mod events;
pub mod op;
pub mod reducer;
pub mod text;
pub mod tree;
pub mod value;

pub use bot::{AuxState, Bot};
pub use diff::{StateDiff, diff_bot, diff_states};
pub use error::AuxError;
pub use events::FileEvent;
pub use op::{AuxOp, DELETE_PRIORITY, NAME_INSERT_PRIORITY, OpKind};
pub use reducer::{AuxMetadata, AuxReducer, TagRef, touched_bots};
pub use tree::{AuxCausalTree, AuxTree, aux_tree};
