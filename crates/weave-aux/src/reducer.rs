//! Folds AUX atoms into bots.
//!
//! Reduction is incremental per bot: every added atom is mapped to its
//! enclosing file atom (depth 1), and only the bots owning those files are
//! re-read from their weave spans. A batch containing the root atom rebuilds
//! everything.
//!
//! # Merging concurrent bindings
//!
//! Two sites can concurrently create a file atom with the same id, or a tag
//! atom with the same name on the same file. All live file atoms of an id
//! form one bot; per tag name, the binding whose current value atom has the
//! highest precedence wins, with value-less bindings losing to any value.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use tracing::trace;
use weave_core::{Atom, AtomId, AtomReducer, Change, SiteVersion, Span, Weave};

use crate::bot::{AuxState, Bot};
use crate::op::AuxOp;
use crate::text;
use crate::value::has_value;

/// The atoms backing one materialized tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagRef {
    pub tag: AtomId,
    /// Current value atom, if the tag has one.
    pub value: Option<AtomId>,
}

/// Lookup caches derived from the weave.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuxMetadata {
    /// Every file atom ever seen per bot id, live or deleted.
    files: BTreeMap<String, BTreeSet<AtomId>>,
    /// Live file atoms per bot id, in weave order.
    live: BTreeMap<String, Vec<AtomId>>,
    /// Winning binding per bot id and tag name.
    tags: BTreeMap<String, BTreeMap<String, TagRef>>,
}

impl AuxMetadata {
    /// Live file atoms for a bot, in weave order.
    #[must_use]
    pub fn file_atoms(&self, id: &str) -> &[AtomId] {
        self.live.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    /// The file atom new tags are attached to.
    #[must_use]
    pub fn primary_file(&self, id: &str) -> Option<AtomId> {
        self.file_atoms(id).first().copied()
    }

    #[must_use]
    pub fn tag(&self, file: &str, name: &str) -> Option<&TagRef> {
        self.tags.get(file)?.get(name)
    }

    /// All bindings of a bot, including value-less ones.
    pub fn tags(&self, file: &str) -> impl Iterator<Item = (&String, &TagRef)> {
        self.tags.get(file).into_iter().flatten()
    }

    fn references(&self, id: &AtomId) -> bool {
        self.live.values().flatten().any(|f| f == id)
            || self
                .tags
                .values()
                .flat_map(BTreeMap::values)
                .any(|r| r.tag == *id || r.value == Some(*id))
    }
}

/// Reducer for the bot/tag document model.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuxReducer;

impl AtomReducer for AuxReducer {
    type Op = AuxOp;
    type State = AuxState;
    type Metadata = AuxMetadata;

    fn reduce(
        &self,
        weave: &Weave<AuxOp>,
        atoms: &[Atom<AuxOp>],
        change: Change,
        mut state: AuxState,
        mut metadata: AuxMetadata,
    ) -> (AuxState, AuxMetadata) {
        if change == Change::Removed {
            // Collection only removes superseded history; a rebuild is needed
            // only if a cached reference went with it.
            if atoms.iter().any(|a| metadata.references(&a.id)) {
                return rebuild(weave);
            }
            return (state, metadata);
        }

        if atoms.iter().any(Atom::is_root) {
            return rebuild(weave);
        }

        let mut affected = BTreeSet::new();
        for atom in atoms {
            if let Some((file, id)) = enclosing_file(weave, atom) {
                metadata.files.entry(id.to_string()).or_default().insert(file);
                affected.insert(id.to_string());
            }
        }
        for id in affected {
            refresh(weave, &id, &mut state, &mut metadata);
        }
        (state, metadata)
    }

    fn collect_garbage(
        &self,
        weave: &mut Weave<AuxOp>,
        added: &[Atom<AuxOp>],
        horizon: Option<&SiteVersion>,
    ) -> Vec<Atom<AuxOp>> {
        let mut tags = BTreeSet::new();
        for atom in added {
            if let (AuxOp::Value { .. }, Some(tag)) = (&atom.value, atom.cause) {
                tags.insert(tag);
            }
        }

        let mut removed = Vec::new();
        for tag in tags {
            let winner = weave
                .span(&tag)
                .and_then(current_value)
                .map(|span| span.head().id);
            if let Some(winner) = winner {
                removed.extend(weave.remove_before(&winner, horizon));
            }
        }
        removed
    }
}

/// Ids of the bots `atoms` belong to, or `None` when every bot may have
/// changed: the root is among them, or an atom can no longer be placed.
///
/// An atom already collected is placed through its cause.
#[must_use]
pub fn touched_bots(weave: &Weave<AuxOp>, atoms: &[Atom<AuxOp>]) -> Option<BTreeSet<String>> {
    let mut touched = BTreeSet::new();
    for atom in atoms {
        if atom.is_root() {
            return None;
        }
        let (_, id) = enclosing_file(weave, atom)?;
        touched.insert(id.to_string());
    }
    Some(touched)
}

/// The file atom (depth 1) above `atom`, or above its cause when `atom`
/// itself is gone from the weave.
fn enclosing_file<'w>(
    weave: &'w Weave<AuxOp>,
    atom: &Atom<AuxOp>,
) -> Option<(AtomId, &'w str)> {
    let file = weave
        .ancestor_at_depth(&atom.id, 1)
        .or_else(|| weave.ancestor_at_depth(&atom.cause?, 1))?;
    match &file.value {
        AuxOp::File { id } => Some((file.id, id.as_str())),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Span readers
// ---------------------------------------------------------------------------

/// Returns `true` if the atom heading `span` carries a whole delete.
#[must_use]
pub fn is_tombstoned(span: Span<'_, AuxOp>) -> bool {
    span.children().any(|c| c.head().value.is_whole_delete())
}

/// The current value of a tag: its first value child in weave order.
#[must_use]
pub fn current_value(tag: Span<'_, AuxOp>) -> Option<Span<'_, AuxOp>> {
    tag.children()
        .find(|c| matches!(c.head().value, AuxOp::Value { .. }))
}

/// Materialized content of a value atom with its text splices applied.
#[must_use]
pub fn value_of(span: Span<'_, AuxOp>) -> Value {
    let AuxOp::Value { value } = &span.head().value else {
        return Value::Null;
    };
    if text::has_edits(span) {
        Value::String(text::materialize(span))
    } else {
        value.clone()
    }
}

struct Binding {
    name: String,
    tag: AtomId,
    value: Option<(AtomId, Value)>,
}

impl Binding {
    fn outranks(&self, other: &Self) -> bool {
        match (&self.value, &other.value) {
            (Some((mine, _)), Some((theirs, _))) => mine.precedes(theirs),
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

fn read_file(file: Span<'_, AuxOp>) -> Option<Vec<Binding>> {
    let mut bindings = Vec::new();
    for child in file.children() {
        match &child.head().value {
            op if op.is_whole_delete() => return None,
            AuxOp::Tag { .. } => bindings.extend(read_tag(child)),
            _ => {}
        }
    }
    Some(bindings)
}

fn read_tag(tag: Span<'_, AuxOp>) -> Option<Binding> {
    if is_tombstoned(tag) {
        return None;
    }
    let name = text::materialize(tag);
    if name.is_empty() {
        return None;
    }
    let value = current_value(tag).map(|span| (span.head().id, value_of(span)));
    Some(Binding {
        name,
        tag: tag.head().id,
        value,
    })
}

// ---------------------------------------------------------------------------
// Reduction
// ---------------------------------------------------------------------------

fn rebuild(weave: &Weave<AuxOp>) -> (AuxState, AuxMetadata) {
    let mut state = AuxState::new();
    let mut metadata = AuxMetadata::default();

    let Some(root) = weave.root().and_then(|r| weave.span(&r.id)) else {
        return (state, metadata);
    };
    for child in root.children() {
        if let AuxOp::File { id } = &child.head().value {
            metadata
                .files
                .entry(id.clone())
                .or_default()
                .insert(child.head().id);
        }
    }

    let ids: Vec<String> = metadata.files.keys().cloned().collect();
    for id in ids {
        refresh(weave, &id, &mut state, &mut metadata);
    }
    (state, metadata)
}

/// Re-read one bot from all of its file atoms.
fn refresh(weave: &Weave<AuxOp>, id: &str, state: &mut AuxState, metadata: &mut AuxMetadata) {
    let mut files: Vec<(usize, AtomId)> = metadata
        .files
        .get(id)
        .into_iter()
        .flatten()
        .filter_map(|f| weave.index_of(f).map(|index| (index, *f)))
        .collect();
    files.sort_unstable();

    let mut live = Vec::new();
    let mut bindings: BTreeMap<String, Binding> = BTreeMap::new();
    for (_, file) in files {
        let Some(file_bindings) = weave.span(&file).and_then(read_file) else {
            continue;
        };
        live.push(file);
        for binding in file_bindings {
            let wins = bindings
                .get(&binding.name)
                .is_none_or(|existing| binding.outranks(existing));
            if wins {
                bindings.insert(binding.name.clone(), binding);
            }
        }
    }

    if live.is_empty() {
        trace!(bot = id, "bot removed");
        state.remove(id);
        metadata.live.remove(id);
        metadata.tags.remove(id);
        return;
    }

    let mut bot = Bot::new(id);
    let mut refs = BTreeMap::new();
    for (name, binding) in bindings {
        refs.insert(name.clone(), TagRef {
            tag: binding.tag,
            value: binding.value.as_ref().map(|(atom, _)| *atom),
        });
        if let Some((_, value)) = binding.value {
            if has_value(&value) {
                bot.tags.insert(name, value);
            }
        }
    }

    trace!(bot = id, tags = bot.tags.len(), files = live.len(), "bot refreshed");
    state.insert(id.to_string(), bot);
    metadata.live.insert(id.to_string(), live);
    metadata.tags.insert(id.to_string(), refs);
}
