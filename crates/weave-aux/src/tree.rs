//! Document editing on top of a causal tree.
//!
//! [`AuxTree`] adds the AUX operations to [`CausalTree<AuxReducer>`]. Every
//! operation validates its target before creating any atom, and multi-atom
//! operations run inside one batch so they are published once. Operations
//! that plan against current state settle the batch first, so later events
//! of a transaction see the earlier ones.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, warn};
use weave_core::{Atom, AtomId, CausalTree, SiteId, TreeConfig};

use crate::bot::{AuxState, Bot};
use crate::error::AuxError;
use crate::events::FileEvent;
use crate::op::{AuxOp, DELETE_PRIORITY, NAME_INSERT_PRIORITY, OpKind};
use crate::reducer::{AuxReducer, is_tombstoned};
use crate::text::{self, Glyph};
use crate::value::{has_value, merge_update, same_value};

pub type AuxCausalTree = CausalTree<AuxReducer>;

/// An empty AUX tree for `site`.
#[must_use]
pub fn aux_tree(site: SiteId, config: TreeConfig) -> AuxCausalTree {
    CausalTree::new(site, AuxReducer, config)
}

type Atoms = Vec<Atom<AuxOp>>;

/// AUX document operations.
pub trait AuxTree {
    /// Create the root atom.
    ///
    /// # Errors
    ///
    /// [`AuxError::Weave`] if a root already exists.
    fn root(&mut self) -> Result<Atom<AuxOp>, AuxError>;

    /// Create a file atom under the root.
    ///
    /// # Errors
    ///
    /// Fails if there is no root.
    fn file(&mut self, id: &str) -> Result<Atom<AuxOp>, AuxError>;

    /// Create a tag atom on a file atom.
    ///
    /// # Errors
    ///
    /// [`AuxError::Malformed`] if `file` is not a file atom,
    /// [`AuxError::Tombstoned`] if it was deleted.
    fn tag(&mut self, name: &str, file: AtomId) -> Result<Atom<AuxOp>, AuxError>;

    /// Create a value atom on a tag atom.
    ///
    /// # Errors
    ///
    /// [`AuxError::Malformed`] if `tag` is not a tag atom,
    /// [`AuxError::Tombstoned`] if it was deleted.
    fn val(&mut self, value: Value, tag: AtomId) -> Result<Atom<AuxOp>, AuxError>;

    /// Splice `text` into a segment after its first `index` own chars.
    ///
    /// # Errors
    ///
    /// [`AuxError::Malformed`] if `cause` is not a text segment or `index`
    /// is past its own text.
    fn insert(&mut self, cause: AtomId, index: usize, text: &str)
    -> Result<Atom<AuxOp>, AuxError>;

    /// Delete a file or tag (no range), or own chars of a segment (range).
    ///
    /// # Errors
    ///
    /// [`AuxError::Malformed`] for a whole delete of a value or insert, a
    /// ranged delete of a file, or a range outside the own text.
    fn delete(
        &mut self,
        cause: AtomId,
        start: Option<usize>,
        end: Option<usize>,
    ) -> Result<Atom<AuxOp>, AuxError>;

    /// Current (materialized) value of a tag.
    fn tag_value(&self, id: &str, tag: &str) -> Option<&Value>;

    /// Create a file atom plus a tag and value atom for every tag that has
    /// a value.
    ///
    /// # Errors
    ///
    /// Fails if there is no root.
    fn add_file(&mut self, bot: &Bot) -> Result<Atoms, AuxError>;

    /// Create value atoms for every tag whose merged value changes.
    ///
    /// # Errors
    ///
    /// [`AuxError::FileNotFound`] if the bot does not exist.
    fn update_file(&mut self, id: &str, tags: &BTreeMap<String, Value>) -> Result<Atoms, AuxError>;

    /// Delete every live file atom of a bot. Missing bots are a no-op.
    ///
    /// # Errors
    ///
    /// Propagates weave errors.
    fn remove_file(&mut self, id: &str) -> Result<Atoms, AuxError>;

    /// Insert text into a tag value at visible char `index`.
    ///
    /// # Errors
    ///
    /// [`AuxError::FileNotFound`], [`AuxError::TagNotFound`], or
    /// [`AuxError::Malformed`] if `index` is past the end.
    fn insert_into_tag_value(
        &mut self,
        id: &str,
        tag: &str,
        index: usize,
        text: &str,
    ) -> Result<Atoms, AuxError>;

    /// Delete `count` visible chars of a tag value starting at `index`.
    ///
    /// # Errors
    ///
    /// [`AuxError::FileNotFound`], [`AuxError::TagNotFound`], or
    /// [`AuxError::Malformed`] if the range is past the end.
    fn delete_from_tag_value(
        &mut self,
        id: &str,
        tag: &str,
        index: usize,
        count: usize,
    ) -> Result<Atoms, AuxError>;

    /// Insert text into a tag's name.
    ///
    /// # Errors
    ///
    /// As [`AuxTree::insert_into_tag_value`].
    fn insert_into_tag_name(
        &mut self,
        id: &str,
        tag: &str,
        index: usize,
        text: &str,
    ) -> Result<Atoms, AuxError>;

    /// Delete chars of a tag's name.
    ///
    /// # Errors
    ///
    /// As [`AuxTree::delete_from_tag_value`].
    fn delete_from_tag_name(
        &mut self,
        id: &str,
        tag: &str,
        index: usize,
        count: usize,
    ) -> Result<Atoms, AuxError>;

    /// Add or update every bot of `state` in one batch.
    ///
    /// # Errors
    ///
    /// Propagates the first failing add or update.
    fn apply_state(&mut self, state: &AuxState) -> Result<Atoms, AuxError>;

    /// Apply one event as a single batch.
    ///
    /// # Errors
    ///
    /// Propagates the failing operation.
    fn apply_event(&mut self, event: &FileEvent) -> Result<Atoms, AuxError>;

    /// Apply events in order, one batch per event.
    ///
    /// # Errors
    ///
    /// Stops at the first failing event; earlier events stay applied.
    fn add_events(&mut self, events: &[FileEvent]) -> Result<Atoms, AuxError>;
}

impl AuxTree for AuxCausalTree {
    fn root(&mut self) -> Result<Atom<AuxOp>, AuxError> {
        Ok(self.create(AuxOp::Root, None, 0)?)
    }

    fn file(&mut self, id: &str) -> Result<Atom<AuxOp>, AuxError> {
        let root = self
            .weave()
            .root()
            .map(|r| r.id)
            .ok_or(weave_core::WeaveError::MissingRoot)?;
        make(self, AuxOp::File { id: id.to_string() }, root)
    }

    fn tag(&mut self, name: &str, file: AtomId) -> Result<Atom<AuxOp>, AuxError> {
        make(self, AuxOp::Tag {
            name: name.to_string(),
        }, file)
    }

    fn val(&mut self, value: Value, tag: AtomId) -> Result<Atom<AuxOp>, AuxError> {
        make(self, AuxOp::Value { value }, tag)
    }

    fn insert(
        &mut self,
        cause: AtomId,
        index: usize,
        text: &str,
    ) -> Result<Atom<AuxOp>, AuxError> {
        make(self, AuxOp::Insert {
            index,
            text: text.to_string(),
        }, cause)
    }

    fn delete(
        &mut self,
        cause: AtomId,
        start: Option<usize>,
        end: Option<usize>,
    ) -> Result<Atom<AuxOp>, AuxError> {
        make(self, AuxOp::Delete { start, end }, cause)
    }

    fn tag_value(&self, id: &str, tag: &str) -> Option<&Value> {
        self.state().get(id)?.tag(tag)
    }

    fn add_file(&mut self, bot: &Bot) -> Result<Atoms, AuxError> {
        let (_, atoms) = self.batch(|t| -> Result<(), AuxError> {
            let file = t.file(&bot.id)?.id;
            for (name, value) in &bot.tags {
                if !has_value(value) {
                    continue;
                }
                let tag = t.tag(name, file)?.id;
                t.val(value.clone(), tag)?;
            }
            Ok(())
        })?;
        debug!(bot = %bot.id, atoms = atoms.len(), "added file");
        Ok(atoms)
    }

    fn update_file(&mut self, id: &str, tags: &BTreeMap<String, Value>) -> Result<Atoms, AuxError> {
        self.settle();
        let file = self
            .metadata()
            .primary_file(id)
            .ok_or_else(|| AuxError::FileNotFound(id.to_string()))?;

        // Plan against the current state before creating anything.
        let current = self.state().get(id);
        let mut plan: Vec<(Option<AtomId>, &str, Value)> = Vec::new();
        for (name, update) in tags {
            let old = current.and_then(|bot| bot.tag(name));
            let merged = merge_update(old, update);
            if same_value(old, &merged) {
                continue;
            }
            let tag = self.metadata().tag(id, name).map(|r| r.tag);
            plan.push((tag, name, merged));
        }
        if plan.is_empty() {
            return Ok(Vec::new());
        }

        let (_, atoms) = self.batch(|t| -> Result<(), AuxError> {
            for (tag, name, value) in plan {
                let tag = match tag {
                    Some(tag) => tag,
                    None => t.tag(name, file)?.id,
                };
                t.val(value, tag)?;
            }
            Ok(())
        })?;
        debug!(bot = id, atoms = atoms.len(), "updated file");
        Ok(atoms)
    }

    fn remove_file(&mut self, id: &str) -> Result<Atoms, AuxError> {
        self.settle();
        let files = self.metadata().file_atoms(id).to_vec();
        if files.is_empty() {
            return Ok(Vec::new());
        }
        let (_, atoms) = self.batch(|t| -> Result<(), AuxError> {
            for file in files {
                t.delete(file, None, None)?;
            }
            Ok(())
        })?;
        debug!(bot = id, "removed file");
        Ok(atoms)
    }

    fn insert_into_tag_value(
        &mut self,
        id: &str,
        tag: &str,
        index: usize,
        text: &str,
    ) -> Result<Atoms, AuxError> {
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let binding = lookup(self, id, tag)?;
        let Some(value) = binding.value else {
            // A value-less tag edits as empty text.
            if index == 0 {
                let update = BTreeMap::from([(tag.to_string(), Value::String(text.to_string()))]);
                return self.update_file(id, &update);
            }
            return Err(past_end(OpKind::Insert, binding.tag, index, 0));
        };
        splice_insert(self, value, index, text)
    }

    fn delete_from_tag_value(
        &mut self,
        id: &str,
        tag: &str,
        index: usize,
        count: usize,
    ) -> Result<Atoms, AuxError> {
        let binding = lookup(self, id, tag)?;
        if count == 0 {
            return Ok(Vec::new());
        }
        let Some(value) = binding.value else {
            return Err(past_end(OpKind::Delete, binding.tag, index.saturating_add(count), 0));
        };
        splice_delete(self, value, index, count)
    }

    fn insert_into_tag_name(
        &mut self,
        id: &str,
        tag: &str,
        index: usize,
        text: &str,
    ) -> Result<Atoms, AuxError> {
        let binding = lookup(self, id, tag)?;
        if text.is_empty() {
            return Ok(Vec::new());
        }
        splice_insert(self, binding.tag, index, text)
    }

    fn delete_from_tag_name(
        &mut self,
        id: &str,
        tag: &str,
        index: usize,
        count: usize,
    ) -> Result<Atoms, AuxError> {
        let binding = lookup(self, id, tag)?;
        if count == 0 {
            return Ok(Vec::new());
        }
        splice_delete(self, binding.tag, index, count)
    }

    fn apply_state(&mut self, state: &AuxState) -> Result<Atoms, AuxError> {
        let (_, atoms) = self.batch(|t| -> Result<(), AuxError> {
            for bot in state.values() {
                t.settle();
                if t.state().contains_key(&bot.id) {
                    t.update_file(&bot.id, &bot.tags)?;
                } else {
                    t.add_file(bot)?;
                }
            }
            Ok(())
        })?;
        Ok(atoms)
    }

    fn apply_event(&mut self, event: &FileEvent) -> Result<Atoms, AuxError> {
        let (_, atoms) = self.batch(|t| -> Result<(), AuxError> {
            match event {
                FileEvent::FileAdded { file } => {
                    t.add_file(file)?;
                }
                FileEvent::FileUpdated { id, tags } => {
                    t.update_file(id, tags)?;
                }
                FileEvent::FileRemoved { id } => {
                    t.remove_file(id)?;
                }
                FileEvent::Transaction { events } => {
                    for event in events {
                        t.apply_event(event)?;
                    }
                }
                FileEvent::ApplyState { state } => {
                    t.apply_state(state)?;
                }
            }
            Ok(())
        })?;
        Ok(atoms)
    }

    fn add_events(&mut self, events: &[FileEvent]) -> Result<Atoms, AuxError> {
        let mut all = Vec::new();
        for event in events {
            all.extend(self.apply_event(event)?);
        }
        Ok(all)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate `op` against `cause`, then create it with the right priority.
fn make(tree: &mut AuxCausalTree, op: AuxOp, cause: AtomId) -> Result<Atom<AuxOp>, AuxError> {
    let priority = match check(tree, &op, cause) {
        Ok(priority) => priority,
        Err(err) => {
            warn!(site = %tree.site(), %cause, error = %err, "rejected edit");
            return Err(err);
        }
    };
    Ok(tree.create(op, Some(cause), priority)?)
}

fn check(tree: &AuxCausalTree, op: &AuxOp, cause: AtomId) -> Result<u32, AuxError> {
    let weave = tree.weave();
    let Some(span) = weave.span(&cause) else {
        // Unknown cause: the tree reports orphan or missing root.
        return Ok(0);
    };
    let target = span.head().value.kind();
    let kind = op.kind();
    let wrong_target = || AuxError::malformed(kind, cause, format!("cannot apply to {target}"));

    match op {
        AuxOp::Root => Err(wrong_target()),
        AuxOp::File { .. } => {
            if target == OpKind::Root {
                Ok(0)
            } else {
                Err(wrong_target())
            }
        }
        AuxOp::Tag { .. } | AuxOp::Value { .. } => {
            let parent = if kind == OpKind::Tag {
                OpKind::File
            } else {
                OpKind::Tag
            };
            if target != parent {
                return Err(wrong_target());
            }
            if is_tombstoned(span) {
                return Err(AuxError::Tombstoned(cause));
            }
            Ok(0)
        }
        AuxOp::Insert { index, .. } => {
            let own = own_len(tree, cause).ok_or_else(wrong_target)?;
            if *index > own {
                return Err(past_end(kind, cause, *index, own));
            }
            if target == OpKind::Tag {
                if is_tombstoned(span) {
                    return Err(AuxError::Tombstoned(cause));
                }
                return Ok(NAME_INSERT_PRIORITY);
            }
            Ok(0)
        }
        AuxOp::Delete { start, end } => {
            if op.is_whole_delete() {
                return match target {
                    OpKind::File | OpKind::Tag => Ok(DELETE_PRIORITY),
                    _ => Err(wrong_target()),
                };
            }
            let own = own_len(tree, cause).ok_or_else(wrong_target)?;
            let start = start.unwrap_or(0);
            let end = end.unwrap_or(own);
            if start > end || end > own {
                return Err(AuxError::malformed(
                    kind,
                    cause,
                    format!("range {start}..{end} outside 0..{own}"),
                ));
            }
            Ok(DELETE_PRIORITY)
        }
    }
}

/// Char length of a segment's own text; `None` if it is not a segment.
fn own_len(tree: &AuxCausalTree, segment: AtomId) -> Option<usize> {
    let atom = tree.weave().get(&segment)?;
    match atom.value.kind() {
        OpKind::Tag | OpKind::Value | OpKind::Insert => {
            atom.value.segment_text().map(|t| t.chars().count())
        }
        _ => None,
    }
}

fn past_end(kind: OpKind, cause: AtomId, index: usize, len: usize) -> AuxError {
    AuxError::malformed(kind, cause, format!("index {index} past end {len}"))
}

// ---------------------------------------------------------------------------
// Text splicing
// ---------------------------------------------------------------------------

fn lookup(
    tree: &mut AuxCausalTree,
    id: &str,
    tag: &str,
) -> Result<crate::reducer::TagRef, AuxError> {
    tree.settle();
    if tree.metadata().primary_file(id).is_none() {
        return Err(AuxError::FileNotFound(id.to_string()));
    }
    tree.metadata()
        .tag(id, tag)
        .copied()
        .ok_or_else(|| AuxError::TagNotFound {
            file: id.to_string(),
            tag: tag.to_string(),
        })
}

fn visible(tree: &AuxCausalTree, head: AtomId) -> Vec<Glyph> {
    tree.weave().span(&head).map(text::glyphs).unwrap_or_default()
}

fn splice_insert(
    tree: &mut AuxCausalTree,
    head: AtomId,
    index: usize,
    text: &str,
) -> Result<Atoms, AuxError> {
    let glyphs = visible(tree, head);
    let (segment, offset) = text::insert_anchor(&glyphs, head, index)
        .ok_or_else(|| past_end(OpKind::Insert, head, index, glyphs.len()))?;
    let atom = tree.insert(segment, offset, text)?;
    Ok(vec![atom])
}

fn splice_delete(
    tree: &mut AuxCausalTree,
    head: AtomId,
    index: usize,
    count: usize,
) -> Result<Atoms, AuxError> {
    let glyphs = visible(tree, head);
    let runs = text::delete_runs(&glyphs, index, count).ok_or_else(|| {
        past_end(OpKind::Delete, head, index.saturating_add(count), glyphs.len())
    })?;
    let (_, atoms) = tree.batch(|t| -> Result<(), AuxError> {
        for run in runs {
            t.delete(run.segment, Some(run.start), Some(run.end))?;
        }
        Ok(())
    })?;
    Ok(atoms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weave_core::{ErrorCode, GcPolicy};

    fn tree() -> AuxCausalTree {
        let mut tree = aux_tree(SiteId(1), TreeConfig::eager());
        tree.root().unwrap();
        tree
    }

    fn tags(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn add_file_skips_empty_tags() {
        let mut t = tree();
        let bot = Bot::new("b1")
            .with_tag("color", "red")
            .with_tag("empty", "")
            .with_tag("nothing", Value::Null);
        let atoms = t.add_file(&bot).unwrap();

        // file + one tag/value pair
        assert_eq!(atoms.len(), 3);
        assert_eq!(t.state()["b1"], Bot::new("b1").with_tag("color", "red"));
    }

    #[test]
    fn update_file_merges_objects_and_skips_no_ops() {
        let mut t = tree();
        t.add_file(&Bot::new("b1").with_tag("pos", json!({"x": 1, "y": 2})))
            .unwrap();

        let atoms = t
            .update_file("b1", &tags(&[("pos", json!({"y": 5})), ("gone", Value::Null)]))
            .unwrap();
        assert_eq!(atoms.len(), 1);
        assert_eq!(t.tag_value("b1", "pos"), Some(&json!({"x": 1, "y": 5})));

        let again = t.update_file("b1", &tags(&[("pos", json!({"y": 5}))])).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn update_file_creates_missing_tags_and_clears_values() {
        let mut t = tree();
        t.add_file(&Bot::new("b1")).unwrap();
        t.update_file("b1", &tags(&[("color", json!("red"))])).unwrap();
        assert_eq!(t.tag_value("b1", "color"), Some(&json!("red")));

        let atoms = t.update_file("b1", &tags(&[("color", Value::Null)])).unwrap();
        assert_eq!(atoms.len(), 1);
        assert_eq!(t.tag_value("b1", "color"), None);

        // Reusing the same tag atom keeps one binding.
        t.update_file("b1", &tags(&[("color", json!("blue"))])).unwrap();
        assert_eq!(t.metadata().tags("b1").count(), 1);
    }

    #[test]
    fn update_missing_file_fails() {
        let mut t = tree();
        let err = t.update_file("nope", &tags(&[("a", json!(1))])).unwrap_err();
        assert_eq!(err.code(), ErrorCode::FileNotFound);
    }

    #[test]
    fn remove_file_deletes_every_live_file_atom() {
        let mut t = tree();
        t.file("b1").unwrap();
        t.file("b1").unwrap();
        let atoms = t.remove_file("b1").unwrap();
        assert_eq!(atoms.len(), 2);
        assert!(atoms.iter().all(|a| a.id.priority == DELETE_PRIORITY));
        assert!(t.state().is_empty());
        assert!(t.remove_file("b1").unwrap().is_empty());
    }

    #[test]
    fn builders_reject_wrong_targets() {
        let mut t = tree();
        let file = t.file("b1").unwrap().id;
        let tag = t.tag("color", file).unwrap().id;
        let value = t.val(json!("red"), tag).unwrap().id;

        let before = t.weave().len();
        let cases = [
            t.val(json!(1), file).unwrap_err(),
            t.tag("x", value).unwrap_err(),
            t.delete(value, None, None).unwrap_err(),
            t.delete(file, Some(0), Some(1)).unwrap_err(),
            t.insert(value, 9, "x").unwrap_err(),
            t.delete(value, Some(1), Some(9)).unwrap_err(),
        ];
        for err in cases {
            assert_eq!(err.code(), ErrorCode::MalformedOperation, "{err}");
        }
        assert_eq!(t.weave().len(), before);
    }

    #[test]
    fn edits_on_deleted_targets_are_refused() {
        let mut t = tree();
        let file = t.file("b1").unwrap().id;
        let tag = t.tag("color", file).unwrap().id;
        t.delete(tag, None, None).unwrap();
        assert!(matches!(t.val(json!(1), tag), Err(AuxError::Tombstoned(_))));

        t.delete(file, None, None).unwrap();
        assert!(matches!(t.tag("x", file), Err(AuxError::Tombstoned(_))));
    }

    #[test]
    fn text_editing_round() {
        let mut t = tree();
        t.add_file(&Bot::new("b1").with_tag("label", "hello world"))
            .unwrap();

        t.insert_into_tag_value("b1", "label", 5, ",").unwrap();
        assert_eq!(t.tag_value("b1", "label"), Some(&json!("hello, world")));

        let atoms = t.delete_from_tag_value("b1", "label", 4, 3).unwrap();
        // o | , | space: three runs across two segments
        assert_eq!(atoms.len(), 3);
        assert_eq!(t.tag_value("b1", "label"), Some(&json!("hellworld")));

        let err = t.insert_into_tag_value("b1", "label", 99, "x").unwrap_err();
        assert_eq!(err.code(), ErrorCode::MalformedOperation);
    }

    #[test]
    fn editing_a_value_less_tag_starts_from_empty_text() {
        let mut t = tree();
        t.add_file(&Bot::new("b1")).unwrap();
        assert_eq!(
            t.insert_into_tag_value("b1", "note", 0, "hi").unwrap_err().code(),
            ErrorCode::TagNotFound
        );

        t.update_file("b1", &tags(&[("note", json!("x"))])).unwrap();
        t.update_file("b1", &tags(&[("note", Value::Null)])).unwrap();
        t.insert_into_tag_value("b1", "note", 0, "hi").unwrap();
        assert_eq!(t.tag_value("b1", "note"), Some(&json!("hi")));
    }

    #[test]
    fn renaming_a_tag_through_name_edits() {
        let mut t = tree();
        t.add_file(&Bot::new("b1").with_tag("colour", "red")).unwrap();
        t.delete_from_tag_name("b1", "colour", 4, 1).unwrap();
        assert_eq!(t.tag_value("b1", "color"), Some(&json!("red")));
        assert_eq!(t.tag_value("b1", "colour"), None);

        t.insert_into_tag_name("b1", "color", 5, "s").unwrap();
        assert_eq!(t.tag_value("b1", "colors"), Some(&json!("red")));

        // A later value does not collect the name edits.
        t.update_file("b1", &tags(&[("colors", json!("blue"))])).unwrap();
        assert_eq!(t.tag_value("b1", "colors"), Some(&json!("blue")));
    }

    #[test]
    fn events_apply_one_batch_each() {
        let mut t = tree();
        let events = vec![
            FileEvent::FileAdded {
                file: Bot::new("a").with_tag("n", 1),
            },
            FileEvent::Transaction {
                events: vec![
                    FileEvent::updated("a", [("n".to_string(), json!(2))]),
                    FileEvent::FileAdded {
                        file: Bot::new("b"),
                    },
                ],
            },
            FileEvent::FileRemoved { id: "b".into() },
        ];
        t.add_events(&events).unwrap();
        assert_eq!(t.state().len(), 1);
        assert_eq!(t.tag_value("a", "n"), Some(&json!(2)));
    }

    #[test]
    fn transaction_events_see_earlier_events() {
        let mut t = tree();
        let atoms = t
            .apply_event(&FileEvent::Transaction {
                events: vec![
                    FileEvent::FileAdded {
                        file: Bot::new("a").with_tag("n", 1),
                    },
                    FileEvent::updated("a", [("n".to_string(), json!(2))]),
                    FileEvent::updated("a", [("m".to_string(), json!("x"))]),
                ],
            })
            .unwrap();

        // file + n tag/value, n value, m tag/value
        assert_eq!(atoms.len(), 6);
        assert_eq!(t.tag_value("a", "n"), Some(&json!(2)));
        assert_eq!(t.tag_value("a", "m"), Some(&json!("x")));
        assert_eq!(t.metadata().tags("a").count(), 2);
        assert_eq!(t.state(), &t.reduce_from_scratch().0);
    }

    #[test]
    fn deleting_far_past_a_value_less_tag_is_malformed() {
        let mut t = tree();
        let file = t.file("b1").unwrap().id;
        t.tag("note", file).unwrap();

        let err = t
            .delete_from_tag_value("b1", "note", usize::MAX, 2)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::MalformedOperation);
    }

    #[test]
    fn apply_state_adds_or_updates() {
        let mut t = tree();
        t.add_file(&Bot::new("a").with_tag("n", 1)).unwrap();

        let snapshot: AuxState = [
            ("a".to_string(), Bot::new("a").with_tag("n", 1).with_tag("m", 2)),
            ("b".to_string(), Bot::new("b").with_tag("k", true)),
        ]
        .into_iter()
        .collect();
        let atoms = t.apply_state(&snapshot).unwrap();

        // a: tag+value for m; b: file + tag + value
        assert_eq!(atoms.len(), 5);
        assert_eq!(t.state(), &snapshot);
    }

    #[test]
    fn failed_event_keeps_earlier_events() {
        let mut t = aux_tree(SiteId(1), TreeConfig {
            gc: GcPolicy::Disabled,
            ..TreeConfig::default()
        });
        t.root().unwrap();
        let events = vec![
            FileEvent::FileAdded { file: Bot::new("a") },
            FileEvent::updated("missing", [("x".to_string(), json!(1))]),
        ];
        let err = t.add_events(&events).unwrap_err();
        assert!(matches!(err, AuxError::FileNotFound(_)));
        assert!(t.state().contains_key("a"));
    }
}
