//! The weave: a totally ordered, causally consistent sequence of atoms.
//!
//! # Layout
//!
//! Atoms are stored in a single vector in pre-order depth-first order of the
//! cause tree. A parallel vector records each atom's depth (root = 0). Two
//! facts follow from pre-order storage and drive every algorithm here:
//!
//! - The subtree of the atom at index `i` is the contiguous run `i+1..` of
//!   atoms whose depth is strictly greater than `depth[i]`.
//! - A cause always precedes its descendants, so a forward scan of the weave
//!   is a causally valid delivery order.
//!
//! # Insertion
//!
//! [`Weave::insert`] places an atom inside its cause's subtree, before the
//! first existing sibling it precedes under [`crate::atom::weave_order`], skipping over
//! the subtrees of siblings that outrank it. Placement depends only on atom
//! ids, never on arrival order, which is what makes concurrent delivery
//! converge.
//!
//! # Garbage Collection
//!
//! [`Weave::remove_before`] physically deletes the lower-precedence siblings
//! of an atom together with their subtrees. Removed ids are remembered so a
//! redelivered copy (or a late descendant of a removed atom) is discarded
//! instead of resurrecting collected history.

mod span;

pub use span::{Span, SpanChildren};

use std::collections::{HashMap, HashSet};

use tracing::{debug, trace};

use crate::atom::{Atom, AtomId};
use crate::error::WeaveError;
use crate::version::SiteVersion;

// ---------------------------------------------------------------------------
// Placement
// ---------------------------------------------------------------------------

/// Result of offering an atom to [`Weave::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// The atom was new and now lives at this index.
    Inserted(usize),
    /// The atom was already present at this index; nothing changed.
    Known(usize),
    /// The atom (or its cause) was garbage collected earlier; ignored.
    Discarded,
}

impl Placement {
    /// Returns `true` if the weave changed.
    #[must_use]
    pub const fn is_inserted(self) -> bool {
        matches!(self, Self::Inserted(_))
    }
}

// ---------------------------------------------------------------------------
// Weave
// ---------------------------------------------------------------------------

/// Ordered atom storage with per-site version tracking.
#[derive(Debug, Clone)]
pub struct Weave<O> {
    atoms: Vec<Atom<O>>,
    depths: Vec<u32>,
    positions: HashMap<AtomId, usize>,
    version: SiteVersion,
    collected: HashSet<AtomId>,
}

impl<O> Default for Weave<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O> Weave<O> {
    /// Create an empty weave.
    #[must_use]
    pub fn new() -> Self {
        Self {
            atoms: Vec::new(),
            depths: Vec::new(),
            positions: HashMap::new(),
            version: SiteVersion::new(),
            collected: HashSet::new(),
        }
    }

    /// Number of atoms physically present.
    #[must_use]
    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    /// All atoms in weave order.
    #[must_use]
    pub fn atoms(&self) -> &[Atom<O>] {
        &self.atoms
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Atom<O>> {
        self.atoms.iter()
    }

    /// The root atom, if one has been inserted.
    #[must_use]
    pub fn root(&self) -> Option<&Atom<O>> {
        self.atoms.first()
    }

    /// Per-site highest timestamps observed (including collected atoms).
    #[must_use]
    pub const fn version(&self) -> &SiteVersion {
        &self.version
    }

    #[must_use]
    pub fn contains(&self, id: &AtomId) -> bool {
        self.positions.contains_key(id)
    }

    /// Returns `true` if the atom was removed by garbage collection.
    #[must_use]
    pub fn is_collected(&self, id: &AtomId) -> bool {
        self.collected.contains(id)
    }

    #[must_use]
    pub fn index_of(&self, id: &AtomId) -> Option<usize> {
        self.positions.get(id).copied()
    }

    #[must_use]
    pub fn get(&self, id: &AtomId) -> Option<&Atom<O>> {
        self.index_of(id).map(|i| &self.atoms[i])
    }

    /// Depth of an atom in the cause tree (root = 0).
    #[must_use]
    pub fn depth_of(&self, id: &AtomId) -> Option<u32> {
        self.index_of(id).map(|i| self.depths[i])
    }

    /// The contiguous subtree rooted at `id`.
    #[must_use]
    pub fn span(&self, id: &AtomId) -> Option<Span<'_, O>> {
        let start = self.index_of(id)?;
        let end = self.subtree_end(start);
        Some(Span::new(&self.atoms[start..end], &self.depths[start..end]))
    }

    /// The ancestor of `id` (or `id` itself) sitting at `depth`.
    ///
    /// Scans backwards: in pre-order storage the nearest preceding atom at the
    /// requested depth is the ancestor.
    #[must_use]
    pub fn ancestor_at_depth(&self, id: &AtomId, depth: u32) -> Option<&Atom<O>> {
        let index = self.index_of(id)?;
        if self.depths[index] < depth {
            return None;
        }
        (0..=index)
            .rev()
            .find(|&i| self.depths[i] == depth)
            .map(|i| &self.atoms[i])
    }

    /// Atoms that a peer at `known` has not seen, in weave order.
    ///
    /// Weave order is pre-order, so every cause is yielded before its
    /// descendants.
    #[must_use]
    pub fn atoms_since(&self, known: &SiteVersion) -> Vec<&Atom<O>> {
        self.atoms.iter().filter(|a| !known.covers(&a.id)).collect()
    }

    /// Insert an atom at the position dictated by its cause and siblings.
    ///
    /// # Errors
    ///
    /// - [`WeaveError::OrphanAtom`] if the cause is not present.
    /// - [`WeaveError::RootExists`] if a second root is offered.
    pub fn insert(&mut self, atom: Atom<O>) -> Result<Placement, WeaveError> {
        if let Some(index) = self.index_of(&atom.id) {
            return Ok(Placement::Known(index));
        }
        if self.collected.contains(&atom.id) {
            return Ok(Placement::Discarded);
        }

        let Some(cause) = atom.cause else {
            if let Some(existing) = self.root() {
                return Err(WeaveError::RootExists {
                    existing: existing.id,
                    rejected: atom.id,
                });
            }
            self.version.observe(&atom.id);
            self.positions.insert(atom.id, 0);
            self.atoms.push(atom);
            self.depths.push(0);
            return Ok(Placement::Inserted(0));
        };

        if self.collected.contains(&cause) {
            trace!(atom = %atom.id, %cause, "discarding descendant of collected atom");
            self.version.observe(&atom.id);
            self.collected.insert(atom.id);
            return Ok(Placement::Discarded);
        }

        let Some(cause_index) = self.index_of(&cause) else {
            return Err(WeaveError::OrphanAtom {
                atom: atom.id,
                cause,
            });
        };

        let cause_depth = self.depths[cause_index];
        let child_depth = cause_depth + 1;
        let mut index = cause_index + 1;
        while index < self.atoms.len() && self.depths[index] > cause_depth {
            if self.depths[index] == child_depth && atom.id.precedes(&self.atoms[index].id) {
                break;
            }
            index += 1;
        }

        trace!(atom = %atom.id, %cause, index, "inserting atom");
        self.version.observe(&atom.id);
        self.atoms.insert(index, atom);
        self.depths.insert(index, child_depth);
        self.reindex_from(index);
        Ok(Placement::Inserted(index))
    }

    /// Remove the lower-precedence siblings of `id` and their subtrees.
    ///
    /// With a `horizon`, a sibling subtree is only removed when every atom in
    /// it is covered by the horizon. Unknown ids and the root remove nothing.
    /// Returns the removed atoms in weave order.
    pub fn remove_before(&mut self, id: &AtomId, horizon: Option<&SiteVersion>) -> Vec<Atom<O>> {
        let Some(index) = self.index_of(id) else {
            return Vec::new();
        };
        let depth = self.depths[index];
        if depth == 0 {
            return Vec::new();
        }

        let mut doomed = Vec::new();
        let mut sibling = self.subtree_end(index);
        while sibling < self.atoms.len() && self.depths[sibling] == depth {
            let end = self.subtree_end(sibling);
            let covered = horizon.is_none_or(|h| {
                self.atoms[sibling..end].iter().all(|a| h.covers(&a.id))
            });
            if covered {
                doomed.push(sibling..end);
            }
            sibling = end;
        }

        if doomed.is_empty() {
            return Vec::new();
        }

        let first = doomed[0].start;
        let mut removed = Vec::new();
        // Ranges are ascending; drain from the back so earlier ranges stay valid.
        for range in doomed.into_iter().rev() {
            self.depths.drain(range.clone());
            let mut chunk: Vec<Atom<O>> = self.atoms.drain(range).collect();
            chunk.append(&mut removed);
            removed = chunk;
        }

        for atom in &removed {
            self.positions.remove(&atom.id);
            self.collected.insert(atom.id);
        }
        self.reindex_from(first);

        debug!(atom = %id, removed = removed.len(), "removed superseded siblings");
        removed
    }

    fn subtree_end(&self, index: usize) -> usize {
        let depth = self.depths[index];
        let mut end = index + 1;
        while end < self.atoms.len() && self.depths[end] > depth {
            end += 1;
        }
        end
    }

    fn reindex_from(&mut self, start: usize) {
        for (offset, atom) in self.atoms[start..].iter().enumerate() {
            self.positions.insert(atom.id, start + offset);
        }
    }
}

impl<O: serde::Serialize> Weave<O> {
    /// BLAKE3 digest over all atom checksums in weave order.
    ///
    /// Two replicas holding the same atoms produce the same checksum.
    #[must_use]
    pub fn checksum(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for atom in &self.atoms {
            hasher.update(atom.checksum.as_bytes());
            hasher.update(b"\n");
        }
        format!("blake3:{}", hasher.finalize().to_hex())
    }

    /// Build a weave from atoms in any causally valid order.
    ///
    /// # Errors
    ///
    /// Propagates the first [`WeaveError`] from [`Weave::insert`].
    pub fn from_atoms(atoms: impl IntoIterator<Item = Atom<O>>) -> Result<Self, WeaveError> {
        let mut weave = Self::new();
        for atom in atoms {
            weave.insert(atom)?;
        }
        Ok(weave)
    }
}

impl<'a, O> IntoIterator for &'a Weave<O> {
    type Item = &'a Atom<O>;
    type IntoIter = std::slice::Iter<'a, Atom<O>>;

    fn into_iter(self) -> Self::IntoIter {
        self.atoms.iter()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::SiteId;

    fn id(site: u32, ts: u64) -> AtomId {
        AtomId::new(SiteId(site), ts, 0)
    }

    fn atom(id: AtomId, cause: Option<AtomId>, value: &str) -> Atom<String> {
        Atom::new(id, cause, value.to_string()).unwrap()
    }

    fn values(weave: &Weave<String>) -> Vec<&str> {
        weave.iter().map(|a| a.value.as_str()).collect()
    }

    fn rooted() -> (Weave<String>, AtomId) {
        let root = id(1, 1);
        let mut weave = Weave::new();
        weave.insert(atom(root, None, "root")).unwrap();
        (weave, root)
    }

    // -------------------------------------------------------------------
    // Insertion
    // -------------------------------------------------------------------

    #[test]
    fn empty_weave() {
        let weave: Weave<String> = Weave::new();
        assert!(weave.is_empty());
        assert!(weave.root().is_none());
        assert!(weave.version().is_empty());
    }

    #[test]
    fn second_root_is_rejected() {
        let (mut weave, _) = rooted();
        let err = weave.insert(atom(id(2, 1), None, "other")).unwrap_err();
        assert!(matches!(err, WeaveError::RootExists { .. }));
    }

    #[test]
    fn orphan_is_rejected() {
        let (mut weave, _) = rooted();
        let err = weave
            .insert(atom(id(1, 3), Some(id(1, 2)), "orphan"))
            .unwrap_err();
        assert!(matches!(err, WeaveError::OrphanAtom { .. }));
        assert_eq!(weave.len(), 1);
    }

    #[test]
    fn duplicate_insert_is_noop() {
        let (mut weave, root) = rooted();
        let a = atom(id(1, 2), Some(root), "a");
        assert_eq!(weave.insert(a.clone()).unwrap(), Placement::Inserted(1));
        assert_eq!(weave.insert(a).unwrap(), Placement::Known(1));
        assert_eq!(weave.len(), 2);
    }

    #[test]
    fn newer_sibling_goes_first() {
        let (mut weave, root) = rooted();
        weave.insert(atom(id(1, 2), Some(root), "old")).unwrap();
        weave.insert(atom(id(1, 3), Some(root), "new")).unwrap();
        assert_eq!(values(&weave), vec!["root", "new", "old"]);
    }

    #[test]
    fn older_sibling_skips_newer_subtree() {
        let (mut weave, root) = rooted();
        let newer = id(1, 5);
        weave.insert(atom(newer, Some(root), "newer")).unwrap();
        weave.insert(atom(id(1, 6), Some(newer), "newer-child")).unwrap();
        weave.insert(atom(id(2, 2), Some(root), "older")).unwrap();
        assert_eq!(values(&weave), vec!["root", "newer", "newer-child", "older"]);
    }

    #[test]
    fn priority_beats_timestamp() {
        let (mut weave, root) = rooted();
        weave.insert(atom(id(1, 9), Some(root), "late")).unwrap();
        let pinned = AtomId::new(SiteId(1), 2, 1);
        weave.insert(atom(pinned, Some(root), "pinned")).unwrap();
        assert_eq!(values(&weave), vec!["root", "pinned", "late"]);
    }

    #[test]
    fn concurrent_siblings_converge_in_any_order() {
        let (mut left, root) = rooted();
        let (mut right, _) = rooted();
        let a = atom(id(1, 2), Some(root), "a");
        let b = atom(id(2, 2), Some(root), "b");
        let c = atom(id(3, 3), Some(a.id), "c");

        for x in [&a, &b, &c] {
            left.insert(x.clone()).unwrap();
        }
        for x in [&b, &a, &c] {
            right.insert(x.clone()).unwrap();
        }

        assert_eq!(values(&left), values(&right));
        assert_eq!(values(&left), vec!["root", "b", "a", "c"]);
        assert_eq!(left.checksum(), right.checksum());
    }

    #[test]
    fn version_tracks_highest_timestamp_per_site() {
        let (mut weave, root) = rooted();
        weave.insert(atom(id(2, 4), Some(root), "x")).unwrap();
        weave.insert(atom(id(2, 2), Some(root), "y")).unwrap();
        assert_eq!(weave.version().get(SiteId(2)), Some(4));
        assert_eq!(weave.version().get(SiteId(1)), Some(1));
    }

    // -------------------------------------------------------------------
    // Traversal helpers
    // -------------------------------------------------------------------

    #[test]
    fn ancestor_at_depth_finds_enclosing_atom() {
        let (mut weave, root) = rooted();
        let file = id(1, 2);
        let tag = id(1, 3);
        let value = id(1, 4);
        weave.insert(atom(file, Some(root), "file")).unwrap();
        weave.insert(atom(tag, Some(file), "tag")).unwrap();
        weave.insert(atom(value, Some(tag), "value")).unwrap();
        weave.insert(atom(id(2, 5), Some(root), "other-file")).unwrap();

        assert_eq!(weave.ancestor_at_depth(&value, 1).unwrap().id, file);
        assert_eq!(weave.ancestor_at_depth(&value, 3).unwrap().id, value);
        assert!(weave.ancestor_at_depth(&file, 2).is_none());
    }

    #[test]
    fn atoms_since_skips_known() {
        let (mut weave, root) = rooted();
        weave.insert(atom(id(2, 2), Some(root), "x")).unwrap();
        weave.insert(atom(id(3, 3), Some(root), "y")).unwrap();

        let known: SiteVersion = [(SiteId(1), 1), (SiteId(2), 2)].into_iter().collect();
        let missing: Vec<&str> = weave
            .atoms_since(&known)
            .into_iter()
            .map(|a| a.value.as_str())
            .collect();
        assert_eq!(missing, vec!["y"]);
    }

    // -------------------------------------------------------------------
    // Garbage collection
    // -------------------------------------------------------------------

    fn tag_with_values() -> (Weave<String>, AtomId, AtomId) {
        let (mut weave, root) = rooted();
        let tag = id(1, 2);
        weave.insert(atom(tag, Some(root), "tag")).unwrap();
        weave.insert(atom(id(1, 3), Some(tag), "v1")).unwrap();
        weave.insert(atom(id(1, 4), Some(id(1, 3)), "v1-edit")).unwrap();
        weave.insert(atom(id(1, 5), Some(tag), "v2")).unwrap();
        let newest = id(1, 6);
        weave.insert(atom(newest, Some(tag), "v3")).unwrap();
        (weave, tag, newest)
    }

    #[test]
    fn remove_before_drops_older_siblings_and_subtrees() {
        let (mut weave, _, newest) = tag_with_values();
        let removed = weave.remove_before(&newest, None);
        let removed: Vec<&str> = removed.iter().map(|a| a.value.as_str()).collect();
        assert_eq!(removed, vec!["v2", "v1", "v1-edit"]);
        assert_eq!(values(&weave), vec!["root", "tag", "v3"]);
        assert!(weave.is_collected(&id(1, 3)));
    }

    #[test]
    fn remove_before_is_idempotent() {
        let (mut weave, _, newest) = tag_with_values();
        weave.remove_before(&newest, None);
        let snapshot = weave.checksum();
        assert!(weave.remove_before(&newest, None).is_empty());
        assert_eq!(weave.checksum(), snapshot);
    }

    #[test]
    fn remove_before_is_order_independent() {
        let (mut a, _, newest) = tag_with_values();
        let (mut b, _, _) = tag_with_values();
        let middle = id(1, 5);

        a.remove_before(&newest, None);
        a.remove_before(&middle, None);

        b.remove_before(&middle, None);
        b.remove_before(&newest, None);

        assert_eq!(a.checksum(), b.checksum());
        assert_eq!(values(&a), values(&b));
    }

    #[test]
    fn horizon_protects_unacknowledged_subtrees() {
        let (mut weave, _, newest) = tag_with_values();
        // Site 1 acknowledged only through timestamp 3: v1 has an edit at 4.
        let horizon: SiteVersion = [(SiteId(1), 3)].into_iter().collect();
        let removed = weave.remove_before(&newest, Some(&horizon));
        assert!(removed.is_empty());

        let horizon: SiteVersion = [(SiteId(1), 5)].into_iter().collect();
        let removed = weave.remove_before(&newest, Some(&horizon));
        assert_eq!(removed.len(), 3);
    }

    #[test]
    fn redelivered_collected_atoms_are_discarded() {
        let (mut weave, tag, newest) = tag_with_values();
        weave.remove_before(&newest, None);

        let old = atom(id(1, 5), Some(tag), "v2");
        assert_eq!(weave.insert(old).unwrap(), Placement::Discarded);

        let late_child = atom(id(2, 9), Some(id(1, 3)), "late-edit");
        assert_eq!(weave.insert(late_child).unwrap(), Placement::Discarded);
        assert_eq!(values(&weave), vec!["root", "tag", "v3"]);
        assert_eq!(weave.version().get(SiteId(2)), Some(9));
    }

    #[test]
    fn root_has_nothing_to_remove() {
        let (mut weave, root) = rooted();
        assert!(weave.remove_before(&root, None).is_empty());
    }
}
