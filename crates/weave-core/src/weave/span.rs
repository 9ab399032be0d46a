//! Subtree cursors over the weave.
//!
//! A [`Span`] is the contiguous pre-order run belonging to one atom. Reducers
//! walk spans instead of the whole weave so that re-reducing one document
//! only touches that document's atoms.

use crate::atom::Atom;

/// A borrowed subtree: the head atom followed by all of its descendants.
#[derive(Debug)]
pub struct Span<'a, O> {
    atoms: &'a [Atom<O>],
    depths: &'a [u32],
}

impl<O> Clone for Span<'_, O> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<O> Copy for Span<'_, O> {}

impl<'a, O> Span<'a, O> {
    pub(crate) fn new(atoms: &'a [Atom<O>], depths: &'a [u32]) -> Self {
        debug_assert!(!atoms.is_empty());
        debug_assert_eq!(atoms.len(), depths.len());
        Self { atoms, depths }
    }

    /// The atom this span is rooted at.
    #[must_use]
    pub fn head(&self) -> &'a Atom<O> {
        &self.atoms[0]
    }

    /// Head plus descendants, in weave order.
    #[must_use]
    pub const fn atoms(&self) -> &'a [Atom<O>] {
        self.atoms
    }

    /// Number of atoms including the head.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.atoms.len()
    }

    /// Always `false`: a span contains at least its head.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    /// Direct children of the head, each as its own span, in weave order.
    #[must_use]
    pub fn children(&self) -> SpanChildren<'a, O> {
        SpanChildren {
            atoms: self.atoms,
            depths: self.depths,
            cursor: 1,
            child_depth: self.depths[0] + 1,
        }
    }
}

/// Iterator over the child spans of a [`Span`].
#[derive(Debug)]
pub struct SpanChildren<'a, O> {
    atoms: &'a [Atom<O>],
    depths: &'a [u32],
    cursor: usize,
    child_depth: u32,
}

impl<'a, O> Iterator for SpanChildren<'a, O> {
    type Item = Span<'a, O>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.atoms.len() {
            return None;
        }
        let start = self.cursor;
        let mut end = start + 1;
        while end < self.atoms.len() && self.depths[end] > self.child_depth {
            end += 1;
        }
        self.cursor = end;
        Some(Span::new(&self.atoms[start..end], &self.depths[start..end]))
    }
}
