//! Collaborative text over weave segments.
//!
//! A segment is an atom that owns text: a tag (its name), a value (its text
//! form) or an insert (its spliced text). Its children edit it:
//!
//! - `insert { index, text }` splices a new segment after the parent's first
//!   `index` own chars. Concurrent inserts at the same index appear in weave
//!   order (newest first).
//! - ranged `delete { start, end }` hides own chars `start..end`.
//!
//! Every visible char is therefore anchored to `(segment atom, own offset)`
//! rather than to a string index, so concurrent edits at different places
//! never disturb each other.

use weave_core::{AtomId, Span};

use crate::op::AuxOp;

/// One visible character and the place it lives in the weave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Glyph {
    pub ch: char,
    pub segment: AtomId,
    pub offset: usize,
}

/// A contiguous run of own chars of one segment: `segment`, `start..end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    pub segment: AtomId,
    pub start: usize,
    pub end: usize,
}

enum Step<'a> {
    Expand(Span<'a, AuxOp>),
    Emit(Glyph),
}

/// Visible characters of the segment rooted at `span`, in reading order.
#[must_use]
pub fn glyphs(span: Span<'_, AuxOp>) -> Vec<Glyph> {
    let mut out = Vec::new();
    // Explicit stack: typing produces insert chains as deep as the text is long.
    let mut stack = vec![Step::Expand(span)];

    while let Some(step) = stack.pop() {
        let span = match step {
            Step::Emit(glyph) => {
                out.push(glyph);
                continue;
            }
            Step::Expand(span) => span,
        };

        let own: Vec<char> = span
            .head()
            .value
            .segment_text()
            .unwrap_or_default()
            .chars()
            .collect();
        let len = own.len();
        let mut deleted = vec![false; len];
        let mut inserts: Vec<Vec<Span<'_, AuxOp>>> = vec![Vec::new(); len + 1];

        for child in span.children() {
            match &child.head().value {
                AuxOp::Insert { index, .. } => inserts[(*index).min(len)].push(child),
                AuxOp::Delete { start, end } if child.head().value.is_ranged_delete() => {
                    let start = start.unwrap_or(0).min(len);
                    let end = end.unwrap_or(len).clamp(start, len);
                    deleted[start..end].fill(true);
                }
                _ => {}
            }
        }

        let segment = span.head().id;
        for offset in (0..=len).rev() {
            if offset < len && !deleted[offset] {
                stack.push(Step::Emit(Glyph {
                    ch: own[offset],
                    segment,
                    offset,
                }));
            }
            for insert in inserts[offset].iter().rev() {
                stack.push(Step::Expand(*insert));
            }
        }
    }
    out
}

/// Visible text of the segment rooted at `span`.
#[must_use]
pub fn materialize(span: Span<'_, AuxOp>) -> String {
    glyphs(span).into_iter().map(|g| g.ch).collect()
}

/// Returns `true` if the segment has any text splices.
#[must_use]
pub fn has_edits(span: Span<'_, AuxOp>) -> bool {
    span.children().any(|c| {
        let op = &c.head().value;
        matches!(op, AuxOp::Insert { .. }) || op.is_ranged_delete()
    })
}

/// Where to attach an insert at visible `index`: `(segment, own offset)`.
///
/// Index 0 anchors at the start of `head`; any other index anchors right
/// after the visible char before it. `None` if `index` is past the end.
#[must_use]
pub fn insert_anchor(glyphs: &[Glyph], head: AtomId, index: usize) -> Option<(AtomId, usize)> {
    if index > glyphs.len() {
        return None;
    }
    if index == 0 {
        return Some((head, 0));
    }
    let before = glyphs[index - 1];
    Some((before.segment, before.offset + 1))
}

/// Split visible range `index..index + count` into per-segment runs.
///
/// `None` if the range extends past the end.
#[must_use]
pub fn delete_runs(glyphs: &[Glyph], index: usize, count: usize) -> Option<Vec<Run>> {
    let end = index.checked_add(count)?;
    if end > glyphs.len() {
        return None;
    }

    let mut runs: Vec<Run> = Vec::new();
    for glyph in &glyphs[index..end] {
        match runs.last_mut() {
            Some(run) if run.segment == glyph.segment && run.end == glyph.offset => {
                run.end += 1;
            }
            _ => runs.push(Run {
                segment: glyph.segment,
                start: glyph.offset,
                end: glyph.offset + 1,
            }),
        }
    }
    Some(runs)
}
