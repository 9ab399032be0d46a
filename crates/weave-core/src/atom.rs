//! Atom identity and the immutable atom record.
//!
//! An atom is one operation in the causal tree: its [`AtomId`] names the site
//! that produced it, that site's Lamport timestamp at creation, and an explicit
//! priority supplied by the operation type. The `cause` points at the atom it
//! was created against; only the root has no cause.
//!
//! # Sibling Order
//!
//! Atoms sharing a cause are ordered by [`weave_order`]: priority descending,
//! then timestamp descending, then site descending. The key is a pure
//! function of immutable fields, so every replica orders siblings the same way
//! no matter when they arrived.
//!
//! # Checksums
//!
//! Every atom carries `blake3:<hex>` over the JSON encoding of
//! `(id, cause, value)`. The checksum is computed once in [`Atom::new`] and
//! can be re-verified with [`Atom::verify`] after transport.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::WeaveError;

/// Identifier of a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(pub u32);

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identity of an atom.
///
/// The derived `Ord` is a storage order only (site, timestamp, priority);
/// use [`weave_order`] for placement in the weave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AtomId {
    /// Site that created the atom.
    pub site: SiteId,
    /// The site's Lamport clock value when the atom was created.
    pub timestamp: u64,
    /// Explicit tiebreak supplied by the operation type.
    pub priority: u32,
}

impl AtomId {
    #[must_use]
    pub const fn new(site: SiteId, timestamp: u64, priority: u32) -> Self {
        Self {
            site,
            timestamp,
            priority,
        }
    }

    /// Returns `true` if `self` sorts before `other` among siblings.
    #[must_use]
    pub fn precedes(&self, other: &Self) -> bool {
        weave_order(self, other) == Ordering::Less
    }
}

impl fmt::Display for AtomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.priority == 0 {
            write!(f, "{}@{}", self.site, self.timestamp)
        } else {
            write!(f, "{}@{}!{}", self.site, self.timestamp, self.priority)
        }
    }
}

/// Sibling order: `Less` means `a` is placed before `b`.
///
/// Higher priority first, then newer timestamp, then higher site id.
#[must_use]
pub fn weave_order(a: &AtomId, b: &AtomId) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| b.timestamp.cmp(&a.timestamp))
        .then_with(|| b.site.cmp(&a.site))
}

/// An immutable, causally-linked operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Atom<O> {
    /// Identity of this atom.
    pub id: AtomId,
    /// The atom this one was created against. `None` only for the root.
    pub cause: Option<AtomId>,
    /// Operation payload.
    pub value: O,
    /// BLAKE3 content checksum, `blake3:<hex>`.
    pub checksum: String,
}

impl<O: Serialize> Atom<O> {
    /// Build an atom and compute its checksum.
    ///
    /// # Errors
    ///
    /// Returns [`WeaveError::Serialization`] if the payload cannot be encoded.
    pub fn new(id: AtomId, cause: Option<AtomId>, value: O) -> Result<Self, WeaveError> {
        let checksum = compute_checksum(&id, cause.as_ref(), &value)?;
        Ok(Self {
            id,
            cause,
            value,
            checksum,
        })
    }

    /// Recompute the checksum and compare with the stored one.
    ///
    /// # Errors
    ///
    /// Returns [`WeaveError::ChecksumMismatch`] when the content was altered.
    pub fn verify(&self) -> Result<(), WeaveError> {
        let expected = compute_checksum(&self.id, self.cause.as_ref(), &self.value)?;
        if expected == self.checksum {
            Ok(())
        } else {
            Err(WeaveError::ChecksumMismatch {
                atom: self.id,
                stored: self.checksum.clone(),
                expected,
            })
        }
    }
}

impl<O> Atom<O> {
    /// Returns `true` for the root atom.
    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.cause.is_none()
    }
}

fn compute_checksum<O: Serialize>(
    id: &AtomId,
    cause: Option<&AtomId>,
    value: &O,
) -> Result<String, WeaveError> {
    let bytes = serde_json::to_vec(&(id, cause, value))?;
    Ok(format!("blake3:{}", blake3::hash(&bytes).to_hex()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(site: u32, timestamp: u64, priority: u32) -> AtomId {
        AtomId::new(SiteId(site), timestamp, priority)
    }

    #[test]
    fn higher_priority_comes_first() {
        assert!(id(1, 1, 1).precedes(&id(9, 50, 0)));
    }

    #[test]
    fn newer_timestamp_comes_first() {
        assert!(id(1, 5, 0).precedes(&id(2, 4, 0)));
        assert!(!id(2, 4, 0).precedes(&id(1, 5, 0)));
    }

    #[test]
    fn site_breaks_timestamp_ties() {
        assert!(id(2, 4, 0).precedes(&id(1, 4, 0)));
    }

    #[test]
    fn order_is_total_and_antisymmetric() {
        let a = id(3, 3, 0);
        assert_eq!(weave_order(&a, &a), Ordering::Equal);
        let b = id(3, 4, 0);
        assert_eq!(weave_order(&a, &b), weave_order(&b, &a).reverse());
    }

    #[test]
    fn checksum_is_stable_and_verifiable() {
        let a = Atom::new(id(1, 2, 0), Some(id(1, 1, 0)), "tag".to_string()).unwrap();
        let b = Atom::new(id(1, 2, 0), Some(id(1, 1, 0)), "tag".to_string()).unwrap();
        assert_eq!(a.checksum, b.checksum);
        assert!(a.checksum.starts_with("blake3:"));
        assert!(a.verify().is_ok());
    }

    #[test]
    fn tampered_atom_fails_verification() {
        let mut atom = Atom::new(id(1, 2, 0), Some(id(1, 1, 0)), "red".to_string()).unwrap();
        atom.value = "blue".to_string();
        let err = atom.verify().unwrap_err();
        assert!(matches!(err, WeaveError::ChecksumMismatch { .. }));
    }

    #[test]
    fn display_includes_priority_only_when_set() {
        assert_eq!(id(4, 10, 0).to_string(), "4@10");
        assert_eq!(id(4, 10, 1).to_string(), "4@10!1");
    }
}
