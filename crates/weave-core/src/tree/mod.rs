//! A replica: one weave plus the reducer that materializes it.
//!
//! [`CausalTree`] owns the site's Lamport clock, the weave, the current
//! reduced state and metadata, and the list of subscribers that hear about
//! every change. Local edits go through [`CausalTree::create`] (optionally
//! grouped with [`CausalTree::batch`]); remote atoms arrive through
//! [`CausalTree::add_many`].
//!
//! # Garbage Collection
//!
//! After every reduction the reducer's collection hook runs according to
//! [`GcPolicy`]. Under [`GcPolicy::Acknowledged`] the hook only receives a
//! horizon covering atoms that every known peer has acknowledged via
//! [`CausalTree::acknowledge`]; a known peer with no acknowledgement blocks
//! collection entirely.

mod stored;

pub use stored::{STORED_FORMAT_VERSION, StoredCausalTree};

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tracing::{debug, info, warn};

use crate::atom::{Atom, AtomId, SiteId};
use crate::config::{GcPolicy, TreeConfig};
use crate::error::WeaveError;
use crate::notify::{SubscriptionId, Subscribers};
use crate::reducer::{AtomReducer, Change};
use crate::version::SiteVersion;
use crate::weave::{Placement, Weave};

/// Change notification published by a [`CausalTree`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeEvent<O> {
    /// Atoms were inserted and reduced. `local` is `true` for atoms this
    /// replica created.
    AtomsAdded { atoms: Vec<Atom<O>>, local: bool },
    /// Atoms were physically removed by garbage collection.
    AtomsRemoved { atoms: Vec<Atom<O>> },
}

/// Outcome of [`CausalTree::add_many`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddedAtoms<O> {
    /// Atoms that were new to this replica, in insertion order.
    pub added: Vec<Atom<O>>,
    /// Ids that were already present (or previously collected).
    pub known: Vec<AtomId>,
}

impl<O> Default for AddedAtoms<O> {
    fn default() -> Self {
        Self {
            added: Vec::new(),
            known: Vec::new(),
        }
    }
}

pub struct CausalTree<R: AtomReducer> {
    site: SiteId,
    clock: u64,
    weave: Weave<R::Op>,
    reducer: R,
    state: R::State,
    metadata: R::Metadata,
    config: TreeConfig,
    peers: BTreeSet<SiteId>,
    acknowledged: BTreeMap<SiteId, SiteVersion>,
    pending: Option<Vec<Atom<R::Op>>>,
    /// Leading atoms of `pending` already folded in by [`Self::settle`].
    settled: usize,
    subscribers: Subscribers<TreeEvent<R::Op>>,
}

impl<R: AtomReducer> fmt::Debug for CausalTree<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CausalTree")
            .field("site", &self.site)
            .field("clock", &self.clock)
            .field("atoms", &self.weave.len())
            .field("gc", &self.config.gc)
            .field("subscribers", &self.subscribers.len())
            .finish_non_exhaustive()
    }
}

impl<R: AtomReducer> CausalTree<R> {
    /// Create an empty replica for `site`.
    pub fn new(site: SiteId, reducer: R, config: TreeConfig) -> Self {
        Self {
            site,
            clock: 0,
            weave: Weave::new(),
            reducer,
            state: R::State::default(),
            metadata: R::Metadata::default(),
            config,
            peers: BTreeSet::new(),
            acknowledged: BTreeMap::new(),
            pending: None,
            settled: 0,
            subscribers: Subscribers::new(),
        }
    }

    /// Rebuild a replica from a snapshot, keeping the snapshot's site.
    ///
    /// # Errors
    ///
    /// Propagates checksum, orphan and root errors from [`Self::add_many`].
    pub fn from_stored(
        stored: StoredCausalTree<R::Op>,
        reducer: R,
        config: TreeConfig,
    ) -> Result<Self, WeaveError> {
        let mut tree = Self::new(stored.site, reducer, config);
        tree.import(stored)?;
        Ok(tree)
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    #[must_use]
    pub const fn site(&self) -> SiteId {
        self.site
    }

    /// Current Lamport time. The next local atom gets `clock() + 1`.
    #[must_use]
    pub const fn clock(&self) -> u64 {
        self.clock
    }

    #[must_use]
    pub const fn weave(&self) -> &Weave<R::Op> {
        &self.weave
    }

    #[must_use]
    pub const fn state(&self) -> &R::State {
        &self.state
    }

    #[must_use]
    pub const fn metadata(&self) -> &R::Metadata {
        &self.metadata
    }

    #[must_use]
    pub const fn reducer(&self) -> &R {
        &self.reducer
    }

    #[must_use]
    pub const fn config(&self) -> &TreeConfig {
        &self.config
    }

    #[must_use]
    pub const fn version(&self) -> &SiteVersion {
        self.weave.version()
    }

    /// Returns `true` while inside [`Self::batch`].
    #[must_use]
    pub const fn in_batch(&self) -> bool {
        self.pending.is_some()
    }

    // -----------------------------------------------------------------------
    // Local edits
    // -----------------------------------------------------------------------

    /// Create a local atom for `op` against `cause`.
    ///
    /// Outside a batch the atom is reduced and published immediately.
    ///
    /// # Errors
    ///
    /// - [`WeaveError::RootExists`] for a second root.
    /// - [`WeaveError::MissingRoot`] for a non-root atom on an empty weave.
    /// - [`WeaveError::OrphanAtom`] if `cause` is not present.
    pub fn create(
        &mut self,
        op: R::Op,
        cause: Option<AtomId>,
        priority: u32,
    ) -> Result<Atom<R::Op>, WeaveError> {
        let id = AtomId::new(self.site, self.clock + 1, priority);
        match cause {
            None => {
                if let Some(existing) = self.weave.root() {
                    return Err(WeaveError::RootExists {
                        existing: existing.id,
                        rejected: id,
                    });
                }
            }
            Some(cause) => {
                if self.weave.is_empty() {
                    return Err(WeaveError::MissingRoot);
                }
                if !self.weave.contains(&cause) {
                    return Err(WeaveError::OrphanAtom { atom: id, cause });
                }
            }
        }

        let atom = Atom::new(id, cause, op)?;
        self.weave.insert(atom.clone())?;
        self.clock = id.timestamp;

        match self.pending.as_mut() {
            Some(pending) => pending.push(atom.clone()),
            None => self.commit(std::slice::from_ref(&atom), true),
        }
        Ok(atom)
    }

    /// Group several local edits into one reduction and one notification.
    ///
    /// Atoms created inside `f` are inserted immediately, so later edits in
    /// the same batch can reference them. Edits that read [`Self::state`]
    /// call [`Self::settle`] first. When `f` fails, the atoms it already
    /// created stay in the weave and are still reduced and published before
    /// the error is returned. Nested batches fold into the outermost.
    ///
    /// # Errors
    ///
    /// Returns whatever `f` returns.
    pub fn batch<T, E>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, E>,
    ) -> Result<(T, Vec<Atom<R::Op>>), E> {
        let nested = self.pending.is_some();
        if !nested {
            self.pending = Some(Vec::new());
        }
        let start = self.pending.as_ref().map_or(0, Vec::len);

        let result = f(self);

        let atoms = if nested {
            self.pending
                .as_ref()
                .map(|pending| pending[start..].to_vec())
                .unwrap_or_default()
        } else {
            let atoms = self.pending.take().unwrap_or_default();
            let settled = std::mem::take(&mut self.settled);
            if let Some(rest) = atoms.get(settled..).filter(|rest| !rest.is_empty()) {
                self.apply(rest, Change::Added);
            }
            if !atoms.is_empty() {
                self.publish_added(&atoms, true);
            }
            atoms
        };

        match result {
            Ok(value) => Ok((value, atoms)),
            Err(err) => {
                if !atoms.is_empty() {
                    warn!(
                        site = %self.site,
                        kept = atoms.len(),
                        "batch failed after creating atoms"
                    );
                }
                Err(err)
            }
        }
    }

    /// Reduce the atoms created so far in the current batch, so that state
    /// and metadata reflect them. Nothing is published until the batch ends.
    /// Outside a batch this is a no-op.
    pub fn settle(&mut self) {
        let Some(pending) = self.pending.as_ref() else {
            return;
        };
        if pending.len() == self.settled {
            return;
        }
        let fresh = pending[self.settled..].to_vec();
        self.settled = pending.len();
        self.apply(&fresh, Change::Added);
    }

    // -----------------------------------------------------------------------
    // Remote atoms
    // -----------------------------------------------------------------------

    /// Integrate atoms from another replica.
    ///
    /// Atoms may arrive in any order within the batch; each is held back
    /// until its cause is present. The clock advances past every observed
    /// timestamp. Everything inserted before an error is still reduced.
    ///
    /// # Errors
    ///
    /// - [`WeaveError::ChecksumMismatch`] (when verification is enabled);
    ///   nothing is inserted in that case.
    /// - [`WeaveError::OrphanAtom`] if some atom's cause is neither present
    ///   nor in the batch.
    /// - [`WeaveError::RootExists`] for a conflicting root.
    pub fn add_many(
        &mut self,
        atoms: Vec<Atom<R::Op>>,
    ) -> Result<AddedAtoms<R::Op>, WeaveError> {
        let mut outcome = AddedAtoms::default();
        let result = self.integrate(atoms, &mut outcome);

        self.clock = self.clock.max(self.weave.version().max_timestamp());
        if !outcome.added.is_empty() {
            debug!(
                site = %self.site,
                added = outcome.added.len(),
                known = outcome.known.len(),
                "integrated remote atoms"
            );
            self.commit(&outcome.added, false);
        }

        result.map(|()| outcome)
    }

    fn integrate(
        &mut self,
        atoms: Vec<Atom<R::Op>>,
        outcome: &mut AddedAtoms<R::Op>,
    ) -> Result<(), WeaveError> {
        if self.config.verify_checksums {
            for atom in &atoms {
                if let Err(err) = atom.verify() {
                    warn!(site = %self.site, atom = %atom.id, "rejecting batch with bad checksum");
                    return Err(err);
                }
            }
        }

        let mut queue = atoms;
        while !queue.is_empty() {
            let progress_before = outcome.added.len() + outcome.known.len();
            let mut deferred = Vec::new();

            for atom in queue {
                if self.weave.contains(&atom.id) || self.weave.is_collected(&atom.id) {
                    outcome.known.push(atom.id);
                    continue;
                }
                let ready = atom
                    .cause
                    .is_none_or(|c| self.weave.contains(&c) || self.weave.is_collected(&c));
                if !ready {
                    deferred.push(atom);
                    continue;
                }
                match self.weave.insert(atom.clone())? {
                    Placement::Inserted(_) => outcome.added.push(atom),
                    Placement::Known(_) | Placement::Discarded => outcome.known.push(atom.id),
                }
            }

            if outcome.added.len() + outcome.known.len() == progress_before {
                if let Some(orphan) = deferred.first() {
                    return Err(WeaveError::OrphanAtom {
                        atom: orphan.id,
                        cause: orphan.cause.unwrap_or(orphan.id),
                    });
                }
            }
            queue = deferred;
        }
        Ok(())
    }

    /// Merge every atom of another replica into this one.
    ///
    /// # Errors
    ///
    /// See [`Self::add_many`].
    pub fn merge(&mut self, other: &Self) -> Result<AddedAtoms<R::Op>, WeaveError> {
        self.add_many(other.weave.atoms().to_vec())
    }

    /// Atoms a peer at `known` is missing, in a causally valid order.
    #[must_use]
    pub fn atoms_since(&self, known: &SiteVersion) -> Vec<Atom<R::Op>> {
        self.weave.atoms_since(known).into_iter().cloned().collect()
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    /// Serializable snapshot of this replica.
    #[must_use]
    pub fn export(&self) -> StoredCausalTree<R::Op> {
        StoredCausalTree {
            format_version: STORED_FORMAT_VERSION,
            site: self.site,
            known_sites: self.weave.version().sites().collect(),
            version: self.weave.version().clone(),
            weave: self.weave.atoms().to_vec(),
        }
    }

    /// Merge a snapshot from any replica into this one.
    ///
    /// # Errors
    ///
    /// See [`Self::add_many`].
    pub fn import(
        &mut self,
        stored: StoredCausalTree<R::Op>,
    ) -> Result<AddedAtoms<R::Op>, WeaveError> {
        let max_seen = stored.version.max_timestamp();
        let result = self.add_many(stored.weave);
        self.clock = self.clock.max(max_seen);
        result
    }

    /// Independent copy with the same site, state and clock.
    ///
    /// Subscribers are not carried over.
    #[must_use]
    pub fn fork(&self) -> Self
    where
        R: Clone,
    {
        self.fork_to_site(self.site)
    }

    /// Independent copy that will author atoms as `site`.
    #[must_use]
    pub fn fork_to_site(&self, site: SiteId) -> Self
    where
        R: Clone,
    {
        Self {
            site,
            clock: self.clock,
            weave: self.weave.clone(),
            reducer: self.reducer.clone(),
            state: self.state.clone(),
            metadata: self.metadata.clone(),
            config: self.config.clone(),
            peers: self.peers.clone(),
            acknowledged: self.acknowledged.clone(),
            pending: None,
            settled: 0,
            subscribers: Subscribers::new(),
        }
    }

    /// Reduce the entire weave from default state.
    ///
    /// Must equal the incrementally maintained state and metadata.
    #[must_use]
    pub fn reduce_from_scratch(&self) -> (R::State, R::Metadata) {
        self.reducer.reduce(
            &self.weave,
            self.weave.atoms(),
            Change::Added,
            R::State::default(),
            R::Metadata::default(),
        )
    }

    // -----------------------------------------------------------------------
    // Garbage collection
    // -----------------------------------------------------------------------

    /// Register a peer whose acknowledgement gates collection.
    pub fn add_peer(&mut self, site: SiteId) {
        if site != self.site {
            self.peers.insert(site);
        }
    }

    /// Record that `site` has received everything up to `version`.
    pub fn acknowledge(&mut self, site: SiteId, version: &SiteVersion) {
        if site == self.site {
            return;
        }
        self.peers.insert(site);
        self.acknowledged.entry(site).or_default().merge(version);
    }

    /// Atoms covered by this horizon have reached every known peer.
    ///
    /// Known peers are registered peers plus every other site that authored
    /// an atom. An unacknowledged peer yields an empty horizon.
    #[must_use]
    pub fn gc_horizon(&self) -> SiteVersion {
        let mut horizon = self.weave.version().clone();
        let peers: BTreeSet<SiteId> = self
            .weave
            .version()
            .sites()
            .chain(self.peers.iter().copied())
            .filter(|site| *site != self.site)
            .collect();
        for peer in peers {
            match self.acknowledged.get(&peer) {
                Some(ack) => horizon = horizon.meet(ack),
                None => return SiteVersion::new(),
            }
        }
        horizon
    }

    /// Run the reducer's collection hook for `added` under the configured
    /// policy, reduce the removal, and publish it.
    pub fn collect_garbage(&mut self, added: &[Atom<R::Op>]) -> Vec<Atom<R::Op>> {
        let horizon = match self.config.gc {
            GcPolicy::Disabled => return Vec::new(),
            GcPolicy::Eager => None,
            GcPolicy::Acknowledged => Some(self.gc_horizon()),
        };

        let removed = self
            .reducer
            .collect_garbage(&mut self.weave, added, horizon.as_ref());
        if !removed.is_empty() {
            info!(site = %self.site, removed = removed.len(), "collected superseded atoms");
            self.apply(&removed, Change::Removed);
            self.subscribers.publish(&TreeEvent::AtomsRemoved {
                atoms: removed.clone(),
            });
        }
        removed
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    pub fn subscribe(
        &mut self,
        callback: impl FnMut(&TreeEvent<R::Op>) + 'static,
    ) -> SubscriptionId {
        self.subscribers.subscribe(callback)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn commit(&mut self, atoms: &[Atom<R::Op>], local: bool) {
        self.apply(atoms, Change::Added);
        self.publish_added(atoms, local);
    }

    fn publish_added(&mut self, atoms: &[Atom<R::Op>], local: bool) {
        self.subscribers.publish(&TreeEvent::AtomsAdded {
            atoms: atoms.to_vec(),
            local,
        });
        self.collect_garbage(atoms);
    }

    fn apply(&mut self, atoms: &[Atom<R::Op>], change: Change) {
        let state = std::mem::take(&mut self.state);
        let metadata = std::mem::take(&mut self.metadata);
        let (state, metadata) = self
            .reducer
            .reduce(&self.weave, atoms, change, state, metadata);
        self.state = state;
        self.metadata = metadata;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
