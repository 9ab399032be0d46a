//! One replica's application context.
//!
//! A [`Session`] owns an AUX tree and a precalculation manager. Local file
//! events and remote atoms go in; after each call the bots those atoms belong
//! to are diffed against the raw tags the precalculation layer last saw,
//! precalculation runs on the changes and the resulting [`StateUpdatedEvent`]
//! is published to subscribers.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use tracing::{debug, info};
use weave_aux::{
    AuxCausalTree, AuxError, AuxOp, AuxReducer, AuxState, AuxTree, FileEvent, StateDiff,
    aux_tree, diff_bot, touched_bots,
};
use weave_core::{
    AddedAtoms, Atom, CausalTree, SiteId, SiteVersion, StoredCausalTree, SubscriptionId,
    Subscribers, TreeEvent, WeaveConfig, WeaveError,
};

use crate::formula::FormulaEvaluator;
use crate::precalc::{PrecalculatedState, PrecalculationManager, StateUpdatedEvent};

pub struct Session {
    tree: AuxCausalTree,
    precalc: PrecalculationManager,
    subscribers: Subscribers<StateUpdatedEvent>,
    atom_subscriptions: Vec<SubscriptionId>,
    /// Atoms added to the tree since the last sync.
    unsynced: Rc<RefCell<Vec<Atom<AuxOp>>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("site", &self.tree.site())
            .field("bots", &self.tree.state().len())
            .field("subscribers", &self.subscribers.len())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Empty session. Call [`Self::create_root`] on exactly one site, or
    /// [`Self::import`] a stored tree.
    pub fn new(site: SiteId, config: &WeaveConfig, evaluator: Box<dyn FormulaEvaluator>) -> Self {
        Self::over(
            aux_tree(site, config.tree.clone()),
            PrecalculationManager::new(evaluator, config.precalc.clone()),
        )
    }

    /// Session over a stored tree, with every bot precalculated.
    ///
    /// # Errors
    ///
    /// Propagates snapshot integration errors.
    pub fn from_stored(
        stored: StoredCausalTree<AuxOp>,
        config: &WeaveConfig,
        evaluator: Box<dyn FormulaEvaluator>,
    ) -> Result<Self, WeaveError> {
        let tree = CausalTree::from_stored(stored, AuxReducer, config.tree.clone())?;
        let mut session = Self::over(
            tree,
            PrecalculationManager::new(evaluator, config.precalc.clone()),
        );
        session.sync_all();
        info!(site = %session.tree.site(), bots = session.tree.state().len(), "session restored");
        Ok(session)
    }

    fn over(mut tree: AuxCausalTree, precalc: PrecalculationManager) -> Self {
        let unsynced = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&unsynced);
        tree.subscribe(move |event| {
            if let TreeEvent::AtomsAdded { atoms, .. } = event {
                sink.borrow_mut().extend(atoms.iter().cloned());
            }
        });
        Self {
            tree,
            precalc,
            subscribers: Subscribers::new(),
            atom_subscriptions: Vec::new(),
            unsynced,
        }
    }

    #[must_use]
    pub const fn tree(&self) -> &AuxCausalTree {
        &self.tree
    }

    /// Raw materialized bots.
    #[must_use]
    pub const fn bots(&self) -> &AuxState {
        self.tree.state()
    }

    /// Bots with precalculated values.
    #[must_use]
    pub const fn state(&self) -> &PrecalculatedState {
        self.precalc.state()
    }

    #[must_use]
    pub const fn precalc(&self) -> &PrecalculationManager {
        &self.precalc
    }

    /// # Errors
    ///
    /// Fails if the tree already has a root.
    pub fn create_root(&mut self) -> Result<Atom<AuxOp>, AuxError> {
        self.tree.root()
    }

    /// Apply local file events.
    ///
    /// # Errors
    ///
    /// Stops at the first failing event. Earlier events stay applied and are
    /// still precalculated and published.
    pub fn apply_events(&mut self, events: &[FileEvent]) -> Result<StateUpdatedEvent, AuxError> {
        self.edit(|tree| tree.add_events(events)).map(|(_, event)| event)
    }

    /// Run any local edit against the tree, then precalculate and publish.
    ///
    /// # Errors
    ///
    /// Returns the edit's error; whatever it changed before failing is
    /// still precalculated and published.
    pub fn edit<T>(
        &mut self,
        f: impl FnOnce(&mut AuxCausalTree) -> Result<T, AuxError>,
    ) -> Result<(T, StateUpdatedEvent), AuxError> {
        let result = f(&mut self.tree);
        let event = self.sync();
        result.map(|value| (value, event))
    }

    /// Integrate atoms received from another site.
    ///
    /// # Errors
    ///
    /// See [`CausalTree::add_many`]; atoms integrated before the error are
    /// still precalculated and published.
    pub fn add_atoms(
        &mut self,
        atoms: Vec<Atom<AuxOp>>,
    ) -> Result<(AddedAtoms<AuxOp>, StateUpdatedEvent), WeaveError> {
        let result = self.tree.add_many(atoms);
        let event = self.sync();
        result.map(|added| (added, event))
    }

    /// Merge a stored tree from any site.
    ///
    /// # Errors
    ///
    /// See [`CausalTree::import`].
    pub fn import(
        &mut self,
        stored: StoredCausalTree<AuxOp>,
    ) -> Result<StateUpdatedEvent, WeaveError> {
        let result = self.tree.import(stored);
        let event = self.sync();
        result.map(|_| event)
    }

    #[must_use]
    pub fn export(&self) -> StoredCausalTree<AuxOp> {
        self.tree.export()
    }

    /// Register a replica whose acknowledgement gates garbage collection.
    pub fn add_peer(&mut self, site: SiteId) {
        self.tree.add_peer(site);
    }

    /// Record that `site` has received everything up to `version`, then
    /// collect whatever the new horizon releases. Returns the number of
    /// atoms removed.
    ///
    /// Collection only drops superseded history, so nothing is
    /// precalculated or published.
    pub fn acknowledge(&mut self, site: SiteId, version: &SiteVersion) -> usize {
        self.tree.acknowledge(site, version);
        let atoms = self.tree.weave().atoms().to_vec();
        self.tree.collect_garbage(&atoms).len()
    }

    /// Listen for precalculated state changes.
    pub fn subscribe(
        &mut self,
        callback: impl FnMut(&StateUpdatedEvent) + 'static,
    ) -> SubscriptionId {
        self.subscribers.subscribe(callback)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    /// Listen for atoms entering or leaving the tree, e.g. to forward local
    /// atoms to other sites.
    pub fn subscribe_atoms(
        &mut self,
        callback: impl FnMut(&TreeEvent<AuxOp>) + 'static,
    ) -> SubscriptionId {
        let id = self.tree.subscribe(callback);
        self.atom_subscriptions.push(id);
        id
    }

    /// Drop every subscriber.
    pub fn shutdown(&mut self) {
        for id in self.atom_subscriptions.drain(..) {
            self.tree.unsubscribe(id);
        }
        self.subscribers.clear();
        debug!(site = %self.tree.site(), "session shut down");
    }

    /// Precalculate the bots owning the atoms added since the last sync.
    fn sync(&mut self) -> StateUpdatedEvent {
        let atoms = std::mem::take(&mut *self.unsynced.borrow_mut());
        match touched_bots(self.tree.weave(), &atoms) {
            Some(ids) => self.sync_bots(&ids),
            None => self.sync_all(),
        }
    }

    fn sync_all(&mut self) -> StateUpdatedEvent {
        self.unsynced.borrow_mut().clear();
        let ids: BTreeSet<String> = self
            .precalc
            .state()
            .keys()
            .chain(self.tree.state().keys())
            .cloned()
            .collect();
        self.sync_bots(&ids)
    }

    /// Diff `ids` against the raw tags the precalculation layer holds.
    fn sync_bots(&mut self, ids: &BTreeSet<String>) -> StateUpdatedEvent {
        let mut diff = StateDiff::default();
        for id in ids {
            let before = self.precalc.state().get(id).map(|bot| &bot.tags);
            diff_bot(&mut diff, id, before, self.tree.state().get(id));
        }
        if diff.is_empty() {
            return StateUpdatedEvent::default();
        }
        let event = self.precalc.apply_diff(&diff, self.tree.state());
        if !event.is_empty() {
            self.subscribers.publish(&event);
        }
        event
    }
}
