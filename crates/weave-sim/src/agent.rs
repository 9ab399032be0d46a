use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use weave_aux::{AuxError, AuxOp, AuxState};
use weave_calc::{ExprEvaluator, PrecalculatedState, Session};
use weave_core::{Atom, AtomId, SiteId, StoredCausalTree, TreeEvent, WeaveConfig};

use crate::rng::DeterministicRng;
use crate::workload::{Edit, EditMix};

/// Index of a simulated agent.
pub type AgentId = usize;

/// Site id an agent authors atoms as.
#[must_use]
pub fn site_of(agent: AgentId) -> SiteId {
    SiteId(u32::try_from(agent + 1).unwrap_or(u32::MAX))
}

/// Snapshot of an agent taken at the end of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub id: AgentId,
    pub bots: AuxState,
    pub precalculated: PrecalculatedState,
    pub checksum: String,
    pub atom_count: usize,
    pub buffered: usize,
}

/// Outcome of handing atoms to an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Receipt {
    pub added: usize,
    pub known: usize,
    /// Atoms still waiting for their cause.
    pub buffered: usize,
}

type Outbox = Rc<RefCell<Vec<Atom<AuxOp>>>>;

/// One replica: a session plus a buffer for atoms that arrived before
/// their cause.
pub struct SimulatedAgent {
    id: AgentId,
    session: Session,
    outbox: Outbox,
    buffer: Vec<Atom<AuxOp>>,
}

impl std::fmt::Debug for SimulatedAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedAgent")
            .field("id", &self.id)
            .field("session", &self.session)
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

impl SimulatedAgent {
    /// Agent starting from `base`, authoring as [`site_of`]`(id)`.
    ///
    /// # Errors
    ///
    /// Fails if `base` cannot be imported.
    pub fn new(id: AgentId, base: StoredCausalTree<AuxOp>, config: &WeaveConfig) -> Result<Self> {
        let mut session = Session::new(site_of(id), config, Box::new(ExprEvaluator));
        session
            .import(base)
            .with_context(|| format!("agent {id} failed to import the base document"))?;

        let outbox: Outbox = Rc::default();
        let sink = Rc::clone(&outbox);
        session.subscribe_atoms(move |event| {
            if let TreeEvent::AtomsAdded { atoms, local: true } = event {
                sink.borrow_mut().extend(atoms.iter().cloned());
            }
        });

        Ok(Self {
            id,
            session,
            outbox,
            buffer: Vec::new(),
        })
    }

    #[must_use]
    pub const fn id(&self) -> AgentId {
        self.id
    }

    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Register every other agent as a garbage-collection peer.
    pub fn add_peers(&mut self, agents: usize) {
        for other in (0..agents).filter(|a| *a != self.id) {
            self.session.add_peer(site_of(other));
        }
    }

    /// Perform one random edit. Returns the atoms it created; rejected
    /// edits create none.
    ///
    /// # Errors
    ///
    /// Weave-level failures, which indicate a bug rather than a bad edit.
    pub fn perform(&mut self, rng: &mut DeterministicRng, mix: EditMix) -> Result<Vec<Atom<AuxOp>>> {
        let edit = Edit::generate(rng, mix, self.session.tree());
        match self.session.edit(|tree| edit.apply(tree)) {
            Ok(_) => {}
            Err(AuxError::Weave(err)) => {
                return Err(err).with_context(|| format!("agent {} failed {edit:?}", self.id));
            }
            Err(rejected) => {
                trace!(agent = self.id, %rejected, "edit rejected");
            }
        }
        Ok(std::mem::take(&mut *self.outbox.borrow_mut()))
    }

    /// Integrate remote atoms, holding back any whose cause is unknown.
    ///
    /// # Errors
    ///
    /// Fails on checksum or root conflicts.
    pub fn receive(&mut self, atoms: Vec<Atom<AuxOp>>) -> Result<Receipt> {
        self.buffer.extend(atoms);
        let ready = self.take_ready();
        let mut receipt = Receipt::default();
        if !ready.is_empty() {
            let (added, _) = self
                .session
                .add_atoms(ready)
                .with_context(|| format!("agent {} failed to integrate atoms", self.id))?;
            receipt.added = added.added.len();
            receipt.known = added.known.len();
        }
        receipt.buffered = self.buffer.len();
        if receipt.buffered > 0 {
            debug!(agent = self.id, buffered = receipt.buffered, "holding atoms for missing causes");
        }
        Ok(receipt)
    }

    /// Every atom this agent holds, for anti-entropy.
    #[must_use]
    pub fn all_atoms(&self) -> Vec<Atom<AuxOp>> {
        self.session.tree().weave().atoms().to_vec()
    }

    /// Record another agent's acknowledgement. Returns atoms collected.
    pub fn acknowledge(&mut self, from: &Self) -> usize {
        let version = from.session.tree().version().clone();
        self.session.acknowledge(site_of(from.id), &version)
    }

    #[must_use]
    pub fn snapshot(&self) -> AgentState {
        let tree = self.session.tree();
        AgentState {
            id: self.id,
            bots: tree.state().clone(),
            precalculated: self.session.state().clone(),
            checksum: tree.weave().checksum(),
            atom_count: tree.weave().len(),
            buffered: self.buffer.len(),
        }
    }

    /// Buffered atoms whose cause is present, collected, or itself ready.
    fn take_ready(&mut self) -> Vec<Atom<AuxOp>> {
        let weave = self.session.tree().weave();
        let mut have: BTreeSet<AtomId> = BTreeSet::new();
        let mut ready = Vec::new();
        let mut waiting = std::mem::take(&mut self.buffer);
        loop {
            let before = ready.len();
            let mut still = Vec::new();
            for atom in waiting {
                let cause_known = atom.cause.is_none_or(|c| {
                    weave.contains(&c) || weave.is_collected(&c) || have.contains(&c)
                });
                if cause_known {
                    have.insert(atom.id);
                    ready.push(atom);
                } else {
                    still.push(atom);
                }
            }
            waiting = still;
            if ready.len() == before {
                break;
            }
        }
        self.buffer = waiting;
        ready
    }
}

#[cfg(test)]
mod tests {
    use weave_aux::{AuxTree, aux_tree};
    use weave_core::TreeConfig;

    use super::*;
    use crate::workload::seed_document;

    fn base() -> StoredCausalTree<AuxOp> {
        let mut tree = aux_tree(SiteId(0), TreeConfig::default());
        tree.root().unwrap();
        for bot in seed_document() {
            tree.add_file(&bot).unwrap();
        }
        tree.export()
    }

    fn agent(id: AgentId) -> SimulatedAgent {
        SimulatedAgent::new(id, base(), &WeaveConfig::default()).unwrap()
    }

    fn edits(agent: &mut SimulatedAgent, seed: u64) -> Vec<Atom<AuxOp>> {
        let mut rng = DeterministicRng::new(seed);
        let mut atoms = Vec::new();
        for _ in 0..20 {
            atoms.extend(agent.perform(&mut rng, EditMix::default()).unwrap());
        }
        atoms
    }

    #[test]
    fn agents_start_from_the_base() {
        let a = agent(0);
        let b = agent(1);
        assert_eq!(a.snapshot().bots, b.snapshot().bots);
        assert_eq!(a.session().tree().site(), SiteId(1));
        assert_eq!(b.session().tree().site(), SiteId(2));
    }

    #[test]
    fn reversed_delivery_is_buffered_then_applied() {
        let mut a = agent(0);
        let mut b = agent(1);
        let mut atoms = edits(&mut a, 5);
        assert!(!atoms.is_empty());
        atoms.reverse();

        for atom in atoms {
            b.receive(vec![atom]).unwrap();
        }
        assert_eq!(b.buffered(), 0);
        assert_eq!(a.snapshot().bots, b.snapshot().bots);
        assert_eq!(a.snapshot().precalculated, b.snapshot().precalculated);
    }

    #[test]
    fn redelivery_is_known() {
        let mut a = agent(0);
        let mut b = agent(1);
        let atoms = edits(&mut a, 9);
        let first = b.receive(atoms.clone()).unwrap();
        let second = b.receive(atoms).unwrap();
        assert_eq!(second.added, 0);
        assert_eq!(second.known, first.added + first.known);
    }
}
