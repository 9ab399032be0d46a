//! Invariant checks run after a simulation has drained.
//!
//! 1. **Convergence**: every agent has the same bots and precalculated
//!    values.
//! 2. **Reference**: agents match a replica that received every atom
//!    directly and never collected garbage (merge correctness and GC
//!    invisibility).
//! 3. **Weave agreement**: identical weave checksums when collection is
//!    deterministic.
//! 4. **Idempotence**: redelivering an agent's own atoms changes nothing.
//! 5. **Commutativity**: any causal delivery order of the reference atoms
//!    yields the reference state.
//! 6. **Round trip**: export → JSON → import reproduces state and weave.
//! 7. **Precalculation**: incremental values equal a full recalculation.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use weave_aux::{AuxCausalTree, AuxOp, AuxReducer, AuxState, aux_tree};
use weave_calc::{ExprEvaluator, PrecalculatedState, Session};
use weave_core::{
    Atom, CausalTree, ErrorCode, GcPolicy, SiteId, StoredCausalTree, TreeConfig, WeaveConfig,
};

use crate::agent::{AgentId, AgentState, SimulatedAgent};
use crate::rng::DeterministicRng;

/// Outcome of one or more checks.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OracleResult {
    pub violations: Vec<InvariantViolation>,
}

impl OracleResult {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    fn merge(mut self, other: Self) -> Self {
        self.violations.extend(other.violations);
        self
    }
}

impl From<Vec<InvariantViolation>> for OracleResult {
    fn from(violations: Vec<InvariantViolation>) -> Self {
        Self { violations }
    }
}

/// A failed invariant with enough detail to start debugging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "invariant", rename_all = "snake_case")]
pub enum InvariantViolation {
    /// Two agents disagree after full delivery.
    Convergence {
        agent_a: AgentId,
        agent_b: AgentId,
        differing_bots: Vec<String>,
    },
    /// An agent disagrees with the never-collected reference replica.
    Reference {
        agent: AgentId,
        differing_bots: Vec<String>,
    },
    /// Two agents hold different weaves.
    WeaveDivergence {
        agent_a: AgentId,
        agent_b: AgentId,
        checksum_a: String,
        checksum_b: String,
    },
    /// Redelivering atoms an agent already has changed it.
    Idempotence { agent: AgentId, reinserted: usize },
    /// A shuffled delivery order produced a different state.
    Commutativity {
        permutation: usize,
        differing_bots: Vec<String>,
    },
    /// A snapshot did not survive export and import.
    RoundTrip { agent: AgentId, reason: String },
    /// Incrementally maintained values differ from a full recalculation.
    Precalculation {
        agent: AgentId,
        differing_bots: Vec<String>,
    },
    /// Atoms stayed buffered after the drain.
    Stuck { agent: AgentId, buffered: usize },
}

impl InvariantViolation {
    /// Stuck buffers mean a cause never arrived; everything else is a
    /// divergence between replicas.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Stuck { .. } => ErrorCode::OrphanAtom,
            _ => ErrorCode::Divergence,
        }
    }
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Convergence {
                agent_a,
                agent_b,
                differing_bots,
            } => write!(
                f,
                "convergence: agents {agent_a} and {agent_b} differ on {differing_bots:?}"
            ),
            Self::Reference {
                agent,
                differing_bots,
            } => write!(f, "reference: agent {agent} differs on {differing_bots:?}"),
            Self::WeaveDivergence {
                agent_a,
                agent_b,
                checksum_a,
                checksum_b,
            } => write!(
                f,
                "weave: agents {agent_a} and {agent_b} hold {checksum_a} vs {checksum_b}"
            ),
            Self::Idempotence { agent, reinserted } => write!(
                f,
                "idempotence: agent {agent} reinserted {reinserted} known atoms"
            ),
            Self::Commutativity {
                permutation,
                differing_bots,
            } => write!(
                f,
                "commutativity: permutation {permutation} differs on {differing_bots:?}"
            ),
            Self::RoundTrip { agent, reason } => {
                write!(f, "round trip: agent {agent}: {reason}")
            }
            Self::Precalculation {
                agent,
                differing_bots,
            } => write!(
                f,
                "precalculation: agent {agent} differs from recalculation on {differing_bots:?}"
            ),
            Self::Stuck { agent, buffered } => {
                write!(f, "stuck: agent {agent} still buffers {buffered} atoms")
            }
        }
    }
}

pub struct ConvergenceOracle;

impl ConvergenceOracle {
    /// Pairwise comparison of final agent states.
    #[must_use]
    pub fn check_convergence(states: &[AgentState]) -> OracleResult {
        let mut violations = Vec::new();
        for (i, a) in states.iter().enumerate() {
            for b in &states[i + 1..] {
                let mut differing = differing_bots(&a.bots, &b.bots);
                differing.extend(differing_values(&a.precalculated, &b.precalculated));
                if !differing.is_empty() {
                    violations.push(InvariantViolation::Convergence {
                        agent_a: a.id,
                        agent_b: b.id,
                        differing_bots: differing.into_iter().collect(),
                    });
                }
            }
        }
        violations.into()
    }

    /// Every agent against the reference replica's state.
    #[must_use]
    pub fn check_reference(states: &[AgentState], reference: &AuxState) -> OracleResult {
        states
            .iter()
            .filter_map(|state| {
                let differing = differing_bots(&state.bots, reference);
                (!differing.is_empty()).then(|| InvariantViolation::Reference {
                    agent: state.id,
                    differing_bots: differing.into_iter().collect(),
                })
            })
            .collect::<Vec<_>>()
            .into()
    }

    /// Pairwise weave checksums.
    #[must_use]
    pub fn check_weaves(states: &[AgentState]) -> OracleResult {
        let mut violations = Vec::new();
        for (i, a) in states.iter().enumerate() {
            for b in &states[i + 1..] {
                if a.checksum != b.checksum {
                    violations.push(InvariantViolation::WeaveDivergence {
                        agent_a: a.id,
                        agent_b: b.id,
                        checksum_a: a.checksum.clone(),
                        checksum_b: b.checksum.clone(),
                    });
                }
            }
        }
        violations.into()
    }

    /// Redeliver an agent's atoms to a copy of itself.
    #[must_use]
    pub fn check_idempotence(agent: &SimulatedAgent) -> OracleResult {
        let tree = agent.session().tree();
        let mut copy = tree.fork();
        let before = copy.weave().checksum();
        let reinserted = copy
            .add_many(agent.all_atoms())
            .map_or(usize::MAX, |added| added.added.len());
        if reinserted == 0 && copy.weave().checksum() == before && copy.state() == tree.state() {
            return OracleResult::default();
        }
        vec![InvariantViolation::Idempotence {
            agent: agent.id(),
            reinserted,
        }]
        .into()
    }

    /// Deliver `atoms` to fresh replicas in `iterations` random causal
    /// orders and compare with `expected`.
    #[must_use]
    pub fn check_commutativity(
        atoms: &[Atom<AuxOp>],
        expected: &AuxState,
        rng: &mut DeterministicRng,
        iterations: usize,
    ) -> OracleResult {
        let mut violations = Vec::new();
        for permutation in 0..iterations {
            let mut tree = aux_tree(SiteId(u32::MAX), no_gc());
            let state = match deliver_shuffled(&mut tree, atoms, rng) {
                Ok(()) => tree.state().clone(),
                Err(_) => AuxState::new(),
            };
            let differing = differing_bots(&state, expected);
            if !differing.is_empty() {
                violations.push(InvariantViolation::Commutativity {
                    permutation,
                    differing_bots: differing.into_iter().collect(),
                });
            }
        }
        violations.into()
    }

    /// Export, serialize, parse and re-import an agent.
    #[must_use]
    pub fn check_round_trip(agent: &SimulatedAgent) -> OracleResult {
        let tree = agent.session().tree();
        let result = tree
            .export()
            .to_json()
            .and_then(|json| StoredCausalTree::<AuxOp>::from_json(&json))
            .and_then(|stored| CausalTree::from_stored(stored, AuxReducer, no_gc()));
        let reason = match result {
            Err(err) => Some(err.to_string()),
            Ok(copy) if copy.weave().checksum() != tree.weave().checksum() => {
                Some("weave checksum changed".to_string())
            }
            Ok(copy) if copy.state() != tree.state() => Some("state changed".to_string()),
            Ok(_) => None,
        };
        reason
            .map(|reason| InvariantViolation::RoundTrip {
                agent: agent.id(),
                reason,
            })
            .into_iter()
            .collect::<Vec<_>>()
            .into()
    }

    /// Compare incremental precalculation with a session rebuilt from the
    /// agent's snapshot.
    #[must_use]
    pub fn check_precalculation(agent: &SimulatedAgent) -> OracleResult {
        let config = WeaveConfig {
            tree: no_gc(),
            ..WeaveConfig::default()
        };
        let rebuilt = Session::from_stored(agent.session().export(), &config, Box::new(ExprEvaluator))
            .map(|session| session.state().clone())
            .unwrap_or_default();
        let differing = differing_values(agent.session().state(), &rebuilt);
        if differing.is_empty() {
            return OracleResult::default();
        }
        vec![InvariantViolation::Precalculation {
            agent: agent.id(),
            differing_bots: differing.into_iter().collect(),
        }]
        .into()
    }

    #[must_use]
    pub fn check_buffers(states: &[AgentState]) -> OracleResult {
        states
            .iter()
            .filter(|s| s.buffered > 0)
            .map(|s| InvariantViolation::Stuck {
                agent: s.id,
                buffered: s.buffered,
            })
            .collect::<Vec<_>>()
            .into()
    }

    /// Every check. Buffers and weave checksums are skipped under eager
    /// collection.
    #[must_use]
    pub fn check_all(
        agents: &[SimulatedAgent],
        reference: &AuxCausalTree,
        gc: GcPolicy,
        rng: &mut DeterministicRng,
    ) -> OracleResult {
        let states: Vec<AgentState> = agents.iter().map(SimulatedAgent::snapshot).collect();

        let mut result = Self::check_convergence(&states)
            .merge(Self::check_reference(&states, reference.state()));
        // Eager collection may remove a buffered atom's cause everywhere,
        // and collects at different times on each agent.
        if gc != GcPolicy::Eager {
            result = result
                .merge(Self::check_buffers(&states))
                .merge(Self::check_weaves(&states));
        }
        for agent in agents {
            result = result
                .merge(Self::check_idempotence(agent))
                .merge(Self::check_round_trip(agent))
                .merge(Self::check_precalculation(agent));
        }
        result.merge(Self::check_commutativity(
            reference.weave().atoms(),
            reference.state(),
            rng,
            4,
        ))
    }
}

fn no_gc() -> TreeConfig {
    TreeConfig {
        gc: GcPolicy::Disabled,
        ..TreeConfig::default()
    }
}

/// Deliver atoms one at a time, each drawn at random from those whose
/// cause is already present.
fn deliver_shuffled(
    tree: &mut AuxCausalTree,
    atoms: &[Atom<AuxOp>],
    rng: &mut DeterministicRng,
) -> Result<(), weave_core::WeaveError> {
    let mut queue = atoms.to_vec();
    while !queue.is_empty() {
        let ready: Vec<usize> = (0..queue.len())
            .filter(|&i| queue[i].cause.is_none_or(|c| tree.weave().contains(&c)))
            .collect();
        let Some(&pick) = rng.pick(&ready) else {
            return Err(weave_core::WeaveError::MissingRoot);
        };
        let atom = queue.swap_remove(pick);
        tree.add_many(vec![atom])?;
    }
    Ok(())
}

fn differing_bots(a: &AuxState, b: &AuxState) -> BTreeSet<String> {
    a.keys()
        .chain(b.keys())
        .filter(|id| a.get(*id) != b.get(*id))
        .cloned()
        .collect()
}

fn differing_values(a: &PrecalculatedState, b: &PrecalculatedState) -> BTreeSet<String> {
    a.keys()
        .chain(b.keys())
        .filter(|id| a.get(*id) != b.get(*id))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use weave_aux::{AuxTree, Bot};

    use super::*;

    fn state(id: AgentId, bots: &[Bot]) -> AgentState {
        AgentState {
            id,
            bots: bots.iter().map(|b| (b.id.clone(), b.clone())).collect(),
            precalculated: PrecalculatedState::new(),
            checksum: "blake3:00".into(),
            atom_count: 0,
            buffered: 0,
        }
    }

    #[test]
    fn identical_states_pass() {
        let bots = [Bot::new("a").with_tag("x", 1)];
        let states = [state(0, &bots), state(1, &bots)];
        assert!(ConvergenceOracle::check_convergence(&states).passed());
        assert!(ConvergenceOracle::check_weaves(&states).passed());
        assert!(ConvergenceOracle::check_buffers(&states).passed());
    }

    #[test]
    fn divergence_names_the_bots() {
        let states = [
            state(0, &[Bot::new("a").with_tag("x", 1), Bot::new("b")]),
            state(1, &[Bot::new("a").with_tag("x", 2), Bot::new("b")]),
            state(2, &[Bot::new("a").with_tag("x", 1)]),
        ];
        let result = ConvergenceOracle::check_convergence(&states);
        assert_eq!(result.violations.len(), 3);
        assert_eq!(
            result.violations[0],
            InvariantViolation::Convergence {
                agent_a: 0,
                agent_b: 1,
                differing_bots: vec!["a".into()],
            }
        );
        assert!(result.violations[0].to_string().contains("agents 0 and 1"));
        assert_eq!(result.violations[0].code(), ErrorCode::Divergence);
        assert_eq!(
            InvariantViolation::Stuck {
                agent: 0,
                buffered: 1
            }
            .code(),
            ErrorCode::OrphanAtom
        );
    }

    #[test]
    fn shuffled_delivery_matches_in_order_delivery() {
        let mut tree = aux_tree(SiteId(1), no_gc());
        tree.root().unwrap();
        tree.add_file(&Bot::new("a").with_tag("label", "hello")).unwrap();
        tree.insert_into_tag_value("a", "label", 5, "!").unwrap();
        tree.update_file("a", &[("n".to_string(), json!(3))].into_iter().collect())
            .unwrap();

        let mut rng = DeterministicRng::new(4);
        let result = ConvergenceOracle::check_commutativity(
            tree.weave().atoms(),
            tree.state(),
            &mut rng,
            8,
        );
        assert!(result.passed(), "{:?}", result.violations);
    }

    #[test]
    fn violations_serialize_with_their_invariant() {
        let v = InvariantViolation::Stuck {
            agent: 2,
            buffered: 4,
        };
        let encoded = serde_json::to_value(&v).unwrap();
        assert_eq!(encoded["invariant"], "stuck");
    }
}
