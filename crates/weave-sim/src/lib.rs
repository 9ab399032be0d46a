//! weave-sim: deterministic multi-site simulation of weave replicas.
//!
//! A [`Simulator`] runs a fixed number of rounds in which agents edit their
//! replica and broadcast the new atoms through a fault-injecting
//! [`network::SimulatedNetwork`]. Afterwards the network is drained, agents
//! run full anti-entropy, acknowledge each other so garbage collection can
//! run, and the [`oracle::ConvergenceOracle`] checks the result. Every
//! decision comes from a [`rng::DeterministicRng`], so a seed replays
//! exactly.
//!
//! # Conventions
//!
//! - **Errors**: `anyhow::Result` for return types.
//! - **Logging**: `tracing` macros; the binary installs the subscriber.

pub mod agent;
pub mod campaign;
pub mod network;
pub mod oracle;
pub mod rng;
pub mod workload;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use weave_aux::{AuxCausalTree, AuxOp, AuxTree, aux_tree};
use weave_core::{Atom, GcPolicy, TreeConfig, WeaveConfig};

use crate::agent::{AgentId, AgentState, SimulatedAgent, site_of};
use crate::network::{Envelope, FaultConfig, SimulatedNetwork};
use crate::oracle::{ConvergenceOracle, OracleResult};
use crate::rng::DeterministicRng;
use crate::workload::{EditMix, seed_document};

/// Parameters of one simulated run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub seed: u64,
    pub agent_count: usize,
    pub rounds: u64,
    /// Peers each new batch is sent to; `0` or `>= agent_count - 1`
    /// broadcasts.
    pub fanout: usize,
    /// Chance per round that an agent edits.
    pub edit_rate_percent: u8,
    pub mix: EditMix,
    pub fault: FaultConfig,
    pub gc: GcPolicy,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            agent_count: 3,
            rounds: 16,
            fanout: 0,
            edit_rate_percent: 60,
            mix: EditMix::default(),
            fault: FaultConfig::default(),
            gc: GcPolicy::Acknowledged,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceEventKind {
    Edit {
        agent: AgentId,
        atoms: usize,
    },
    Send {
        from: AgentId,
        to: AgentId,
        seq: u64,
        atoms: usize,
        dropped: bool,
        duplicated: bool,
        delay_rounds: u8,
    },
    Deliver {
        from: AgentId,
        to: AgentId,
        seq: u64,
        added: usize,
        buffered: usize,
    },
    Partition {
        agent: AgentId,
        isolated: bool,
    },
    AntiEntropy {
        from: AgentId,
        to: AgentId,
        added: usize,
    },
    Collect {
        agent: AgentId,
        removed: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub round: u64,
    pub kind: TraceEventKind,
}

/// Everything a run produced.
#[derive(Debug, Clone)]
pub struct SimulationResult {
    pub trace: Vec<TraceEvent>,
    pub states: Vec<AgentState>,
    pub oracle: OracleResult,
    /// Some fault (drop, duplicate, reorder, partition, buffering or
    /// collection) actually happened.
    pub interesting_state_reached: bool,
}

pub struct Simulator {
    config: SimulationConfig,
    rng: DeterministicRng,
    network: SimulatedNetwork,
    agents: Vec<SimulatedAgent>,
    reference: AuxCausalTree,
    trace: Vec<TraceEvent>,
    next_seq: Vec<u64>,
    interesting: bool,
}

impl std::fmt::Debug for Simulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulator")
            .field("config", &self.config)
            .field("agents", &self.agents.len())
            .field("trace", &self.trace.len())
            .finish_non_exhaustive()
    }
}

impl Simulator {
    /// Build agents from a shared seed document.
    ///
    /// # Errors
    ///
    /// Invalid configuration or a failure building the seed document.
    pub fn new(config: SimulationConfig) -> Result<Self> {
        if config.agent_count == 0 {
            bail!("agent_count must be > 0");
        }

        let tree_config = TreeConfig {
            gc: config.gc,
            ..TreeConfig::default()
        };
        let mut origin = aux_tree(site_of(0), tree_config.clone());
        origin.root().context("creating root")?;
        for bot in seed_document() {
            origin
                .add_file(&bot)
                .with_context(|| format!("seeding bot {}", bot.id))?;
        }
        let base = origin.export();

        let weave_config = WeaveConfig {
            tree: tree_config,
            ..WeaveConfig::default()
        };
        let mut agents = Vec::with_capacity(config.agent_count);
        for id in 0..config.agent_count {
            let mut agent = SimulatedAgent::new(id, base.clone(), &weave_config)?;
            agent.add_peers(config.agent_count);
            agents.push(agent);
        }

        let mut reference = aux_tree(
            site_of(config.agent_count),
            TreeConfig {
                gc: GcPolicy::Disabled,
                ..TreeConfig::default()
            },
        );
        reference.import(base).context("building reference replica")?;

        Ok(Self {
            rng: DeterministicRng::new(config.seed),
            network: SimulatedNetwork::new(config.fault),
            next_seq: vec![0; config.agent_count],
            agents,
            reference,
            trace: Vec::new(),
            interesting: false,
            config,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &SimulationConfig {
        &self.config
    }

    #[must_use]
    pub fn agents(&self) -> &[SimulatedAgent] {
        &self.agents
    }

    /// Run every round, drain, collect and check.
    ///
    /// # Errors
    ///
    /// Weave-level failures inside an agent.
    pub fn run(&mut self) -> Result<SimulationResult> {
        info!(
            seed = self.config.seed,
            agents = self.config.agent_count,
            rounds = self.config.rounds,
            "simulation started"
        );
        for round in 0..self.config.rounds {
            self.toggle_partitions(round);
            self.edit_round(round)?;
            self.deliver_round(round)?;
        }
        self.drain()?;
        self.anti_entropy()?;
        self.collect();

        let mut oracle_rng = DeterministicRng::new(self.config.seed.wrapping_add(0xDEAD));
        let oracle = ConvergenceOracle::check_all(
            &self.agents,
            &self.reference,
            self.config.gc,
            &mut oracle_rng,
        );
        let states: Vec<AgentState> = self.agents.iter().map(SimulatedAgent::snapshot).collect();
        info!(
            seed = self.config.seed,
            trace = self.trace.len(),
            violations = oracle.violations.len(),
            "simulation finished"
        );

        Ok(SimulationResult {
            trace: std::mem::take(&mut self.trace),
            states,
            oracle,
            interesting_state_reached: self.interesting,
        })
    }

    fn record(&mut self, round: u64, kind: TraceEventKind) {
        self.trace.push(TraceEvent { round, kind });
    }

    fn toggle_partitions(&mut self, round: u64) {
        if !self.rng.hit_rate_percent(self.config.fault.partition_rate_percent) {
            return;
        }
        let agent = self.rng.index(self.agents.len());
        let isolated = !self.network.is_partitioned(agent);
        self.network.set_partitioned(agent, isolated);
        self.interesting = true;
        self.record(round, TraceEventKind::Partition { agent, isolated });
    }

    fn edit_round(&mut self, round: u64) -> Result<()> {
        for id in 0..self.agents.len() {
            if !self.rng.hit_rate_percent(self.config.edit_rate_percent) {
                continue;
            }
            let atoms = self.agents[id].perform(&mut self.rng, self.config.mix)?;
            if atoms.is_empty() {
                continue;
            }
            self.reference
                .add_many(atoms.clone())
                .context("reference replica rejected atoms")?;
            self.record(
                round,
                TraceEventKind::Edit {
                    agent: id,
                    atoms: atoms.len(),
                },
            );
            self.broadcast(id, atoms, round);
        }
        Ok(())
    }

    fn broadcast(&mut self, from: AgentId, atoms: Vec<Atom<AuxOp>>, round: u64) {
        let mut peers: Vec<AgentId> = (0..self.agents.len()).filter(|p| *p != from).collect();
        let fanout = self.config.fanout;
        if fanout > 0 && fanout < peers.len() {
            self.rng.shuffle(&mut peers);
            peers.truncate(fanout);
            peers.sort_unstable();
        }

        let seq = self.next_seq[from];
        self.next_seq[from] += 1;
        for to in peers {
            let envelope = Envelope {
                from,
                to,
                seq,
                atoms: atoms.clone(),
            };
            let outcome = self.network.send(envelope, round, &mut self.rng);
            if outcome.dropped || outcome.duplicated {
                self.interesting = true;
            }
            self.record(
                round,
                TraceEventKind::Send {
                    from,
                    to,
                    seq,
                    atoms: atoms.len(),
                    dropped: outcome.dropped,
                    duplicated: outcome.duplicated,
                    delay_rounds: outcome.delay_rounds,
                },
            );
        }
    }

    fn deliver_round(&mut self, round: u64) -> Result<()> {
        let outcome = self.network.deliver_ready(round, &mut self.rng);
        if outcome.reordered {
            self.interesting = true;
        }
        for envelope in outcome.delivered {
            let receipt = self.agents[envelope.to].receive(envelope.atoms)?;
            if receipt.buffered > 0 || receipt.known > 0 {
                self.interesting = true;
            }
            self.record(
                round,
                TraceEventKind::Deliver {
                    from: envelope.from,
                    to: envelope.to,
                    seq: envelope.seq,
                    added: receipt.added,
                    buffered: receipt.buffered,
                },
            );
        }
        Ok(())
    }

    /// Heal partitions and deliver everything still in flight.
    fn drain(&mut self) -> Result<()> {
        self.network.heal();
        let mut round = self.config.rounds;
        while self.network.pending_len() > 0 {
            self.deliver_round(round)?;
            round += 1;
        }
        debug!(seed = self.config.seed, round, "network drained");
        Ok(())
    }

    /// Every agent sends its full weave to every other agent.
    fn anti_entropy(&mut self) -> Result<()> {
        let round = self.config.rounds;
        for from in 0..self.agents.len() {
            let atoms = self.agents[from].all_atoms();
            for to in (0..self.agents.len()).filter(|to| *to != from) {
                let receipt = self.agents[to].receive(atoms.clone())?;
                self.record(
                    round,
                    TraceEventKind::AntiEntropy {
                        from,
                        to,
                        added: receipt.added,
                    },
                );
            }
        }
        Ok(())
    }

    /// Every agent acknowledges every other, releasing collection.
    fn collect(&mut self) {
        let round = self.config.rounds;
        for to in 0..self.agents.len() {
            let mut removed = 0;
            for from in (0..self.agents.len()).filter(|from| *from != to) {
                let (left, right) = self.agents.split_at_mut(to.max(from));
                let (receiver, sender) = if to < from {
                    (&mut left[to], &right[0])
                } else {
                    (&mut right[0], &left[from])
                };
                removed += receiver.acknowledge(sender);
            }
            if removed > 0 {
                self.interesting = true;
                self.record(round, TraceEventKind::Collect { agent: to, removed });
            }
        }
    }
}
