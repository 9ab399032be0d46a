use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use weave_aux::AuxOp;
use weave_core::Atom;

use crate::agent::AgentId;
use crate::rng::DeterministicRng;

/// Fault injection settings for simulated delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultConfig {
    /// Maximum delivery delay in rounds.
    pub max_delay_rounds: u8,
    /// Percentage of sends dropped.
    pub drop_rate_percent: u8,
    /// Percentage of sends delivered twice.
    pub duplicate_rate_percent: u8,
    /// Percentage chance of shuffling the messages ready in a round.
    pub reorder_rate_percent: u8,
    /// Percentage chance per round to isolate or reconnect a random agent.
    pub partition_rate_percent: u8,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            max_delay_rounds: 2,
            drop_rate_percent: 5,
            duplicate_rate_percent: 3,
            reorder_rate_percent: 5,
            partition_rate_percent: 2,
        }
    }
}

/// A batch of atoms in flight between two agents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: AgentId,
    pub to: AgentId,
    /// Sender-local sequence.
    pub seq: u64,
    pub atoms: Vec<Atom<AuxOp>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Pending {
    deliver_at_round: u64,
    envelope: Envelope,
}

/// Result of a send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOutcome {
    pub dropped: bool,
    pub duplicated: bool,
    pub delay_rounds: u8,
}

impl SendOutcome {
    const DROPPED: Self = Self {
        dropped: true,
        duplicated: false,
        delay_rounds: 0,
    };
}

/// Envelopes delivered in one round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliverOutcome {
    pub delivered: Vec<Envelope>,
    pub reordered: bool,
}

/// Deterministic fault-injecting network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedNetwork {
    pending: Vec<Pending>,
    partitioned: BTreeSet<AgentId>,
    fault: FaultConfig,
}

impl SimulatedNetwork {
    #[must_use]
    pub const fn new(fault: FaultConfig) -> Self {
        Self {
            pending: Vec::new(),
            partitioned: BTreeSet::new(),
            fault,
        }
    }

    #[must_use]
    pub const fn fault_config(&self) -> FaultConfig {
        self.fault
    }

    /// Isolate or reconnect an agent.
    pub fn set_partitioned(&mut self, agent: AgentId, isolated: bool) {
        if isolated {
            self.partitioned.insert(agent);
        } else {
            self.partitioned.remove(&agent);
        }
    }

    #[must_use]
    pub fn is_partitioned(&self, agent: AgentId) -> bool {
        self.partitioned.contains(&agent)
    }

    /// Reconnect every agent.
    pub fn heal(&mut self) {
        self.partitioned.clear();
    }

    #[must_use]
    pub const fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Queue an envelope, subject to partitions, drops, delay and
    /// duplication.
    pub fn send(
        &mut self,
        envelope: Envelope,
        round: u64,
        rng: &mut DeterministicRng,
    ) -> SendOutcome {
        if self.is_partitioned(envelope.from) || self.is_partitioned(envelope.to) {
            return SendOutcome::DROPPED;
        }
        if rng.hit_rate_percent(self.fault.drop_rate_percent) {
            return SendOutcome::DROPPED;
        }

        let bound = u64::from(self.fault.max_delay_rounds) + 1;
        let delay = u8::try_from(rng.next_bounded(bound)).unwrap_or(self.fault.max_delay_rounds);
        let deliver_at_round = round.saturating_add(u64::from(delay));

        let duplicated = rng.hit_rate_percent(self.fault.duplicate_rate_percent);
        if duplicated {
            self.pending.push(Pending {
                deliver_at_round,
                envelope: envelope.clone(),
            });
        }
        self.pending.push(Pending {
            deliver_at_round,
            envelope,
        });

        SendOutcome {
            dropped: false,
            duplicated,
            delay_rounds: delay,
        }
    }

    /// Take every envelope due by `round`. Envelopes to a partitioned agent
    /// are lost.
    pub fn deliver_ready(&mut self, round: u64, rng: &mut DeterministicRng) -> DeliverOutcome {
        let (due, future): (Vec<Pending>, Vec<Pending>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|p| p.deliver_at_round <= round);
        self.pending = future;

        let mut delivered: Vec<Envelope> = due
            .into_iter()
            .map(|p| p.envelope)
            .filter(|e| !self.partitioned.contains(&e.to))
            .collect();

        let reordered = delivered.len() > 1 && rng.hit_rate_percent(self.fault.reorder_rate_percent);
        if reordered {
            rng.shuffle(&mut delivered);
        }
        DeliverOutcome {
            delivered,
            reordered,
        }
    }
}
