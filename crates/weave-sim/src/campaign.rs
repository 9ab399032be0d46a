//! Seed campaigns: run many seeds with the same parameters, report which
//! failed, and replay one seed with its full trace.

use std::ops::Range;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use weave_core::{ErrorCode, GcPolicy};

use crate::network::FaultConfig;
use crate::oracle::InvariantViolation;
use crate::workload::EditMix;
use crate::{SimulationConfig, SimulationResult, Simulator};

/// Campaign parameters, loadable from TOML.
///
/// ```toml
/// first_seed = 0
/// seeds = 200
/// agent_count = 4
/// gc = "acknowledged"
///
/// [fault]
/// drop_rate_percent = 10
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CampaignConfig {
    pub first_seed: u64,
    /// Number of seeds to run.
    pub seeds: u64,
    pub agent_count: usize,
    pub rounds: u64,
    pub fanout: usize,
    pub edit_rate_percent: u8,
    pub mix: EditMix,
    pub fault: FaultConfig,
    pub gc: GcPolicy,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        let sim = SimulationConfig::default();
        Self {
            first_seed: 0,
            seeds: 100,
            agent_count: sim.agent_count,
            rounds: sim.rounds,
            fanout: sim.fanout,
            edit_rate_percent: sim.edit_rate_percent,
            mix: sim.mix,
            fault: sim.fault,
            gc: sim.gc,
        }
    }
}

impl CampaignConfig {
    /// Load from a TOML file; a missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Unreadable or malformed files.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading campaign config {}", path.display()))?;
        toml::from_str(&text).with_context(|| {
            format!(
                "{}: parsing campaign config {}",
                ErrorCode::ConfigParseError,
                path.display()
            )
        })
    }

    #[must_use]
    pub const fn seed_range(&self) -> Range<u64> {
        self.first_seed..self.first_seed.saturating_add(self.seeds)
    }

    #[must_use]
    pub const fn sim_config_for_seed(&self, seed: u64) -> SimulationConfig {
        SimulationConfig {
            seed,
            agent_count: self.agent_count,
            rounds: self.rounds,
            fanout: self.fanout,
            edit_rate_percent: self.edit_rate_percent,
            mix: self.mix,
            fault: self.fault,
            gc: self.gc,
        }
    }

    /// # Errors
    ///
    /// Returns an error if any parameter is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.seeds == 0 {
            bail!("seeds must be > 0");
        }
        if self.agent_count == 0 {
            bail!("agent_count must be > 0");
        }
        if self.rounds == 0 {
            bail!("rounds must be > 0");
        }
        let percents = [
            self.edit_rate_percent,
            self.fault.drop_rate_percent,
            self.fault.duplicate_rate_percent,
            self.fault.reorder_rate_percent,
            self.fault.partition_rate_percent,
        ];
        if percents.iter().any(|p| *p > 100) {
            bail!("rates are percentages and must be <= 100");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedFailure {
    pub seed: u64,
    pub violations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignReport {
    pub seeds_run: usize,
    pub seeds_passed: usize,
    /// First failing seed, for replay.
    pub first_failure: Option<u64>,
    pub failures: Vec<SeedFailure>,
    /// Seeds in which some fault actually fired.
    pub interesting_states_reached: usize,
}

impl CampaignReport {
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Outcome of one seed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedOutcome {
    pub violations: Vec<InvariantViolation>,
    pub interesting: bool,
}

/// Run every seed in the campaign.
///
/// # Errors
///
/// Invalid configuration or a simulation failing internally (as opposed to
/// an invariant violation, which is reported).
pub fn run_campaign(config: &CampaignConfig) -> Result<CampaignReport> {
    config.validate()?;

    let mut report = CampaignReport {
        seeds_run: 0,
        seeds_passed: 0,
        first_failure: None,
        failures: Vec::new(),
        interesting_states_reached: 0,
    };

    for seed in config.seed_range() {
        report.seeds_run += 1;
        let outcome = run_single_seed(seed, config)?;
        if outcome.interesting {
            report.interesting_states_reached += 1;
        }
        if outcome.violations.is_empty() {
            report.seeds_passed += 1;
            continue;
        }
        warn!(seed, violations = outcome.violations.len(), "seed failed");
        report.first_failure.get_or_insert(seed);
        report.failures.push(SeedFailure {
            seed,
            violations: outcome
                .violations
                .iter()
                .map(|v| format!("{} {v}", v.code()))
                .collect(),
        });
    }

    info!(
        seeds = report.seeds_run,
        passed = report.seeds_passed,
        interesting = report.interesting_states_reached,
        "campaign finished"
    );
    Ok(report)
}

/// # Errors
///
/// See [`Simulator::run`].
pub fn run_single_seed(seed: u64, config: &CampaignConfig) -> Result<SeedOutcome> {
    let result = replay_seed(seed, config)?;
    Ok(SeedOutcome {
        violations: result.oracle.violations,
        interesting: result.interesting_state_reached,
    })
}

/// Run one seed and keep everything it produced.
///
/// # Errors
///
/// See [`Simulator::run`].
pub fn replay_seed(seed: u64, config: &CampaignConfig) -> Result<SimulationResult> {
    let mut simulator = Simulator::new(config.sim_config_for_seed(seed))?;
    simulator
        .run()
        .with_context(|| format!("simulation of seed {seed} failed"))
}
