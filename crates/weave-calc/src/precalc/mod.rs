//! Incremental precalculation of tag values.
//!
//! [`PrecalculationManager`] keeps the raw tags of every bot together with
//! their precalculated values. When bots are added, removed or updated it
//! asks the [`DependencyManager`] which other tags are affected, recomputes
//! only those, and reports the change as a [`StateUpdatedEvent`] carrying a
//! partial state rather than a snapshot.

mod context;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use weave_aux::{AuxState, Bot, StateDiff};
use weave_core::PrecalcConfig;

use crate::dependency::{DependencyManager, Updates, merge_updates};
use crate::formula::FormulaEvaluator;

pub use context::CalculationContext;

/// A bot with raw tags and their precalculated values.
///
/// In partial updates a removed tag is present with a `null` value in both
/// maps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrecalculatedBot {
    pub id: String,
    pub tags: BTreeMap<String, Value>,
    pub values: BTreeMap<String, Value>,
}

impl PrecalculatedBot {
    fn empty(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Self::default()
        }
    }
}

pub type PrecalculatedState = BTreeMap<String, PrecalculatedBot>;

/// Change report for consumers of precalculated state.
///
/// `state` holds full bots for added ids, `None` for removed ids and only
/// the changed tags for updated ids.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateUpdatedEvent {
    pub state: BTreeMap<String, Option<PrecalculatedBot>>,
    pub added_bots: Vec<String>,
    pub removed_bots: Vec<String>,
    pub updated_bots: Vec<String>,
}

impl StateUpdatedEvent {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    /// Fold a later event into this one.
    pub fn merge(&mut self, later: Self) {
        for (id, entry) in later.state {
            let replace = match (self.state.get_mut(&id), entry) {
                (Some(Some(existing)), Some(partial)) => {
                    existing.tags.extend(partial.tags);
                    existing.values.extend(partial.values);
                    None
                }
                (_, entry) => Some(entry),
            };
            if let Some(entry) = replace {
                self.state.insert(id, entry);
            }
        }
        for id in later.removed_bots {
            self.added_bots.retain(|a| *a != id);
            self.updated_bots.retain(|u| *u != id);
            push_unique(&mut self.removed_bots, id);
        }
        for id in later.added_bots {
            self.removed_bots.retain(|r| *r != id);
            push_unique(&mut self.added_bots, id);
        }
        for id in later.updated_bots {
            if !self.added_bots.contains(&id) {
                push_unique(&mut self.updated_bots, id);
            }
        }
    }
}

fn push_unique(list: &mut Vec<String>, id: String) {
    if !list.contains(&id) {
        list.push(id);
    }
}

/// A changed bot: its new raw tags plus the names that changed. A listed
/// name missing from `bot.tags` was removed.
#[derive(Debug, Clone, PartialEq)]
pub struct BotUpdate {
    pub bot: Bot,
    pub tags: BTreeSet<String>,
}

/// Maintains precalculated values for a set of bots.
pub struct PrecalculationManager {
    dependencies: DependencyManager,
    evaluator: Box<dyn FormulaEvaluator>,
    config: PrecalcConfig,
    bots: BTreeMap<String, Bot>,
    state: PrecalculatedState,
}

impl std::fmt::Debug for PrecalculationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrecalculationManager")
            .field("bots", &self.bots.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PrecalculationManager {
    pub fn new(evaluator: Box<dyn FormulaEvaluator>, config: PrecalcConfig) -> Self {
        Self {
            dependencies: DependencyManager::new(),
            evaluator,
            config,
            bots: BTreeMap::new(),
            state: PrecalculatedState::new(),
        }
    }

    #[must_use]
    pub const fn state(&self) -> &PrecalculatedState {
        &self.state
    }

    #[must_use]
    pub const fn dependencies(&self) -> &DependencyManager {
        &self.dependencies
    }

    /// Precalculated value of one tag.
    #[must_use]
    pub fn value(&self, bot: &str, tag: &str) -> Option<&Value> {
        self.state.get(bot)?.values.get(tag)
    }

    pub fn bots_added(&mut self, bots: &[Bot]) -> StateUpdatedEvent {
        let mut targets = Updates::new();
        for bot in bots {
            self.bots.insert(bot.id.clone(), bot.clone());
            targets
                .entry(bot.id.clone())
                .or_default()
                .extend(bot.tags.keys().cloned());
        }
        merge_updates(&mut targets, self.dependencies.add_bots(bots));

        let mut event = StateUpdatedEvent::default();
        for bot in bots {
            self.state.insert(bot.id.clone(), PrecalculatedBot {
                id: bot.id.clone(),
                tags: bot.tags.clone(),
                values: BTreeMap::new(),
            });
            push_unique(&mut event.added_bots, bot.id.clone());
        }
        let changed = self.recompute(&targets);

        let added: BTreeSet<&str> = bots.iter().map(|b| b.id.as_str()).collect();
        for bot in bots {
            event
                .state
                .insert(bot.id.clone(), self.state.get(&bot.id).cloned());
        }
        self.report_values(&mut event, changed, &added);
        debug!(added = bots.len(), recomputed = targets.len(), "bots added");
        event
    }

    pub fn bots_removed(&mut self, ids: &[String]) -> StateUpdatedEvent {
        let mut event = StateUpdatedEvent::default();
        let mut targets = Updates::new();
        for id in ids {
            if self.bots.remove(id).is_none() {
                continue;
            }
            self.state.remove(id);
            merge_updates(&mut targets, self.dependencies.remove_bot(id));
            event.state.insert(id.clone(), None);
            push_unique(&mut event.removed_bots, id.clone());
        }
        for id in ids {
            targets.remove(id);
        }

        let changed = self.recompute(&targets);
        self.report_values(&mut event, changed, &BTreeSet::new());
        debug!(removed = event.removed_bots.len(), "bots removed");
        event
    }

    pub fn bots_updated(&mut self, updates: &[BotUpdate]) -> StateUpdatedEvent {
        let mut event = StateUpdatedEvent::default();
        let mut targets = Updates::new();
        for update in updates {
            let id = &update.bot.id;
            if !self.bots.contains_key(id) {
                continue;
            }
            self.bots.insert(id.clone(), update.bot.clone());
            merge_updates(
                &mut targets,
                self.dependencies.update_bot(&update.bot, &update.tags),
            );
            targets
                .entry(id.clone())
                .or_default()
                .extend(update.tags.iter().cloned());

            let entry = self
                .state
                .entry(id.clone())
                .or_insert_with(|| PrecalculatedBot::empty(id));
            let partial = event
                .state
                .entry(id.clone())
                .or_insert_with(|| Some(PrecalculatedBot::empty(id)));
            for tag in &update.tags {
                let raw = update.bot.tags.get(tag).cloned().unwrap_or(Value::Null);
                if raw.is_null() {
                    entry.tags.remove(tag);
                } else {
                    entry.tags.insert(tag.clone(), raw.clone());
                }
                if let Some(partial) = partial.as_mut() {
                    partial.tags.insert(tag.clone(), raw);
                }
            }
            push_unique(&mut event.updated_bots, id.clone());
        }

        let changed = self.recompute(&targets);
        self.report_values(&mut event, changed, &BTreeSet::new());
        debug!(
            updated = updates.len(),
            recomputed = targets.values().map(BTreeSet::len).sum::<usize>(),
            "bots updated"
        );
        event
    }

    /// Translate a materialized state diff into add, remove and update
    /// calls, folded into one event.
    pub fn apply_diff(&mut self, diff: &StateDiff, state: &AuxState) -> StateUpdatedEvent {
        let removed: Vec<String> = diff.removed.iter().cloned().collect();
        let mut event = self.bots_removed(&removed);

        let added: Vec<Bot> = diff.added.values().cloned().collect();
        if !added.is_empty() {
            event.merge(self.bots_added(&added));
        }

        let updates: Vec<BotUpdate> = diff
            .updated
            .iter()
            .filter_map(|(id, tags)| {
                Some(BotUpdate {
                    bot: state.get(id)?.clone(),
                    tags: tags.clone(),
                })
            })
            .collect();
        if !updates.is_empty() {
            event.merge(self.bots_updated(&updates));
        }
        event
    }

    /// Recompute `targets` and store the results. Returns the keys whose
    /// value changed, with the new value (`null` when the tag is gone).
    fn recompute(&mut self, targets: &Updates) -> Vec<((String, String), Value)> {
        let mut cache = BTreeMap::new();
        for (id, bot) in &self.state {
            for (tag, value) in &bot.values {
                let stale = targets.get(id).is_some_and(|t| t.contains(tag));
                if !stale {
                    cache.insert((id.clone(), tag.clone()), value.clone());
                }
            }
        }

        let mut cx =
            CalculationContext::new(&self.bots, self.evaluator.as_ref(), self.config.max_depth)
                .with_cache(cache);
        let mut results = Vec::new();
        for (id, tags) in targets {
            if !self.bots.contains_key(id) {
                continue;
            }
            for tag in tags {
                let value = cx.value_of(id, tag);
                results.push(((id.clone(), tag.clone()), value));
            }
        }

        let mut changed = Vec::new();
        for ((id, tag), value) in results {
            let Some(bot) = self.state.get_mut(&id) else {
                continue;
            };
            let old = bot.values.get(&tag);
            if old == Some(&value) || (old.is_none() && value.is_null()) {
                continue;
            }
            if value.is_null() {
                bot.values.remove(&tag);
            } else {
                bot.values.insert(tag.clone(), value.clone());
            }
            changed.push(((id, tag), value));
        }
        changed
    }

    /// Record changed values in `event`. Bots in `full` already carry
    /// their complete entry.
    fn report_values(
        &self,
        event: &mut StateUpdatedEvent,
        changed: Vec<((String, String), Value)>,
        full: &BTreeSet<&str>,
    ) {
        for ((id, tag), value) in changed {
            if full.contains(id.as_str()) {
                continue;
            }
            if let Some(partial) = event
                .state
                .entry(id.clone())
                .or_insert_with(|| Some(PrecalculatedBot::empty(&id)))
            {
                partial.values.insert(tag, value);
            }
            if !event.added_bots.contains(&id) {
                push_unique(&mut event.updated_bots, id);
            }
        }
    }
}
