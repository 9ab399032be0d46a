use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::bot::{AuxState, Bot};

/// Difference between two materialized states.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateDiff {
    pub added: BTreeMap<String, Bot>,
    pub removed: BTreeSet<String>,
    /// Bot id → names of tags whose value changed, appeared or vanished.
    pub updated: BTreeMap<String, BTreeSet<String>>,
}

impl StateDiff {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }
}

/// Compare `old` against `new`.
#[must_use]
pub fn diff_states(old: &AuxState, new: &AuxState) -> StateDiff {
    let mut diff = StateDiff::default();
    let ids: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    for id in ids {
        diff_bot(&mut diff, id, old.get(id).map(|bot| &bot.tags), new.get(id));
    }
    diff
}

/// Record how one bot changed from the raw tags `old` to `new`.
pub fn diff_bot(
    diff: &mut StateDiff,
    id: &str,
    old: Option<&BTreeMap<String, Value>>,
    new: Option<&Bot>,
) {
    match (old, new) {
        (None, None) => {}
        (None, Some(bot)) => {
            diff.added.insert(id.to_string(), bot.clone());
        }
        (Some(_), None) => {
            diff.removed.insert(id.to_string());
        }
        (Some(before), Some(bot)) => {
            let names: BTreeSet<String> = before
                .keys()
                .chain(bot.tags.keys())
                .filter(|name| before.get(*name) != bot.tags.get(*name))
                .cloned()
                .collect();
            if !names.is_empty() {
                diff.updated.insert(id.to_string(), names);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(bots: &[Bot]) -> AuxState {
        bots.iter().map(|b| (b.id.clone(), b.clone())).collect()
    }

    #[test]
    fn classifies_bots() {
        let old = state(&[
            Bot::new("keep").with_tag("a", 1),
            Bot::new("edit").with_tag("a", 1).with_tag("b", 2),
            Bot::new("gone"),
        ]);
        let new = state(&[
            Bot::new("keep").with_tag("a", 1),
            Bot::new("edit").with_tag("a", 5).with_tag("c", 3),
            Bot::new("fresh"),
        ]);
        let diff = diff_states(&old, &new);

        assert_eq!(diff.added.keys().collect::<Vec<_>>(), ["fresh"]);
        assert_eq!(diff.removed.iter().collect::<Vec<_>>(), ["gone"]);
        assert_eq!(
            diff.updated["edit"].iter().collect::<Vec<_>>(),
            ["a", "b", "c"]
        );
        assert!(!diff.updated.contains_key("keep"));
    }

    #[test]
    fn single_bot_against_raw_tags() {
        let mut diff = StateDiff::default();
        let before = Bot::new("a").with_tag("x", 1).with_tag("y", 2).tags;
        let after = Bot::new("a").with_tag("x", 1).with_tag("z", 3);
        diff_bot(&mut diff, "a", Some(&before), Some(&after));
        diff_bot(&mut diff, "b", Some(&before), None);
        diff_bot(&mut diff, "c", None, None);

        assert_eq!(diff.updated["a"].iter().collect::<Vec<_>>(), ["y", "z"]);
        assert_eq!(diff.removed.iter().collect::<Vec<_>>(), ["b"]);
        assert!(diff.added.is_empty());
    }

    #[test]
    fn identical_states_are_empty() {
        let s = state(&[Bot::new("x").with_tag("a", "b")]);
        assert!(diff_states(&s, &s).is_empty());
        assert_eq!(diff_states(&s, &s), StateDiff::default());
    }
}
