//! Which precalculated tags must be recomputed after a change.
//!
//! # Overview
//!
//! Every formula tag is scanned once for the values it reads
//! ([`analysis::analyze`]); the resulting edges are kept in a reverse index
//! from [`Target`] to the `(bot, tag)` pairs that read it. A change is then
//! answered by walking the reverse index transitively.
//!
//! # Edges
//!
//! | dependency   | target                 | fires when                         |
//! |--------------|------------------------|------------------------------------|
//! | `#tag`       | `Tag(tag)`             | any bot's `tag` changes            |
//! | `@bot`       | `Bot(bot)`             | the bot is added or removed        |
//! | `@bot.tag`   | `BotTag(bot, tag)`     | that bot's `tag` changes           |
//! | `this.tag`   | `BotTag(self, tag)`    | the reading bot's own `tag` changes |
//! | `getBots()`  | `All`                  | any bot is added or removed        |
//!
//! Self references only reach the reading bot, never other bots.

pub mod analysis;

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use tracing::debug;
use weave_aux::Bot;

pub use analysis::{analyze, dependencies_of};

/// A value a formula reads.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Dependency {
    /// `#name`: that tag on every bot.
    Tag { name: String },
    /// `@id` (existence) or `@id.tag`.
    Bot { id: String, tag: Option<String> },
    /// `this.tag`: the reading bot's own tag.
    This { tag: String },
    /// `getBots()`: the set of bots.
    All,
}

/// Reverse-index key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Target {
    Tag(String),
    Bot(String),
    BotTag(String, String),
    All,
}

impl Dependency {
    fn target(&self, reader: &str) -> Target {
        match self {
            Self::Tag { name } => Target::Tag(name.clone()),
            Self::Bot { id, tag: None } => Target::Bot(id.clone()),
            Self::Bot { id, tag: Some(tag) } => Target::BotTag(id.clone(), tag.clone()),
            Self::This { tag } => Target::BotTag(reader.to_string(), tag.clone()),
            Self::All => Target::All,
        }
    }
}

/// Affected tags per bot id.
pub type Updates = BTreeMap<String, BTreeSet<String>>;

type Key = (String, String);

/// Tracks formula dependencies between bots.
#[derive(Debug, Clone, Default)]
pub struct DependencyManager {
    /// Tag names present on each known bot.
    tags: BTreeMap<String, BTreeSet<String>>,
    /// Dependencies of each formula tag.
    edges: BTreeMap<Key, BTreeSet<Dependency>>,
    /// Readers of each target.
    readers: BTreeMap<Target, BTreeSet<Key>>,
}

impl DependencyManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn contains(&self, bot: &str) -> bool {
        self.tags.contains_key(bot)
    }

    /// Dependencies registered for `bot.tag`.
    pub fn dependencies(&self, bot: &str, tag: &str) -> impl Iterator<Item = &Dependency> {
        self.edges
            .get(&(bot.to_string(), tag.to_string()))
            .into_iter()
            .flatten()
    }

    /// Register a new bot. Returns tags on other bots that read it.
    pub fn add_bot(&mut self, bot: &Bot) -> Updates {
        let names: BTreeSet<String> = bot.tags.keys().cloned().collect();
        for (tag, value) in &bot.tags {
            self.set_edges(&bot.id, tag, value);
        }
        self.tags.insert(bot.id.clone(), names.clone());

        let seeds = self.existence_readers(&bot.id, &names);
        let updates = self.closure(seeds, |(id, _)| id == &bot.id);
        debug!(bot = %bot.id, affected = updates.len(), "dependencies added");
        updates
    }

    /// [`Self::add_bot`] for each bot, results merged.
    pub fn add_bots(&mut self, bots: &[Bot]) -> Updates {
        let mut all = Updates::new();
        for bot in bots {
            merge_updates(&mut all, self.add_bot(bot));
        }
        all
    }

    /// Re-scan `tags` of an updated bot (`bot` carries the new values; a
    /// listed tag missing from it was removed). Returns every tag whose value
    /// can change as a result, excluding the listed tags themselves.
    pub fn update_bot(&mut self, bot: &Bot, tags: &BTreeSet<String>) -> Updates {
        let names = self.tags.entry(bot.id.clone()).or_default();
        for tag in tags {
            if bot.tags.contains_key(tag) {
                names.insert(tag.clone());
            } else {
                names.remove(tag);
            }
        }
        for tag in tags {
            match bot.tags.get(tag) {
                Some(value) => self.set_edges(&bot.id, tag, value),
                None => self.clear_edges(&bot.id, tag),
            }
        }

        let changed: Vec<Key> = tags.iter().map(|t| (bot.id.clone(), t.clone())).collect();
        let mut seeds = BTreeSet::new();
        for (id, tag) in &changed {
            seeds.extend(self.value_readers(id, tag));
        }
        let updates = self.closure(seeds, |key| changed.contains(key));
        debug!(bot = %bot.id, changed = tags.len(), affected = updates.len(), "dependencies updated");
        updates
    }

    /// Forget a bot. Returns tags on other bots that read it.
    pub fn remove_bot(&mut self, id: &str) -> Updates {
        let Some(names) = self.tags.remove(id) else {
            return Updates::new();
        };
        for tag in &names {
            self.clear_edges(id, tag);
        }
        let seeds = self.existence_readers(id, &names);
        let updates = self.closure(seeds, |(bot, _)| bot == id);
        debug!(bot = id, affected = updates.len(), "dependencies removed");
        updates
    }

    // -----------------------------------------------------------------------
    // Edges
    // -----------------------------------------------------------------------

    fn set_edges(&mut self, bot: &str, tag: &str, value: &Value) {
        self.clear_edges(bot, tag);
        let deps = dependencies_of(value);
        if deps.is_empty() {
            return;
        }
        let key = (bot.to_string(), tag.to_string());
        for dep in &deps {
            self.readers
                .entry(dep.target(bot))
                .or_default()
                .insert(key.clone());
        }
        self.edges.insert(key, deps);
    }

    fn clear_edges(&mut self, bot: &str, tag: &str) {
        let key = (bot.to_string(), tag.to_string());
        let Some(deps) = self.edges.remove(&key) else {
            return;
        };
        for dep in deps {
            let target = dep.target(bot);
            if let Some(readers) = self.readers.get_mut(&target) {
                readers.remove(&key);
                if readers.is_empty() {
                    self.readers.remove(&target);
                }
            }
        }
    }

    fn readers_of(&self, target: &Target) -> impl Iterator<Item = &Key> {
        self.readers.get(target).into_iter().flatten()
    }

    /// Readers of one tag value.
    fn value_readers(&self, bot: &str, tag: &str) -> BTreeSet<Key> {
        self.readers_of(&Target::Tag(tag.to_string()))
            .chain(self.readers_of(&Target::BotTag(bot.to_string(), tag.to_string())))
            .cloned()
            .collect()
    }

    /// Readers affected by a bot appearing or disappearing.
    fn existence_readers(&self, bot: &str, names: &BTreeSet<String>) -> BTreeSet<Key> {
        let mut seeds: BTreeSet<Key> = self
            .readers_of(&Target::All)
            .chain(self.readers_of(&Target::Bot(bot.to_string())))
            .cloned()
            .collect();
        for tag in names {
            seeds.extend(self.value_readers(bot, tag));
        }
        seeds
    }

    /// Everything reachable from `seeds` through value readers, minus the
    /// keys `skip` matches.
    fn closure(&self, seeds: BTreeSet<Key>, skip: impl Fn(&Key) -> bool) -> Updates {
        let mut seen: BTreeSet<Key> = BTreeSet::new();
        let mut queue: Vec<Key> = seeds.into_iter().collect();
        while let Some(key) = queue.pop() {
            if !seen.insert(key.clone()) {
                continue;
            }
            for next in self.value_readers(&key.0, &key.1) {
                if !seen.contains(&next) {
                    queue.push(next);
                }
            }
        }

        let mut updates = Updates::new();
        for key in seen {
            if skip(&key) {
                continue;
            }
            let (bot, tag) = key;
            updates.entry(bot).or_default().insert(tag);
        }
        updates
    }
}

/// Union `other` into `into`.
pub fn merge_updates(into: &mut Updates, other: Updates) {
    for (bot, tags) in other {
        into.entry(bot).or_default().extend(tags);
    }
}
