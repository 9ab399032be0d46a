use std::collections::BTreeMap;

use serde_json::Value;
use tracing::warn;
use weave_aux::Bot;

use crate::formula::{FormulaError, FormulaEvaluator, coerce_literal, formula_source};

/// Read-only view of the bots handed to a formula evaluator, with lazy
/// evaluation of the tags a formula reads.
///
/// Values are computed on first read and cached. Formulas that read
/// themselves (directly or through others) or nest deeper than
/// `max_depth` produce an error marker instead of recursing.
pub struct CalculationContext<'a> {
    bots: &'a BTreeMap<String, Bot>,
    evaluator: &'a dyn FormulaEvaluator,
    cache: BTreeMap<(String, String), Value>,
    stack: Vec<(String, String)>,
    max_depth: usize,
}

impl<'a> CalculationContext<'a> {
    pub fn new(
        bots: &'a BTreeMap<String, Bot>,
        evaluator: &'a dyn FormulaEvaluator,
        max_depth: usize,
    ) -> Self {
        Self {
            bots,
            evaluator,
            cache: BTreeMap::new(),
            stack: Vec::new(),
            max_depth,
        }
    }

    /// Seed the cache with values known to be current.
    pub fn with_cache(mut self, cache: BTreeMap<(String, String), Value>) -> Self {
        self.cache = cache;
        self
    }

    pub fn bots(&self) -> impl Iterator<Item = &'a Bot> {
        self.bots.values()
    }

    pub fn bot_ids(&self) -> impl Iterator<Item = &'a str> {
        self.bots.keys().map(String::as_str)
    }

    #[must_use]
    pub fn has_bot(&self, id: &str) -> bool {
        self.bots.contains_key(id)
    }

    /// Precalculated value of `bot.tag`; `null` if either is missing.
    pub fn value_of(&mut self, bot: &str, tag: &str) -> Value {
        let key = (bot.to_string(), tag.to_string());
        if let Some(value) = self.cache.get(&key) {
            return value.clone();
        }
        let bots = self.bots;
        let Some(raw) = bots.get(bot).and_then(|b| b.tag(tag)) else {
            return Value::Null;
        };
        let Some(source) = formula_source(raw) else {
            let value = coerce_literal(raw);
            self.cache.insert(key, value.clone());
            return value;
        };

        // A cycle member is not cached: the outer evaluation owns the result.
        if self.stack.contains(&key) {
            return FormulaError::Cycle {
                bot: bot.to_string(),
                tag: tag.to_string(),
            }
            .marker();
        }
        if self.stack.len() >= self.max_depth {
            return FormulaError::DepthExceeded {
                limit: self.max_depth,
            }
            .marker();
        }

        self.stack.push(key.clone());
        let evaluator = self.evaluator;
        let result = evaluator.evaluate(source, bot, tag, self);
        self.stack.pop();

        let value = result.unwrap_or_else(|err| {
            warn!(bot, tag, error = %err, "formula failed");
            err.marker()
        });
        self.cache.insert(key, value.clone());
        value
    }

    /// Values of `tag` on every bot that has it, in bot id order. Bots
    /// whose value is `null` are skipped.
    pub fn values_of_tag(&mut self, tag: &str) -> Vec<Value> {
        let bots = self.bots;
        let mut values = Vec::new();
        for (id, bot) in bots {
            if bot.tag(tag).is_none() {
                continue;
            }
            let value = self.value_of(id, tag);
            if !value.is_null() {
                values.push(value);
            }
        }
        values
    }

    /// Computed values, consuming the context.
    #[must_use]
    pub fn into_cache(self) -> BTreeMap<(String, String), Value> {
        self.cache
    }

    /// Number of formulas currently being evaluated.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.stack.len()
    }
}

impl std::fmt::Debug for CalculationContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalculationContext")
            .field("bots", &self.bots.len())
            .field("cached", &self.cache.len())
            .field("depth", &self.stack.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::{ExprEvaluator, is_error_marker};
    use serde_json::json;

    fn bots(list: &[Bot]) -> BTreeMap<String, Bot> {
        list.iter().map(|b| (b.id.clone(), b.clone())).collect()
    }

    #[test]
    fn formulas_read_other_formulas() {
        let bots = bots(&[
            Bot::new("a").with_tag("n", "2").with_tag("double", "=this.n * 2"),
            Bot::new("b").with_tag("n", 5).with_tag("total", "=sum(#n) + @a.double"),
        ]);
        let mut cx = CalculationContext::new(&bots, &ExprEvaluator, 8);
        assert_eq!(cx.value_of("b", "total"), json!(11));
        assert_eq!(cx.value_of("a", "double"), json!(4));
        assert_eq!(cx.value_of("a", "missing"), Value::Null);
    }

    #[test]
    fn cycles_become_markers() {
        let bots = bots(&[Bot::new("a").with_tag("x", "=this.y").with_tag("y", "=this.x")]);
        let mut cx = CalculationContext::new(&bots, &ExprEvaluator, 8);
        assert!(is_error_marker(&cx.value_of("a", "x")));
        assert_eq!(cx.depth(), 0);
    }

    #[test]
    fn depth_is_bounded() {
        let chain: Vec<Bot> = (0..6)
            .map(|i| Bot::new(format!("b{i}")).with_tag("v", format!("=@b{}.v + 1", i + 1)))
            .chain([Bot::new("b6").with_tag("v", 0)])
            .collect();
        let bots = bots(&chain);

        let mut shallow = CalculationContext::new(&bots, &ExprEvaluator, 3);
        assert!(is_error_marker(&shallow.value_of("b0", "v")));

        let mut deep = CalculationContext::new(&bots, &ExprEvaluator, 8);
        assert_eq!(deep.value_of("b0", "v"), json!(6));
    }

    #[test]
    fn one_failure_does_not_spread() {
        let bots = bots(&[Bot::new("a")
            .with_tag("bad", "=1/0")
            .with_tag("good", "=1+1")]);
        let mut cx = CalculationContext::new(&bots, &ExprEvaluator, 8);
        assert!(is_error_marker(&cx.value_of("a", "bad")));
        assert_eq!(cx.value_of("a", "good"), json!(2));
    }
}
