//! Static scan of formula text for the values it can read.

use std::collections::BTreeSet;

use serde_json::Value;
use tracing::trace;

use super::Dependency;
use crate::formula::formula_source;
use crate::formula::lexer::{Token, tokenize};

/// Dependencies of a tag value. Non-formulas and formulas that fail to
/// tokenize depend on nothing.
#[must_use]
pub fn dependencies_of(value: &Value) -> BTreeSet<Dependency> {
    formula_source(value).map(analyze).unwrap_or_default()
}

/// Dependencies named in formula source (without the `=`).
#[must_use]
pub fn analyze(source: &str) -> BTreeSet<Dependency> {
    let Ok(tokens) = tokenize(source) else {
        trace!(source, "formula does not tokenize; no dependencies");
        return BTreeSet::new();
    };
    let tokens: Vec<&Token> = tokens.iter().map(|s| &s.token).collect();

    let mut deps = BTreeSet::new();
    let mut i = 0;
    while i < tokens.len() {
        match tokens[i] {
            Token::TagRef(name) => {
                deps.insert(Dependency::Tag { name: name.clone() });
            }
            Token::BotRef(id) => {
                let tag = match (tokens.get(i + 1), tokens.get(i + 2)) {
                    (Some(Token::Dot), Some(Token::Ident(tag))) => {
                        i += 2;
                        Some(tag.clone())
                    }
                    _ => None,
                };
                deps.insert(Dependency::Bot { id: id.clone(), tag });
            }
            Token::Ident(name) if name == "this" => {
                if let (Some(Token::Dot), Some(Token::Ident(tag))) =
                    (tokens.get(i + 1), tokens.get(i + 2))
                {
                    deps.insert(Dependency::This { tag: tag.clone() });
                    i += 2;
                }
            }
            Token::Ident(name) if name == "getBots" => {
                deps.insert(Dependency::All);
            }
            _ => {}
        }
        i += 1;
    }
    deps
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tag(name: &str) -> Dependency {
        Dependency::Tag { name: name.into() }
    }

    #[test]
    fn finds_every_reference_kind() {
        let deps = analyze("sum(#num) + @a.total + count(@b) + this.x + count(getBots())");
        let expected: BTreeSet<Dependency> = [
            tag("num"),
            Dependency::Bot {
                id: "a".into(),
                tag: Some("total".into()),
            },
            Dependency::Bot {
                id: "b".into(),
                tag: None,
            },
            Dependency::This { tag: "x".into() },
            Dependency::All,
        ]
        .into_iter()
        .collect();
        assert_eq!(deps, expected);
    }

    #[test]
    fn literals_and_broken_formulas_have_none() {
        assert!(dependencies_of(&json!("#num")).is_empty());
        assert!(dependencies_of(&json!(5)).is_empty());
        assert!(dependencies_of(&json!("=#num + \"open")).is_empty());
        assert_eq!(dependencies_of(&json!("=#num")), BTreeSet::from([tag("num")]));
    }

    #[test]
    fn strings_do_not_count() {
        assert!(analyze("'#num @a this.x'").is_empty());
    }
}
