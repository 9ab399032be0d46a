//! Random document edits performed by simulated sites.
//!
//! The edit mix covers every AUX operation: file add/remove, tag set and
//! clear, value text splices and tag-name inserts. Formula tags only read
//! literal tags, so generated documents never contain formula cycles.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use weave_aux::value::text_form;
use weave_aux::{AuxCausalTree, AuxError, AuxTree, Bot, FileEvent};

use crate::rng::DeterministicRng;

pub const FILES: [&str; 4] = ["f1", "f2", "f3", "f4"];
pub const TAGS: [&str; 5] = ["n", "label", "total", "count", "next"];
pub const TEXTS: [&str; 3] = ["a", "xy", "Z"];

/// Values a tag may be set to. `null` clears the tag.
fn values_for(tag: &str) -> Vec<Value> {
    match tag {
        "n" => vec![json!(1), json!(2), json!(5), json!("3"), json!("x"), Value::Null],
        "total" => vec![json!("=sum(#n)"), json!("=max(#n) - min(#n)"), Value::Null],
        "count" => vec![json!("=count(getBots())"), json!("=count(#n)"), Value::Null],
        "next" => vec![json!("=this.n + 1"), json!("=this.label + \"!\""), Value::Null],
        _ => vec![json!("hello"), json!("world"), json!(true), Value::Null],
    }
}

/// The document every simulation starts from.
#[must_use]
pub fn seed_document() -> Vec<Bot> {
    vec![
        Bot::new("f1")
            .with_tag("n", 1)
            .with_tag("label", "hello")
            .with_tag("total", "=sum(#n)"),
        Bot::new("f2")
            .with_tag("n", 4)
            .with_tag("count", "=count(getBots())"),
    ]
}

/// Relative weights of the edit kinds, in percent of edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditMix {
    pub set_tag: u8,
    pub insert_text: u8,
    pub delete_text: u8,
    pub insert_name: u8,
    pub add_file: u8,
    pub remove_file: u8,
}

impl Default for EditMix {
    fn default() -> Self {
        Self {
            set_tag: 40,
            insert_text: 20,
            delete_text: 20,
            insert_name: 5,
            add_file: 10,
            remove_file: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Edit {
    SetTag { file: String, tag: String, value: Value },
    InsertText { file: String, tag: String, index: usize, text: String },
    DeleteText { file: String, tag: String, index: usize, count: usize },
    InsertName { file: String, tag: String, index: usize, text: String },
    AddFile { file: Bot },
    RemoveFile { file: String },
}

impl Edit {
    /// Draw an edit against the site's current document.
    pub fn generate(rng: &mut DeterministicRng, mix: EditMix, tree: &AuxCausalTree) -> Self {
        let file = pick(rng, &FILES).to_string();
        let tag = pick(rng, &TAGS).to_string();
        let text_len = tree
            .tag_value(&file, &tag)
            .map_or(0, |value| text_form(value).chars().count());

        let weights = [
            mix.set_tag,
            mix.insert_text,
            mix.delete_text,
            mix.insert_name,
            mix.add_file,
            mix.remove_file,
        ];
        let total: u64 = weights.iter().map(|w| u64::from(*w)).sum();
        let mut roll = rng.next_bounded(total.max(1));
        let mut kind = 0;
        for (i, weight) in weights.iter().enumerate() {
            if roll < u64::from(*weight) {
                kind = i;
                break;
            }
            roll -= u64::from(*weight);
        }

        match kind {
            1 => Self::InsertText {
                index: rng.index(text_len + 1),
                text: pick(rng, &TEXTS).to_string(),
                file,
                tag,
            },
            2 => {
                let index = rng.index(text_len + 1);
                let count = (rng.index(3) + 1).min(text_len - index);
                Self::DeleteText {
                    file,
                    tag,
                    index,
                    count,
                }
            }
            3 => Self::InsertName {
                index: rng.index(tag.chars().count() + 1),
                text: pick(rng, &TEXTS).to_string(),
                file,
                tag,
            },
            4 => {
                let value = pick(rng, &values_for("n")).clone();
                let mut bot = Bot::new(file);
                if !value.is_null() {
                    bot = bot.with_tag("n", value);
                }
                Self::AddFile { file: bot }
            }
            5 => Self::RemoveFile { file },
            _ => {
                let value = pick(rng, &values_for(&tag)).clone();
                Self::SetTag { file, tag, value }
            }
        }
    }

    /// Apply to a tree, returning the atoms created.
    ///
    /// # Errors
    ///
    /// Whatever the AUX operation rejects, such as editing a missing file.
    pub fn apply(&self, tree: &mut AuxCausalTree) -> Result<usize, AuxError> {
        let atoms = match self {
            Self::SetTag { file, tag, value } => {
                tree.apply_event(&FileEvent::updated(file.clone(), [(tag.clone(), value.clone())]))?
            }
            Self::InsertText {
                file,
                tag,
                index,
                text,
            } => tree.insert_into_tag_value(file, tag, *index, text)?,
            Self::DeleteText {
                file,
                tag,
                index,
                count,
            } => tree.delete_from_tag_value(file, tag, *index, *count)?,
            Self::InsertName {
                file,
                tag,
                index,
                text,
            } => tree.insert_into_tag_name(file, tag, *index, text)?,
            Self::AddFile { file } => tree.apply_event(&FileEvent::FileAdded { file: file.clone() })?,
            Self::RemoveFile { file } => tree.remove_file(file)?,
        };
        Ok(atoms.len())
    }
}

fn pick<'a, T>(rng: &mut DeterministicRng, items: &'a [T]) -> &'a T {
    // Callers pass non-empty constant tables.
    let index = rng.index(items.len());
    &items[index]
}
