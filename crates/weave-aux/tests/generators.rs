use proptest::prelude::*;
use serde_json::{Value, json};
use weave_aux::value::text_form;
use weave_aux::{AuxCausalTree, AuxOp, AuxTree, Bot, aux_tree};
use weave_core::{Atom, GcPolicy, SiteId, TreeConfig};

pub const FILES: [&str; 3] = ["f1", "f2", "f3"];
pub const TAGS: [&str; 3] = ["label", "color", "n"];
pub const TEXTS: [&str; 3] = ["a", "xy", "Z"];

pub fn values() -> Vec<Value> {
    vec![
        json!("red"),
        json!("blue"),
        json!(3),
        json!({"x": 1, "y": [1, 2]}),
        Value::Null,
        json!(""),
    ]
}

/// One user-level edit a site may attempt.
#[derive(Debug, Clone)]
pub enum Edit {
    Set { file: usize, tag: usize, value: usize },
    InsertText { file: usize, tag: usize, at: prop::sample::Index, text: usize },
    DeleteText { file: usize, tag: usize, at: prop::sample::Index, count: usize },
    InsertName { file: usize, tag: usize, at: prop::sample::Index, text: usize },
    Remove { file: usize },
    Add { file: usize },
}

pub fn arb_edit() -> impl Strategy<Value = Edit> {
    let file = 0..FILES.len();
    let tag = 0..TAGS.len();
    prop_oneof![
        4 => (file.clone(), tag.clone(), 0..values().len())
            .prop_map(|(file, tag, value)| Edit::Set { file, tag, value }),
        3 => (file.clone(), tag.clone(), any::<prop::sample::Index>(), 0..TEXTS.len())
            .prop_map(|(file, tag, at, text)| Edit::InsertText { file, tag, at, text }),
        3 => (file.clone(), tag.clone(), any::<prop::sample::Index>(), 1usize..4)
            .prop_map(|(file, tag, at, count)| Edit::DeleteText { file, tag, at, count }),
        1 => (file.clone(), tag, any::<prop::sample::Index>(), 0..TEXTS.len())
            .prop_map(|(file, tag, at, text)| Edit::InsertName { file, tag, at, text }),
        1 => file.clone().prop_map(|file| Edit::Remove { file }),
        1 => file.prop_map(|file| Edit::Add { file }),
    ]
}

/// Edit scripts for three concurrent sites.
pub fn arb_scripts() -> impl Strategy<Value = Vec<Vec<Edit>>> {
    prop::collection::vec(prop::collection::vec(arb_edit(), 0..8), 3)
}

/// Delivery picks: which ready atom a replica takes next.
pub fn arb_order() -> impl Strategy<Value = Vec<prop::sample::Index>> {
    prop::collection::vec(any::<prop::sample::Index>(), 1..64)
}

pub fn config(gc: GcPolicy) -> TreeConfig {
    TreeConfig {
        gc,
        ..TreeConfig::default()
    }
}

/// Shared starting point: two bots with a text tag and a number.
pub fn base() -> AuxCausalTree {
    let mut tree = aux_tree(SiteId(1), config(GcPolicy::Disabled));
    tree.root().unwrap();
    tree.add_file(&Bot::new("f1").with_tag("label", "hello").with_tag("n", 12))
        .unwrap();
    tree.add_file(&Bot::new("f2").with_tag("color", "green"))
        .unwrap();
    tree
}

fn visible_len(tree: &AuxCausalTree, file: &str, tag: &str) -> usize {
    tree.tag_value(file, tag)
        .map_or(0, |value| text_form(value).chars().count())
}

/// Run an edit script. Rejected edits are expected and ignored.
pub fn run(tree: &mut AuxCausalTree, script: &[Edit]) {
    let values = values();
    for edit in script {
        match *edit {
            Edit::Set { file, tag, value } => {
                let update = [(TAGS[tag].to_string(), values[value].clone())].into_iter().collect();
                let _ = tree.update_file(FILES[file], &update);
            }
            Edit::InsertText { file, tag, at, text } => {
                let index = at.index(visible_len(tree, FILES[file], TAGS[tag]) + 1);
                let _ = tree.insert_into_tag_value(FILES[file], TAGS[tag], index, TEXTS[text]);
            }
            Edit::DeleteText { file, tag, at, count } => {
                let len = visible_len(tree, FILES[file], TAGS[tag]);
                let index = at.index(len + 1);
                let count = count.min(len - index);
                let _ = tree.delete_from_tag_value(FILES[file], TAGS[tag], index, count);
            }
            Edit::InsertName { file, tag, at, text } => {
                let index = at.index(TAGS[tag].len() + 1);
                let _ = tree.insert_into_tag_name(FILES[file], TAGS[tag], index, TEXTS[text]);
            }
            Edit::Remove { file } => {
                let _ = tree.remove_file(FILES[file]);
            }
            Edit::Add { file } => {
                let _ = tree.add_file(&Bot::new(FILES[file]).with_tag("color", "new"));
            }
        }
    }
}

/// Fork `base` to sites 2, 3, 4, run one script on each and return every
/// atom the sites created.
pub fn concurrent_atoms(base: &AuxCausalTree, scripts: &[Vec<Edit>]) -> Vec<Atom<AuxOp>> {
    let mut atoms = Vec::new();
    for (n, script) in scripts.iter().enumerate() {
        let mut site = base.fork_to_site(SiteId(n as u32 + 2));
        run(&mut site, script);
        atoms.extend(site.atoms_since(base.version()));
    }
    atoms
}

/// Deliver atoms one at a time in a causally valid order chosen by `order`.
pub fn deliver(tree: &mut AuxCausalTree, atoms: &[Atom<AuxOp>], order: &[prop::sample::Index]) {
    let mut queue = atoms.to_vec();
    let mut step = 0;
    while !queue.is_empty() {
        let ready: Vec<usize> = (0..queue.len())
            .filter(|&i| {
                queue[i].cause.is_none_or(|c| {
                    tree.weave().contains(&c) || tree.weave().is_collected(&c)
                })
            })
            .collect();
        assert!(!ready.is_empty(), "atoms contain an orphan");
        let pick = ready[order[step % order.len()].index(ready.len())];
        step += 1;
        let atom = queue.remove(pick);
        tree.add_many(vec![atom]).unwrap();
    }
}
