use proptest::prelude::*;
use weave_core::{Atom, AtomId, SiteId, Weave};

/// Atoms of a random cause tree in creation order (always causally valid).
///
/// Atom 0 is the root. Every other atom picks an earlier atom as its cause,
/// a site in `1..=4` and an occasional non-zero priority.
pub fn arb_forest(max: usize) -> impl Strategy<Value = Vec<Atom<u32>>> + Clone {
    prop::collection::vec((1u32..=4, any::<prop::sample::Index>(), 0u32..3), 0..max).prop_map(
        |picks| {
            let root = Atom::new(AtomId::new(SiteId(1), 1, 0), None, 0).unwrap();
            let mut atoms = vec![root];
            for (n, (site, cause, priority)) in picks.into_iter().enumerate() {
                let cause = atoms[cause.index(atoms.len())].id;
                // Priority 2 stays rare so most siblings order by timestamp.
                let priority = u32::from(priority == 2);
                let id = AtomId::new(SiteId(site), n as u64 + 2, priority);
                atoms.push(Atom::new(id, Some(cause), n as u32 + 1).unwrap());
            }
            atoms
        },
    )
}

/// The same forest together with a shuffled copy.
pub fn arb_forest_and_permutation(
    max: usize,
) -> impl Strategy<Value = (Vec<Atom<u32>>, Vec<Atom<u32>>)> {
    arb_forest(max).prop_flat_map(|atoms| {
        let shuffled = Just(atoms.clone()).prop_shuffle();
        (Just(atoms), shuffled)
    })
}

/// Insert atoms in any order, holding back each one until its cause arrived.
pub fn deliver(weave: &mut Weave<u32>, atoms: &[Atom<u32>]) {
    let mut queue: Vec<Atom<u32>> = atoms.to_vec();
    while !queue.is_empty() {
        let before = queue.len();
        queue.retain(|atom| {
            let ready = atom.cause.is_none_or(|c| weave.contains(&c) || weave.is_collected(&c));
            if ready {
                weave.insert(atom.clone()).unwrap();
            }
            !ready
        });
        assert!(queue.len() < before, "forest contains an orphan");
    }
}

pub fn values(weave: &Weave<u32>) -> Vec<u32> {
    weave.iter().map(|a| a.value).collect()
}
