use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use weave_core::{Atom, AtomId, SiteId, Weave};

const SIZES: [usize; 3] = [1_000, 10_000, 50_000];

/// Typing: every atom is caused by the previous one.
fn chain(n: usize) -> Vec<Atom<u32>> {
    let mut atoms = Vec::with_capacity(n);
    let mut cause = None;
    for ts in 1..=n as u64 {
        let id = AtomId::new(SiteId(1), ts, 0);
        atoms.push(Atom::new(id, cause, ts as u32).unwrap_or_else(|e| panic!("{e}")));
        cause = Some(id);
    }
    atoms
}

/// Many documents: every atom is a child of the root.
fn fan(n: usize) -> Vec<Atom<u32>> {
    let root = AtomId::new(SiteId(1), 1, 0);
    let mut atoms = vec![Atom::new(root, None, 0).unwrap_or_else(|e| panic!("{e}"))];
    for ts in 2..=n as u64 {
        let site = SiteId((ts % 4) as u32);
        let id = AtomId::new(site, ts, 0);
        atoms.push(Atom::new(id, Some(root), ts as u32).unwrap_or_else(|e| panic!("{e}")));
    }
    atoms
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("weave.insert");
    for n in SIZES {
        group.throughput(Throughput::Elements(n as u64));

        let atoms = chain(n);
        group.bench_with_input(BenchmarkId::new("chain", n), &atoms, |b, atoms| {
            b.iter(|| black_box(Weave::from_atoms(atoms.iter().cloned())))
        });

        let atoms = fan(n);
        group.bench_with_input(BenchmarkId::new("fan", n), &atoms, |b, atoms| {
            b.iter(|| black_box(Weave::from_atoms(atoms.iter().cloned())))
        });
    }
    group.finish();
}

fn bench_checksum(c: &mut Criterion) {
    let mut group = c.benchmark_group("weave.checksum");
    for n in SIZES {
        let weave = Weave::from_atoms(fan(n)).unwrap_or_else(|e| panic!("{e}"));
        group.bench_with_input(BenchmarkId::from_parameter(n), &weave, |b, weave| {
            b.iter(|| black_box(weave.checksum()))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_insert, bench_checksum);
criterion_main!(benches);
