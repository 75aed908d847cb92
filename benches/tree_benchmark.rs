use criterion::{criterion_group, criterion_main, Criterion};
use minnow::{BPlusTree, BytewiseComparator, MemDisk, Pager, RecordId};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::Arc;

criterion_group!(benches, tree_insert_benchmark, tree_get_benchmark);
criterion_main!(benches);

pub fn tree_insert_benchmark(c: &mut Criterion) {
    let pager = Arc::new(Pager::new(Box::new(MemDisk::new()), 1024, 2).unwrap());
    let tree = BPlusTree::create(pager, BytewiseComparator, 8, 64, 64).unwrap();

    let mut next = 0u64;
    c.bench_function("insert", |b| {
        b.iter(|| {
            next += 1;
            tree.insert(&next.to_be_bytes(), RecordId::new(next as u32, 0))
                .unwrap();
        })
    });
}

pub fn tree_get_benchmark(c: &mut Criterion) {
    let pager = Arc::new(Pager::new(Box::new(MemDisk::new()), 1024, 2).unwrap());
    let tree = BPlusTree::create(pager, BytewiseComparator, 8, 64, 64).unwrap();

    let mut keys = Vec::new();
    for k in 0..100000u64 {
        tree.insert(&k.to_be_bytes(), RecordId::new(k as u32, 0))
            .unwrap();
        keys.push(k);
    }
    let mut rng = rand::rngs::StdRng::seed_from_u64(0);

    c.bench_function("get", |b| {
        b.iter(|| {
            let k = keys.choose(&mut rng).unwrap();
            tree.get(&k.to_be_bytes()).unwrap().unwrap();
        })
    });
}
