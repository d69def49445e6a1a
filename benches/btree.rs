//! Storage benchmarks for simpledoc.
//!
//! Benchmarks for:
//! - B-tree inserts, sequential and random, inside one transaction
//! - B-tree point lookups
//! - Collection inserts with and without a secondary index
//! - Indexed queries against full scans

use std::ops::Bound;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use simpledoc::{
    btree::{BTree, InsertMode},
    doc, Config, Database, SyncMode,
};
use tempfile::TempDir;

fn open_db() -> (TempDir, Database) {
    let dir = TempDir::new().unwrap();
    let config = Config::new().sync(SyncMode::Off);
    let db = Database::open(dir.path().join("bench.db"), config).unwrap();
    (dir, db)
}

fn sequential_keys(count: usize) -> Vec<Vec<u8>> {
    (0..count)
        .map(|i| format!("key_{i:08}").into_bytes())
        .collect()
}

fn random_keys(count: usize) -> Vec<Vec<u8>> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..count)
        .map(|_| (0..16).map(|_| rng.gen()).collect())
        .collect()
}

fn bench_tree_insert(c: &mut Criterion, name: &str, keys_for: fn(usize) -> Vec<Vec<u8>>) {
    let mut group = c.benchmark_group(name);
    let (_dir, db) = open_db();
    let value = vec![7u8; 100];

    for size in [1000, 10_000] {
        let keys = keys_for(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let mut txn = db.begin_transaction().unwrap();
                let tree = BTree::create(&mut txn).unwrap();
                for key in &keys {
                    tree.insert(&mut txn, key, &value, InsertMode::Insert)
                        .unwrap();
                }
                // nothing reaches the file
                txn.rollback().unwrap();
            });
        });
    }

    group.finish();
}

fn bench_insert_sequential(c: &mut Criterion) {
    bench_tree_insert(c, "btree/insert_sequential", sequential_keys);
}

fn bench_insert_random(c: &mut Criterion) {
    bench_tree_insert(c, "btree/insert_random", random_keys);
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree/lookup");
    let (_dir, db) = open_db();

    for size in [1000, 10_000] {
        let keys = random_keys(size);
        let mut txn = db.begin_transaction().unwrap();
        let tree = BTree::create(&mut txn).unwrap();
        for key in &keys {
            tree.insert(&mut txn, key, b"value", InsertMode::Insert)
                .unwrap();
        }

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                for key in &keys {
                    black_box(tree.lookup(&txn, key).unwrap());
                }
            });
        });

        group.bench_with_input(BenchmarkId::new("scan", size), &size, |b, _| {
            b.iter(|| {
                let scanned = tree
                    .range_scan(&txn, Bound::Unbounded, Bound::Unbounded)
                    .count();
                black_box(scanned)
            });
        });
        txn.rollback().unwrap();
    }

    group.finish();
}

fn bench_collection_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("collection/insert_many");
    let batch: i64 = 1000;
    group.throughput(Throughput::Elements(batch as u64));

    for indexed in [false, true] {
        let label = if indexed { "indexed" } else { "plain" };
        group.bench_function(label, |b| {
            b.iter_with_setup(
                || {
                    let (dir, db) = open_db();
                    if indexed {
                        db.collection("people").create_index("age").unwrap();
                    }
                    (dir, db)
                },
                |(_dir, db)| {
                    let docs = (0..batch).map(|i| doc! { "name" => format!("user {i}"), "age" => i % 90 });
                    db.collection("people").insert_many(docs).unwrap();
                },
            );
        });
    }

    group.finish();
}

fn bench_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("collection/query");
    let (_dir, db) = open_db();
    let people = db.collection("people");
    people
        .insert_many((0..10_000).map(|i| doc! { "_id" => i, "age" => i % 90, "score" => i % 90 }))
        .unwrap();
    people.create_index("age").unwrap();

    group.bench_function("indexed", |b| {
        b.iter(|| black_box(people.count_documents(doc! { "age" => 42 }).unwrap()));
    });
    group.bench_function("full_scan", |b| {
        b.iter(|| black_box(people.count_documents(doc! { "score" => 42 }).unwrap()));
    });
    group.bench_function("id_range", |b| {
        b.iter(|| {
            let filter = doc! { "_id" => doc! { "$gte" => 5000, "$lt" => 5100 } };
            black_box(people.count_documents(filter).unwrap())
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_insert_sequential,
    bench_insert_random,
    bench_lookup,
    bench_collection_insert,
    bench_query
);
criterion_main!(benches);
