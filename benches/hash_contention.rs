use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;

fn hash_contention_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash table mixed contention benchmark");
    group.sample_size(10);
    group.bench_function("7 readers , 1 writer", |b| {
        b.iter(|| hash_mixed_benchmark_call(black_box(7)));
    });
    group.finish();

    let mut group = c.benchmark_group("hash table insert contention benchmark");
    group.sample_size(10);
    group.bench_function("4 threads", |b| {
        b.iter(|| hash_write_benchmark_call(black_box(4)));
    });
    group.bench_function("8 threads", |b| {
        b.iter(|| hash_write_benchmark_call(black_box(8)));
    });
    group.finish();
}

extern crate marmotdb;
use marmotdb::cache::BufferPool;
use marmotdb::indexes::{IndexName, LinearProbeHashTable, OrdComparator, SipKeyHasher};
use marmotdb::storage::FileStorage;

use std::sync::Arc;
use std::thread;

use tempfile::NamedTempFile;

type BenchTable = LinearProbeHashTable<u32, u32, OrdComparator, SipKeyHasher>;

fn create_table(num_buckets: usize) -> (BenchTable, NamedTempFile) {
    let storage_path = NamedTempFile::new().unwrap();
    let storage = FileStorage::create(storage_path.path()).unwrap();
    let pool = Arc::new(BufferPool::with_default_capacity(Box::new(storage)));
    let table = LinearProbeHashTable::try_new(
        IndexName::try_from("bench_index").unwrap(),
        pool,
        OrdComparator,
        SipKeyHasher::new(),
        num_buckets,
    )
    .unwrap();
    (table, storage_path)
}

fn hash_mixed_benchmark_call(num_read_threads: usize) {
    let (table, _storage_path) = create_table(16384);
    let table = Arc::new(table);
    let table_clone = Arc::clone(&table);
    let mut threads = Vec::new();
    let start_key = 0u32;
    let end_key = 4000u32;

    for _ in 0..num_read_threads {
        let table_clone = Arc::clone(&table);

        let handle = thread::spawn(move || {
            for key in start_key..end_key {
                let _ = table_clone.get_value(None, &key).unwrap();
            }
        });

        threads.push(handle);
    }

    let handle = thread::spawn(move || {
        // HACK: stop when reader threads stop
        while Arc::strong_count(&table_clone) > 2 {
            for key in start_key..end_key {
                let _ = table_clone.insert(None, &key, &key).unwrap();
            }
            for key in start_key..end_key {
                let _ = table_clone.remove(None, &key, &key).unwrap();
            }
        }
    });
    threads.push(handle);

    for handle in threads {
        handle.join().unwrap();
    }
}

fn hash_write_benchmark_call(num_threads: usize) {
    let (table, _storage_path) = create_table(16384);
    let table = Arc::new(table);

    let keys_per_thread = 8000 / num_threads;

    let mut threads = Vec::new();

    for i in 0..num_threads {
        let table_clone = Arc::clone(&table);
        let start_key = (i * keys_per_thread) as u32;
        let end_key = start_key + keys_per_thread as u32;

        let handle = thread::spawn(move || {
            for key in start_key..end_key {
                table_clone.insert(None, &key, &key).unwrap();
            }
        });

        threads.push(handle);
    }

    for handle in threads {
        handle.join().unwrap();
    }
}

criterion_group!(benches, hash_contention_benchmark);
criterion_main!(benches);
