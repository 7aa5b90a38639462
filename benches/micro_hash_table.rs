#![forbid(unsafe_code)]

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use flowkv::hash_table::{MemoryBudget, PartitionedHashTable, WriteOrigin};
use flowkv::key::StoredKey;
use flowkv::value::{ConflictResMode, Datatype, StoredValue};
use std::sync::Arc;

const ITEMS_PER_BATCH: usize = 256;

fn budget() -> MemoryBudget {
    MemoryBudget { max_data_size: usize::MAX, mutation_threshold: 0.99, replication_threshold: 0.99 }
}

fn micro_hash_table(c: &mut Criterion) {
    let mut group = c.benchmark_group("micro/hash_table");
    for num_stripes in [7usize, 47] {
        let mut harness = Harness::new(num_stripes);
        group.throughput(Throughput::Elements(ITEMS_PER_BATCH as u64));
        group.bench_with_input(
            BenchmarkId::new("set", num_stripes),
            &num_stripes,
            |b, _| b.iter(|| harness.set_batch(ITEMS_PER_BATCH)),
        );
        group.bench_with_input(
            BenchmarkId::new("find", num_stripes),
            &num_stripes,
            |b, _| b.iter(|| harness.find_batch(ITEMS_PER_BATCH)),
        );
    }
    group.finish();
}

struct Harness {
    table: PartitionedHashTable,
    counter: u64,
}

impl Harness {
    fn new(num_stripes: usize) -> Self {
        let table = PartitionedHashTable::new(num_stripes);
        let mut harness = Self { table, counter: 0 };
        harness.set_batch(4096);
        harness
    }

    fn key_for(counter: u64) -> StoredKey {
        StoredKey::default_collection(format!("bench-key-{counter}").into_bytes())
    }

    fn set_batch(&mut self, count: usize) {
        for _ in 0..count {
            self.counter += 1;
            let sv = Arc::new(StoredValue::new(
                Self::key_for(self.counter),
                Some(vec![0u8; 64]),
                self.counter as i64,
                0,
                0,
                Datatype::Raw,
                ConflictResMode::RevisionSeqno,
            ));
            self.table.set(sv, WriteOrigin::Client, 64, &budget());
        }
    }

    fn find_batch(&mut self, count: usize) {
        for i in 0..count {
            let key = Self::key_for((i as u64 % self.counter.max(1)) + 1);
            std::hint::black_box(self.table.find(&key));
        }
    }
}

criterion_group!(benches, micro_hash_table);
criterion_main!(benches);
