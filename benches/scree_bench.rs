use criterion::{black_box, criterion_group, criterion_main, Criterion};

use scree::{CompactionStrategy, Scree};

pub fn measure_set(c: &mut Criterion) {
    let mut store: Scree<u64> = Scree::new();
    let values = [1, 2, 3, 4];
    let mut generation = 0;

    c.bench_function("set 4 values", |b| {
        b.iter(|| {
            store.set(0, black_box(&values));
            generation += 1;
            store.on_generation_change(generation);
            let first_used = store.update_first_used_generation();
            store.remove_old_generations(first_used);
        })
    });
}

pub fn measure_get(c: &mut Criterion) {
    let mut store: Scree<u64> = Scree::new();
    for id in 0..1024 {
        store.set(id, &[u64::from(id); 8]);
    }

    c.bench_function("get 8 values", |b| {
        let mut id = 0;
        b.iter(|| {
            black_box(store.get(id % 1024));
            id += 1;
        })
    });
}

pub fn measure_pinned_get(c: &mut Criterion) {
    let mut store: Scree<u64> = Scree::new();
    for id in 0..1024 {
        store.set(id, &[u64::from(id); 8]);
    }
    let reader = store.reader();

    c.bench_function("pin and get 8 values", |b| {
        let mut id = 0;
        b.iter(|| {
            let guard = reader.pin();
            black_box(guard.get(id % 1024));
            id += 1;
        })
    });
}

pub fn measure_compaction(c: &mut Criterion) {
    c.bench_function("compact 75% dead buffer", |b| {
        b.iter_with_setup(
            || {
                let mut store: Scree<u64> = Scree::new();
                for id in 0..2048 {
                    store.set(id, &[u64::from(id); 4]);
                }
                for id in 0..1536 {
                    store.set(id, &[]);
                }
                store.on_generation_change(1);
                let first_used = store.update_first_used_generation();
                store.remove_old_generations(first_used);
                store
            },
            |mut store| {
                store.compact_worst(black_box(&CompactionStrategy::default()));
            },
        )
    });
}

criterion_group!(writes, measure_set);
criterion_group!(reads, measure_get, measure_pinned_get);
criterion_group!(gc, measure_compaction);
criterion_main!(writes, reads, gc);
