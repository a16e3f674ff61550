use std::sync::atomic::{AtomicBool, Ordering::SeqCst};

use scree::{CompactionStrategy, Config, Scree, ScreeReader};

mod common;

const N_READERS: usize = 4;
const WRITER_ROUNDS: u64 = if cfg!(feature = "runtime_verification") {
    500
} else {
    5000
};
const IDS: u32 = 64;

/// Every array is homogeneous, so a reader that ever
/// observes a torn or stale-beyond-the-pin view fails
/// loudly.
fn check_homogeneous(values: &[u64]) {
    if let Some(&first) = values.first() {
        assert!(
            values.iter().all(|&v| v == first),
            "observed a torn array: {:?}",
            values,
        );
        assert_eq!(values.len() as u64 % 8, first % 8);
    }
}

fn reader_loop(reader: ScreeReader<u64>, done: &AtomicBool) {
    while !done.load(SeqCst) {
        let guard = reader.pin();
        for id in 0..IDS {
            check_homogeneous(guard.get(id));
        }
    }
}

#[test]
fn burn_in() {
    common::setup_logger();

    let config = Config {
        min_entries_per_buffer: 8,
        ..Default::default()
    };
    let mut store: Scree<u64> = config.build().unwrap();
    store.ensure_size(u64::from(IDS));
    let done = AtomicBool::new(false);

    std::thread::scope(|s| {
        for i in 0..N_READERS {
            let reader = store.reader();
            let done = &done;
            std::thread::Builder::new()
                .name(format!("reader_{}", i))
                .spawn_scoped(s, move || reader_loop(reader, done))
                .unwrap();
        }

        for round in 1..=WRITER_ROUNDS {
            let id = (round % u64::from(IDS)) as u32;
            let len = (round % 96) as usize;
            store.set(id, &vec![round * 8 + len as u64 % 8; len]);

            if round % 16 == 0 {
                store.on_generation_change(round);
                let first_used = store.update_first_used_generation();
                store.remove_old_generations(first_used);
            }
            if round % 256 == 0 {
                store.compact_worst(&CompactionStrategy::default());
            }
        }

        done.store(true, SeqCst);
    });

    let stats = store.stats();
    log::info!("burn in finished: {:?}", stats);
    assert_eq!(stats.current_generation, WRITER_ROUNDS - WRITER_ROUNDS % 16);
}

#[test]
fn pinned_view_survives_reclamation() {
    common::setup_logger();

    let config = Config {
        min_entries_per_buffer: 8,
        ..Default::default()
    };
    let mut store: Scree<u64> = config.build().unwrap();

    store.set(0, &[11, 11, 11]);

    let reader = store.reader();
    let guard = reader.pin();
    let view = guard.get(0);
    assert_eq!(view, &[11, 11, 11]);

    // overwrite, advance, and aggressively reclaim while the
    // guard still pins the original generation
    store.set(0, &[22]);
    store.on_generation_change(1);
    store.remove_old_generations(u64::MAX);
    store.compact_worst(&CompactionStrategy::default());

    // the pinned view is still intact and unchanged
    assert_eq!(view, &[11, 11, 11]);
    assert_eq!(guard.generation(), 0);

    drop(guard);

    // with the pin gone the retired array may now drain
    store.on_generation_change(2);
    let first_used = store.update_first_used_generation();
    assert_eq!(first_used, 2);
    store.remove_old_generations(first_used);
    assert_eq!(store.stats().on_hold_arrays, 0);

    assert_eq!(reader.pin().get(0), &[22]);
}
