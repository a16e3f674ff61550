#![no_main]
#[macro_use]
extern crate libfuzzer_sys;
extern crate arbitrary;
extern crate scree;

use std::collections::BTreeMap;

use arbitrary::Arbitrary;

use scree::{CompactionStrategy, Config as ScreeConfig, EntityId};

const KEYSPACE: u32 = 64;
const VALUE_MAX_LEN: usize = 96;

#[derive(Debug)]
struct Config(ScreeConfig);

impl<'a> Arbitrary<'a> for Config {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        let max_small: usize = u.int_in_range(1..=64).unwrap_or(64);

        Ok(Config(ScreeConfig {
            size_classes: ScreeConfig::default_size_classes(max_small),
            min_entries_per_buffer: u.int_in_range(1..=64).unwrap_or(8),
            enable_free_lists: Arbitrary::arbitrary(u).unwrap_or(true),
            ..Default::default()
        }))
    }
}

#[derive(Debug)]
enum Op {
    Set { id: EntityId, values: Vec<u16> },
    AdvanceGeneration,
    Reclaim,
    Compact,
}

impl<'a> Arbitrary<'a> for Op {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        let choice = u.int_in_range(0..=5).unwrap_or(0);
        Ok(match choice {
            0 | 1 | 2 => {
                let id = u.int_in_range(0..=KEYSPACE).unwrap_or(0);
                let len = u.int_in_range(0..=VALUE_MAX_LEN as u8).unwrap_or(0);
                let values = (0..len).map(|_| Arbitrary::arbitrary(u).unwrap_or(0)).collect();
                Op::Set { id, values }
            }
            3 => Op::AdvanceGeneration,
            4 => Op::Reclaim,
            5 => Op::Compact,
            _ => unreachable!(),
        })
    }
}

fuzz_target!(|args: (Config, Vec<Op>)| {
    let (config, ops) = args;

    let mut store = config.0.build::<u16>().unwrap();
    let mut model: BTreeMap<EntityId, Vec<u16>> = BTreeMap::new();
    let mut generation = 0;

    for op in ops {
        match op {
            Op::Set { id, values } => {
                store.set(id, &values);
                model.insert(id, values);
            }
            Op::AdvanceGeneration => {
                generation += 1;
                store.on_generation_change(generation);
            }
            Op::Reclaim => {
                let first_used = store.update_first_used_generation();
                store.remove_old_generations(first_used);
            }
            Op::Compact => {
                store.compact_worst(&CompactionStrategy::default());
            }
        };

        for (id, expected) in &model {
            assert_eq!(store.get(*id), &expected[..]);
        }

        let total: usize = model.values().map(Vec::len).sum();
        assert_eq!(store.total_values(), total);
    }
});
