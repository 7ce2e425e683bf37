//! Property tests for pool bookkeeping.

use daq_pool::{PoolConfig, Sample, SampleMut, SamplePool, SampleType};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Acquire { type_index: usize, len: usize },
    Freeze { index: usize },
    Share { index: usize },
    Release { index: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..SampleType::ALL.len(), 0usize..2000)
            .prop_map(|(type_index, len)| Op::Acquire { type_index, len }),
        any::<usize>().prop_map(|index| Op::Freeze { index }),
        any::<usize>().prop_map(|index| Op::Share { index }),
        any::<usize>().prop_map(|index| Op::Release { index }),
    ]
}

fn pool_config_strategy() -> impl Strategy<Value = PoolConfig> {
    (1usize..32, 32usize..600, prop::option::of(1usize..6), 0usize..4).prop_map(
        |(small, medium, max_free, spares)| PoolConfig {
            small_max_elements: small,
            medium_max_elements: medium,
            initial_bytes: 4096,
            max_free_per_class: max_free,
            borrow_min_spares: spares,
            ..PoolConfig::default()
        },
    )
}

proptest! {
    #[test]
    fn allocated_equals_free_plus_outstanding(
        config in pool_config_strategy(),
        ops in prop::collection::vec(op_strategy(), 1..120),
    ) {
        let pool = SamplePool::new(config);
        let mut filling: Vec<SampleMut> = Vec::new();
        let mut shared: Vec<Sample> = Vec::new();

        for op in ops {
            match op {
                Op::Acquire { type_index, len } => {
                    let s = pool.acquire(SampleType::ALL[type_index], len).unwrap();
                    prop_assert_eq!(s.len(), len);
                    prop_assert!(s.capacity() >= len);
                    filling.push(s);
                }
                Op::Freeze { index } if !filling.is_empty() => {
                    let s = filling.swap_remove(index % filling.len());
                    shared.push(s.freeze());
                }
                Op::Share { index } if !shared.is_empty() => {
                    let s = shared[index % shared.len()].clone();
                    shared.push(s);
                }
                Op::Release { index } if !shared.is_empty() => {
                    drop(shared.swap_remove(index % shared.len()));
                }
                Op::Release { index } if !filling.is_empty() => {
                    drop(filling.swap_remove(index % filling.len()));
                }
                _ => {}
            }

            let stats = pool.stats();
            prop_assert_eq!(stats.allocated, stats.free() + stats.outstanding);
        }

        drop(filling);
        drop(shared);
        let stats = pool.stats();
        prop_assert_eq!(stats.outstanding, 0);
        prop_assert_eq!(stats.allocated, stats.free());
    }

    #[test]
    fn acquire_always_fits_request(len in 0usize..5000, type_index in 0..SampleType::ALL.len()) {
        let pool = SamplePool::default();
        // warm the pool with a smaller buffer of the same type
        drop(pool.acquire(SampleType::ALL[type_index], len / 2).unwrap());
        let s = pool.acquire(SampleType::ALL[type_index], len).unwrap();
        prop_assert_eq!(s.len(), len);
        prop_assert!(s.capacity() >= len);
        prop_assert_eq!(s.sample_type(), SampleType::ALL[type_index]);
    }
}
