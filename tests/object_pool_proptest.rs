use nsync::ObjectPool;
use proptest::prelude::*;
use std::collections::BTreeSet;

#[derive(Clone, Debug)]
enum Op {
    Put,
    Get,
    Drain,
    Purge,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => Just(Op::Put),
        4 => Just(Op::Get),
        1 => Just(Op::Drain),
        1 => Just(Op::Purge),
    ]
}

#[derive(Default)]
struct Counts {
    local: usize,
    shared: usize,
    local_victims: usize,
    shared_victims: usize,
}

// Property: single-threaded pool behaviour against a counting model.
// - `get` only ever returns a value that was put and not taken since, and
//   prefers values put since the last drain.
// - Values that sat through two drains, or any purge, never come back.
// - Releases beyond both capacities are discarded.
// - `local_len`/`shared_len` match the model after each op.
proptest! {
    #![proptest_config(ProptestConfig { cases: 128, .. ProptestConfig::default() })]
    #[test]
    fn prop_pool_matches_counting_model(
        local in 0usize..4,
        shared in 1usize..4,
        ops in proptest::collection::vec(arb_op(), 1..120),
    ) {
        let pool: ObjectPool<u32> = ObjectPool::builder()
            .local_capacity(local)
            .shared_capacity(shared)
            .build()
            .unwrap();
        let mut next = 0u32;
        let mut n = Counts::default();
        // Values retained since the last drain, and those from the cycle before.
        let mut fresh: BTreeSet<u32> = BTreeSet::new();
        let mut aging: BTreeSet<u32> = BTreeSet::new();

        for op in ops {
            match op {
                Op::Put => {
                    pool.put(next);
                    if n.local < local {
                        n.local += 1;
                        fresh.insert(next);
                    } else if n.shared < shared {
                        n.shared += 1;
                        fresh.insert(next);
                    }
                    next += 1;
                }
                Op::Get => {
                    let got = pool.get();
                    if n.local > 0 || n.shared > 0 {
                        if n.local > 0 { n.local -= 1 } else { n.shared -= 1 }
                        let v = got.expect("fresh value available");
                        prop_assert!(fresh.remove(&v), "value {} not fresh", v);
                    } else if n.local_victims > 0 || n.shared_victims > 0 {
                        if n.local_victims > 0 { n.local_victims -= 1 } else { n.shared_victims -= 1 }
                        let v = got.expect("aging value available");
                        prop_assert!(aging.remove(&v), "value {} not aging", v);
                    } else {
                        prop_assert_eq!(got, None);
                    }
                }
                Op::Drain => {
                    pool.drain();
                    n.local_victims = std::mem::take(&mut n.local);
                    n.shared_victims = std::mem::take(&mut n.shared);
                    aging = std::mem::take(&mut fresh);
                }
                Op::Purge => {
                    pool.purge();
                    n = Counts::default();
                    fresh.clear();
                    aging.clear();
                }
            }
            prop_assert_eq!(pool.local_len(), n.local + n.local_victims);
            prop_assert_eq!(pool.shared_len(), n.shared + n.shared_victims);
        }
    }
}
