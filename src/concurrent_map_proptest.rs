#![cfg(test)]

// Property tests for ConcurrentMap kept inside the crate so they can check
// the snapshot/overlay bookkeeping alongside the public behaviour.

use crate::concurrent_map::ConcurrentMap;
use proptest::prelude::*;
use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{BuildHasher, Hasher};

// Key newtype with Borrow<str> to exercise borrowed lookup.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
struct Key(String);
impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
impl std::borrow::Borrow<str> for Key {
    fn borrow(&self) -> &str {
        &self.0
    }
}

// Pool-indexed operations to improve shrinking. Values come from a small
// range so compare-and-swap/delete hit often.
#[derive(Clone, Debug)]
enum OpI {
    Load(String),
    Store(usize, u8),
    Swap(usize, u8),
    LoadOrStore(usize, u8),
    LoadOrStoreWith(usize, u8),
    LoadAndDelete(usize),
    Delete(usize),
    CompareAndSwap(usize, u8, u8),
    CompareAndDelete(usize, u8),
    Range,
    RangeStopEarly(usize),
    Clear,
}

fn key_from(pool: &[String], i: usize) -> Key {
    Key(pool[i].clone())
}

fn arb_scenario() -> impl Strategy<Value = (Vec<String>, Vec<OpI>)> {
    proptest::collection::vec("[a-z]{0,4}", 1..=8).prop_flat_map(|pool| {
        let idxs: Vec<usize> = (0..pool.len()).collect();
        let idx = proptest::sample::select(idxs);
        let lookup = prop_oneof![
            proptest::sample::select(pool.clone()),
            "[a-z]{0,4}".prop_map(|s| s)
        ];
        let val = 0u8..4;
        let op = prop_oneof![
            4 => lookup.prop_map(OpI::Load),
            4 => (idx.clone(), val.clone()).prop_map(|(i, v)| OpI::Store(i, v)),
            2 => (idx.clone(), val.clone()).prop_map(|(i, v)| OpI::Swap(i, v)),
            2 => (idx.clone(), val.clone()).prop_map(|(i, v)| OpI::LoadOrStore(i, v)),
            1 => (idx.clone(), val.clone()).prop_map(|(i, v)| OpI::LoadOrStoreWith(i, v)),
            2 => idx.clone().prop_map(OpI::LoadAndDelete),
            2 => idx.clone().prop_map(OpI::Delete),
            2 => (idx.clone(), val.clone(), val.clone()).prop_map(|(i, o, n)| OpI::CompareAndSwap(i, o, n)),
            2 => (idx.clone(), val.clone()).prop_map(|(i, o)| OpI::CompareAndDelete(i, o)),
            1 => Just(OpI::Range),
            1 => (0usize..4).prop_map(OpI::RangeStopEarly),
            1 => Just(OpI::Clear),
        ];
        proptest::collection::vec(op, 1..80).prop_map(move |ops| (pool.clone(), ops))
    })
}

// Single-threaded equivalence against std::collections::HashMap.
fn run_scenario<S>(sut: ConcurrentMap<Key, u8, S>, pool: &[String], ops: Vec<OpI>) -> Result<(), TestCaseError>
where
    S: BuildHasher + Clone + Default,
{
    let mut model: HashMap<Key, u8> = HashMap::new();
    let init_calls = Cell::new(0usize);

    for op in ops {
        match op {
            OpI::Load(s) => {
                let model_v = model.iter().find(|(k, _)| k.0 == s).map(|(_, v)| *v);
                prop_assert_eq!(sut.load(s.as_str()), model_v);
            }
            OpI::Store(i, v) => {
                let k = key_from(pool, i);
                sut.store(k.clone(), v);
                model.insert(k, v);
            }
            OpI::Swap(i, v) => {
                let k = key_from(pool, i);
                prop_assert_eq!(sut.swap(k.clone(), v), model.insert(k, v));
            }
            OpI::LoadOrStore(i, v) => {
                let k = key_from(pool, i);
                let expected = match model.get(&k) {
                    Some(&cur) => (cur, true),
                    None => {
                        model.insert(k.clone(), v);
                        (v, false)
                    }
                };
                prop_assert_eq!(sut.load_or_store(k, v), expected);
            }
            OpI::LoadOrStoreWith(i, v) => {
                let k = key_from(pool, i);
                let before = init_calls.get();
                let present = model.contains_key(&k);
                let got = sut.load_or_store_with(k.clone(), || {
                    init_calls.set(init_calls.get() + 1);
                    v
                });
                if present {
                    prop_assert_eq!(got, (model[&k], true));
                    prop_assert_eq!(init_calls.get(), before, "initialiser must not run on hit");
                } else {
                    prop_assert_eq!(got, (v, false));
                    prop_assert_eq!(init_calls.get(), before + 1);
                    model.insert(k, v);
                }
            }
            OpI::LoadAndDelete(i) => {
                let k = key_from(pool, i);
                prop_assert_eq!(sut.load_and_delete(&k), model.remove(&k));
                prop_assert_eq!(sut.load(&k), None);
            }
            OpI::Delete(i) => {
                let k = key_from(pool, i);
                sut.delete(&k);
                model.remove(&k);
            }
            OpI::CompareAndSwap(i, old, new) => {
                let k = key_from(pool, i);
                let hit = model.get(&k) == Some(&old);
                prop_assert_eq!(sut.compare_and_swap(&k, &old, new), hit);
                if hit {
                    model.insert(k, new);
                }
            }
            OpI::CompareAndDelete(i, old) => {
                let k = key_from(pool, i);
                let hit = model.get(&k) == Some(&old);
                prop_assert_eq!(sut.compare_and_delete(&k, &old), hit);
                if hit {
                    model.remove(&k);
                }
            }
            OpI::Range => {
                let mut seen = BTreeMap::new();
                sut.range(|k, v| {
                    seen.insert(k.clone(), *v);
                    true
                });
                let expected: BTreeMap<_, _> = model.iter().map(|(k, v)| (k.clone(), *v)).collect();
                prop_assert_eq!(seen, expected);
                prop_assert!(!sut.is_amended(), "range promotes the overlay");
            }
            OpI::RangeStopEarly(n) => {
                let mut visits = 0;
                sut.range(|_, _| {
                    visits += 1;
                    visits <= n
                });
                prop_assert_eq!(visits, (n + 1).min(model.len()));
            }
            OpI::Clear => {
                sut.clear();
                model.clear();
            }
        }

        // Post-conditions after each op
        // 1) Snapshot without overlay means the overlay is empty.
        if !sut.is_amended() {
            prop_assert_eq!(sut.overlay_len(), 0);
        } else {
            // 2) An amended overlay links every live key.
            prop_assert!(sut.overlay_len() >= model.len());
        }
    }
    // Size checks walk (and so promote) the map; only do them at the end.
    prop_assert_eq!(sut.len(), model.len());
    prop_assert_eq!(sut.is_empty(), model.is_empty());
    Ok(())
}

// Property: State-machine equivalence against std::collections::HashMap.
// Invariants exercised across random operation sequences:
// - Every operation's return value matches the model.
// - `load_or_store_with` runs its initialiser only when it stores.
// - `range` visits each live entry exactly once and leaves no overlay behind.
// - Overlay bookkeeping stays consistent through promotions and expunges.
proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]
    #[test]
    fn prop_state_machine((pool, ops) in arb_scenario()) {
        run_scenario(ConcurrentMap::new(), &pool, ops)?;
    }
}

// Collision variant using a constant hasher to stress equality resolution.
#[derive(Clone, Default)]
struct ConstBuildHasher;
struct ConstHasher;
impl BuildHasher for ConstBuildHasher {
    type Hasher = ConstHasher;
    fn build_hasher(&self) -> Self::Hasher {
        ConstHasher
    }
}
impl Hasher for ConstHasher {
    fn write(&mut self, _bytes: &[u8]) {}
    fn finish(&self) -> u64 {
        0
    }
}

// Property: Same invariants under worst-case collision behavior.
proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]
    #[test]
    fn prop_state_machine_with_collisions((pool, ops) in arb_scenario()) {
        run_scenario(ConcurrentMap::with_hasher(ConstBuildHasher), &pool, ops)?;
    }
}

