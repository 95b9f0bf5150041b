//! Reservoirs: where released values wait to be handed out again.
//!
//! Each reservoir keeps two generations of values. `primary` receives every
//! release; a drain moves `primary` into `victim` and discards the previous
//! victims, so an unused value survives exactly one drain.
//!
//! Every thread gets its own shard per pool, found through a thread-local
//! registry keyed by pool id. The registry owns the shard; the pool keeps a
//! `Weak` to it so drains and purges reach threads that have gone idle, and
//! the shard's values go away with the thread.
//!
//! Nothing in this module drops a pooled value while the registry is
//! borrowed or a reservoir is locked: evicted values are handed back to the
//! caller, which drops them afterwards. A value's `Drop` may therefore use a
//! pool itself.

use core::any::Any;
use core::cell::RefCell;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
#[derive(Debug)]
pub(crate) struct Reservoir<T> {
    primary: Vec<T>,
    victim: Vec<T>,
}

impl<T> Reservoir<T> {
    pub(crate) const fn new() -> Self {
        Self {
            primary: Vec::new(),
            victim: Vec::new(),
        }
    }

    #[inline]
    pub(crate) fn pop_primary(&mut self) -> Option<T> {
        self.primary.pop()
    }

    #[inline]
    pub(crate) fn pop_victim(&mut self) -> Option<T> {
        self.victim.pop()
    }

    /// Keep `value` unless `primary` already holds `capacity` values, in
    /// which case it is handed back.
    #[inline]
    pub(crate) fn push(&mut self, value: T, capacity: usize) -> Option<T> {
        if self.primary.len() >= capacity {
            return Some(value);
        }
        self.primary.push(value);
        None
    }

    /// Age one generation. Returns the victims that fell off the end.
    pub(crate) fn demote(&mut self) -> Vec<T> {
        let fresh = core::mem::take(&mut self.primary);
        core::mem::replace(&mut self.victim, fresh)
    }

    /// Empty both generations. Returns everything that was held.
    pub(crate) fn take_all(&mut self) -> Vec<T> {
        let mut all = core::mem::take(&mut self.primary);
        all.append(&mut self.victim);
        all
    }

    pub(crate) fn len(&self) -> usize {
        self.primary.len() + self.victim.len()
    }
}

/// One thread's reservoir for one pool. Only its owning thread pushes and
/// pops; the pool locks it from elsewhere to drain or purge.
pub(crate) type Shard<T> = Mutex<Reservoir<T>>;

struct LocalSlot {
    // Dead once the owning pool is dropped.
    owner: Weak<()>,
    shard: Box<dyn Any>,
}

thread_local! {
    static REGISTRY: RefCell<HashMap<u64, LocalSlot>> = RefCell::new(HashMap::new());
}

/// The calling thread's shard for pool `pool_id`, creating it on first use.
/// The flag is `true` when the shard was created by this call.
///
/// Returns `None` during thread teardown or from inside another registry
/// access on the same thread.
pub(crate) fn local_shard<T>(pool_id: u64, owner: &Arc<()>) -> Option<(Arc<Shard<T>>, bool)>
where
    T: Send + 'static,
{
    let mut dead: Vec<LocalSlot> = Vec::new();
    let found = REGISTRY
        .try_with(|cell| {
            let mut registry = cell.try_borrow_mut().ok()?;
            let created = !registry.contains_key(&pool_id);
            if created {
                // Clear out slots of pools that no longer exist.
                dead = registry
                    .extract_if(|_, slot| slot.owner.strong_count() == 0)
                    .map(|(_, slot)| slot)
                    .collect();
            }
            let slot = registry.entry(pool_id).or_insert_with(|| LocalSlot {
                owner: Arc::downgrade(owner),
                shard: Box::new(Arc::new(Shard::new(Reservoir::<T>::new()))),
            });
            let shard = slot.shard.downcast_ref::<Arc<Shard<T>>>()?;
            Some((Arc::clone(shard), created))
        })
        .ok()
        .flatten();
    // The registry borrow has ended.
    drop(dead);
    found
}

/// Forget the calling thread's shard for `pool_id`.
pub(crate) fn remove_local(pool_id: u64) {
    let removed = REGISTRY
        .try_with(|cell| {
            cell.try_borrow_mut()
                .ok()
                .and_then(|mut registry| registry.remove(&pool_id))
        })
        .ok()
        .flatten();
    drop(removed);
}
