//! Entry: an atomically replaceable value slot shared by both map views.
//!
//! A slot is always one of three states:
//! - `Value(v)`: the key is present with value `v`.
//! - `Deleted`: the key is absent; the entry may still be reachable from
//!   the committed snapshot and from the overlay.
//! - `Expunged`: the key is absent and the entry was left out of the
//!   overlay when it was rebuilt. Only a lock holder may move a slot out of
//!   this state, because doing so must also re-link the entry into the
//!   overlay.
//!
//! Every transition is a pointer CAS on an `ArcSwap`, so readers never see a
//! half-written value. The guard held across a CAS keeps the expected `Arc`
//! alive, so its address cannot be recycled underneath the comparison.

use arc_swap::ArcSwap;
use std::sync::Arc;

#[derive(Debug)]
pub(crate) enum Slot<V> {
    Value(V),
    Deleted,
    Expunged,
}

impl<V> Slot<V> {
    #[inline]
    pub(crate) fn value(&self) -> Option<&V> {
        match self {
            Slot::Value(v) => Some(v),
            Slot::Deleted | Slot::Expunged => None,
        }
    }

    #[inline]
    fn is_expunged(&self) -> bool {
        matches!(self, Slot::Expunged)
    }
}

/// Take the value out of a slot, cloning only if the slot is still shared.
pub(crate) fn into_value<V: Clone>(slot: Arc<Slot<V>>) -> Option<V> {
    match Arc::try_unwrap(slot) {
        Ok(Slot::Value(v)) => Some(v),
        Ok(Slot::Deleted | Slot::Expunged) => None,
        Err(shared) => shared.value().cloned(),
    }
}

/// Result of a lock-free `load_or_store` attempt.
pub(crate) enum TryLoadOrStore<V> {
    /// The slot already held a value; read it once the lock is released.
    Loaded(Arc<Slot<V>>),
    Stored,
    /// The slot is expunged; the caller must retry under the overlay lock.
    Expunged,
}

pub(crate) struct Entry<V> {
    slot: ArcSwap<Slot<V>>,
}

impl<V> Entry<V> {
    #[cfg(test)]
    pub(crate) fn new(value: V) -> Self {
        Self::from_slot(Arc::new(Slot::Value(value)))
    }

    pub(crate) fn from_slot(slot: Arc<Slot<V>>) -> Self {
        Self {
            slot: ArcSwap::new(slot),
        }
    }

    pub(crate) fn load(&self) -> Option<V>
    where
        V: Clone,
    {
        self.slot.load().value().cloned()
    }

    /// Current slot as an owned `Arc`, for callers that hold it across user
    /// code.
    pub(crate) fn snapshot(&self) -> Arc<Slot<V>> {
        self.slot.load_full()
    }

    /// Replace the slot unless it is expunged. Returns the previous slot on
    /// success, or gives `value` back when the entry is expunged.
    pub(crate) fn try_swap(&self, value: Arc<Slot<V>>) -> Result<Arc<Slot<V>>, Arc<Slot<V>>> {
        loop {
            let current = self.slot.load();
            if current.is_expunged() {
                return Err(value);
            }
            let prev = self.slot.compare_and_swap(&*current, Arc::clone(&value));
            if Arc::ptr_eq(&*prev, &*current) {
                return Ok(arc_swap::Guard::into_inner(prev));
            }
        }
    }

    /// Unconditional replace. Caller holds the overlay lock and has already
    /// un-expunged the entry.
    pub(crate) fn swap_locked(&self, value: Arc<Slot<V>>) -> Arc<Slot<V>> {
        self.slot.swap(value)
    }

    /// Move an expunged slot back to `Deleted`. Caller holds the overlay
    /// lock and must re-insert the entry into the overlay when this returns
    /// true.
    pub(crate) fn unexpunge_locked(&self) -> bool {
        let current = self.slot.load();
        if !current.is_expunged() {
            return false;
        }
        // Nothing outside the lock moves a slot out of Expunged, so this
        // exchange cannot fail.
        let prev = self
            .slot
            .compare_and_swap(&*current, Arc::new(Slot::Deleted));
        Arc::ptr_eq(&*prev, &*current)
    }

    /// Turn a `Deleted` slot into `Expunged`. Returns true if the entry is
    /// expunged afterwards. Caller holds the overlay lock.
    pub(crate) fn try_expunge_locked(&self) -> bool {
        loop {
            let current = self.slot.load();
            match &**current {
                Slot::Value(_) => return false,
                Slot::Expunged => return true,
                Slot::Deleted => {
                    let prev = self
                        .slot
                        .compare_and_swap(&*current, Arc::new(Slot::Expunged));
                    if Arc::ptr_eq(&*prev, &*current) {
                        return true;
                    }
                }
            }
        }
    }

    /// Fill a `Deleted` slot with `value`, or report the slot that already
    /// holds a value. Never clones `V`, so it is safe under the lock.
    pub(crate) fn try_load_or_store(&self, value: &Arc<Slot<V>>) -> TryLoadOrStore<V> {
        loop {
            let current = self.slot.load();
            match &**current {
                Slot::Value(_) => {}
                Slot::Expunged => return TryLoadOrStore::Expunged,
                Slot::Deleted => {
                    let prev = self.slot.compare_and_swap(&*current, Arc::clone(value));
                    if Arc::ptr_eq(&*prev, &*current) {
                        return TryLoadOrStore::Stored;
                    }
                    continue;
                }
            }
            return TryLoadOrStore::Loaded(arc_swap::Guard::into_inner(current));
        }
    }

    /// Move a live slot to `Deleted`, returning the slot that held the value.
    pub(crate) fn delete(&self) -> Option<Arc<Slot<V>>> {
        self.delete_if(|_| true)
    }

    /// Move a live slot to `Deleted` if `pred` accepts its value.
    pub(crate) fn delete_if<F>(&self, mut pred: F) -> Option<Arc<Slot<V>>>
    where
        F: FnMut(&V) -> bool,
    {
        let tombstone = Arc::new(Slot::Deleted);
        loop {
            let current = self.slot.load();
            match current.value() {
                Some(v) if pred(v) => {}
                _ => return None,
            }
            let prev = self.slot.compare_and_swap(&*current, Arc::clone(&tombstone));
            if Arc::ptr_eq(&*prev, &*current) {
                return Some(arc_swap::Guard::into_inner(prev));
            }
        }
    }

    /// Replace the value with `new` if `pred` accepts the current value.
    pub(crate) fn compare_and_swap_by<F>(&self, new: V, mut pred: F) -> bool
    where
        F: FnMut(&V) -> bool,
    {
        let fresh = Arc::new(Slot::Value(new));
        loop {
            let current = self.slot.load();
            match current.value() {
                Some(v) if pred(v) => {}
                _ => return false,
            }
            let prev = self.slot.compare_and_swap(&*current, Arc::clone(&fresh));
            if Arc::ptr_eq(&*prev, &*current) {
                return true;
            }
        }
    }
}
