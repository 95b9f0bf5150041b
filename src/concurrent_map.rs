//! ConcurrentMap: committed snapshot plus locked overlay, merged on misses.
//!
//! Readers load the committed snapshot through an `ArcSwap` and resolve the
//! key against an immutable `HashMap`. Each snapshot entry owns an atomic
//! value slot, so updating or deleting a key that is already in the snapshot
//! never takes the lock. Keys created since the last promotion live only in
//! the overlay; reaching them costs a lock and counts as a miss. Once the
//! misses add up to the overlay's size, the overlay becomes the next
//! snapshot.
//!
//! While a snapshot is amended, the overlay holds every live snapshot entry
//! as the same `Arc<Entry>`, plus the new keys. Deleted snapshot entries are
//! expunged (left out) when the overlay is rebuilt, which is how deleted keys
//! eventually disappear from the snapshot.

use crate::entry::{into_value, Entry, Slot, TryLoadOrStore};
use crate::reentrancy::DebugReentrancy;
use arc_swap::ArcSwap;
use core::borrow::Borrow;
use core::fmt;
use core::hash::{BuildHasher, Hash};
use hashbrown::HashMap;
use std::collections::hash_map::RandomState;
use std::sync::Arc;
use tracing::trace;

type Entries<K, V, S> = HashMap<K, Arc<Entry<V>>, S>;

struct ReadOnly<K, V, S> {
    map: Arc<Entries<K, V, S>>,
    // The overlay holds keys that `map` does not.
    amended: bool,
}

impl<K, V, S> ReadOnly<K, V, S> {
    fn empty(hasher: S) -> Self {
        Self {
            map: Arc::new(HashMap::with_hasher(hasher)),
            amended: false,
        }
    }
}

struct Overlay<K, V, S> {
    // `None` until the first insert after a promotion.
    map: Option<Entries<K, V, S>>,
    misses: usize,
}

impl<K, V, S> Overlay<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher + Clone,
{
    fn get<Q>(&self, key: &Q) -> Option<&Arc<Entry<V>>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.map.as_ref()?.get(key)
    }

    fn remove<Q>(&mut self, key: &Q) -> Option<Arc<Entry<V>>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.map.as_mut()?.remove(key)
    }

    fn entries_mut(&mut self, hasher: &S) -> &mut Entries<K, V, S> {
        self.map
            .get_or_insert_with(|| HashMap::with_hasher(hasher.clone()))
    }

    fn len(&self) -> usize {
        self.map.as_ref().map_or(0, HashMap::len)
    }
}

/// A hash map safe for concurrent use from many threads without external
/// locking.
///
/// Tuned for keys that are written once and read many times, and for
/// threads working on disjoint key sets. Lookups, updates and deletes of
/// keys that have been promoted into the committed snapshot are lock-free.
///
/// Values are handed out by clone; store `Arc<T>` for large values.
pub struct ConcurrentMap<K, V, S = RandomState> {
    hasher: S,
    read: ArcSwap<ReadOnly<K, V, S>>,
    overlay: DebugReentrancy<Overlay<K, V, S>>,
}

impl<K, V> ConcurrentMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::with_hasher(Default::default())
    }
}

impl<K, V> Default for ConcurrentMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> ConcurrentMap<K, V, S>
where
    K: Eq + Hash + Clone,
    V: Clone,
    S: BuildHasher + Clone + Default,
{
    pub fn with_hasher(hasher: S) -> Self {
        Self {
            read: ArcSwap::from_pointee(ReadOnly::empty(hasher.clone())),
            overlay: DebugReentrancy::new(Overlay {
                map: None,
                misses: 0,
            }),
            hasher,
        }
    }

    /// Value stored for `key`, if any.
    pub fn load<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        {
            let read = self.read.load();
            if let Some(e) = read.map.get(key) {
                return e.load();
            }
            if !read.amended {
                return None;
            }
        }
        self.locate_locked(key)?.load()
    }

    /// Set the value for `key`.
    pub fn store(&self, key: K, value: V) {
        // The previous slot is dropped here, outside the lock.
        let _ = self.swap_slot(key, value);
    }

    /// Set the value for `key` and return the value it replaced, if any.
    pub fn swap(&self, key: K, value: V) -> Option<V> {
        self.swap_slot(key, value).and_then(into_value)
    }

    /// Return the existing value for `key` if present; otherwise store
    /// `value` and return it. The flag is true if the value was loaded.
    pub fn load_or_store(&self, key: K, value: V) -> (V, bool) {
        let fresh = Arc::new(Slot::Value(value));
        {
            let read = self.read.load();
            if let Some(e) = read.map.get(&key) {
                match e.try_load_or_store(&fresh) {
                    TryLoadOrStore::Loaded(slot) => return Self::present(slot, true),
                    TryLoadOrStore::Stored => return Self::present(fresh, false),
                    TryLoadOrStore::Expunged => {}
                }
            }
        }

        let (outcome, retired) = {
            let mut overlay = self.overlay.enter();
            let read = self.read.load();
            if let Some(e) = read.map.get(&key) {
                if e.unexpunge_locked() {
                    overlay
                        .entries_mut(&self.hasher)
                        .insert(key, Arc::clone(e));
                }
                (e.try_load_or_store(&fresh), None)
            } else if let Some(e) = overlay.get(&key).cloned() {
                let outcome = e.try_load_or_store(&fresh);
                (outcome, self.miss_locked(&mut overlay))
            } else {
                let entry = Arc::new(Entry::from_slot(Arc::clone(&fresh)));
                self.insert_locked(&mut overlay, &read, key, entry);
                (TryLoadOrStore::Stored, None)
            }
        };
        drop(retired);

        match outcome {
            TryLoadOrStore::Loaded(slot) => Self::present(slot, true),
            TryLoadOrStore::Stored => Self::present(fresh, false),
            TryLoadOrStore::Expunged => unreachable!("entry is un-expunged under the lock"),
        }
    }

    /// Like `load_or_store`, but builds the value lazily. `default` is not
    /// called when `key` is present on entry; it runs outside every lock,
    /// and its result is dropped if a concurrent store wins the race.
    pub fn load_or_store_with<F>(&self, key: K, default: F) -> (V, bool)
    where
        F: FnOnce() -> V,
    {
        if let Some(v) = self.load(&key) {
            return (v, true);
        }
        self.load_or_store(key, default())
    }

    /// Remove `key` and return the value it held, as one atomic step.
    pub fn load_and_delete<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let old = self.locate_for_delete(key)?.delete()?;
        into_value(old)
    }

    /// Remove `key`.
    pub fn delete<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        if let Some(e) = self.locate_for_delete(key) {
            e.delete();
        }
    }

    /// Replace the value for `key` with `new` if it currently equals `old`.
    pub fn compare_and_swap<Q>(&self, key: &Q, old: &V, new: V) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
        V: PartialEq,
    {
        self.compare_and_swap_by(key, new, |current| current == old)
    }

    /// Replace the value for `key` with `new` if `matches` accepts the
    /// current value. `matches` runs without any lock held and may run more
    /// than once under contention.
    pub fn compare_and_swap_by<Q, F>(&self, key: &Q, new: V, matches: F) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
        F: FnMut(&V) -> bool,
    {
        match self.locate(key) {
            Some(e) => e.compare_and_swap_by(new, matches),
            None => false,
        }
    }

    /// Delete `key` if its value currently equals `old`.
    pub fn compare_and_delete<Q>(&self, key: &Q, old: &V) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
        V: PartialEq,
    {
        self.compare_and_delete_by(key, |current| current == old)
    }

    /// Delete `key` if `matches` accepts its current value.
    pub fn compare_and_delete_by<Q, F>(&self, key: &Q, matches: F) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
        F: FnMut(&V) -> bool,
    {
        match self.locate(key) {
            Some(e) => e.delete_if(matches).is_some(),
            None => false,
        }
    }

    /// Call `visit` for each key and value, stopping when it returns false.
    ///
    /// No lock is held while `visit` runs, so it may call back into the map.
    /// Each key is visited at most once and every key present for the whole
    /// call is visited, but the view is weakly consistent: keys stored or
    /// deleted concurrently, including by `visit` itself, may or may not be
    /// seen. The order is unspecified.
    pub fn range<F>(&self, mut visit: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        let mut read = self.read.load_full();
        if read.amended {
            // Promote first so every key is in one immutable map.
            let (current, retired) = {
                let mut overlay = self.overlay.enter();
                let current = self.read.load_full();
                if current.amended {
                    let (promoted, retired) = self.promote_locked(&mut overlay);
                    (promoted, Some(retired))
                } else {
                    (current, None)
                }
            };
            drop(retired);
            read = current;
        }

        for (k, e) in read.map.iter() {
            let slot = e.snapshot();
            if let Some(v) = slot.value() {
                if !visit(k, v) {
                    break;
                }
            }
        }
    }

    /// Remove every entry. Stores racing with `clear` may survive it.
    pub fn clear(&self) {
        {
            let read = self.read.load();
            if read.map.is_empty() && !read.amended {
                return;
            }
        }
        let (old_read, old_overlay) = {
            let mut overlay = self.overlay.enter();
            overlay.misses = 0;
            let old_read = self
                .read
                .swap(Arc::new(ReadOnly::empty(self.hasher.clone())));
            (old_read, overlay.map.take())
        };
        // Entries and their values drop here, outside the lock.
        drop(old_read);
        drop(old_overlay);
    }

    /// Number of live entries. Walks the map, so this is O(n) and only a
    /// point-in-time estimate under concurrent writes.
    pub fn len(&self) -> usize {
        let mut n = 0;
        self.range(|_, _| {
            n += 1;
            true
        });
        n
    }

    pub fn is_empty(&self) -> bool {
        let mut empty = true;
        self.range(|_, _| {
            empty = false;
            false
        });
        empty
    }

    /// Read a slot known to hold a value. Called with no lock held, since
    /// it may clone `V`.
    fn present(slot: Arc<Slot<V>>, loaded: bool) -> (V, bool) {
        match into_value(slot) {
            Some(v) => (v, loaded),
            None => unreachable!("slot was observed holding a value"),
        }
    }

    /// Entry for `key` wherever it lives. Overlay hits count as misses.
    fn locate<Q>(&self, key: &Q) -> Option<Arc<Entry<V>>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        {
            let read = self.read.load();
            if let Some(e) = read.map.get(key) {
                return Some(Arc::clone(e));
            }
            if !read.amended {
                return None;
            }
        }
        self.locate_locked(key)
    }

    fn locate_locked<Q>(&self, key: &Q) -> Option<Arc<Entry<V>>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let mut overlay = self.overlay.enter();
        let read = self.read.load();
        if let Some(e) = read.map.get(key) {
            return Some(Arc::clone(e));
        }
        if !read.amended {
            return None;
        }
        let found = overlay.get(key).cloned();
        let retired = self.miss_locked(&mut overlay);
        drop(overlay);
        drop(retired);
        found
    }

    /// Like `locate`, but unlinks overlay-only entries so the key is gone
    /// structurally once the caller deletes the slot.
    fn locate_for_delete<Q>(&self, key: &Q) -> Option<Arc<Entry<V>>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        {
            let read = self.read.load();
            if let Some(e) = read.map.get(key) {
                return Some(Arc::clone(e));
            }
            if !read.amended {
                return None;
            }
        }
        let mut overlay = self.overlay.enter();
        let read = self.read.load();
        if let Some(e) = read.map.get(key) {
            return Some(Arc::clone(e));
        }
        if !read.amended {
            return None;
        }
        let found = overlay.remove(key);
        let retired = self.miss_locked(&mut overlay);
        drop(overlay);
        drop(retired);
        found
    }

    fn swap_slot(&self, key: K, value: V) -> Option<Arc<Slot<V>>> {
        let fresh = Arc::new(Slot::Value(value));
        let fresh = {
            let read = self.read.load();
            match read.map.get(&key) {
                Some(e) => match e.try_swap(fresh) {
                    Ok(prev) => return Some(prev),
                    Err(fresh) => fresh,
                },
                None => fresh,
            }
        };

        let mut overlay = self.overlay.enter();
        let read = self.read.load();
        if let Some(e) = read.map.get(&key) {
            if e.unexpunge_locked() {
                overlay
                    .entries_mut(&self.hasher)
                    .insert(key, Arc::clone(e));
            }
            Some(e.swap_locked(fresh))
        } else if let Some(e) = overlay.get(&key) {
            Some(e.swap_locked(fresh))
        } else {
            self.insert_locked(&mut overlay, &read, key, Arc::new(Entry::from_slot(fresh)));
            None
        }
    }

    /// Add a brand-new key to the overlay, first rebuilding the overlay and
    /// flagging the snapshot as amended if this is the first new key since
    /// the last promotion.
    fn insert_locked(
        &self,
        overlay: &mut Overlay<K, V, S>,
        read: &ReadOnly<K, V, S>,
        key: K,
        entry: Arc<Entry<V>>,
    ) {
        if !read.amended {
            self.rebuild_overlay_locked(overlay, read);
            self.read.store(Arc::new(ReadOnly {
                map: Arc::clone(&read.map),
                amended: true,
            }));
        }
        overlay.entries_mut(&self.hasher).insert(key, entry);
    }

    fn rebuild_overlay_locked(&self, overlay: &mut Overlay<K, V, S>, read: &ReadOnly<K, V, S>) {
        if overlay.map.is_some() {
            return;
        }
        let mut map = HashMap::with_capacity_and_hasher(read.map.len(), self.hasher.clone());
        let mut expunged = 0usize;
        for (k, e) in read.map.iter() {
            if e.try_expunge_locked() {
                expunged += 1;
            } else {
                map.insert(k.clone(), Arc::clone(e));
            }
        }
        trace!(copied = map.len(), expunged, "rebuilt map overlay");
        overlay.map = Some(map);
    }

    /// Count a miss, promoting once misses reach the overlay's size. Returns
    /// the retired snapshot, which the caller drops after unlocking.
    #[must_use]
    fn miss_locked(&self, overlay: &mut Overlay<K, V, S>) -> Option<Arc<ReadOnly<K, V, S>>> {
        overlay.misses += 1;
        if overlay.misses < overlay.len() {
            return None;
        }
        let (_, retired) = self.promote_locked(overlay);
        Some(retired)
    }

    /// Publish the overlay as the new committed snapshot. Returns the new
    /// snapshot and the one it replaced; the replaced one may hold the last
    /// references to expunged keys, so it must be dropped after unlocking.
    fn promote_locked(
        &self,
        overlay: &mut Overlay<K, V, S>,
    ) -> (Arc<ReadOnly<K, V, S>>, Arc<ReadOnly<K, V, S>>) {
        let map = overlay
            .map
            .take()
            .unwrap_or_else(|| HashMap::with_hasher(self.hasher.clone()));
        let misses = core::mem::replace(&mut overlay.misses, 0);
        trace!(entries = map.len(), misses, "promoted map overlay");
        let promoted = Arc::new(ReadOnly {
            map: Arc::new(map),
            amended: false,
        });
        let retired = self.read.swap(Arc::clone(&promoted));
        (promoted, retired)
    }

    #[cfg(test)]
    pub(crate) fn is_amended(&self) -> bool {
        self.read.load().amended
    }

    #[cfg(test)]
    pub(crate) fn overlay_len(&self) -> usize {
        self.overlay.enter().len()
    }
}

impl<K, V, S> fmt::Debug for ConcurrentMap<K, V, S>
where
    K: Eq + Hash + Clone + fmt::Debug,
    V: Clone + fmt::Debug,
    S: BuildHasher + Clone + Default,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_map();
        self.range(|k, v| {
            out.entry(k, v);
            true
        });
        out.finish()
    }
}

impl<K, V, S> FromIterator<(K, V)> for ConcurrentMap<K, V, S>
where
    K: Eq + Hash + Clone,
    V: Clone,
    S: BuildHasher + Clone + Default,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let m = Self::with_hasher(S::default());
        for (k, v) in iter {
            m.store(k, v);
        }
        m
    }
}

impl<K, V, S> Extend<(K, V)> for ConcurrentMap<K, V, S>
where
    K: Eq + Hash + Clone,
    V: Clone,
    S: BuildHasher + Clone + Default,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (k, v) in iter {
            self.store(k, v);
        }
    }
}
