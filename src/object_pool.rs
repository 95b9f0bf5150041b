//! ObjectPool: per-thread reservoirs with a shared overflow and drain-based
//! eviction.

use crate::error::PoolError;
use crate::reservoir::{self, Reservoir, Shard};
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;

/// Sizing and eviction settings for an [`ObjectPool`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Values each thread keeps for itself before spilling to the shared
    /// reservoir.
    pub local_capacity: usize,
    /// Values the shared reservoir keeps before discarding releases.
    pub shared_capacity: usize,
    /// Period for [`DrainTask::from_config`](crate::DrainTask::from_config).
    /// `None` means drains happen only when requested.
    pub drain_interval: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            local_capacity: 32,
            shared_capacity: 1024,
            drain_interval: None,
        }
    }
}

impl PoolConfig {
    pub fn local_capacity(mut self, n: usize) -> Self {
        self.local_capacity = n;
        self
    }

    pub fn shared_capacity(mut self, n: usize) -> Self {
        self.shared_capacity = n;
        self
    }

    pub fn drain_interval(mut self, every: Duration) -> Self {
        self.drain_interval = Some(every);
        self
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        if self.local_capacity == 0 && self.shared_capacity == 0 {
            return Err(PoolError::NoCapacity);
        }
        if self.drain_interval.is_some_and(|d| d.is_zero()) {
            return Err(PoolError::ZeroInterval);
        }
        Ok(())
    }
}

/// A cache of released values that threads can reuse instead of
/// allocating.
///
/// `put` parks a value in the calling thread's own reservoir, spilling to a
/// shared reservoir when that is full; `get` prefers the thread's own values
/// and then the shared ones. Values carry no identity: whoever asks next gets
/// whatever is available. Anything left unused across two
/// [`drain`](ObjectPool::drain) calls is discarded.
///
/// ```
/// use nsync::ObjectPool;
///
/// let pool = ObjectPool::with_factory(|| Vec::<u8>::with_capacity(4096));
/// let mut buf = pool.get().unwrap();
/// buf.extend_from_slice(b"scratch");
/// buf.clear();
/// pool.put(buf);
/// assert!(pool.get().unwrap().capacity() >= 4096);
/// ```
pub struct ObjectPool<T> {
    id: u64,
    factory: Option<Factory<T>>,
    config: PoolConfig,
    drains: AtomicU64,
    shared: Mutex<Reservoir<T>>,
    // Every thread's shard; the owning thread's registry keeps it alive.
    locals: Mutex<Vec<Weak<Shard<T>>>>,
    // Registry slots hold a `Weak` to this; dead slots get pruned.
    alive: Arc<()>,
}

impl<T: Send + 'static> ObjectPool<T> {
    /// A pool without a factory: `get` returns `None` once it runs dry.
    pub fn new() -> Self {
        Self::from_parts(None, PoolConfig::default())
    }

    /// A pool that calls `factory` whenever it has nothing to hand out.
    pub fn with_factory<F>(factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::from_parts(Some(Box::new(factory)), PoolConfig::default())
    }

    pub fn builder() -> PoolBuilder<T> {
        PoolBuilder {
            config: PoolConfig::default(),
            factory: None,
        }
    }

    fn from_parts(factory: Option<Factory<T>>, config: PoolConfig) -> Self {
        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            factory,
            config,
            drains: AtomicU64::new(0),
            shared: Mutex::new(Reservoir::new()),
            locals: Mutex::new(Vec::new()),
            alive: Arc::new(()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Take a value out of the pool, or make one with the factory.
    ///
    /// Search order: this thread's values, shared values, this thread's
    /// values that survived the last drain, shared ones likewise, then the
    /// factory. `None` means the pool was empty and has no factory.
    pub fn get(&self) -> Option<T> {
        let local = self.local();
        if let Some(v) = local.as_ref().and_then(|l| l.lock().pop_primary()) {
            return Some(v);
        }
        if let Some(v) = self.shared.lock().pop_primary() {
            return Some(v);
        }
        if let Some(v) = local.as_ref().and_then(|l| l.lock().pop_victim()) {
            return Some(v);
        }
        if let Some(v) = self.shared.lock().pop_victim() {
            return Some(v);
        }
        self.factory.as_ref().map(|make| make())
    }

    /// Return a value to the pool for later reuse. If both this thread's
    /// reservoir and the shared reservoir are full, `value` is dropped.
    pub fn put(&self, value: T) {
        let local = self.local();
        let spilled = match &local {
            Some(shard) => shard.lock().push(value, self.config.local_capacity),
            None => Some(value),
        };
        let Some(value) = spilled else {
            return;
        };
        let discarded = self.shared.lock().push(value, self.config.shared_capacity);
        // Dropped after the shared lock is released.
        drop(discarded);
    }

    /// Start a new eviction cycle. Values released before the previous
    /// drain and not reused since are discarded; values released since then
    /// become eligible for discarding at the next drain.
    ///
    /// Every thread's reservoir is drained, including threads that are
    /// blocked or no longer use the pool.
    pub fn drain(&self) {
        let cycle = self.drains.fetch_add(1, Ordering::Relaxed) + 1;
        let mut discarded = self.shared.lock().demote();
        for shard in self.live_shards() {
            discarded.append(&mut shard.lock().demote());
        }
        debug!(
            pool = self.id,
            cycle,
            discarded = discarded.len(),
            "drained object pool"
        );
    }

    /// Discard everything the pool holds, in every thread's reservoir and
    /// the shared one.
    pub fn purge(&self) {
        let mut discarded = self.shared.lock().take_all();
        for shard in self.live_shards() {
            discarded.append(&mut shard.lock().take_all());
        }
        debug!(
            pool = self.id,
            discarded = discarded.len(),
            "purged object pool"
        );
    }

    /// Values currently parked in this thread's reservoir.
    pub fn local_len(&self) -> usize {
        self.local().map_or(0, |shard| shard.lock().len())
    }

    /// Values currently parked in the shared reservoir.
    pub fn shared_len(&self) -> usize {
        self.shared.lock().len()
    }

    /// This thread's shard, or `None` when values should bypass it: a zero
    /// local capacity, or a thread being torn down.
    fn local(&self) -> Option<Arc<Shard<T>>> {
        if self.config.local_capacity == 0 {
            return None;
        }
        let (shard, created) = reservoir::local_shard::<T>(self.id, &self.alive)?;
        if created {
            let mut locals = self.locals.lock();
            locals.retain(|w| w.strong_count() > 0);
            locals.push(Arc::downgrade(&shard));
        }
        Some(shard)
    }

    fn live_shards(&self) -> Vec<Arc<Shard<T>>> {
        let mut locals = self.locals.lock();
        locals.retain(|w| w.strong_count() > 0);
        locals.iter().filter_map(Weak::upgrade).collect()
    }
}

impl<T: Send + 'static> Default for ObjectPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for ObjectPool<T> {
    fn drop(&mut self) {
        // Other threads' registries outlive the pool; empty their shards now.
        let mut held = Vec::new();
        for weak in self.locals.get_mut().drain(..) {
            if let Some(shard) = weak.upgrade() {
                held.append(&mut shard.lock().take_all());
            }
        }
        reservoir::remove_local(self.id);
        drop(held);
    }
}

impl<T> fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPool")
            .field("id", &self.id)
            .field("drains", &self.drains.load(Ordering::Relaxed))
            .field("has_factory", &self.factory.is_some())
            .field("config", &self.config)
            .finish()
    }
}

/// Builder for an [`ObjectPool`] with non-default settings.
pub struct PoolBuilder<T> {
    config: PoolConfig,
    factory: Option<Factory<T>>,
}

impl<T: Send + 'static> PoolBuilder<T> {
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    pub fn local_capacity(mut self, n: usize) -> Self {
        self.config.local_capacity = n;
        self
    }

    pub fn shared_capacity(mut self, n: usize) -> Self {
        self.config.shared_capacity = n;
        self
    }

    pub fn drain_interval(mut self, every: Duration) -> Self {
        self.config.drain_interval = Some(every);
        self
    }

    pub fn factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.factory = Some(Box::new(factory));
        self
    }

    pub fn build(self) -> Result<ObjectPool<T>, PoolError> {
        self.config.validate()?;
        Ok(ObjectPool::from_parts(self.factory, self.config))
    }
}
