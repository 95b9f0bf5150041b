//! nsync: concurrency primitives for read-mostly maps and reusable
//! objects.
//!
//! Internal Design:
//!
//! Summary
//! - Goal: two independent thread-safe building blocks whose fast paths
//!   take no lock.
//! - Pieces:
//!   - ConcurrentMap<K, V, S>: a committed snapshot, read through an
//!     `ArcSwap`, plus a mutex-guarded overlay of recent changes. Lookups
//!     that miss the snapshot fall back to the overlay and count a miss;
//!     when misses reach the overlay's size the overlay is promoted to be
//!     the next snapshot.
//!   - Entry<V>: the shared per-key cell. Both views point at the same
//!     `Arc<Entry>`, so updates to keys already in the snapshot are single
//!     atomic swaps on the entry's slot.
//!   - ObjectPool<T>: one shard per thread, owned by a thread-local registry
//!     and tracked by the pool through `Weak`s, plus one shared overflow
//!     reservoir. A two-generation victim scheme makes `drain` discard only
//!     values idle for a full cycle, on every thread including idle ones.
//!   - DrainTask: optional background thread that drains a pool on a
//!     fixed period.
//!
//! Constraints
//! - `Send`/`Sync` whenever keys, values, and hashers are.
//! - Values leave the map by clone; store `Arc<T>` for large values.
//! - Pool capacity is bounded per thread and in the shared reservoir;
//!   releases beyond both bounds are dropped.
//!
//! Entry states
//! - A slot holds a value, `Deleted` (key logically absent but still
//!   linked), or `Expunged` (absent from the overlay; must be re-linked
//!   under the lock before reuse). Only the overlay rebuild expunges, and
//!   only under the lock, which is what lets lock-free writers trust the
//!   snapshot.
//!
//! Reentrancy policy
//! - The overlay mutex is held only while `K: Hash`, `K: Eq` or `K: Clone`
//!   may run. A debug-only guard panics if such code re-enters the same
//!   map.
//! - `V: Clone`, range callbacks, `load_or_store_with` initialisers and
//!   compare predicates run without the lock and may use the map freely.
//!   A promotion hands the replaced snapshot back to the caller so it is
//!   dropped after unlocking.
//! - Neither structure drops a user value while holding a lock or the
//!   pool registry borrow, so `Drop` impls may call back in. A pool's
//!   factory also runs with nothing held.
//!
//! Logging
//! - `tracing` events at `trace` for snapshot promotion and overlay
//!   rebuilds, and at `debug` for pool drains, purges, and drain-task
//!   lifecycle. No subscriber is installed by this crate.
//!
//! Notes and non-goals
//! - No ordered iteration and no linearizable snapshot of the whole map.
//! - No per-value identity in the pool: any thread may receive any value.
//! - No automatic eviction unless a `DrainTask` runs or `drain` is called.

mod concurrent_map;
#[cfg(test)]
mod concurrent_map_proptest;
mod drain;
mod entry;
mod error;
mod object_pool;
mod reentrancy;
mod reservoir;

// Public surface
pub use concurrent_map::ConcurrentMap;
pub use drain::DrainTask;
pub use error::PoolError;
pub use object_pool::{ObjectPool, PoolBuilder, PoolConfig};
