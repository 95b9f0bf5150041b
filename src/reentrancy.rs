//! Debug-only reentrancy detector for the overlay lock.
//!
//! The overlay mutex is not reentrant: a thread that calls back into the
//! map while holding it (for example from a `K: Hash` or `K: Eq` impl run
//! during an overlay lookup) would deadlock. In debug builds the detector
//! records which thread holds the lock and panics on a nested acquisition
//! from that same thread. In release builds it compiles to a plain lock.

use core::ops::{Deref, DerefMut};
use parking_lot::{Mutex, MutexGuard};

#[cfg(debug_assertions)]
use core::sync::atomic::{AtomicUsize, Ordering};

#[cfg(debug_assertions)]
fn current_thread_tag() -> usize {
    use core::cell::Cell;
    static NEXT: AtomicUsize = AtomicUsize::new(1);
    thread_local! {
        static TAG: Cell<usize> = const { Cell::new(0) };
    }
    TAG.with(|tag| {
        let t = tag.get();
        if t != 0 {
            return t;
        }
        let t = NEXT.fetch_add(1, Ordering::Relaxed);
        tag.set(t);
        t
    })
}

/// A mutex that remembers its holder in debug builds. Embed it in place of
/// a bare `Mutex` and acquire with `let g = self.overlay.enter();`.
#[derive(Debug)]
pub struct DebugReentrancy<T> {
    lock: Mutex<T>,
    #[cfg(debug_assertions)]
    holder: AtomicUsize,
}

impl<T> DebugReentrancy<T> {
    pub fn new(value: T) -> Self {
        Self {
            lock: Mutex::new(value),
            #[cfg(debug_assertions)]
            holder: AtomicUsize::new(0),
        }
    }

    /// Acquire the lock. In debug builds, panics if the calling thread
    /// already holds it.
    #[inline]
    pub fn enter(&self) -> ReentrancyGuard<'_, T> {
        #[cfg(debug_assertions)]
        {
            let me = current_thread_tag();
            // Only this thread ever stores its own tag, so a match here means
            // we are nested inside our own critical section.
            assert!(
                self.holder.load(Ordering::Relaxed) != me,
                "reentrancy detected: nested entry into locked map overlay"
            );
            let guard = self.lock.lock();
            self.holder.store(me, Ordering::Relaxed);
            ReentrancyGuard {
                guard,
                owner: self,
            }
        }

        #[cfg(not(debug_assertions))]
        {
            ReentrancyGuard {
                guard: self.lock.lock(),
            }
        }
    }
}

/// RAII guard returned by `DebugReentrancy::enter`.
pub struct ReentrancyGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    #[cfg(debug_assertions)]
    owner: &'a DebugReentrancy<T>,
}

impl<T> Deref for ReentrancyGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for ReentrancyGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for ReentrancyGuard<'_, T> {
    fn drop(&mut self) {
        // Runs before `guard` is dropped, so the holder is cleared while the
        // lock is still ours.
        #[cfg(debug_assertions)]
        self.owner.holder.store(0, Ordering::Relaxed);
    }
}
