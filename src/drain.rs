//! Background thread that drains a pool on a fixed period.

use crate::error::PoolError;
use crate::object_pool::ObjectPool;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// Handle to a thread calling [`ObjectPool::drain`] every `interval`.
///
/// The thread holds only a weak reference: it exits on its own once the
/// pool is dropped. Dropping the handle stops the thread and waits for it.
///
/// ```
/// use nsync::{DrainTask, ObjectPool};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let pool = Arc::new(ObjectPool::<Vec<u8>>::new());
/// let task = DrainTask::spawn(&pool, Duration::from_millis(50)).unwrap();
/// pool.put(Vec::new());
/// task.stop();
/// ```
#[derive(Debug)]
pub struct DrainTask {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl DrainTask {
    pub fn spawn<T: Send + 'static>(
        pool: &Arc<ObjectPool<T>>,
        interval: Duration,
    ) -> Result<Self, PoolError> {
        if interval.is_zero() {
            return Err(PoolError::ZeroInterval);
        }
        let (stop, stopped) = bounded::<()>(0);
        let weak = Arc::downgrade(pool);
        let handle = std::thread::Builder::new()
            .name("nsync-pool-drain".into())
            .spawn(move || {
                debug!(?interval, "pool drain task started");
                loop {
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => match weak.upgrade() {
                            Some(pool) => pool.drain(),
                            None => break,
                        },
                        // Explicit stop or the handle went away.
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("pool drain task stopped");
            })?;
        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    /// Spawn a task using the pool's configured interval, if it has one.
    pub fn from_config<T: Send + 'static>(
        pool: &Arc<ObjectPool<T>>,
    ) -> Result<Option<Self>, PoolError> {
        match pool.config().drain_interval {
            Some(interval) => Self::spawn(pool, interval).map(Some),
            None => Ok(None),
        }
    }

    /// Stop the thread and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Disconnecting wakes the thread out of `recv_timeout`.
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("pool drain task panicked");
            }
        }
    }
}

impl Drop for DrainTask {
    fn drop(&mut self) {
        self.shutdown();
    }
}
