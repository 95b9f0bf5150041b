use thiserror::Error;

/// Errors from building an [`ObjectPool`](crate::ObjectPool) or starting its
/// drain task. Pool and map operations themselves never fail.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool has zero local and zero shared capacity and could never keep a value")]
    NoCapacity,

    #[error("drain interval must be greater than zero")]
    ZeroInterval,

    #[error("failed to spawn pool drain thread: {0}")]
    Spawn(#[from] std::io::Error),
}
