mod config;
mod datastore;
mod dref;
mod locality;
mod loopback;
mod lru;
mod pool;
mod refcount;
mod service;
mod spill;

pub use config::*;
pub use datastore::*;
pub use dref::*;
pub use loopback::*;
pub use pool::*;
pub use refcount::*;
pub use service::*;

#[cfg(test)]
mod pool_tests;

use thiserror::Error;

/// Directory created under the configured base dir for spilled payloads.
pub const MEMPOOL_DIR_NAME: &str = ".mempool";
/// Worker that answers topology queries and keeps the `who_has_read` registry.
pub const DEFAULT_COORDINATOR: crate::WorkerId = 1;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("missing ref: {0}")]
    MissingRef(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("precondition violated: {0}")]
    Precondition(String),
    #[error("invalid parameter: {0}")]
    InvalidParam(String),
    #[error("decode error: {0}")]
    DecodeError(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl PoolError {
    pub fn is_missing_ref(&self) -> bool {
        matches!(self, PoolError::MissingRef(_))
    }
}

pub type PoolResult<T> = Result<T, PoolError>;
