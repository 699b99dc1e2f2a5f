use crate::pool::MemPool;
use crate::PoolResult;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

pub type WorkerId = u32;
pub type LocalId = u64;

/// Identity of a distributed ref: the owning worker plus its owner-local id.
pub type RefKey = (WorkerId, LocalId);

/// Distributed handle to a value held by one worker's pool.
///
/// A `DRef` is a plain value and crosses the wire as such. `size` is the
/// advertised byte footprint and is advisory; identity is `(owner, id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DRef {
    pub owner: WorkerId,
    pub id: LocalId,
    pub size: u64,
}

impl DRef {
    pub fn key(&self) -> RefKey {
        (self.owner, self.id)
    }
}

impl fmt::Display for DRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dref({}:{})", self.owner, self.id)
    }
}

/// Handle to a value materialized on disk. Identity is `(host, file)`.
///
/// FRefs are not reference counted; the file stays until someone deletes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FRef {
    pub host: Ipv4Addr,
    pub file: PathBuf,
    pub size: u64,
}

impl fmt::Display for FRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fref({}:{})", self.host, self.file.display())
    }
}

/// Either kind of pool reference, the argument type of `get` and `delete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PoolRef {
    Obj(DRef),
    File(FRef),
}

/// A live materialization of a [`DRef`] on this worker.
///
/// Construction registers the holder with the local counter table (and, on
/// first sight of the ref at this worker, notifies the owner); dropping the
/// guard unregisters it. Cloning the guard is cheap and stays local: only the
/// first appearance and the last disappearance on a worker produce owner
/// traffic. Transports must route every `DRef` decoded from the wire through
/// [`MemPool::adopt`] so the reconstructed value gets a guard here.
pub struct DRefGuard {
    dref: DRef,
    pool: Arc<MemPool>,
}

impl DRefGuard {
    pub(crate) fn new(pool: Arc<MemPool>, dref: DRef) -> Self {
        pool.on_materialize(&dref);
        Self { dref, pool }
    }

    pub fn dref(&self) -> DRef {
        self.dref
    }

    pub fn owner(&self) -> WorkerId {
        self.dref.owner
    }

    pub fn id(&self) -> LocalId {
        self.dref.id
    }

    pub fn size(&self) -> u64 {
        self.dref.size
    }

    /// Dereference through the pool that issued this guard.
    pub async fn get(&self) -> PoolResult<Bytes> {
        self.pool.get_dref(&self.dref).await
    }
}

impl Clone for DRefGuard {
    fn clone(&self) -> Self {
        Self::new(self.pool.clone(), self.dref)
    }
}

impl Drop for DRefGuard {
    fn drop(&mut self) {
        self.pool.on_drop(&self.dref);
    }
}

impl fmt::Debug for DRefGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DRefGuard").field("dref", &self.dref).finish()
    }
}
