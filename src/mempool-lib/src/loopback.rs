use crate::{
    DRef, FRef, FetchReply, LocalId, MemPool, PoolError, PoolResult, PoolRpc, PoolService,
    PutOptions, WorkerId,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// In-process transport: every registered pool is reachable by worker id
/// through direct calls into its service handlers. This is the runtime for
/// single-process clusters and the harness the scenario tests run on; a
/// network transport implements the same [`PoolRpc`] trait.
#[derive(Default)]
pub struct LoopbackNet {
    workers: Mutex<HashMap<WorkerId, Arc<MemPool>>>,
}

impl LoopbackNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, pool: &Arc<MemPool>) {
        self.workers
            .lock()
            .unwrap()
            .insert(pool.worker_id(), pool.clone());
    }

    pub fn unregister(&self, worker: WorkerId) {
        self.workers.lock().unwrap().remove(&worker);
    }

    fn peer(&self, target: WorkerId) -> PoolResult<Arc<MemPool>> {
        self.workers
            .lock()
            .unwrap()
            .get(&target)
            .cloned()
            .ok_or_else(|| PoolError::Transport(format!("worker {} not reachable", target)))
    }
}

#[async_trait]
impl PoolRpc for LoopbackNet {
    async fn ref_at_owner(&self, target: WorkerId, dref: DRef) -> PoolResult<()> {
        let peer = self.peer(target)?;
        PoolService::ref_at_owner(peer.as_ref(), dref)
            .await
            .map_err(PoolError::from)
    }

    async fn unref_at_owner(&self, target: WorkerId, dref: DRef) -> PoolResult<()> {
        let peer = self.peer(target)?;
        PoolService::unref_at_owner(peer.as_ref(), dref)
            .await
            .map_err(PoolError::from)
    }

    async fn get_local(&self, target: WorkerId, id: LocalId) -> PoolResult<FetchReply> {
        let peer = self.peer(target)?;
        PoolService::get_local(peer.as_ref(), id)
            .await
            .map_err(PoolError::from)
    }

    async fn read_file(&self, target: WorkerId, file: PathBuf) -> PoolResult<Bytes> {
        let peer = self.peer(target)?;
        PoolService::read_file(peer.as_ref(), file)
            .await
            .map_err(PoolError::from)
    }

    async fn put(&self, target: WorkerId, data: Bytes, opts: PutOptions) -> PoolResult<DRef> {
        let peer = self.peer(target)?;
        PoolService::put(peer.as_ref(), data, opts)
            .await
            .map_err(PoolError::from)
    }

    async fn move_to_disk(
        &self,
        target: WorkerId,
        dref: DRef,
        path: Option<PathBuf>,
        keep_in_memory: bool,
    ) -> PoolResult<FRef> {
        let peer = self.peer(target)?;
        PoolService::move_to_disk(peer.as_ref(), dref, path, keep_in_memory)
            .await
            .map_err(PoolError::from)
    }

    async fn save_to_disk(&self, target: WorkerId, dref: DRef, path: PathBuf) -> PoolResult<FRef> {
        let peer = self.peer(target)?;
        PoolService::save_to_disk(peer.as_ref(), dref, path)
            .await
            .map_err(PoolError::from)
    }

    async fn delete_from_disk(
        &self,
        target: WorkerId,
        dref: DRef,
        path: Option<PathBuf>,
    ) -> PoolResult<()> {
        let peer = self.peer(target)?;
        PoolService::delete_from_disk(peer.as_ref(), dref, path)
            .await
            .map_err(PoolError::from)
    }

    async fn set_destroy_on_evict(
        &self,
        target: WorkerId,
        dref: DRef,
        flag: bool,
    ) -> PoolResult<()> {
        let peer = self.peer(target)?;
        PoolService::set_destroy_on_evict(peer.as_ref(), dref, flag)
            .await
            .map_err(PoolError::from)
    }

    async fn delete(&self, target: WorkerId, dref: DRef) -> PoolResult<()> {
        let peer = self.peer(target)?;
        PoolService::delete(peer.as_ref(), dref)
            .await
            .map_err(PoolError::from)
    }

    async fn delete_file(&self, target: WorkerId, file: PathBuf) -> PoolResult<()> {
        let peer = self.peer(target)?;
        PoolService::delete_file(peer.as_ref(), file)
            .await
            .map_err(PoolError::from)
    }

    async fn get_wrkrips(
        &self,
        target: WorkerId,
    ) -> PoolResult<HashMap<Ipv4Addr, Vec<WorkerId>>> {
        let peer = self.peer(target)?;
        PoolService::get_wrkrips(peer.as_ref())
            .await
            .map_err(PoolError::from)
    }

    async fn external_ip(&self, target: WorkerId) -> PoolResult<Ipv4Addr> {
        let peer = self.peer(target)?;
        PoolService::external_ip(peer.as_ref())
            .await
            .map_err(PoolError::from)
    }

    async fn record_read(&self, target: WorkerId, file: PathBuf, dref: DRef) -> PoolResult<()> {
        let peer = self.peer(target)?;
        PoolService::record_read(peer.as_ref(), file, dref)
            .await
            .map_err(PoolError::from)
    }
}
