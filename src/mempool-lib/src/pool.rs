use crate::lru::LruTracker;
use crate::{
    DRef, DRefGuard, DataStore, FRef, FetchReply, LocalId, MemPoolConfig, PoolError, PoolRef,
    PoolResult, PoolRpc, PoolService, PutOptions, RefCounter, RefState, RpcFault, RpcResult,
    WorkerId,
};
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, error, info, warn};
use once_cell::sync::Lazy;
use rand::RngCore;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{mpsc, oneshot};

/// Process-stable identifier mixed into spill paths so concurrent pool
/// instances on one host never collide in `.mempool/`.
static POOL_SESSION: Lazy<String> = Lazy::new(|| {
    let mut raw = [0u8; 8];
    rand::rng().fill_bytes(&mut raw);
    hex::encode(raw)
});

/// Work handed to the background dispatch task. Ref and unref notices are
/// best effort and never retried; the channel keeps them in the order they
/// became due on this worker.
pub(crate) enum Notice {
    Ref(DRef),
    Unref(DRef),
    RecordRead(PathBuf, DRef),
    RemoveFile(PathBuf),
    Flush(oneshot::Sender<()>),
}

/// Everything guarded by the per-worker lock: the datastore, both counter
/// tables, the file cache, the advisory read registry and the topology
/// cache. The lock is held for map operations only, never across RPC or
/// file I/O.
pub(crate) struct PoolState {
    pub store: DataStore,
    pub counters: RefCounter,
    pub file_to_dref: HashMap<PathBuf, DRef>,
    pub who_has_read: HashMap<PathBuf, Vec<DRef>>,
    pub wrkrips: Option<HashMap<Ipv4Addr, Vec<WorkerId>>>,
    pub lru: LruTracker,
}

/// One worker's slice of the distributed object pool.
pub struct MemPool {
    config: MemPoolConfig,
    advertised_ip: Ipv4Addr,
    rpc: Arc<dyn PoolRpc>,
    state: Mutex<PoolState>,
    next_id: AtomicU64,
    notices: mpsc::UnboundedSender<Notice>,
    weak_self: Weak<MemPool>,
}

impl MemPool {
    /// Build the pool for this worker. Must run inside a tokio runtime; the
    /// owner-notice dispatch task is spawned here.
    pub fn new(config: MemPoolConfig, rpc: Arc<dyn PoolRpc>) -> Arc<Self> {
        let advertised_ip = config
            .external_ip
            .or_else(|| crate::locality::resolve_ipv4(&config.address).ok())
            .unwrap_or(Ipv4Addr::LOCALHOST);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch_notices(rx, rpc.clone(), config.coordinator));
        info!(
            "mempool: worker {} up, session {}, ip {}",
            config.worker_id,
            POOL_SESSION.as_str(),
            advertised_ip
        );
        Arc::new_cyclic(|weak| Self {
            config,
            advertised_ip,
            rpc,
            state: Mutex::new(PoolState {
                store: DataStore::default(),
                counters: RefCounter::default(),
                file_to_dref: HashMap::new(),
                who_has_read: HashMap::new(),
                wrkrips: None,
                lru: LruTracker::default(),
            }),
            next_id: AtomicU64::new(1),
            notices: tx,
            weak_self: weak.clone(),
        })
    }

    pub fn worker_id(&self) -> WorkerId {
        self.config.worker_id
    }

    pub fn session(&self) -> &str {
        POOL_SESSION.as_str()
    }

    pub fn advertised_ip(&self) -> Ipv4Addr {
        self.advertised_ip
    }

    pub(crate) fn config(&self) -> &MemPoolConfig {
        &self.config
    }

    pub(crate) fn rpc(&self) -> &Arc<dyn PoolRpc> {
        &self.rpc
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap()
    }

    fn arc(&self) -> Arc<MemPool> {
        self.weak_self.upgrade().expect("pool already torn down")
    }

    pub(crate) fn send_notice(&self, notice: Notice) {
        if self.notices.send(notice).is_err() {
            warn!("mempool: notice channel closed, owner notification dropped");
        }
    }

    /// Wait until every owner notice queued so far has been dispatched.
    pub async fn flush_notices(&self) {
        let (tx, rx) = oneshot::channel();
        self.send_notice(Notice::Flush(tx));
        let _ = rx.await;
    }

    // ---- materialization protocol ----

    /// Register a DRef decoded from the wire. Transports call this for every
    /// DRef they reconstruct, instead of running the value through `put`
    /// again; the guard arranges the matching drop notification.
    pub fn adopt(&self, dref: DRef) -> DRefGuard {
        DRefGuard::new(self.arc(), dref)
    }

    pub(crate) fn on_materialize(&self, dref: &DRef) {
        {
            let mut st = self.lock_state();
            if !st.counters.materialize(dref) {
                return;
            }
            if dref.owner == self.worker_id() {
                st.counters.ref_at_owner(dref);
                return;
            }
        }
        self.send_notice(Notice::Ref(*dref));
    }

    pub(crate) fn on_drop(&self, dref: &DRef) {
        {
            let mut st = self.lock_state();
            match st.counters.drop_holder(dref) {
                Ok(false) => return,
                Ok(true) => {}
                Err(e) => {
                    // A drop without a prior ref means the guard wiring is
                    // broken somewhere; surface it loudly.
                    error!("mempool: {}", e);
                    debug_assert!(false, "unref without prior ref");
                    return;
                }
            }
            if dref.owner == self.worker_id() {
                if st.counters.unref_at_owner(dref) {
                    self.destroy_locked(&mut st, dref.id);
                }
                return;
            }
        }
        self.send_notice(Notice::Unref(*dref));
    }

    /// Owner-side teardown once the population is gone. Runs exactly once
    /// per id; repeated calls fall through on the absent entry.
    pub(crate) fn destroy_locked(&self, st: &mut PoolState, id: LocalId) {
        let Some(state) = st.store.remove(id) else {
            return;
        };
        st.lru.remove(id);
        let me = self.worker_id();
        st.file_to_dref
            .retain(|_, d| !(d.owner == me && d.id == id));
        if let Some(file) = state.file {
            // Only unlink files this worker wrote itself; a ref loaded from
            // someone's FRef must not take the source file with it.
            if file.starts_with(self.session_dir()) {
                self.send_notice(Notice::RemoveFile(file));
            }
        }
        debug!("mempool: destroyed local id {}", id);
    }

    // ---- put ----

    pub(crate) async fn put_impl(&self, data: Bytes, opts: PutOptions) -> PoolResult<DRef> {
        let size = opts.size.unwrap_or(data.len() as u64);
        self.lru_free(size, None).await?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let dref = DRef {
            owner: self.worker_id(),
            id,
            size,
        };
        let state = RefState {
            size,
            data: Some(data),
            file: opts.file.clone(),
            destroy_on_evict: opts.destroy_on_evict,
        };
        {
            let mut st = self.lock_state();
            st.store.insert(id, state);
            st.lru.insert(id, size);
            if let Some(file) = opts.file.clone() {
                st.file_to_dref.insert(file, dref);
            }
        }
        if let Some(file) = opts.file {
            if self.config.enable_who_has_read {
                if self.config.is_coordinator() {
                    let mut st = self.lock_state();
                    st.who_has_read.entry(file).or_default().push(dref);
                } else {
                    self.send_notice(Notice::RecordRead(file, dref));
                }
            }
        }
        debug!("mempool: put {} ({} bytes)", dref, size);
        Ok(dref)
    }

    /// Publish a value and obtain a guard for it. With a remote `owner` the
    /// payload is shipped there and the returned DRef adopted locally.
    pub async fn put(&self, data: Bytes, opts: PutOptions) -> PoolResult<DRefGuard> {
        let owner = opts.owner.unwrap_or_else(|| self.worker_id());
        if owner != self.worker_id() {
            let mut fwd = opts;
            fwd.owner = None;
            let dref = self.rpc.put(owner, data, fwd).await?;
            return Ok(self.adopt(dref));
        }
        let dref = self.put_impl(data, opts).await?;
        Ok(DRefGuard::new(self.arc(), dref))
    }

    // ---- get ----

    pub async fn get(&self, r: &PoolRef) -> PoolResult<Bytes> {
        match r {
            PoolRef::Obj(dref) => self.get_dref(dref).await,
            PoolRef::File(fref) => self.get_fref(fref).await,
        }
    }

    pub async fn get_dref(&self, dref: &DRef) -> PoolResult<Bytes> {
        if dref.owner == self.worker_id() {
            return match self.get_local_impl(dref.id, false).await? {
                FetchReply::Payload(data) => Ok(data),
                FetchReply::Spilled(_) => Err(PoolError::Internal(
                    "local dereference produced a file reference".to_string(),
                )),
            };
        }
        // Faults re-raise as the owner saw them, so a remote miss reads the
        // same as a local one.
        match self.rpc.get_local(dref.owner, dref.id).await? {
            FetchReply::Payload(data) => Ok(data),
            FetchReply::Spilled(fref) => Box::pin(self.get_fref(&fref)).await,
        }
    }

    pub(crate) async fn get_local_impl(&self, id: LocalId, remote: bool) -> PoolResult<FetchReply> {
        let (data, file, size) = {
            let mut st = self.lock_state();
            let state = st.store.lookup(id).ok_or_else(|| {
                PoolError::MissingRef(format!(
                    "local id {} not found on worker {}",
                    id,
                    self.worker_id()
                ))
            })?;
            let snapshot = (state.data.clone(), state.file.clone(), state.size);
            st.lru.touch(id);
            snapshot
        };

        if remote {
            // Spilled payloads are not re-materialized here just to ship
            // them; the caller pulls the file through a worker on this host.
            if let Some(file) = file {
                return Ok(FetchReply::Spilled(FRef {
                    host: self.advertised_ip,
                    file,
                    size,
                }));
            }
            if let Some(data) = data {
                return Ok(FetchReply::Payload(data));
            }
        } else {
            if let Some(data) = data {
                return Ok(FetchReply::Payload(data));
            }
            if let Some(file) = file {
                // Lazy restore: read outside the lock, install under it.
                // Two racing restores both succeed; last writer wins.
                Box::pin(self.lru_free(size, Some(id))).await?;
                let raw = tokio::fs::read(&file).await.map_err(|e| {
                    warn!(
                        "mempool: restore of id {} from {} failed: {}",
                        id,
                        file.display(),
                        e
                    );
                    PoolError::IoError(e.to_string())
                })?;
                let data = Bytes::from(raw);
                let mut st = self.lock_state();
                st.store.restore_memory(id, data.clone())?;
                st.lru.insert(id, size);
                debug!("mempool: restored id {} from {}", id, file.display());
                return Ok(FetchReply::Payload(data));
            }
        }
        Err(PoolError::Internal(format!(
            "id {} holds neither memory nor disk copy",
            id
        )))
    }

    pub async fn get_fref(&self, fref: &FRef) -> PoolResult<Bytes> {
        let cached = self.lock_state().file_to_dref.get(&fref.file).copied();
        if let Some(dref) = cached {
            if dref.owner == self.worker_id() {
                match self.get_dref(&dref).await {
                    Ok(data) => return Ok(data),
                    Err(PoolError::MissingRef(_)) => {
                        debug!(
                            "mempool: dropping stale file cache entry for {}",
                            fref.file.display()
                        );
                        self.lock_state().file_to_dref.remove(&fref.file);
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let data = if fref.host == self.advertised_ip {
            Bytes::from(tokio::fs::read(&fref.file).await.map_err(|e| {
                warn!("mempool: read of {} failed: {}", fref, e);
                PoolError::IoError(e.to_string())
            })?)
        } else {
            let server = self.worker_at(fref.host).await?;
            debug!("mempool: fetching {} via worker {}", fref, server);
            self.rpc.read_file(server, fref.file.clone()).await?
        };

        let opts = PutOptions {
            size: Some(fref.size),
            file: Some(fref.file.clone()),
            ..Default::default()
        };
        self.put_impl(data.clone(), opts).await?;
        Ok(data)
    }

    // ---- delete ----

    /// Destroy a DRef regardless of its counters, or unlink an FRef's file
    /// and drop its cache entry. Both flavors are idempotent.
    pub async fn delete(&self, r: &PoolRef) -> PoolResult<()> {
        match r {
            PoolRef::Obj(dref) => {
                if dref.owner == self.worker_id() {
                    self.delete_local(dref)
                } else {
                    self.rpc.delete(dref.owner, *dref).await
                }
            }
            PoolRef::File(fref) => self.delete_fref(fref).await,
        }
    }

    pub(crate) fn delete_local(&self, dref: &DRef) -> PoolResult<()> {
        let mut st = self.lock_state();
        st.counters.clear_population(dref.key());
        self.destroy_locked(&mut st, dref.id);
        Ok(())
    }

    async fn delete_fref(&self, fref: &FRef) -> PoolResult<()> {
        if let Some(dref) = self.lock_state().file_to_dref.remove(&fref.file) {
            debug!("mempool: evicted cache entry {} for {}", dref, fref);
        }
        if fref.host == self.advertised_ip {
            crate::spill::remove_file_idempotent(&fref.file).await
        } else {
            let server = self.worker_at(fref.host).await?;
            self.rpc.delete_file(server, fref.file.clone()).await
        }
    }

    // ---- introspection ----

    pub fn local_holders(&self, dref: &DRef) -> u64 {
        self.lock_state().counters.local_count(dref.key())
    }

    pub fn population(&self, dref: &DRef) -> u64 {
        self.lock_state().counters.population(dref.key())
    }

    pub fn contains(&self, id: LocalId) -> bool {
        self.lock_state().store.contains(id)
    }

    pub fn query_ref_state(&self, id: LocalId) -> Option<RefState> {
        self.lock_state().store.lookup(id).cloned()
    }

    pub fn mem_used(&self) -> u64 {
        self.lock_state().lru.mem_used()
    }

    /// Advisory registry of which DRefs were created from a file, kept on
    /// the coordinator. Debug surface only; never consulted by dereference.
    pub fn who_has_read(&self, file: &Path) -> Vec<DRef> {
        self.lock_state()
            .who_has_read
            .get(file)
            .cloned()
            .unwrap_or_default()
    }
}

async fn dispatch_notices(
    mut rx: mpsc::UnboundedReceiver<Notice>,
    rpc: Arc<dyn PoolRpc>,
    coordinator: WorkerId,
) {
    while let Some(notice) = rx.recv().await {
        match notice {
            Notice::Ref(dref) => {
                if let Err(e) = rpc.ref_at_owner(dref.owner, dref).await {
                    warn!("mempool: ref notice for {} lost: {}", dref, e);
                }
            }
            Notice::Unref(dref) => {
                if let Err(e) = rpc.unref_at_owner(dref.owner, dref).await {
                    warn!("mempool: unref notice for {} lost: {}", dref, e);
                }
            }
            Notice::RecordRead(file, dref) => {
                if let Err(e) = rpc.record_read(coordinator, file, dref).await {
                    debug!("mempool: read record for {} lost: {}", dref, e);
                }
            }
            Notice::RemoveFile(path) => {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    debug!(
                        "mempool: spill file {} already gone: {}",
                        path.display(),
                        e
                    );
                }
            }
            Notice::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

#[async_trait]
impl PoolService for MemPool {
    async fn ref_at_owner(&self, dref: DRef) -> RpcResult<()> {
        if dref.owner != self.worker_id() {
            return Err(RpcFault::from(PoolError::InvalidParam(format!(
                "{} is not owned by worker {}",
                dref,
                self.worker_id()
            ))));
        }
        let mut st = self.lock_state();
        if !st.store.contains(dref.id) {
            warn!("mempool: ref notice for unknown {}", dref);
        }
        st.counters.ref_at_owner(&dref);
        Ok(())
    }

    async fn unref_at_owner(&self, dref: DRef) -> RpcResult<()> {
        if dref.owner != self.worker_id() {
            return Err(RpcFault::from(PoolError::InvalidParam(format!(
                "{} is not owned by worker {}",
                dref,
                self.worker_id()
            ))));
        }
        let mut st = self.lock_state();
        if st.counters.unref_at_owner(&dref) {
            self.destroy_locked(&mut st, dref.id);
        }
        Ok(())
    }

    async fn get_local(&self, id: LocalId) -> RpcResult<FetchReply> {
        self.get_local_impl(id, true).await.map_err(Into::into)
    }

    async fn read_file(&self, file: PathBuf) -> RpcResult<Bytes> {
        let raw = tokio::fs::read(&file).await.map_err(|e| {
            warn!("mempool: peer read of {} failed: {}", file.display(), e);
            RpcFault::from(PoolError::IoError(e.to_string()))
        })?;
        Ok(Bytes::from(raw))
    }

    async fn put(&self, data: Bytes, opts: PutOptions) -> RpcResult<DRef> {
        let mut opts = opts;
        opts.owner = None;
        self.put_impl(data, opts).await.map_err(Into::into)
    }

    async fn move_to_disk(
        &self,
        dref: DRef,
        path: Option<PathBuf>,
        keep_in_memory: bool,
    ) -> RpcResult<FRef> {
        self.move_to_disk(&dref, path, keep_in_memory)
            .await
            .map_err(Into::into)
    }

    async fn save_to_disk(&self, dref: DRef, path: PathBuf) -> RpcResult<FRef> {
        self.save_to_disk(&dref, path).await.map_err(Into::into)
    }

    async fn delete_from_disk(&self, dref: DRef, path: Option<PathBuf>) -> RpcResult<()> {
        self.delete_from_disk(&dref, path).await.map_err(Into::into)
    }

    async fn set_destroy_on_evict(&self, dref: DRef, flag: bool) -> RpcResult<()> {
        self.set_destroy_on_evict(&dref, flag).await.map_err(Into::into)
    }

    async fn delete(&self, dref: DRef) -> RpcResult<()> {
        if dref.owner != self.worker_id() {
            return Err(RpcFault::from(PoolError::InvalidParam(format!(
                "{} is not owned by worker {}",
                dref,
                self.worker_id()
            ))));
        }
        self.delete_local(&dref).map_err(Into::into)
    }

    async fn delete_file(&self, file: PathBuf) -> RpcResult<()> {
        crate::spill::remove_file_idempotent(&file)
            .await
            .map_err(Into::into)
    }

    async fn get_wrkrips(&self) -> RpcResult<HashMap<Ipv4Addr, Vec<WorkerId>>> {
        crate::locality::build_wrkrips(&self.config.peers, self.config.enable_random_fref_serve)
            .map_err(Into::into)
    }

    async fn external_ip(&self) -> RpcResult<Ipv4Addr> {
        Ok(self.advertised_ip)
    }

    async fn record_read(&self, file: PathBuf, dref: DRef) -> RpcResult<()> {
        if !self.config.enable_who_has_read {
            return Ok(());
        }
        self.lock_state()
            .who_has_read
            .entry(file)
            .or_default()
            .push(dref);
        Ok(())
    }
}
