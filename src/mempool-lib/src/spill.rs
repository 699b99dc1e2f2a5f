use crate::pool::MemPool;
use crate::{DRef, FRef, FetchReply, LocalId, PoolError, PoolResult, MEMPOOL_DIR_NAME};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

impl MemPool {
    /// Directory holding this worker's spilled payloads,
    /// `<base>/.mempool/<session>-<worker_id>/`. Files in here belong to
    /// this worker; peers only read them through the locality resolver.
    pub fn session_dir(&self) -> PathBuf {
        let base = self
            .config()
            .base_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        base.join(MEMPOOL_DIR_NAME)
            .join(format!("{}-{}", self.session(), self.worker_id()))
    }

    pub fn default_path(&self, dref: &DRef) -> PathBuf {
        self.session_dir().join(dref.id.to_string())
    }

    /// Write the payload to disk and make that file the canonical copy.
    /// Without `keep_in_memory` the resident payload is released afterwards.
    /// Forwards to the owner when the ref lives elsewhere.
    pub async fn move_to_disk(
        &self,
        dref: &DRef,
        path: Option<PathBuf>,
        keep_in_memory: bool,
    ) -> PoolResult<FRef> {
        if dref.owner != self.worker_id() {
            return self
                .rpc()
                .move_to_disk(dref.owner, *dref, path, keep_in_memory)
                .await;
        }
        let path = path.unwrap_or_else(|| self.default_path(dref));
        let size = {
            let st = self.lock_state();
            st.store
                .lookup(dref.id)
                .ok_or_else(|| PoolError::MissingRef(format!("{} not found", dref)))?
                .size
        };
        if fs::try_exists(&path).await.unwrap_or(false) {
            debug!("mempool: {} already on disk at {}", dref, path.display());
            return Ok(FRef {
                host: self.advertised_ip(),
                file: path,
                size,
            });
        }

        let data = match self.get_local_impl(dref.id, false).await? {
            FetchReply::Payload(data) => data,
            FetchReply::Spilled(_) => {
                return Err(PoolError::Internal("unexpected file reply".to_string()))
            }
        };
        write_payload_file(&path, &data).await?;
        {
            let mut st = self.lock_state();
            st.store.mark_spilled(dref.id, path.clone())?;
            st.file_to_dref.insert(path.clone(), *dref);
            if !keep_in_memory {
                st.store.evict_memory(dref.id)?;
                st.lru.remove(dref.id);
            }
        }
        info!("mempool: moved {} to {}", dref, path.display());
        Ok(FRef {
            host: self.advertised_ip(),
            file: path,
            size,
        })
    }

    /// Like `move_to_disk` but the payload stays resident.
    pub async fn copy_to_disk(&self, dref: &DRef, path: PathBuf) -> PoolResult<FRef> {
        self.move_to_disk(dref, Some(path), true).await
    }

    /// Write a serialized copy for the user without touching the RefState;
    /// neither the canonical file nor size accounting changes.
    pub async fn save_to_disk(&self, dref: &DRef, path: PathBuf) -> PoolResult<FRef> {
        if dref.owner != self.worker_id() {
            return self.rpc().save_to_disk(dref.owner, *dref, path).await;
        }
        let size = {
            let st = self.lock_state();
            st.store
                .lookup(dref.id)
                .ok_or_else(|| PoolError::MissingRef(format!("{} not found", dref)))?
                .size
        };
        let data = match self.get_local_impl(dref.id, false).await? {
            FetchReply::Payload(data) => data,
            FetchReply::Spilled(_) => {
                return Err(PoolError::Internal("unexpected file reply".to_string()))
            }
        };
        write_payload_file(&path, &data).await?;
        info!("mempool: saved {} to {}", dref, path.display());
        Ok(FRef {
            host: self.advertised_ip(),
            file: path,
            size,
        })
    }

    /// Remove an on-disk copy. With no explicit path the canonical file
    /// (falling back to the default spill path) is the target.
    pub async fn delete_from_disk(&self, dref: &DRef, path: Option<PathBuf>) -> PoolResult<()> {
        if dref.owner != self.worker_id() {
            return self.rpc().delete_from_disk(dref.owner, *dref, path).await;
        }
        let (target, was_canonical) = {
            let st = self.lock_state();
            let state = st
                .store
                .lookup(dref.id)
                .ok_or_else(|| PoolError::MissingRef(format!("{} not found", dref)))?;
            let target = path
                .or_else(|| state.file.clone())
                .unwrap_or_else(|| self.default_path(dref));
            let was_canonical = state.file.as_deref() == Some(target.as_path());
            (target, was_canonical)
        };
        remove_file_idempotent(&target).await?;
        if was_canonical {
            let mut st = self.lock_state();
            if let Err(e) = st.store.clear_file(dref.id) {
                debug!("mempool: {} vanished during delete_from_disk: {}", dref, e);
            }
            st.file_to_dref.remove(&target);
        }
        Ok(())
    }

    pub async fn set_destroy_on_evict(&self, dref: &DRef, flag: bool) -> PoolResult<()> {
        if dref.owner != self.worker_id() {
            return self.rpc().set_destroy_on_evict(dref.owner, *dref, flag).await;
        }
        self.lock_state().store.set_destroy_on_evict(dref.id, flag)
    }

    /// Make room for `incoming` bytes under the advisory memory cap. Victims
    /// go in least-recently-touched order: destroy-on-evict refs are
    /// destroyed, the rest are spilled when spilling is enabled and stay
    /// resident otherwise. Without a cap this is a no-op.
    pub(crate) async fn lru_free(&self, incoming: u64, protect: Option<LocalId>) -> PoolResult<()> {
        let Some(cap) = self.config().max_memsize else {
            return Ok(());
        };
        enum Evict {
            Destroy(DRef),
            Spill(DRef),
        }
        let mut skip: HashSet<LocalId> = protect.into_iter().collect();
        loop {
            let action = {
                let st = self.lock_state();
                if st.lru.mem_used().saturating_add(incoming) <= cap {
                    break;
                }
                let Some(id) = st.lru.victim(&skip) else {
                    warn!(
                        "mempool: memory cap {} exceeded with nothing evictable",
                        cap
                    );
                    break;
                };
                let Some(state) = st.store.lookup(id) else {
                    skip.insert(id);
                    continue;
                };
                let dref = DRef {
                    owner: self.worker_id(),
                    id,
                    size: state.size,
                };
                if state.destroy_on_evict {
                    Evict::Destroy(dref)
                } else if self.config().spill_to_disk {
                    Evict::Spill(dref)
                } else {
                    skip.insert(id);
                    continue;
                }
            };
            match action {
                Evict::Destroy(dref) => {
                    info!("mempool: evicting {} (destroy on evict)", dref);
                    self.delete_local(&dref)?;
                }
                Evict::Spill(dref) => {
                    info!("mempool: spilling {} under memory pressure", dref);
                    skip.insert(dref.id);
                    self.move_to_disk(&dref, None, false).await?;
                }
            }
        }
        Ok(())
    }

    /// Purge this worker. Every local id is destroyed and the session
    /// directory removed, after pending notices drain.
    pub async fn cleanup(&self) -> PoolResult<()> {
        self.flush_notices().await;
        {
            let mut st = self.lock_state();
            for id in st.store.keys() {
                self.destroy_locked(&mut st, id);
            }
            st.counters.clear_populations();
            st.file_to_dref.clear();
            st.who_has_read.clear();
            st.lru.clear();
        }
        let dir = self.session_dir();
        if let Err(e) = fs::remove_dir_all(&dir).await {
            if e.kind() != ErrorKind::NotFound {
                warn!("mempool: cleanup of {} failed: {}", dir.display(), e);
                return Err(PoolError::IoError(e.to_string()));
            }
        }
        info!("mempool: worker {} cleaned up", self.worker_id());
        Ok(())
    }
}

/// Write the payload through a temp file so readers never observe a partial
/// write; the canonical path appears only after the rename.
async fn write_payload_file(path: &Path, data: &[u8]) -> PoolResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(|e| {
            warn!("mempool: create dir {} failed: {}", parent.display(), e);
            PoolError::IoError(e.to_string())
        })?;
    }
    let tmp = tmp_path(path);
    fs::write(&tmp, data).await.map_err(|e| {
        warn!("mempool: write of {} failed: {}", tmp.display(), e);
        PoolError::IoError(e.to_string())
    })?;
    fs::rename(&tmp, path).await.map_err(|e| {
        warn!("mempool: rename to {} failed: {}", path.display(), e);
        PoolError::IoError(e.to_string())
    })?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut raw = path.as_os_str().to_os_string();
    raw.push(".tmp");
    PathBuf::from(raw)
}

pub(crate) async fn remove_file_idempotent(path: &Path) -> PoolResult<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => {
            warn!("mempool: remove of {} failed: {}", path.display(), e);
            Err(PoolError::IoError(e.to_string()))
        }
    }
}
