use crate::{LocalId, PoolError, PoolResult};
use bytes::Bytes;
use log::warn;
use std::collections::HashMap;
use std::path::PathBuf;

/// Owner-side record for one live local id.
///
/// While the id is live at least one of `data` and `file` is present. `size`
/// never changes after insertion; `file`, once set, is the canonical on-disk
/// copy until it is explicitly deleted.
#[derive(Debug, Clone)]
pub struct RefState {
    pub size: u64,
    pub data: Option<Bytes>,
    pub file: Option<PathBuf>,
    pub destroy_on_evict: bool,
}

impl RefState {
    pub fn in_memory(data: Bytes, size: u64, destroy_on_evict: bool) -> Self {
        Self {
            size,
            data: Some(data),
            file: None,
            destroy_on_evict,
        }
    }

    pub fn is_resident(&self) -> bool {
        self.data.is_some()
    }

    pub fn is_spilled(&self) -> bool {
        self.file.is_some()
    }
}

/// Per-worker map from local id to [`RefState`].
///
/// Every access runs under the pool lock. RefState fields change only through
/// the entry points below; other components never mutate a state directly.
#[derive(Default)]
pub struct DataStore {
    states: HashMap<LocalId, RefState>,
}

impl DataStore {
    pub fn insert(&mut self, id: LocalId, state: RefState) {
        self.states.insert(id, state);
    }

    pub fn lookup(&self, id: LocalId) -> Option<&RefState> {
        self.states.get(&id)
    }

    pub fn remove(&mut self, id: LocalId) -> Option<RefState> {
        self.states.remove(&id)
    }

    pub fn contains(&self, id: LocalId) -> bool {
        self.states.contains_key(&id)
    }

    pub fn keys(&self) -> Vec<LocalId> {
        self.states.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Record `path` as the canonical on-disk copy after a successful write.
    pub fn mark_spilled(&mut self, id: LocalId, path: PathBuf) -> PoolResult<()> {
        let state = self.lookup_mut(id)?;
        state.file = Some(path);
        Ok(())
    }

    /// Drop the in-memory payload. Refused when no on-disk copy exists, the
    /// id would otherwise hold neither representation.
    pub fn evict_memory(&mut self, id: LocalId) -> PoolResult<()> {
        let state = self.lookup_mut(id)?;
        if state.file.is_none() {
            return Err(PoolError::Internal(format!(
                "evict_memory: id {} has no on-disk copy",
                id
            )));
        }
        state.data = None;
        Ok(())
    }

    /// Install a payload read back from disk. Concurrent restores may race;
    /// the payload is immutable so last writer wins.
    pub fn restore_memory(&mut self, id: LocalId, data: Bytes) -> PoolResult<()> {
        let state = self.lookup_mut(id)?;
        state.data = Some(data);
        Ok(())
    }

    /// Forget the on-disk copy after its file was removed.
    pub fn clear_file(&mut self, id: LocalId) -> PoolResult<()> {
        let state = self.lookup_mut(id)?;
        state.file = None;
        if state.data.is_none() {
            warn!("clear_file: id {} now holds neither memory nor disk copy", id);
        }
        Ok(())
    }

    pub fn set_destroy_on_evict(&mut self, id: LocalId, flag: bool) -> PoolResult<()> {
        let state = self.lookup_mut(id)?;
        state.destroy_on_evict = flag;
        Ok(())
    }

    fn lookup_mut(&mut self, id: LocalId) -> PoolResult<&mut RefState> {
        self.states
            .get_mut(&id)
            .ok_or_else(|| PoolError::MissingRef(format!("local id {} not found", id)))
    }
}
