use crate::{DRef, PoolError, PoolResult, RefKey};
use std::collections::HashMap;

/// Two-level distributed reference counter.
///
/// `local_holders` lives on every worker and counts live materializations of
/// a ref at that worker. `owner_populations` lives on the owning worker only
/// and counts how many distinct workers currently hold the ref. A worker
/// notifies the owner on its first holder and again when its last holder
/// goes away, so local duplication never fans out to the owner.
#[derive(Default)]
pub struct RefCounter {
    local_holders: HashMap<RefKey, u64>,
    owner_populations: HashMap<RefKey, u64>,
}

impl RefCounter {
    /// Count a new materialization at this worker. Returns true on first
    /// sight, when the caller owes the owner a ref notice.
    pub fn materialize(&mut self, dref: &DRef) -> bool {
        let slot = self.local_holders.entry(dref.key()).or_insert(0);
        let first_sight = *slot == 0;
        *slot += 1;
        first_sight
    }

    /// Count a dropped materialization. Returns true when the last local
    /// holder is gone, when the caller owes the owner an unref notice.
    /// Dropping a ref that was never materialized here is a wiring bug.
    pub fn drop_holder(&mut self, dref: &DRef) -> PoolResult<bool> {
        let count = self.local_holders.get_mut(&dref.key()).ok_or_else(|| {
            PoolError::Precondition(format!("unref of {} without a prior ref", dref))
        })?;
        *count -= 1;
        if *count == 0 {
            self.local_holders.remove(&dref.key());
            return Ok(true);
        }
        Ok(false)
    }

    /// Owner-side handler: one more worker holds the ref.
    pub fn ref_at_owner(&mut self, dref: &DRef) {
        *self.owner_populations.entry(dref.key()).or_insert(0) += 1;
    }

    /// Owner-side handler: one worker let go of the ref. Returns true when
    /// the population reached zero and the RefState must be destroyed.
    /// A no-op for ids already gone, so double-deletes stay idempotent.
    pub fn unref_at_owner(&mut self, dref: &DRef) -> bool {
        match self.owner_populations.get_mut(&dref.key()) {
            None => false,
            Some(count) => {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.owner_populations.remove(&dref.key());
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Drop the population entry without waiting for unrefs. Used by the
    /// forced delete path; late unref notices then hit the idempotent no-op.
    pub fn clear_population(&mut self, key: RefKey) {
        self.owner_populations.remove(&key);
    }

    pub fn local_count(&self, key: RefKey) -> u64 {
        self.local_holders.get(&key).copied().unwrap_or(0)
    }

    pub fn population(&self, key: RefKey) -> u64 {
        self.owner_populations.get(&key).copied().unwrap_or(0)
    }

    /// Forget every owner-side population. Holder entries stay so guards
    /// still alive drop through the normal path afterwards.
    pub fn clear_populations(&mut self) {
        self.owner_populations.clear();
    }
}
