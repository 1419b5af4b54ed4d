//! Core-local storage: one pending list and context per core.

use parking_lot::{Mutex, MutexGuard};

use crate::context::ShardContext;
use crate::error::CilError;
use crate::padded::CachePadded;

/// Pending items plus the accounting that goes with them.
#[derive(Debug)]
pub struct PendingList<T, B> {
    /// Items in append order.
    pub items: Vec<T>,
    /// Accounting for `items`.
    pub ctx: ShardContext<B>,
}

impl<T, B> Default for PendingList<T, B> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            ctx: ShardContext::default(),
        }
    }
}

impl<T, B> PendingList<T, B> {
    /// Returns true if no item is pending and the context is clear.
    #[must_use]
    pub fn is_clear(&self) -> bool {
        self.items.is_empty() && self.ctx.is_clear()
    }
}

/// Fixed array of per-core pending lists, sized once at initialization.
///
/// Each slot has its own mutex so the array can be shared between threads.
/// With one thread per core the mutex is never contended.
pub struct CoreLocalStore<T, B> {
    slots: Box<[CachePadded<Mutex<PendingList<T, B>>>]>,
}

impl<T, B> CoreLocalStore<T, B> {
    /// Allocates `num_cores` empty slots.
    ///
    /// # Errors
    ///
    /// Returns [`CilError::Allocation`] if the slot array cannot be allocated.
    pub fn allocate(num_cores: usize) -> Result<Self, CilError> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(num_cores)
            .map_err(|source| CilError::Allocation {
                what: "per-core pending lists",
                source,
            })?;
        slots.extend((0..num_cores).map(|_| CachePadded::new(Mutex::new(PendingList::default()))));
        Ok(Self {
            slots: slots.into_boxed_slice(),
        })
    }

    /// Returns the number of core slots.
    #[must_use]
    pub fn num_cores(&self) -> usize {
        self.slots.len()
    }

    /// Locks the slot of `core_id`, checking bounds.
    ///
    /// # Errors
    ///
    /// Returns an error if `core_id >= num_cores`.
    pub fn lock_checked(
        &self,
        core_id: usize,
    ) -> Result<MutexGuard<'_, PendingList<T, B>>, CilError> {
        self.slots
            .get(core_id)
            .map(|slot| slot.lock())
            .ok_or(CilError::InvalidCoreId {
                core_id,
                max_core_id: self.slots.len().saturating_sub(1),
            })
    }

    /// Iterates over every slot in core order.
    pub fn iter(&self) -> impl Iterator<Item = &Mutex<PendingList<T, B>>> {
        self.slots.iter().map(|slot| &**slot)
    }
}

impl<T, B> std::fmt::Debug for CoreLocalStore<T, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreLocalStore")
            .field("num_cores", &self.slots.len())
            .finish_non_exhaustive()
    }
}
