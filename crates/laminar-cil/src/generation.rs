//! # Generation Shard
//!
//! One of the two double-buffered generations of the committed item list.
//!
//! ## Locking
//!
//! ```text
//!   commit (many)                 push (one)
//!        │                            │
//!        ▼                            ▼
//!   ctx_lock.read()             ctx_lock.write()   ← append vs drain
//!        │                            │
//!        ├─ per-core: slot mutex      ├─ cil mutex + every slot mutex
//!        └─ shared:   cil mutex       │
//!        │                            │
//!        ▼                            ▼
//!   space_counter / is_empty     reset space_counter / is_empty
//!   (atomics, no lock)
//! ```
//!
//! The slot mutexes never see contention from the drain side: the drain only
//! touches them while holding `ctx_lock` exclusively, and appenders only
//! touch them while holding it shared.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::CilMode;
use crate::context::{CommitContext, TransactionDelta};
use crate::error::{CilError, CommitRejected};
use crate::space::{bucket_count, ceil_div, crosses_segment, split_reservation, SpaceUpdate};
use crate::store::{CoreLocalStore, PendingList};

/// Where a generation keeps its pending items before a drain.
enum Layout<T, B> {
    /// Everything lives in the unified list.
    Shared,
    /// Items and accounting live in per-core slots until merged.
    PerCore(CoreLocalStore<T, B>),
}

/// Point-in-time counters of one generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GenerationStats {
    /// Generation index (0 or 1).
    pub index: usize,
    /// Atomic updates made to the shared space counter.
    pub space_publishes: u64,
    /// Completed drains.
    pub drains: u64,
    /// Space visible through the shared counter, in bytes.
    pub published_space: i64,
    /// Emptiness flag at the time of the snapshot.
    pub is_empty: bool,
}

/// One generation of the committed item list.
pub struct GenerationShard<T, B> {
    index: usize,
    stride: u32,
    /// Appenders hold it shared, a drain holds it exclusively.
    ctx_lock: RwLock<()>,
    /// Unified list. In shared mode it also carries the lone context.
    cil: Mutex<PendingList<T, B>>,
    layout: Layout<T, B>,
    is_empty: AtomicBool,
    /// Published space, in buckets.
    space_counter: AtomicI64,
    being_drained: AtomicBool,
    space_publishes: AtomicU64,
    drains: AtomicU64,
}

impl<T, B> GenerationShard<T, B> {
    /// Creates an empty generation.
    ///
    /// # Errors
    ///
    /// Returns [`CilError::Allocation`] if per-core storage cannot be allocated.
    pub(crate) fn new(index: usize, mode: CilMode, num_cores: usize) -> Result<Self, CilError> {
        let layout = match mode {
            CilMode::Shared => Layout::Shared,
            CilMode::PerCore { .. } => Layout::PerCore(CoreLocalStore::allocate(num_cores)?),
        };
        Ok(Self {
            index,
            stride: mode.stride(),
            ctx_lock: RwLock::new(()),
            cil: Mutex::new(PendingList::default()),
            layout,
            is_empty: AtomicBool::new(true),
            space_counter: AtomicI64::new(0),
            being_drained: AtomicBool::new(false),
            space_publishes: AtomicU64::new(0),
            drains: AtomicU64::new(0),
        })
    }

    /// Returns the generation index.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns true if items are staged per core.
    #[must_use]
    pub fn is_per_core(&self) -> bool {
        matches!(self.layout, Layout::PerCore(_))
    }

    /// Returns the quantization stride.
    #[must_use]
    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Lock-free emptiness snapshot.
    ///
    /// Cleared by the first commit that stages anything after a drain: an
    /// item, a busy extent or a non-zero counter, whether or not it publishes
    /// a bucket. Set again once a drain has taken everything. Only a hint for
    /// deciding whether a push is worth it; see [`Self::is_clear`].
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.is_empty.load(Ordering::Acquire)
    }

    /// Returns true while a drain holds this generation.
    #[must_use]
    pub fn is_being_drained(&self) -> bool {
        self.being_drained.load(Ordering::Acquire)
    }

    /// Space visible through the shared counter, in bytes.
    #[must_use]
    pub fn published_space(&self) -> i64 {
        self.space_counter.load(Ordering::Acquire) << self.stride
    }

    /// Counts the items staged in the unified list and every core slot.
    ///
    /// Takes every lock in turn; meant for diagnostics and tests.
    #[must_use]
    pub fn pending_items(&self) -> usize {
        let local = match &self.layout {
            Layout::Shared => 0,
            Layout::PerCore(store) => store.iter().map(|slot| slot.lock().items.len()).sum(),
        };
        self.cil.lock().items.len() + local
    }

    /// Returns true if nothing is staged in the unified list or any core
    /// slot.
    ///
    /// Unlike [`Self::is_empty`] this inspects the lists themselves, taking
    /// every lock in turn.
    #[must_use]
    pub fn is_clear(&self) -> bool {
        let slots_clear = match &self.layout {
            Layout::Shared => true,
            Layout::PerCore(store) => store.iter().all(|slot| slot.lock().is_clear()),
        };
        slots_clear && self.cil.lock().is_clear()
    }

    /// Returns a snapshot of the generation counters.
    #[must_use]
    pub fn stats(&self) -> GenerationStats {
        GenerationStats {
            index: self.index,
            space_publishes: self.space_publishes.load(Ordering::Relaxed),
            drains: self.drains.load(Ordering::Relaxed),
            published_space: self.published_space(),
            is_empty: self.is_empty(),
        }
    }

    /// Publishes an append of `len` bytes made on top of `space_used` bytes
    /// already accounted on the calling core.
    ///
    /// Only touches the shared counter when the core's bucket count changes.
    /// A shrinking append is subtracted without re-checking emptiness or
    /// segment boundaries.
    pub fn update_space_used(&self, space_used: i64, len: i64, iclog_space: i64) -> SpaceUpdate {
        debug_assert!(iclog_space > 0, "iclog_space must be positive");

        let stride = self.stride;
        let diff = bucket_count(space_used + len, stride) - bucket_count(space_used, stride);
        let mut update = SpaceUpdate::default();

        match diff.cmp(&0) {
            CmpOrdering::Greater => {
                let new_count = self.space_counter.fetch_add(diff, Ordering::AcqRel) + diff;
                self.space_publishes.fetch_add(1, Ordering::Relaxed);
                let cur_space = (new_count - diff) << stride;
                let new_space = new_count << stride;

                if cur_space == 0 {
                    update.first = self.mark_dirty();
                }

                if crosses_segment(cur_space, new_space, iclog_space) {
                    update.split_res = Some(ceil_div(diff << stride, iclog_space));
                }
            }
            CmpOrdering::Less => {
                self.space_counter.fetch_add(diff, Ordering::AcqRel);
                self.space_publishes.fetch_add(1, Ordering::Relaxed);
            }
            CmpOrdering::Equal => {}
        }

        update
    }

    /// Clears the emptiness flag. Returns true for the one caller per epoch
    /// that actually flipped it.
    ///
    /// Only attempts the exchange while the flag still reads set.
    fn mark_dirty(&self) -> bool {
        let flipped = self.is_empty.load(Ordering::Acquire)
            && self
                .is_empty
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
        if flipped {
            tracing::trace!(generation = self.index, "generation dirtied");
        }
        flipped
    }

    /// Enters the generation as an appender.
    pub(crate) fn enter(&self) -> RwLockReadGuard<'_, ()> {
        self.ctx_lock.read()
    }

    /// Stages `delta` on `core_id`.
    ///
    /// The caller proves it entered the generation by passing its guard.
    /// Any split reservation is charged to the shard as `split_res *
    /// op_header_size` bytes. A delta that stages anything reports `first`
    /// if it dirtied the generation, even when it adds no bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CommitRejected`] in per-core mode if `core_id` has no slot.
    /// The delta is handed back untouched.
    pub(crate) fn append(
        &self,
        _entered: &RwLockReadGuard<'_, ()>,
        core_id: usize,
        delta: TransactionDelta<T, B>,
        iclog_space: i64,
        op_header_size: i64,
    ) -> Result<SpaceUpdate, CommitRejected<T, B>> {
        let staged = !delta.is_empty();

        match &self.layout {
            Layout::PerCore(store) => {
                let mut slot = match store.lock_checked(core_id) {
                    Ok(slot) => slot,
                    Err(error) => return Err(CommitRejected { error, delta }),
                };
                let (mut items, acct) = delta.into_parts();
                let len = acct.space_used;
                let before = slot.ctx.space_used;
                slot.items.append(&mut items);
                slot.ctx.absorb(acct);

                let mut update = self.update_space_used(before, len, iclog_space);
                if let Some(split) = update.split_res {
                    slot.ctx.curr_res += split * op_header_size;
                }
                update.first = update.first || (staged && self.mark_dirty());
                Ok(update)
            }
            Layout::Shared => {
                let mut cil = self.cil.lock();
                let (mut items, acct) = delta.into_parts();
                let len = acct.space_used;
                let before = cil.ctx.space_used;
                cil.items.append(&mut items);
                cil.ctx.absorb(acct);

                let split_res = split_reservation(before, len, iclog_space);
                if let Some(split) = split_res {
                    cil.ctx.curr_res += split * op_header_size;
                }

                let first = staged && self.mark_dirty();
                Ok(SpaceUpdate { split_res, first })
            }
        }
    }

    /// Starts draining this generation.
    ///
    /// Waits for in-flight appenders, then keeps new ones out until the
    /// returned guard is dropped.
    ///
    /// # Panics
    ///
    /// Panics if the generation is already being drained. Two drains of the
    /// same generation would double count or lose items.
    pub fn begin_drain(&self) -> DrainGuard<'_, T, B> {
        let already = self.being_drained.swap(true, Ordering::AcqRel);
        assert!(!already, "generation {} is already being drained", self.index);
        let exclusive = self.ctx_lock.write();
        DrainGuard {
            shard: self,
            _exclusive: exclusive,
            released: false,
        }
    }
}

impl<T, B> std::fmt::Debug for GenerationShard<T, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationShard")
            .field("index", &self.index)
            .field("per_core", &self.is_per_core())
            .field("stride", &self.stride)
            .field("is_empty", &self.is_empty())
            .field("published_space", &self.published_space())
            .field("being_drained", &self.is_being_drained())
            .finish_non_exhaustive()
    }
}

/// Exclusive access to a generation for the duration of a drain.
///
/// Dropping the guard readmits appenders.
pub struct DrainGuard<'a, T, B> {
    shard: &'a GenerationShard<T, B>,
    _exclusive: RwLockWriteGuard<'a, ()>,
    /// Set once this guard has cleared `being_drained`. A later drain may
    /// already have raised the flag again.
    released: bool,
}

impl<T, B> DrainGuard<'_, T, B> {
    /// Returns the generation being drained.
    #[must_use]
    pub fn shard(&self) -> &GenerationShard<T, B> {
        self.shard
    }

    /// Merges the generation into `target` using the strategy of its mode.
    pub fn merge(&mut self, target: &mut CommitContext<T, B>) {
        if self.shard.is_per_core() {
            self.merge_percpu(target);
        } else {
            self.merge_shared(target);
        }
    }

    /// Moves the lone shared context into `target`.
    ///
    /// Counters are copied, not added: there is exactly one source. The
    /// unified list itself stays in place; see [`Self::take_items`]. The
    /// generation reads as empty once both are gone.
    ///
    /// # Panics
    ///
    /// Panics if the generation is in per-core mode.
    pub fn merge_shared(&mut self, target: &mut CommitContext<T, B>) {
        assert!(
            !self.shard.is_per_core(),
            "shared merge on per-core generation {}",
            self.shard.index
        );
        let mut cil = self.shard.cil.lock();
        target.assign(cil.ctx.take());
        if cil.items.is_empty() {
            self.shard.is_empty.store(true, Ordering::Release);
        }
    }

    /// Gathers every core slot into the unified list and `target`, then
    /// resets the generation's shared counters.
    ///
    /// # Panics
    ///
    /// Panics if the generation is in shared mode.
    pub fn merge_percpu(&mut self, target: &mut CommitContext<T, B>) {
        let Layout::PerCore(store) = &self.shard.layout else {
            panic!("per-core merge on shared generation {}", self.shard.index);
        };

        {
            let mut cil = self.shard.cil.lock();
            for slot in store.iter() {
                let mut local = slot.lock();
                cil.items.append(&mut local.items);
                target.absorb(local.ctx.take());
            }
        }

        self.shard.space_counter.store(0, Ordering::Release);
        self.shard.is_empty.store(true, Ordering::Release);
        self.release();
    }

    /// Moves the unified list out of the generation.
    pub fn take_items(&mut self) -> Vec<T> {
        let mut cil = self.shard.cil.lock();
        let items = std::mem::take(&mut cil.items);
        if !self.shard.is_per_core() && cil.ctx.is_clear() {
            self.shard.is_empty.store(true, Ordering::Release);
        }
        items
    }

    /// Clears `being_drained`, at most once per guard.
    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.shard.being_drained.store(false, Ordering::Release);
        }
    }
}

impl<T, B> Drop for DrainGuard<'_, T, B> {
    fn drop(&mut self) {
        self.release();
        self.shard.drains.fetch_add(1, Ordering::Relaxed);
    }
}
