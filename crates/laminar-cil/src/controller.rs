//! Scale controller: owns both generations and routes by sequence parity.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::config::{CilConfig, CilMode, LogHandle};
use crate::context::{CommitContext, TransactionDelta};
use crate::error::{CilError, CommitRejected};
use crate::generation::{DrainGuard, GenerationShard, GenerationStats};

/// Outcome of one commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitReceipt {
    /// Sequence the items were staged under.
    pub sequence: u64,
    /// Generation index the items landed in.
    pub generation: usize,
    /// True if this commit dirtied an empty generation. The pipeline uses it
    /// to schedule a future push.
    pub first: bool,
    /// Extra log buffer segments the commit spilled into.
    pub split_res: Option<i64>,
}

/// Double-buffered committed item list.
///
/// Generation `sequence & 1` accepts new commits while the other one is
/// either empty or being pushed.
pub struct ScaleController<T, B> {
    generations: [GenerationShard<T, B>; 2],
    sequence: AtomicU64,
    unit_res: i64,
    iclog_space: i64,
    config: CilConfig,
    /// Serializes pushes.
    drain_lock: Mutex<()>,
}

impl<T, B> ScaleController<T, B> {
    /// Builds both generations for the given log.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration or log geometry is invalid, or
    /// if per-core storage cannot be allocated. Nothing is left behind on
    /// failure.
    pub fn initialize<L: LogHandle + ?Sized>(log: &L, config: CilConfig) -> Result<Self, CilError> {
        config.validate()?;
        let iclog_space = log.iclog_space();
        if iclog_space <= 0 {
            return Err(CilError::InvalidConfig(format!(
                "iclog_space must be > 0, got {iclog_space}"
            )));
        }

        let generations = [
            GenerationShard::new(0, config.mode, config.num_cores)?,
            GenerationShard::new(1, config.mode, config.num_cores)?,
        ];
        let unit_res = log.unit_reservation();

        tracing::info!(
            mode = ?config.mode,
            num_cores = config.num_cores,
            stride = config.mode.stride(),
            unit_res,
            iclog_space,
            "committed item list initialized"
        );

        Ok(Self {
            generations,
            sequence: AtomicU64::new(1),
            unit_res,
            iclog_space,
            config,
            drain_lock: Mutex::new(()),
        })
    }

    /// Releases the controller.
    ///
    /// # Panics
    ///
    /// Panics if either generation still holds items, busy extents or
    /// accounting: they would never reach the log.
    pub fn teardown(self) {
        assert!(
            self.generations.iter().all(GenerationShard::is_clear),
            "committed item list torn down with pending items at sequence {}",
            self.sequence()
        );
        tracing::info!(sequence = self.sequence(), "committed item list torn down");
    }

    /// Generation index for `seq`.
    #[must_use]
    pub fn active_index(seq: u64) -> usize {
        usize::from(seq & 1 == 1)
    }

    /// Returns the current sequence.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    /// Returns the generation selected by `seq`.
    #[must_use]
    pub fn generation(&self, seq: u64) -> &GenerationShard<T, B> {
        &self.generations[Self::active_index(seq)]
    }

    /// Returns the generation currently accepting commits.
    #[must_use]
    pub fn active_generation(&self) -> &GenerationShard<T, B> {
        self.generation(self.sequence())
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &CilConfig {
        &self.config
    }

    /// Returns the storage mode.
    #[must_use]
    pub fn mode(&self) -> CilMode {
        self.config.mode
    }

    /// Returns the number of core slots.
    #[must_use]
    pub fn num_cores(&self) -> usize {
        self.config.num_cores
    }

    /// Returns the quantization stride.
    #[must_use]
    pub fn stride(&self) -> u32 {
        self.config.mode.stride()
    }

    /// Unit reservation read from the log at initialization.
    #[must_use]
    pub fn unit_res(&self) -> i64 {
        self.unit_res
    }

    /// Usable bytes per log buffer segment.
    #[must_use]
    pub fn iclog_space(&self) -> i64 {
        self.iclog_space
    }

    /// Emptiness hint for the generation selected by `seq`.
    #[must_use]
    pub fn is_generation_empty(&self, seq: u64) -> bool {
        self.generation(seq).is_empty()
    }

    /// Returns true if both generations are empty.
    #[must_use]
    pub fn is_everything_empty(&self) -> bool {
        self.generations.iter().all(GenerationShard::is_empty)
    }

    /// Same as [`Self::is_everything_empty`], evaluated while holding the
    /// pipeline's push lock so no push can be mid-flight.
    #[must_use]
    pub fn is_everything_empty_guarded<G>(&self, push_lock: &Mutex<G>) -> bool {
        let _held = push_lock.lock();
        self.is_everything_empty()
    }

    /// Core slot used by [`Self::commit_local`] for the calling thread.
    #[must_use]
    pub fn core_for_current_thread(&self) -> usize {
        fxhash::hash(&std::thread::current().id()) % self.config.num_cores
    }

    /// Stages a transaction on `core_id` in the active generation.
    ///
    /// Blocks while the active generation is being pushed, then retries on
    /// whichever generation is active afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`CommitRejected`] wrapping [`CilError::InvalidCoreId`] in
    /// per-core mode if `core_id` has no slot. Nothing is staged in that
    /// case and the delta comes back with the error.
    pub fn commit(
        &self,
        core_id: usize,
        delta: TransactionDelta<T, B>,
    ) -> Result<CommitReceipt, CommitRejected<T, B>> {
        loop {
            let sequence = self.sequence();
            let generation = self.generation(sequence);
            let entered = generation.enter();
            if self.sequence() != sequence {
                continue;
            }

            let update = generation.append(
                &entered,
                core_id,
                delta,
                self.iclog_space,
                self.config.op_header_size,
            )?;
            return Ok(CommitReceipt {
                sequence,
                generation: generation.index(),
                first: update.first,
                split_res: update.split_res,
            });
        }
    }

    /// Stages a transaction on the slot picked for the calling thread.
    ///
    /// # Errors
    ///
    /// See [`Self::commit`].
    pub fn commit_local(
        &self,
        delta: TransactionDelta<T, B>,
    ) -> Result<CommitReceipt, CommitRejected<T, B>> {
        self.commit(self.core_for_current_thread(), delta)
    }

    /// Takes exclusive drain access to the generation selected by `seq`.
    ///
    /// Low-level entry point for pipelines that drive merges themselves.
    /// Does not advance the sequence.
    ///
    /// # Panics
    ///
    /// Panics if that generation is already being drained.
    pub fn begin_drain(&self, seq: u64) -> DrainGuard<'_, T, B> {
        self.generation(seq).begin_drain()
    }

    /// Drains the shared-mode generation selected by `seq` into `target`,
    /// including its unified list.
    ///
    /// # Panics
    ///
    /// Panics if the controller is in per-core mode or the generation is
    /// already being drained.
    pub fn merge_shared(&self, seq: u64, target: &mut CommitContext<T, B>) {
        let mut drain = self.begin_drain(seq);
        drain.merge_shared(target);
        target.items.append(&mut drain.take_items());
    }

    /// Gathers every core slot of the generation selected by `seq` into
    /// `target`, including the unified list.
    ///
    /// # Panics
    ///
    /// Panics if the controller is in shared mode or the generation is
    /// already being drained.
    pub fn merge_percpu(&self, seq: u64, target: &mut CommitContext<T, B>) {
        let mut drain = self.begin_drain(seq);
        drain.merge_percpu(target);
        target.items.append(&mut drain.take_items());
    }

    /// Drains the active generation and makes the other one active.
    ///
    /// Waits for commits already inside the generation, advances the
    /// sequence, then gathers everything into one commit context.
    pub fn push(&self) -> CommitContext<T, B> {
        let _serialized = self.drain_lock.lock();
        let sequence = self.sequence();
        let generation = self.generation(sequence);

        let mut drain = generation.begin_drain();
        self.sequence.store(sequence + 1, Ordering::Release);

        let mut ctx = CommitContext::new(sequence);
        drain.merge(&mut ctx);
        ctx.items = drain.take_items();
        drop(drain);

        tracing::debug!(
            sequence,
            generation = generation.index(),
            items = ctx.items.len(),
            nvecs = ctx.nvecs,
            space_used = ctx.space_used,
            busy_extents = ctx.busy_extents.len(),
            "pushed generation"
        );
        ctx
    }

    /// Pushes the active generation unless it looks empty.
    pub fn push_if_dirty(&self) -> Option<CommitContext<T, B>> {
        if self.is_generation_empty(self.sequence()) {
            return None;
        }
        Some(self.push())
    }

    /// Returns counters for both generations.
    #[must_use]
    pub fn stats(&self) -> [GenerationStats; 2] {
        [self.generations[0].stats(), self.generations[1].stats()]
    }
}

impl<T, B> std::fmt::Debug for ScaleController<T, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScaleController")
            .field("sequence", &self.sequence())
            .field("mode", &self.config.mode)
            .field("num_cores", &self.config.num_cores)
            .field("unit_res", &self.unit_res)
            .field("generations", &self.generations)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogGeometry;

    const LOG: LogGeometry = LogGeometry::new(2048, 4096);

    fn controller(config: CilConfig) -> ScaleController<u32, u32> {
        ScaleController::initialize(&LOG, config).unwrap()
    }

    fn per_core(num_cores: usize) -> ScaleController<u32, u32> {
        controller(CilConfig::builder().num_cores(num_cores).build().unwrap())
    }

    fn delta(item: u32, len: i64) -> TransactionDelta<u32, u32> {
        TransactionDelta::new().item(item, len, 1).busy(item)
    }

    #[test]
    fn test_initialize() {
        let cil = per_core(4);
        assert_eq!(cil.sequence(), 1);
        assert_eq!(cil.unit_res(), 2048);
        assert_eq!(cil.iclog_space(), 4096);
        assert_eq!(cil.num_cores(), 4);
        assert!(cil.is_generation_empty(0));
        assert!(cil.is_generation_empty(1));
        assert!(cil.is_everything_empty());
        assert_eq!(cil.active_generation().index(), 1);
    }

    #[test]
    fn test_initialize_rejects_bad_geometry() {
        let config = CilConfig::builder().num_cores(1).build().unwrap();
        let result =
            ScaleController::<u32, u32>::initialize(&LogGeometry::new(0, 0), config);
        assert!(matches!(result, Err(CilError::InvalidConfig(_))));
    }

    #[test]
    fn test_initialize_rejects_invalid_config() {
        let config = CilConfig {
            num_cores: 0,
            ..CilConfig::default()
        };
        let result = ScaleController::<u32, u32>::initialize(&LOG, config);
        assert!(matches!(result, Err(CilError::InvalidConfig(_))));
    }

    #[test]
    fn test_active_index_parity() {
        assert_eq!(ScaleController::<u32, u32>::active_index(0), 0);
        assert_eq!(ScaleController::<u32, u32>::active_index(1), 1);
        assert_eq!(ScaleController::<u32, u32>::active_index(2), 0);
        assert_eq!(ScaleController::<u32, u32>::active_index(u64::MAX), 1);
    }

    #[test]
    fn test_commit_reports_first_once() {
        let cil = per_core(2);
        let a = cil.commit(0, delta(1, 64)).unwrap();
        let b = cil.commit(1, delta(2, 64)).unwrap();

        assert!(a.first);
        assert!(!b.first);
        assert_eq!(a.sequence, 1);
        assert_eq!(a.generation, 1);
        assert!(!cil.is_generation_empty(1));
        assert!(cil.is_generation_empty(0));
    }

    #[test]
    fn test_commit_invalid_core() {
        let cil = per_core(2);
        let rejected = cil.commit(2, delta(1, 64)).unwrap_err();
        assert!(matches!(
            rejected.error,
            CilError::InvalidCoreId {
                core_id: 2,
                max_core_id: 1
            }
        ));
        assert!(cil.is_everything_empty());

        // The caller still owns the items and busy extents.
        assert_eq!(rejected.delta.items, vec![1]);
        assert_eq!(rejected.delta.busy_extents, vec![1]);
        assert_eq!(rejected.delta.len, 64);

        let receipt = cil.commit(1, rejected.delta).unwrap();
        assert!(receipt.first);
        let ctx = cil.push();
        assert_eq!(ctx.items, vec![1]);
        assert_eq!(ctx.busy_extents, vec![1]);
        cil.teardown();
    }

    #[test]
    fn test_zero_length_commit_is_pushed() {
        let cil = per_core(1);
        let receipt = cil
            .commit(0, TransactionDelta::new().item(1, 0, 1).busy(77))
            .unwrap();
        assert!(receipt.first);
        assert!(!cil.is_generation_empty(1));
        assert!(!cil.is_everything_empty());

        let ctx = cil.push_if_dirty().unwrap();
        assert_eq!(ctx.items, vec![1]);
        assert_eq!(ctx.busy_extents, vec![77]);
        assert_eq!(ctx.space_used, 0);
        assert!(cil.is_everything_empty());
        cil.teardown();
    }

    #[test]
    fn test_busy_only_shared_commit_is_pushed() {
        let cil = controller(CilConfig::builder().shared().num_cores(1).build().unwrap());
        let receipt = cil
            .commit(0, TransactionDelta::new().busy(88).reservation(100, 8))
            .unwrap();
        assert!(receipt.first);
        assert_eq!(receipt.split_res, None);
        assert!(!cil.is_generation_empty(1));

        let ctx = cil.push_if_dirty().unwrap();
        assert!(ctx.items.is_empty());
        assert_eq!(ctx.busy_extents, vec![88]);
        assert_eq!(ctx.ticket.curr_res, 100);
        assert_eq!(ctx.ticket.unit_res, 8);
        assert!(cil.is_everything_empty());
        cil.teardown();
    }

    #[test]
    fn test_empty_commit_stages_nothing() {
        let cil = per_core(1);
        let receipt = cil.commit(0, TransactionDelta::new()).unwrap();
        assert!(!receipt.first);
        assert!(cil.is_everything_empty());
        assert!(cil.push_if_dirty().is_none());
        cil.teardown();
    }

    /// Fills to just under a segment, shrinks, then grows back across it.
    fn shrink_then_grow(cil: &ScaleController<u32, u32>) {
        let fill = cil
            .commit(0, TransactionDelta::new().item(1, 4090, 1))
            .unwrap();
        assert!(fill.first);
        assert_eq!(fill.split_res, None);

        let shrink = cil.commit(0, TransactionDelta::new().resize(-100)).unwrap();
        assert!(!shrink.first);
        assert_eq!(shrink.split_res, None);

        // 3990 + 110 crosses 4096 again.
        let grow = cil
            .commit(0, TransactionDelta::new().item(2, 110, 1))
            .unwrap();
        assert!(!grow.first);
        assert_eq!(grow.split_res, Some(1));

        let ctx = cil.push();
        assert_eq!(ctx.items, vec![1, 2]);
        assert_eq!(ctx.nvecs, 2);
        assert_eq!(ctx.space_used, 4100);
        assert_eq!(ctx.ticket.curr_res, 12);
        assert!(cil.is_everything_empty());
    }

    #[test]
    fn test_shrink_then_grow_per_core() {
        let cil = per_core(1);
        assert_eq!(cil.stride(), 0);
        shrink_then_grow(&cil);
        assert_eq!(cil.generation(1).published_space(), 0);
        cil.teardown();
    }

    #[test]
    fn test_shrink_then_grow_shared() {
        let cil = controller(CilConfig::builder().shared().num_cores(1).build().unwrap());
        shrink_then_grow(&cil);
        cil.teardown();
    }

    #[test]
    fn test_push_alternates_generations() {
        let cil = per_core(2);

        for round in 0..6_u32 {
            let seq = cil.sequence();
            let receipt = cil.commit(0, delta(round, 32)).unwrap();
            assert_eq!(receipt.generation, ScaleController::<u32, u32>::active_index(seq));

            let ctx = cil.push();
            assert_eq!(ctx.sequence, seq);
            assert_eq!(ctx.items, vec![round]);
            assert_eq!(cil.sequence(), seq + 1);
            assert!(cil.is_generation_empty(seq));
            assert_ne!(cil.active_generation().index(), receipt.generation);
        }

        let stats = cil.stats();
        assert_eq!(stats[0].drains, 3);
        assert_eq!(stats[1].drains, 3);
        cil.teardown();
    }

    #[test]
    fn test_push_empty_generation() {
        let cil = per_core(1);
        assert!(cil.push_if_dirty().is_none());
        assert_eq!(cil.sequence(), 1);

        let ctx = cil.push();
        assert!(ctx.is_empty());
        assert_eq!(cil.sequence(), 2);
    }

    #[test]
    fn test_push_if_dirty() {
        let cil = per_core(1);
        cil.commit(0, delta(9, 10)).unwrap();
        let ctx = cil.push_if_dirty().unwrap();
        assert_eq!(ctx.items, vec![9]);
        assert!(cil.push_if_dirty().is_none());
    }

    #[test]
    fn test_shared_mode_round_trip() {
        let cil = controller(CilConfig::builder().shared().num_cores(1).build().unwrap());
        assert_eq!(cil.mode(), CilMode::Shared);

        let first = cil.commit(0, delta(1, 100)).unwrap();
        let second = cil.commit(7, delta(2, 100)).unwrap();
        assert!(first.first);
        assert!(!second.first);

        let ctx = cil.push();
        assert_eq!(ctx.items, vec![1, 2]);
        assert_eq!(ctx.busy_extents, vec![1, 2]);
        assert_eq!(ctx.space_used, 200);
        assert!(cil.is_everything_empty());
        cil.teardown();
    }

    #[test]
    fn test_controller_merge_entry_points() {
        let shared = controller(CilConfig::builder().shared().num_cores(1).build().unwrap());
        shared.commit(0, delta(5, 10)).unwrap();
        let mut target = CommitContext::new(1);
        shared.merge_shared(1, &mut target);
        assert_eq!(target.items, vec![5]);
        assert_eq!(target.space_used, 10);

        let sharded = per_core(2);
        sharded.commit(1, delta(6, 20)).unwrap();
        let mut target = CommitContext::new(1);
        sharded.merge_percpu(1, &mut target);
        assert_eq!(target.items, vec![6]);
        assert_eq!(target.busy_extents, vec![6]);
        // Merging does not advance the sequence.
        assert_eq!(sharded.sequence(), 1);
        assert!(sharded.is_everything_empty());
    }

    #[test]
    fn test_guarded_emptiness() {
        let cil = per_core(1);
        let push_lock = Mutex::new(0_u64);
        assert!(cil.is_everything_empty_guarded(&push_lock));
        cil.commit(0, delta(1, 1)).unwrap();
        assert!(!cil.is_everything_empty_guarded(&push_lock));
    }

    #[test]
    fn test_commit_local_uses_stable_slot() {
        let cil = per_core(4);
        let core = cil.core_for_current_thread();
        assert!(core < 4);
        assert_eq!(core, cil.core_for_current_thread());
        assert!(cil.commit_local(delta(3, 8)).unwrap().first);
    }

    #[test]
    #[should_panic(expected = "torn down with pending items")]
    fn test_teardown_with_pending_items_panics() {
        let cil = per_core(1);
        cil.commit(0, delta(1, 16)).unwrap();
        cil.teardown();
    }

    #[test]
    #[should_panic(expected = "torn down with pending items")]
    fn test_teardown_with_zero_length_item_panics() {
        let cil = per_core(1);
        cil.commit(0, TransactionDelta::new().item(1, 0, 1)).unwrap();
        cil.teardown();
    }

    #[test]
    fn test_debug_format() {
        let cil = per_core(2);
        let debug_str = format!("{cil:?}");
        assert!(debug_str.contains("ScaleController"));
        assert!(debug_str.contains("sequence"));
    }
}
