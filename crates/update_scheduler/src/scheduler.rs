use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use region_updates::RegionUpdateQueue;
use scheduler_protocol::{
    Compositor, LevelOfDetail, LodPreferences, NodeId, ProgressListener, ProjectionUpdateListener,
    Rect, SpontaneousJob, UpdateKind,
};
use strokes::{
    LodNUndoAdapter, Lod0ToNStrokeFactory, PostSyncLod0RefreshCallback, PurgeRedoStateCallback,
    StrokeId, StrokeInfo, StrokeJobData, StrokeStrategy, StrokesQueue, SuspendResumeStrokeFactory,
    UndoResult,
};
use worker_pool::{PoolCallbacks, WorkerPool};

use crate::config::{SchedulerConfig, SchedulerConfigError};
use crate::lazy_wait::LazyWaitCondition;

const DEFAULT_PROGRESS_NAME: &str = "Updating...";

/// Front door of the update machinery.
///
/// Owns the worker pool, the stroke queue and the region update queue, and
/// decides after every finished job which queue feeds the pool next.
/// Cloning is cheap and every clone drives the same scheduler.
#[derive(Clone)]
pub struct UpdateScheduler {
    core: Arc<SchedulerCore>,
}

struct SchedulerCore {
    config: RwLock<SchedulerConfig>,
    pool: WorkerPool,
    strokes_queue: Arc<StrokesQueue>,
    updates_queue: RegionUpdateQueue,
    projection_listener: RwLock<Option<Arc<dyn ProjectionUpdateListener>>>,
    progress_listener: RwLock<Option<Arc<dyn ProgressListener>>>,
    processing_blocked: AtomicBool,
    updates_lock_counter: AtomicUsize,
    updates_start_lock: RwLock<()>,
    updates_finished_condition: LazyWaitCondition,
    /// Serializes scheduling passes. Requests that arrive while a pass runs
    /// are folded into one more pass by the owner of this lock.
    pass_lock: Mutex<()>,
    pass_requested: AtomicBool,
    /// Bumped on every requested pass. Drain loops that made no progress
    /// sleep on `queues_changed` until it moves.
    queue_generation: AtomicU64,
    queues_changed: LazyWaitCondition,
}

impl UpdateScheduler {
    pub fn new(
        config: SchedulerConfig,
        compositor: Arc<dyn Compositor>,
    ) -> Result<Self, SchedulerConfigError> {
        config.validate()?;
        let strokes_queue = StrokesQueue::new();
        strokes_queue.set_lod_preferences(config.lod);
        let updates_queue = RegionUpdateQueue::new(compositor, config.region_merge_settings());
        let thread_count = config.thread_count;

        let core = Arc::new_cyclic(|core: &Weak<SchedulerCore>| {
            let callbacks: Weak<dyn PoolCallbacks> = core.clone();
            SchedulerCore {
                config: RwLock::new(config),
                pool: WorkerPool::new(thread_count, callbacks),
                strokes_queue,
                updates_queue,
                projection_listener: RwLock::new(None),
                progress_listener: RwLock::new(None),
                processing_blocked: AtomicBool::new(false),
                updates_lock_counter: AtomicUsize::new(0),
                updates_start_lock: RwLock::new(()),
                updates_finished_condition: LazyWaitCondition::default(),
                pass_lock: Mutex::new(()),
                pass_requested: AtomicBool::new(false),
                queue_generation: AtomicU64::new(0),
                queues_changed: LazyWaitCondition::default(),
            }
        });
        tracing::debug!(thread_count, "update scheduler started");
        Ok(Self { core })
    }

    pub fn set_projection_update_listener(&self, listener: Arc<dyn ProjectionUpdateListener>) {
        *self.core.projection_listener.write() = Some(listener);
    }

    pub fn set_progress_listener(&self, listener: Arc<dyn ProgressListener>) {
        *self.core.progress_listener.write() = Some(listener);
    }

    pub fn config(&self) -> SchedulerConfig {
        self.core.config.read().clone()
    }

    /// Applies new tunables. A changed thread count resizes the pool, which
    /// waits for the running jobs first.
    pub fn update_settings(&self, config: SchedulerConfig) -> Result<(), SchedulerConfigError> {
        config.validate()?;
        let previous = self.config();
        self.core
            .updates_queue
            .update_settings(config.region_merge_settings());
        if previous.lod != config.lod {
            self.core.strokes_queue.set_lod_preferences(config.lod);
        }
        let thread_count = config.thread_count;
        *self.core.config.write() = config;
        if previous.thread_count != thread_count {
            self.set_thread_limit(thread_count);
        } else {
            self.core.process_queues();
        }
        Ok(())
    }

    pub fn start_stroke(&self, strategy: Box<dyn StrokeStrategy>) -> StrokeId {
        let id = self.core.strokes_queue.start_stroke(strategy);
        self.core.process_queues();
        id
    }

    pub fn add_job(&self, id: StrokeId, data: Box<dyn StrokeJobData>) {
        self.core.strokes_queue.add_job(id, data);
        self.core.process_queues();
    }

    pub fn add_mutated_jobs(&self, id: StrokeId, jobs: Vec<Box<dyn StrokeJobData>>) {
        self.core.strokes_queue.add_mutated_jobs(id, jobs);
        self.core.process_queues();
    }

    pub fn end_stroke(&self, id: StrokeId) {
        self.core.strokes_queue.end_stroke(id);
        self.core.process_queues();
    }

    /// Cancels the stroke. Returns `false` when the id is stale.
    pub fn cancel_stroke(&self, id: StrokeId) -> bool {
        let found = self.core.strokes_queue.cancel_stroke(id);
        self.core.process_queues();
        found
    }

    pub fn try_cancel_current_stroke(&self) -> bool {
        let cancelled = self.core.strokes_queue.try_cancel_current_stroke_async();
        self.core.process_queues();
        cancelled
    }

    pub fn try_undo_last_stroke(&self) -> UndoResult {
        let result = self.core.strokes_queue.try_undo_last_stroke_async();
        self.core.process_queues();
        result
    }

    pub fn stroke_info(&self, id: StrokeId) -> Option<StrokeInfo> {
        self.core.strokes_queue.stroke_info(id)
    }

    pub fn update_region(&self, node: NodeId, rects: &[Rect], crop_rect: Rect) {
        self.queue_update(node, rects, crop_rect, UpdateKind::Update);
    }

    /// Like [`Self::update_region`] but the node's own content is not
    /// re-rendered, only the composite above it.
    pub fn update_region_no_filthy(&self, node: NodeId, rects: &[Rect], crop_rect: Rect) {
        self.queue_update(node, rects, crop_rect, UpdateKind::UpdateNoFilthy);
    }

    pub fn full_refresh_async(&self, node: NodeId, rect: Rect, crop_rect: Rect) {
        let level_of_detail = self.current_level_of_detail();
        self.core
            .updates_queue
            .add_full_refresh(node, rect, crop_rect, level_of_detail);
        self.core.process_queues();
    }

    /// Runs a full refresh of `rect` on the pool and returns once it merged.
    /// Everything else is held back meanwhile.
    pub fn full_refresh(&self, node: NodeId, rect: Rect, crop_rect: Rect) {
        let level_of_detail = self.current_level_of_detail();
        let job = self
            .core
            .updates_queue
            .full_refresh_job(node, rect, crop_rect, level_of_detail);

        let need_lock = !self.core.processing_blocked.load(Ordering::Acquire);
        if need_lock {
            self.lock();
        } else {
            tracing::warn!("synchronous full refresh requested under a held scheduler lock");
        }
        {
            let mut pool = self.core.pool.lock();
            assert!(
                pool.is_admissible(&job),
                "synchronous full refresh collides with running work"
            );
            pool.dispatch(job);
        }
        self.core.pool.wait_for_idle();
        if need_lock {
            self.unlock(true);
        }
    }

    pub fn add_spontaneous_job(&self, job: Box<dyn SpontaneousJob>) {
        self.core.updates_queue.add_spontaneous_job(job);
        self.core.process_queues();
    }

    fn queue_update(&self, node: NodeId, rects: &[Rect], crop_rect: Rect, kind: UpdateKind) {
        let level_of_detail = self.current_level_of_detail();
        self.core
            .updates_queue
            .add_update(node, rects, crop_rect, level_of_detail, kind);
        self.core.process_queues();
    }

    /// Stops dispatching and waits for running jobs. Queued work stays queued.
    pub fn lock(&self) {
        self.core.block_processing();
    }

    /// Resumes dispatching. `reset_lod_levels` marks preview caches stale,
    /// as the image was edited behind the scheduler's back.
    pub fn unlock(&self, reset_lod_levels: bool) {
        if reset_lod_levels {
            self.core.strokes_queue.notify_ufo_changed_image();
        }
        self.core.processing_blocked.store(false, Ordering::Release);
        self.core.process_queues();
    }

    /// Lock for callers that only read the image. Pair with `unlock(false)`.
    pub fn immediate_lock_for_read_only(&self) {
        self.core.block_processing();
    }

    /// Drains both queues, then leaves the scheduler locked.
    ///
    /// A stroke that was started but not ended keeps this waiting until its
    /// owner ends or cancels it.
    pub fn barrier_lock(&self) {
        loop {
            let generation = self.core.queue_generation.load(Ordering::SeqCst);
            let dispatched = self.core.pool.dispatched_jobs();
            self.core.processing_blocked.store(false, Ordering::Release);
            self.core.run_passes();
            self.core.block_processing();
            if self.core.queues_empty() {
                break;
            }
            if self.core.pool.dispatched_jobs() == dispatched {
                self.core.wait_for_queue_change(generation);
            }
        }
    }

    /// Locks only if nothing is queued. Leaves the scheduler unlocked and
    /// returns `false` otherwise.
    pub fn try_barrier_lock(&self) -> bool {
        if !self.core.queues_empty() {
            return false;
        }
        self.core.block_processing();
        if !self.core.queues_empty() {
            self.core.processing_blocked.store(false, Ordering::Release);
            self.core.process_queues();
            return false;
        }
        true
    }

    pub fn is_idle(&self) -> bool {
        if self.try_barrier_lock() {
            self.unlock(false);
            return true;
        }
        false
    }

    /// Blocks until both queues are empty and the pool is idle.
    pub fn wait_for_done(&self) {
        if self.core.processing_blocked.load(Ordering::Acquire) {
            tracing::warn!("wait_for_done on a locked scheduler only drains running jobs");
            self.core.pool.wait_for_idle();
            return;
        }
        loop {
            let generation = self.core.queue_generation.load(Ordering::SeqCst);
            let dispatched = self.core.pool.dispatched_jobs();
            self.core.run_passes();
            self.core.pool.wait_for_idle();
            if self.core.queues_empty() {
                break;
            }
            if self.core.pool.dispatched_jobs() == dispatched {
                self.core.wait_for_queue_change(generation);
            }
        }
    }

    /// Holds back new region merges and waits for the running ones.
    /// Nests; every call needs a matching [`Self::unblock_updates`].
    pub fn block_updates(&self) {
        {
            let _start = self.core.updates_start_lock.write();
            self.core.updates_lock_counter.fetch_add(1, Ordering::AcqRel);
        }
        let core = &self.core;
        core.updates_finished_condition
            .wait_until(|| !core.has_updates_running());
    }

    pub fn unblock_updates(&self) {
        let released = self.core.updates_lock_counter.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |count| count.checked_sub(1),
        );
        assert!(released.is_ok(), "unblock_updates without block_updates");
        self.core.process_queues();
    }

    pub fn has_updates_running(&self) -> bool {
        self.core.has_updates_running()
    }

    /// Level of the jobs running now, else the level a stale walker is being
    /// recalculated at, else full resolution.
    pub fn current_level_of_detail(&self) -> LevelOfDetail {
        self.core
            .pool
            .current_level_of_detail()
            .or_else(|| self.core.updates_queue.override_level_of_detail())
            .unwrap_or(LevelOfDetail::FULL_RESOLUTION)
    }

    /// Resizes the pool once the running jobs finished. Queued work stays
    /// queued and runs on the new threads.
    pub fn set_thread_limit(&self, thread_count: usize) {
        assert!(thread_count > 0, "update scheduler needs at least one thread");
        if self.core.processing_blocked.load(Ordering::Acquire) {
            tracing::warn!(thread_count, "thread limit change ignored under a scheduler lock");
            return;
        }
        self.lock();
        self.core.pool.set_thread_limit(thread_count);
        self.core.config.write().thread_count = thread_count;
        self.unlock(false);
    }

    pub fn thread_limit(&self) -> usize {
        self.core.pool.thread_limit()
    }

    pub fn lod_preferences(&self) -> LodPreferences {
        self.core.strokes_queue.lod_preferences()
    }

    pub fn set_lod_preferences(&self, preferences: LodPreferences) {
        self.core.config.write().lod = preferences;
        self.core.strokes_queue.set_lod_preferences(preferences);
        self.core.process_queues();
    }

    pub fn explicit_regenerate_level_of_detail(&self) {
        self.core.strokes_queue.explicit_regenerate_level_of_detail();
        self.core.process_queues();
    }

    /// Starts a new preview range behind a fresh resync stroke, even when
    /// the level did not change.
    pub fn force_reset_lod_and_close_current_lod_range(&self) {
        self.core
            .strokes_queue
            .force_reset_lod_and_close_current_lod_range();
        self.core.process_queues();
    }

    pub fn set_lod0_to_n_stroke_factory(&self, factory: Lod0ToNStrokeFactory) {
        self.core.strokes_queue.set_lod0_to_n_stroke_factory(factory);
    }

    pub fn set_suspend_resume_stroke_factory(&self, factory: SuspendResumeStrokeFactory) {
        self.core
            .strokes_queue
            .set_suspend_resume_stroke_factory(factory);
    }

    pub fn set_post_sync_lod0_refresh_callback(&self, callback: PostSyncLod0RefreshCallback) {
        self.core
            .strokes_queue
            .set_post_sync_lod0_refresh_callback(callback);
    }

    pub fn set_purge_redo_state_callback(&self, callback: PurgeRedoStateCallback) {
        self.core.strokes_queue.set_purge_redo_state_callback(callback);
    }

    /// Undo sink shared by every low-resolution stroke.
    pub fn lodn_post_execution_undo_adapter(&self) -> LodNUndoAdapter {
        self.core.strokes_queue.lodn_undo_adapter()
    }

    /// Runs one scheduling pass now. Normally passes are triggered by the
    /// other calls and by finished jobs.
    pub fn process_queues(&self) {
        self.core.process_queues();
    }
}

impl SchedulerCore {
    fn process_queues(&self) {
        self.queue_generation.fetch_add(1, Ordering::SeqCst);
        self.queues_changed.wake_all();
        self.run_passes();
        self.report_progress();
    }

    fn run_passes(&self) {
        self.wake_up_waiting_threads();
        self.pass_requested.store(true, Ordering::Release);
        loop {
            {
                let Some(_pass) = self.pass_lock.try_lock() else {
                    return;
                };
                self.pass_requested.store(false, Ordering::Release);
                self.run_pass();
            }
            if !self.pass_requested.load(Ordering::Acquire) {
                return;
            }
        }
    }

    fn run_pass(&self) {
        if self.processing_blocked.load(Ordering::Acquire) {
            return;
        }
        if self.strokes_queue.needs_exclusive_access() {
            self.process_strokes();
            if !self.strokes_queue.needs_exclusive_access() {
                self.try_process_updates();
            }
            return;
        }

        let balancing_ratio = self
            .strokes_queue
            .balancing_ratio_override()
            .unwrap_or_else(|| self.config.read().balancing_ratio);
        let strokes_load = balancing_ratio * self.strokes_queue.size_metric() as f64;
        if strokes_load > self.updates_queue.size_metric() as f64 {
            self.process_strokes();
            self.try_process_updates();
        } else {
            self.try_process_updates();
            self.process_strokes();
        }
    }

    fn process_strokes(&self) {
        let mut pool = self.pool.lock();
        let external_jobs_pending = !self.updates_queue.is_empty();
        self.strokes_queue
            .process_queue(&mut pool, external_jobs_pending);
    }

    fn try_process_updates(&self) {
        let _start = self.updates_start_lock.read();
        if self.updates_lock_counter.load(Ordering::Acquire) > 0 {
            return;
        }
        let mut pool = self.pool.lock();
        self.updates_queue.process_queue(&mut pool);
    }

    fn wake_up_waiting_threads(&self) {
        if self.updates_lock_counter.load(Ordering::Acquire) > 0
            && self.updates_finished_condition.is_someone_waiting()
            && !self.has_updates_running()
        {
            self.updates_finished_condition.wake_all();
        }
    }

    fn has_updates_running(&self) -> bool {
        self.pool.snapshot().has_merge_jobs()
    }

    /// Stops new passes, lets a pass already dispatching finish, then waits
    /// for the pool to drain.
    fn block_processing(&self) {
        self.processing_blocked.store(true, Ordering::Release);
        drop(self.pass_lock.lock());
        self.pool.wait_for_idle();
    }

    fn report_progress(&self) {
        let listener = self.progress_listener.read().clone();
        let Some(listener) = listener else {
            return;
        };
        if self.strokes_queue.has_open_strokes() {
            listener.hide();
            return;
        }
        let mut pending = self.strokes_queue.size_metric();
        if pending == 0 {
            pending = self.updates_queue.size_metric();
        }
        let name = self.strokes_queue.current_stroke_name();
        listener.update_progress(pending, name.as_deref().unwrap_or(DEFAULT_PROGRESS_NAME));
    }

    fn wait_for_queue_change(&self, generation: u64) {
        tracing::trace!("drain loop waiting for queued work to change");
        self.queues_changed
            .wait_until(|| self.queue_generation.load(Ordering::SeqCst) != generation);
    }

    fn queues_empty(&self) -> bool {
        self.strokes_queue.is_empty() && self.updates_queue.is_empty()
    }
}

impl PoolCallbacks for SchedulerCore {
    fn region_merged(&self, rect: Rect) {
        let listener = self.projection_listener.read().clone();
        if let Some(listener) = listener {
            listener.on_region_merged(rect);
        }
    }

    fn do_some_useful_work(&self) {
        self.updates_queue.optimize();
    }

    fn spare_slot_appeared(&self) {
        self.process_queues();
    }
}
