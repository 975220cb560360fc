//! Pending dirty-region work for the projection.
//!
//! Incoming invalidations are folded into existing walkers when the union
//! does not amplify the work too much, cut into patches when they are too
//! large, and otherwise turned into fresh walkers. Spontaneous maintenance
//! jobs wait here too and only run when the pool has nothing else to do.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicI16, Ordering};

use parking_lot::Mutex;
use scheduler_protocol::{
    Compositor, LevelOfDetail, MergeWalker, NodeId, Rect, SpontaneousJob, UpdateKind,
};
use worker_pool::{JobCompletion, PoolGuard, PoolJob};

const NO_OVERRIDE: i16 = -1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegionMergeSettings {
    pub patch_width: i32,
    pub patch_height: i32,
    /// Highest union-area to summed-area ratio at which a new rect is folded
    /// into a pending walker.
    pub max_merge_alpha: f64,
    /// Ratio used to sweep further walkers into a walker that just grew.
    pub max_merge_collect_alpha: f64,
    /// Ratio used by the idle-time [`RegionUpdateQueue::optimize`] sweep.
    pub max_collect_alpha: f64,
}

impl Default for RegionMergeSettings {
    fn default() -> Self {
        Self {
            patch_width: 512,
            patch_height: 512,
            max_merge_alpha: 1.0,
            max_merge_collect_alpha: 1.5,
            max_collect_alpha: 2.5,
        }
    }
}

impl RegionMergeSettings {
    /// Grows `base` to include `other` when the union fits one patch and
    /// does not cost more than `max_alpha` times the separate work.
    fn join_rects(&self, base: &mut Rect, other: Rect, max_alpha: f64) -> bool {
        let united = base.united(&other);
        if !united.fits_patch(self.patch_width, self.patch_height) {
            return false;
        }
        let separate_work = base.area() + other.area();
        if separate_work == 0 {
            return false;
        }
        let alpha = united.area() as f64 / separate_work as f64;
        if alpha > max_alpha {
            return false;
        }
        *base = united;
        true
    }
}

struct UpdateQueueState {
    walkers: VecDeque<Box<dyn MergeWalker>>,
    spontaneous_jobs: VecDeque<Box<dyn SpontaneousJob>>,
    settings: RegionMergeSettings,
}

fn same_target(a: &dyn MergeWalker, b: &dyn MergeWalker) -> bool {
    a.start_node() == b.start_node()
        && a.update_kind() == b.update_kind()
        && a.crop_rect() == b.crop_rect()
        && a.level_of_detail() == b.level_of_detail()
}

impl UpdateQueueState {
    fn try_merge_job(
        &mut self,
        node: NodeId,
        rect: Rect,
        crop_rect: Rect,
        level_of_detail: LevelOfDetail,
        update_kind: UpdateKind,
    ) -> bool {
        let mut base_rect = rect;
        let settings = self.settings;
        let candidate = self.walkers.iter().rposition(|walker| {
            walker.is_checksum_valid()
                && walker.start_node() == node
                && walker.update_kind() == update_kind
                && walker.crop_rect() == crop_rect
                && walker.level_of_detail() == level_of_detail
                && settings.join_rects(
                    &mut base_rect,
                    walker.requested_rect(),
                    settings.max_merge_alpha,
                )
        });
        let Some(candidate) = candidate else {
            return false;
        };
        self.collect_jobs(candidate, base_rect, settings.max_merge_collect_alpha);
        true
    }

    /// Absorbs every compatible walker that joins cheaply into the walker at
    /// `base_index`, then re-collects it over the grown rect. Returns the
    /// base walker's index after removals.
    fn collect_jobs(&mut self, base_index: usize, mut base_rect: Rect, max_alpha: f64) -> usize {
        let settings = self.settings;
        let mut base_index = base_index;
        let mut index = 0;
        while index < self.walkers.len() {
            if index != base_index
                && same_target(self.walkers[index].as_ref(), self.walkers[base_index].as_ref())
                && settings.join_rects(&mut base_rect, self.walkers[index].requested_rect(), max_alpha)
            {
                self.walkers.remove(index);
                if index < base_index {
                    base_index -= 1;
                }
                continue;
            }
            index += 1;
        }
        let base = &mut self.walkers[base_index];
        if base.requested_rect() != base_rect {
            let start_node = base.start_node();
            base.collect(start_node, base_rect);
        }
        base_index
    }
}

pub struct RegionUpdateQueue {
    compositor: Arc<dyn Compositor>,
    state: Mutex<UpdateQueueState>,
    override_level_of_detail: AtomicI16,
}

impl RegionUpdateQueue {
    pub fn new(compositor: Arc<dyn Compositor>, settings: RegionMergeSettings) -> Self {
        assert!(
            settings.patch_width > 0 && settings.patch_height > 0,
            "region patch size must be positive"
        );
        Self {
            compositor,
            state: Mutex::new(UpdateQueueState {
                walkers: VecDeque::new(),
                spontaneous_jobs: VecDeque::new(),
                settings,
            }),
            override_level_of_detail: AtomicI16::new(NO_OVERRIDE),
        }
    }

    pub fn update_settings(&self, settings: RegionMergeSettings) {
        self.state.lock().settings = settings;
    }

    pub fn settings(&self) -> RegionMergeSettings {
        self.state.lock().settings
    }

    pub fn add_update(
        &self,
        node: NodeId,
        rects: &[Rect],
        crop_rect: Rect,
        level_of_detail: LevelOfDetail,
        update_kind: UpdateKind,
    ) {
        let mut state = self.state.lock();
        for &rect in rects {
            self.add_job(&mut state, node, rect, crop_rect, level_of_detail, update_kind);
        }
    }

    pub fn add_full_refresh(
        &self,
        node: NodeId,
        rect: Rect,
        crop_rect: Rect,
        level_of_detail: LevelOfDetail,
    ) {
        self.add_update(node, &[rect], crop_rect, level_of_detail, UpdateKind::FullRefresh);
    }

    fn add_job(
        &self,
        state: &mut UpdateQueueState,
        node: NodeId,
        rect: Rect,
        crop_rect: Rect,
        level_of_detail: LevelOfDetail,
        update_kind: UpdateKind,
    ) {
        if rect.is_empty() {
            return;
        }
        if state.try_merge_job(node, rect, crop_rect, level_of_detail, update_kind) {
            tracing::trace!(?rect, "dirty rect folded into pending walker");
            return;
        }
        let settings = state.settings;
        if !rect.fits_patch(settings.patch_width, settings.patch_height) {
            let patches = rect.split_into_patches(settings.patch_width, settings.patch_height);
            tracing::trace!(?rect, patches = patches.len(), "dirty rect split");
            for patch in patches {
                self.add_job(state, node, patch, crop_rect, level_of_detail, update_kind);
            }
            return;
        }
        let mut walker = self
            .compositor
            .create_walker(update_kind, crop_rect, level_of_detail);
        walker.collect(node, rect);
        state.walkers.push_back(walker);
    }

    /// Drops pending spontaneous jobs made redundant by `job`, then queues it.
    pub fn add_spontaneous_job(&self, job: Box<dyn SpontaneousJob>) {
        let mut state = self.state.lock();
        let before = state.spontaneous_jobs.len();
        state
            .spontaneous_jobs
            .retain(|pending| !job.overrides(pending.as_ref()));
        let overridden = before - state.spontaneous_jobs.len();
        if overridden > 0 {
            tracing::debug!(job = job.name(), overridden, "spontaneous jobs overridden");
        }
        state.spontaneous_jobs.push_back(job);
    }

    /// Re-coalesces the whole pending list with the loose collect ratio.
    pub fn optimize(&self) {
        let mut state = self.state.lock();
        if state.walkers.len() <= 1 {
            return;
        }
        let max_alpha = state.settings.max_collect_alpha;
        let mut base_index = 0;
        while base_index < state.walkers.len() {
            let base_rect = state.walkers[base_index].requested_rect();
            base_index = state.collect_jobs(base_index, base_rect, max_alpha) + 1;
        }
    }

    /// Dispatches admissible walkers while the pool has spare slots. A
    /// spontaneous job runs only when no walker could and the pool is idle.
    pub fn process_queue(&self, pool: &mut PoolGuard<'_>) {
        let mut state = self.state.lock();
        while pool.has_spare_slot() && self.process_one_job(&mut state, pool) {}
    }

    fn process_one_job(&self, state: &mut UpdateQueueState, pool: &mut PoolGuard<'_>) -> bool {
        let pinned = pool.current_level_of_detail();
        let admissible = (0..state.walkers.len()).find(|&index| {
            let walker = &mut state.walkers[index];
            let level_of_detail = walker.level_of_detail();
            if pinned.is_some_and(|pinned| pinned != level_of_detail) {
                return false;
            }
            if !walker.is_checksum_valid() {
                self.override_level_of_detail
                    .store(i16::from(level_of_detail.get()), Ordering::Release);
                let requested_rect = walker.requested_rect();
                walker.recalculate(requested_rect);
                self.override_level_of_detail
                    .store(NO_OVERRIDE, Ordering::Release);
            }
            pool.is_region_admissible(walker.access_rect(), walker.change_rect(), level_of_detail)
        });

        if let Some(walker) = admissible.and_then(|index| state.walkers.remove(index)) {
            pool.dispatch(self.wrap_walker(walker));
            return true;
        }
        // A finishing slot counts as idle before it drops its level pin.
        if pool.is_fully_idle()
            && state
                .spontaneous_jobs
                .front()
                .is_some_and(|job| pinned.is_none_or(|pinned| pinned == job.level_of_detail()))
            && let Some(job) = state.spontaneous_jobs.pop_front()
        {
            tracing::trace!(job = job.name(), "dispatching spontaneous job");
            pool.dispatch(PoolJob::spontaneous(
                job.exclusivity(),
                job.level_of_detail(),
                Box::new(move || {
                    job.run();
                    JobCompletion::Done
                }),
            ));
            return true;
        }
        false
    }

    /// Merge job for a synchronous full refresh. It bypasses the pending
    /// list, so the caller dispatches it itself.
    pub fn full_refresh_job(
        &self,
        node: NodeId,
        rect: Rect,
        crop_rect: Rect,
        level_of_detail: LevelOfDetail,
    ) -> PoolJob {
        let mut walker =
            self.compositor
                .create_walker(UpdateKind::FullRefresh, crop_rect, level_of_detail);
        walker.collect(node, rect);
        self.wrap_walker(walker)
    }

    fn wrap_walker(&self, mut walker: Box<dyn MergeWalker>) -> PoolJob {
        let compositor = Arc::clone(&self.compositor);
        PoolJob::region_merge(
            walker.access_rect(),
            walker.change_rect(),
            walker.level_of_detail(),
            Box::new(move || {
                compositor.merge(walker.as_mut());
                JobCompletion::RegionMerged(walker.change_rect())
            }),
        )
    }

    pub fn is_empty(&self) -> bool {
        let state = self.state.lock();
        state.walkers.is_empty() && state.spontaneous_jobs.is_empty()
    }

    pub fn size_metric(&self) -> usize {
        let state = self.state.lock();
        state.walkers.len() + state.spontaneous_jobs.len()
    }

    pub fn pending_walkers(&self) -> usize {
        self.state.lock().walkers.len()
    }

    pub fn pending_requested_rects(&self) -> Vec<Rect> {
        self.state
            .lock()
            .walkers
            .iter()
            .map(|walker| walker.requested_rect())
            .collect()
    }

    /// Level pinned while a stale walker recalculates, so collaborators the
    /// walker calls back into see the walker's level.
    pub fn override_level_of_detail(&self) -> Option<LevelOfDetail> {
        let raw = self.override_level_of_detail.load(Ordering::Acquire);
        u8::try_from(raw).ok().map(LevelOfDetail)
    }
}

#[cfg(test)]
mod tests;
