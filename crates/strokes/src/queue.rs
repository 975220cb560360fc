use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use scheduler_protocol::{LevelOfDetail, LodPreferences, Sequentiality};
use slotmap::{SlotMap, new_key_type};
use worker_pool::{ContextSnapshot, JobCompletion, PoolGuard, PoolJob};

use crate::job::{FnStrokeJob, StrokeJobContext, StrokeJobData};
use crate::strategy::StrokeStrategy;
use crate::stroke::{PoppedStrokeJob, Stroke, StrokeType};
use crate::undo_store::{LodNUndoAdapter, LodNUndoStore};

new_key_type! {
    /// Weak handle to a queued stroke. Stays valid as a key after the stroke
    /// is gone; lookups then simply miss.
    pub struct StrokeId;
}

/// Strategy plus pre-filled jobs for a stroke the queue creates on its own.
pub struct StrokeTemplate {
    pub strategy: Box<dyn StrokeStrategy>,
    pub jobs: Vec<Box<dyn StrokeJobData>>,
}

/// Builds the stroke that regenerates low-resolution caches. The flag tells
/// whether the stroke may be forgotten if nothing ends up needing it.
pub type Lod0ToNStrokeFactory = Box<dyn Fn(bool) -> StrokeTemplate + Send + Sync>;

/// Builds the strokes that pause and resume projection updates around a
/// run of full-resolution preview strokes.
pub type SuspendResumeStrokeFactory =
    Box<dyn Fn() -> (StrokeTemplate, StrokeTemplate) + Send + Sync>;

pub type PurgeRedoStateCallback = Arc<dyn Fn() + Send + Sync>;

/// Asks the owner of the full-resolution plane to redraw it. Runs as the last
/// job of every resume stroke, after preview work was shown in its place.
pub type PostSyncLod0RefreshCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoResult {
    Fail,
    Ok,
    Wait,
}

/// Point-in-time view of one queued stroke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrokeInfo {
    pub stroke_type: StrokeType,
    pub level_of_detail: LevelOfDetail,
    pub pending_jobs: usize,
    pub is_ended: bool,
    pub is_cancelled: bool,
    pub requests_other_strokes_to_end: bool,
}

struct QueueState {
    strokes: SlotMap<StrokeId, Stroke>,
    order: VecDeque<StrokeId>,
    open_strokes: usize,
    loaded_stroke: Option<StrokeId>,
    needs_exclusive_access: bool,
    balancing_ratio_override: Option<f64>,
    lodn_needs_synchronization: bool,
    lod_preferences: LodPreferences,
    desired_level_of_detail: LevelOfDetail,
    next_desired_level_of_detail: LevelOfDetail,
    lod0_to_n_factory: Option<Lod0ToNStrokeFactory>,
    suspend_resume_factory: Option<SuspendResumeStrokeFactory>,
    post_sync_refresh: Option<PostSyncLod0RefreshCallback>,
}

pub struct StrokesQueue {
    state: Mutex<QueueState>,
    lodn_undo_store: Arc<Mutex<LodNUndoStore>>,
    purge_redo_state_callback: Mutex<Option<PurgeRedoStateCallback>>,
    self_handle: Weak<StrokesQueue>,
}

impl StrokesQueue {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|self_handle| Self {
            state: Mutex::new(QueueState {
                strokes: SlotMap::with_key(),
                order: VecDeque::new(),
                open_strokes: 0,
                loaded_stroke: None,
                needs_exclusive_access: false,
                balancing_ratio_override: None,
                lodn_needs_synchronization: true,
                lod_preferences: LodPreferences::default(),
                desired_level_of_detail: LevelOfDetail::FULL_RESOLUTION,
                next_desired_level_of_detail: LevelOfDetail::FULL_RESOLUTION,
                lod0_to_n_factory: None,
                suspend_resume_factory: None,
                post_sync_refresh: None,
            }),
            lodn_undo_store: Arc::new(Mutex::new(LodNUndoStore::default())),
            purge_redo_state_callback: Mutex::new(None),
            self_handle: self_handle.clone(),
        })
    }

    pub fn start_stroke(&self, strategy: Box<dyn StrokeStrategy>) -> StrokeId {
        let clears_redo = strategy.clears_redo_on_start();
        let id = {
            let mut state = self.state.lock();
            state.cancel_forgettable_strokes();
            let desired = state.desired_level_of_detail;
            let lodn_strategy = if desired.is_full_resolution() {
                None
            } else {
                strategy.create_lod_clone(desired)
            };
            let id = match lodn_strategy {
                Some(lodn_strategy) => state.start_lod_pair(strategy, lodn_strategy, desired),
                None => {
                    let id = state
                        .strokes
                        .insert(Stroke::new(strategy, StrokeType::Legacy, LevelOfDetail::FULL_RESOLUTION));
                    state.order.push_back(id);
                    state.lodn_needs_synchronization = true;
                    id
                }
            };
            state.open_strokes += 1;
            tracing::debug!(stroke = ?id, queued = state.order.len(), "stroke started");
            id
        };
        if clears_redo {
            self.purge_redo_state();
        }
        id
    }

    /// Appends a dab job. The low-resolution twin, if any, gets a clone.
    pub fn add_job(&self, id: StrokeId, data: Box<dyn StrokeJobData>) {
        let mut state = self.state.lock();
        let Some(stroke) = state.strokes.get(id) else {
            panic!("job added to stroke {id:?} that already finished");
        };
        if let Some(buddy_id) = stroke.lod_buddy()
            && let Some(buddy) = state.strokes.get_mut(buddy_id)
        {
            let lod = buddy.level_of_detail();
            let Some(clone) = data.create_lod_clone(lod) else {
                panic!("job for stroke {id:?} has no clone for level of detail {}", lod.get());
            };
            buddy.add_job(clone);
        }
        state.strokes[id].add_job(data);
    }

    pub fn add_mutated_jobs(&self, id: StrokeId, jobs: Vec<Box<dyn StrokeJobData>>) {
        let mut state = self.state.lock();
        match state.strokes.get_mut(id) {
            Some(stroke) => stroke.add_mutated_jobs(jobs),
            None => tracing::warn!(stroke = ?id, "mutated jobs for a finished stroke dropped"),
        }
    }

    pub fn end_stroke(&self, id: StrokeId) {
        let mut state = self.state.lock();
        let Some(stroke) = state.strokes.get_mut(id) else {
            panic!("stroke {id:?} ended after it finished");
        };
        stroke.end_stroke();
        if let Some(buddy_id) = stroke.lod_buddy()
            && let Some(buddy) = state.strokes.get_mut(buddy_id)
        {
            buddy.end_stroke();
        }
        state.open_strokes -= 1;
    }

    /// Returns false when the stroke has already left the queue.
    pub fn cancel_stroke(&self, id: StrokeId) -> bool {
        let mut state = self.state.lock();
        let Some(stroke) = state.strokes.get_mut(id) else {
            return false;
        };
        let was_ended = stroke.is_ended();
        stroke.cancel_stroke();
        if let Some(buddy_id) = stroke.lod_buddy()
            && let Some(buddy) = state.strokes.get_mut(buddy_id)
        {
            buddy.cancel_stroke();
        }
        if !was_ended {
            state.open_strokes -= 1;
        }
        tracing::debug!(stroke = ?id, "stroke cancelled");
        true
    }

    /// Cancels every queued stroke, but only when all of them were ended by
    /// their owners.
    pub fn try_cancel_current_stroke_async(&self) -> bool {
        let mut state = self.state.lock();
        if state.order.is_empty() || state.has_unfinished_strokes() {
            return false;
        }
        let ids: Vec<StrokeId> = state.order.iter().copied().collect();
        for id in ids {
            let stroke = &mut state.strokes[id];
            stroke.cancel_stroke();
            if stroke.stroke_type() == StrokeType::Lod0 {
                state.lodn_needs_synchronization = true;
            }
        }
        true
    }

    pub fn try_undo_last_stroke_async(&self) -> UndoResult {
        let mut state = self.state.lock();
        let mut last_stroke = None;
        let mut buddy_found = false;
        for &id in state.order.iter().rev() {
            let stroke = &state.strokes[id];
            if stroke.stroke_type() == StrokeType::Legacy {
                break;
            }
            if last_stroke.is_none()
                && stroke.stroke_type() == StrokeType::Lod0
                && !stroke.is_cancelled()
            {
                last_stroke = Some((id, stroke.lod_buddy()));
            }
            if let Some((_, Some(buddy))) = last_stroke
                && buddy == id
            {
                buddy_found = true;
                break;
            }
        }

        let Some((stroke_id, buddy_id)) = last_stroke else {
            return UndoResult::Fail;
        };
        let stroke = &mut state.strokes[stroke_id];
        if !stroke.is_ended() || stroke.is_cancelled() {
            return UndoResult::Fail;
        }
        if !stroke.can_cancel() {
            return UndoResult::Wait;
        }
        stroke.cancel_stroke();

        if buddy_found
            && let Some(buddy) = buddy_id.and_then(|id| state.strokes.get_mut(id))
            && buddy.can_cancel()
        {
            buddy.cancel_stroke();
            return UndoResult::Ok;
        }
        drop(state);
        let mut store = self.lodn_undo_store.lock();
        store.undo();
        store.purge_redo_state();
        UndoResult::Ok
    }

    /// Dispatches admissible head jobs while the pool has spare slots.
    ///
    /// `external_jobs_pending` tells a barrier job that region updates are
    /// still waiting and it has to let them go first.
    pub fn process_queue(&self, pool: &mut PoolGuard<'_>, external_jobs_pending: bool) {
        let mut state = self.state.lock();
        while pool.has_spare_slot() {
            let Some(job) = self.pop_admissible_job(&mut state, pool, external_jobs_pending) else {
                break;
            };
            pool.dispatch(job);
        }
    }

    pub fn try_pop_next_job(
        &self,
        pool: &PoolGuard<'_>,
        external_jobs_pending: bool,
    ) -> Option<PoolJob> {
        let mut state = self.state.lock();
        self.pop_admissible_job(&mut state, pool, external_jobs_pending)
    }

    fn pop_admissible_job(
        &self,
        state: &mut QueueState,
        pool: &PoolGuard<'_>,
        external_jobs_pending: bool,
    ) -> Option<PoolJob> {
        let snapshot = pool.snapshot();
        if !state.check_stroke_state(
            snapshot.has_stroke_jobs(),
            pool.current_level_of_detail(),
            &self.lodn_undo_store,
        ) {
            return None;
        }
        if !state.check_exclusive_property(snapshot)
            || !state.check_sequential_property(snapshot, external_jobs_pending)
        {
            return None;
        }
        let head = *state.order.front()?;
        let popped = state.strokes[head].pop_one_job()?;
        Some(self.wrap_job(head, popped))
    }

    fn wrap_job(&self, stroke_id: StrokeId, popped: PoppedStrokeJob) -> PoolJob {
        let PoppedStrokeJob {
            phase,
            data,
            level_of_detail,
            sequentiality,
            exclusivity,
        } = popped;
        tracing::trace!(stroke = ?stroke_id, ?phase, ?sequentiality, "stroke job popped");
        let queue = self.self_handle.clone();
        PoolJob::stroke(
            sequentiality,
            exclusivity,
            level_of_detail,
            Box::new(move || {
                let queue = queue.upgrade();
                let context =
                    StrokeJobContext::new(stroke_id, phase, level_of_detail, queue.as_deref());
                data.run(&context);
                JobCompletion::Done
            }),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().order.is_empty()
    }

    /// Pending work estimate used to balance strokes against region updates.
    pub fn size_metric(&self) -> usize {
        let state = self.state.lock();
        let Some(&head) = state.order.front() else {
            return 0;
        };
        state.strokes[head].pending_jobs().max(1) * state.order.len()
    }

    pub fn needs_exclusive_access(&self) -> bool {
        self.state.lock().needs_exclusive_access
    }

    pub fn balancing_ratio_override(&self) -> Option<f64> {
        self.state.lock().balancing_ratio_override
    }

    /// Name of the stroke at the head of the queue.
    pub fn current_stroke_name(&self) -> Option<String> {
        let state = self.state.lock();
        state
            .order
            .front()
            .map(|&head| state.strokes[head].id().to_owned())
    }

    pub fn has_open_strokes(&self) -> bool {
        self.state.lock().open_strokes > 0
    }

    pub fn stroke_info(&self, id: StrokeId) -> Option<StrokeInfo> {
        self.state.lock().strokes.get(id).map(|stroke| StrokeInfo {
            stroke_type: stroke.stroke_type(),
            level_of_detail: stroke.level_of_detail(),
            pending_jobs: stroke.pending_jobs(),
            is_ended: stroke.is_ended(),
            is_cancelled: stroke.is_cancelled(),
            requests_other_strokes_to_end: stroke.requests_other_strokes_to_end(),
        })
    }

    /// Types of the queued strokes, head first.
    pub fn queued_stroke_types(&self) -> Vec<StrokeType> {
        let state = self.state.lock();
        state
            .order
            .iter()
            .map(|&id| state.strokes[id].stroke_type())
            .collect()
    }

    pub fn lod_preferences(&self) -> LodPreferences {
        self.state.lock().lod_preferences
    }

    pub fn set_lod_preferences(&self, preferences: LodPreferences) {
        let mut state = self.state.lock();
        state.lod_preferences = preferences;
        state.next_desired_level_of_detail = preferences.effective_level_of_detail();
        state.switch_desired_level_of_detail(false);
    }

    /// Level new preview strokes are created at.
    pub fn desired_level_of_detail(&self) -> LevelOfDetail {
        self.state.lock().desired_level_of_detail
    }

    /// The image changed outside of any stroke; previews need a resync.
    pub fn notify_ufo_changed_image(&self) {
        self.state.lock().lodn_needs_synchronization = true;
    }

    pub fn explicit_regenerate_level_of_detail(&self) {
        let mut state = self.state.lock();
        let desired = state.desired_level_of_detail;
        if !desired.is_full_resolution() {
            state.start_lod0_to_n_stroke(desired, false);
        }
    }

    /// Re-applies the desired level even when it did not change, so the
    /// next preview strokes start a fresh range behind a new resync stroke.
    /// The resync is forgettable when the caches are already in sync.
    pub fn force_reset_lod_and_close_current_lod_range(&self) {
        self.state.lock().switch_desired_level_of_detail(true);
    }

    pub fn lodn_needs_synchronization(&self) -> bool {
        self.state.lock().lodn_needs_synchronization
    }

    pub fn set_lod0_to_n_stroke_factory(&self, factory: Lod0ToNStrokeFactory) {
        self.state.lock().lod0_to_n_factory = Some(factory);
    }

    pub fn set_suspend_resume_stroke_factory(&self, factory: SuspendResumeStrokeFactory) {
        self.state.lock().suspend_resume_factory = Some(factory);
    }

    pub fn set_post_sync_lod0_refresh_callback(&self, callback: PostSyncLod0RefreshCallback) {
        self.state.lock().post_sync_refresh = Some(callback);
    }

    pub fn set_purge_redo_state_callback(&self, callback: PurgeRedoStateCallback) {
        *self.purge_redo_state_callback.lock() = Some(callback);
    }

    pub fn lodn_undo_adapter(&self) -> LodNUndoAdapter {
        LodNUndoAdapter::new(Arc::clone(&self.lodn_undo_store))
    }

    fn purge_redo_state(&self) {
        let callback = self.purge_redo_state_callback.lock().clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl QueueState {
    fn has_unfinished_strokes(&self) -> bool {
        self.order.iter().any(|&id| !self.strokes[id].is_ended())
    }

    fn cancel_forgettable_strokes(&mut self) {
        if self.order.is_empty() || self.has_unfinished_strokes() {
            return;
        }
        for &id in &self.order {
            let stroke = &mut self.strokes[id];
            if stroke.can_forget_about_me() {
                stroke.cancel_stroke();
            }
        }
    }

    fn start_lod_pair(
        &mut self,
        strategy: Box<dyn StrokeStrategy>,
        lodn_strategy: Box<dyn StrokeStrategy>,
        level_of_detail: LevelOfDetail,
    ) -> StrokeId {
        if self.lodn_needs_synchronization {
            self.start_lod0_to_n_stroke(level_of_detail, false);
        }

        let buddy_id = self
            .strokes
            .insert(Stroke::new(lodn_strategy, StrokeType::LodN, level_of_detail));
        let position = self.find_new_lodn_position(buddy_id);
        self.order.insert(position, buddy_id);

        let mut stroke = Stroke::new(strategy, StrokeType::Lod0, LevelOfDetail::FULL_RESOLUTION);
        stroke.set_lod_buddy(buddy_id);
        let id = self.strokes.insert(stroke);

        let range_open = self.order.iter().any(|&queued| {
            let queued = &self.strokes[queued];
            queued.stroke_type() == StrokeType::Resume && !queued.is_cancelled()
        });
        let suspend_resume = if range_open {
            None
        } else {
            self.suspend_resume_factory.as_ref().map(|factory| factory())
        };
        match suspend_resume {
            Some((suspend, resume)) => {
                let resume = self.with_post_sync_refresh(resume);
                let suspend_id = self.insert_prefilled_stroke(suspend, StrokeType::Suspend);
                let position = self.find_new_lod0_position();
                self.order.insert(position, suspend_id);
                let position = self.find_new_lod0_position();
                self.order.insert(position, id);
                let resume_id = self.insert_prefilled_stroke(resume, StrokeType::Resume);
                let position = self.find_new_lod0_position();
                self.order.insert(position, resume_id);
            }
            None => {
                let position = self.find_new_lod0_position();
                self.order.insert(position, id);
            }
        }
        id
    }

    fn with_post_sync_refresh(&self, mut resume: StrokeTemplate) -> StrokeTemplate {
        if let Some(callback) = self.post_sync_refresh.clone() {
            resume.jobs.push(
                FnStrokeJob::new(Sequentiality::Sequential, move |_| callback())
                    .uncancellable()
                    .boxed(),
            );
        }
        resume
    }

    fn insert_prefilled_stroke(&mut self, template: StrokeTemplate, stroke_type: StrokeType) -> StrokeId {
        let mut stroke = Stroke::new(template.strategy, stroke_type, LevelOfDetail::FULL_RESOLUTION);
        for job in template.jobs {
            stroke.add_job(job);
        }
        stroke.end_stroke();
        self.strokes.insert(stroke)
    }

    /// Position right before the first live full-resolution preview stroke.
    /// When that stroke is the head it is suspended in favour of `buddy_id`.
    fn find_new_lodn_position(&mut self, buddy_id: StrokeId) -> usize {
        let found = self.order.iter().position(|&id| {
            let stroke = &self.strokes[id];
            !stroke.is_cancelled()
                && matches!(
                    stroke.stroke_type(),
                    StrokeType::Lod0 | StrokeType::Suspend | StrokeType::Resume
                )
        });
        let Some(position) = found else {
            return self.order.len();
        };
        if position == 0 {
            let head_id = self.order[0];
            if let Some([head, buddy]) = self.strokes.get_disjoint_mut([head_id, buddy_id])
                && head.supports_suspension()
            {
                head.suspend_stroke(buddy);
            }
        }
        position
    }

    /// Position inside the currently open suspend/resume range, or the end.
    fn find_new_lod0_position(&self) -> usize {
        self.order
            .iter()
            .position(|&id| {
                let stroke = &self.strokes[id];
                !stroke.is_cancelled() && stroke.stroke_type() == StrokeType::Resume
            })
            .unwrap_or(self.order.len())
    }

    fn start_lod0_to_n_stroke(&mut self, level_of_detail: LevelOfDetail, forgettable: bool) {
        let Some(factory) = self.lod0_to_n_factory.as_ref() else {
            tracing::warn!(
                level_of_detail = level_of_detail.get(),
                "no resync stroke factory, preview caches left as they are"
            );
            return;
        };
        let template = factory(forgettable);
        let mut stroke = Stroke::new(template.strategy, StrokeType::LodN, level_of_detail);
        for job in template.jobs {
            stroke.add_job(job);
        }
        stroke.end_stroke();
        let id = self.strokes.insert(stroke);
        let position = self.find_new_lodn_position(id);
        self.order.insert(position, id);
        self.lodn_needs_synchronization = false;
        tracing::debug!(level_of_detail = level_of_detail.get(), forgettable, "resync stroke queued");
    }

    /// Applies a pending level change once only legacy strokes are queued.
    fn switch_desired_level_of_detail(&mut self, forced: bool) {
        if !forced && self.next_desired_level_of_detail == self.desired_level_of_detail {
            return;
        }
        if self
            .order
            .iter()
            .any(|&id| self.strokes[id].stroke_type() != StrokeType::Legacy)
        {
            return;
        }
        let forgettable = forced
            && !self.lodn_needs_synchronization
            && self.desired_level_of_detail == self.next_desired_level_of_detail;
        self.desired_level_of_detail = self.next_desired_level_of_detail;
        self.lodn_needs_synchronization |= !forgettable;
        let desired = self.desired_level_of_detail;
        if !desired.is_full_resolution() {
            self.start_lod0_to_n_stroke(desired, forgettable);
        }
    }

    /// Drops finished heads and reports whether the head has a job that can
    /// be popped at the pinned level of detail.
    fn check_stroke_state(
        &mut self,
        has_stroke_jobs_running: bool,
        pinned_level_of_detail: Option<LevelOfDetail>,
        lodn_undo_store: &Mutex<LodNUndoStore>,
    ) -> bool {
        loop {
            let Some(&head_id) = self.order.front() else {
                self.unload_stroke();
                return false;
            };
            let head = &self.strokes[head_id];
            if head.is_ended() && !head.has_jobs() {
                if has_stroke_jobs_running {
                    return false;
                }
                self.order.pop_front();
                self.strokes.remove(head_id);
                self.unload_stroke();
                tracing::debug!(stroke = ?head_id, "stroke finished");
                let preview_work_left = self.order.iter().any(|&id| {
                    matches!(
                        self.strokes[id].stroke_type(),
                        StrokeType::Lod0 | StrokeType::Resume
                    )
                });
                if !preview_work_left {
                    lodn_undo_store.lock().clear();
                }
                self.switch_desired_level_of_detail(false);
                continue;
            }

            if self.loaded_stroke != Some(head_id) {
                self.loaded_stroke = Some(head_id);
                self.needs_exclusive_access = head.is_exclusive();
                self.balancing_ratio_override = head.balancing_ratio_override();
            }
            let Some(next_level) = head.next_job_level_of_detail() else {
                return false;
            };
            return pinned_level_of_detail.is_none_or(|pinned| pinned == next_level);
        }
    }

    fn unload_stroke(&mut self) {
        self.loaded_stroke = None;
        self.needs_exclusive_access = false;
        self.balancing_ratio_override = None;
    }

    fn check_exclusive_property(&self, snapshot: ContextSnapshot) -> bool {
        !self.needs_exclusive_access || !snapshot.has_merge_jobs()
    }

    fn check_sequential_property(
        &self,
        snapshot: ContextSnapshot,
        external_jobs_pending: bool,
    ) -> bool {
        let Some(sequentiality) = self
            .order
            .front()
            .and_then(|&head| self.strokes[head].next_job_sequentiality())
        else {
            return false;
        };
        if snapshot.intersects(ContextSnapshot::HAS_SEQUENTIAL_JOB | ContextSnapshot::HAS_BARRIER_JOB) {
            return false;
        }
        match sequentiality {
            Sequentiality::Concurrent => true,
            Sequentiality::UniquelyConcurrent => {
                !snapshot.contains(ContextSnapshot::HAS_UNIQUELY_CONCURRENT_JOB)
            }
            Sequentiality::Sequential => !snapshot.intersects(
                ContextSnapshot::HAS_UNIQUELY_CONCURRENT_JOB | ContextSnapshot::HAS_CONCURRENT_JOB,
            ),
            Sequentiality::Barrier => {
                !external_jobs_pending
                    && !snapshot.intersects(
                        ContextSnapshot::HAS_UNIQUELY_CONCURRENT_JOB
                            | ContextSnapshot::HAS_CONCURRENT_JOB
                            | ContextSnapshot::HAS_MERGE_JOB
                            | ContextSnapshot::HAS_SPONTANEOUS_JOB,
                    )
            }
        }
    }
}
