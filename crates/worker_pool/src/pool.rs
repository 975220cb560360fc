use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use bitflags::bitflags;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use scheduler_protocol::{Exclusivity, LevelOfDetail, Rect, Sequentiality};

use crate::lod_counter::LodCounter;
use crate::slot::{JobBody, JobCompletion, JobSlot, PoolJob, PoolJobKind};

bitflags! {
    /// What kinds of jobs occupy the pool right now.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ContextSnapshot: u8 {
        const HAS_SEQUENTIAL_JOB = 1 << 0;
        const HAS_UNIQUELY_CONCURRENT_JOB = 1 << 1;
        const HAS_CONCURRENT_JOB = 1 << 2;
        const HAS_BARRIER_JOB = 1 << 3;
        const HAS_MERGE_JOB = 1 << 4;
        const HAS_SPONTANEOUS_JOB = 1 << 5;
    }
}

impl ContextSnapshot {
    pub fn has_stroke_jobs(self) -> bool {
        self.intersects(
            Self::HAS_SEQUENTIAL_JOB
                | Self::HAS_UNIQUELY_CONCURRENT_JOB
                | Self::HAS_CONCURRENT_JOB
                | Self::HAS_BARRIER_JOB,
        )
    }

    pub fn has_merge_jobs(self) -> bool {
        self.contains(Self::HAS_MERGE_JOB)
    }
}

/// Hooks a pool thread calls after every job, in this order.
///
/// `spare_slot_appeared` runs while the finished slot is still `Waiting`, so
/// a job dispatched from inside it into that slot reuses the calling thread.
pub trait PoolCallbacks: Send + Sync {
    fn region_merged(&self, rect: Rect);

    fn do_some_useful_work(&self);

    fn spare_slot_appeared(&self);
}

struct PoolShared {
    lod_counter: LodCounter,
    exclusive_access: RwLock<()>,
    active_slots: Mutex<usize>,
    idle_condition: Condvar,
    dispatched_jobs: AtomicU64,
    callbacks: Weak<dyn PoolCallbacks>,
}

struct PoolState {
    slots: Vec<Arc<JobSlot>>,
    job_sender: Option<Sender<Arc<JobSlot>>>,
    threads: Vec<JoinHandle<()>>,
}

pub struct WorkerPool {
    shared: Arc<PoolShared>,
    state: Mutex<PoolState>,
}

/// Holds the pool lock. Every admission decision and dispatch goes through it.
pub struct PoolGuard<'a> {
    shared: &'a PoolShared,
    state: MutexGuard<'a, PoolState>,
}

impl WorkerPool {
    pub fn new(thread_count: usize, callbacks: Weak<dyn PoolCallbacks>) -> Self {
        let shared = Arc::new(PoolShared {
            lod_counter: LodCounter::new(),
            exclusive_access: RwLock::new(()),
            active_slots: Mutex::new(0),
            idle_condition: Condvar::new(),
            dispatched_jobs: AtomicU64::new(0),
            callbacks,
        });
        let state = spawn_pool_state(&shared, thread_count);
        Self {
            shared,
            state: Mutex::new(state),
        }
    }

    pub fn lock(&self) -> PoolGuard<'_> {
        PoolGuard {
            shared: &self.shared,
            state: self.state.lock(),
        }
    }

    pub fn thread_limit(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn current_level_of_detail(&self) -> Option<LevelOfDetail> {
        self.shared.lod_counter.read_lod()
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        self.lock().snapshot()
    }

    /// Number of jobs dispatched since the pool was created.
    pub fn dispatched_jobs(&self) -> u64 {
        self.shared.dispatched_jobs.load(Ordering::Acquire)
    }

    pub fn is_idle(&self) -> bool {
        *self.shared.active_slots.lock() == 0
    }

    /// Blocks until no slot is running or finishing a job.
    ///
    /// Must not be called from a pool thread.
    pub fn wait_for_idle(&self) {
        let mut active = self.shared.active_slots.lock();
        while *active > 0 {
            self.shared.idle_condition.wait(&mut active);
        }
    }

    /// Replaces the slot set. The pool must be idle.
    pub fn set_thread_limit(&self, thread_count: usize) {
        let mut state = self.state.lock();
        let active = *self.shared.active_slots.lock();
        assert!(
            active == 0,
            "thread limit changed while {active} job slot(s) are busy"
        );
        if state.slots.len() == thread_count {
            return;
        }
        shutdown_threads(&mut state);
        *state = spawn_pool_state(&self.shared, thread_count);
        tracing::debug!(thread_count, "update worker pool resized");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        shutdown_threads(&mut self.state.lock());
    }
}

fn spawn_pool_state(shared: &Arc<PoolShared>, thread_count: usize) -> PoolState {
    assert!(thread_count > 0, "worker pool needs at least one thread");
    let (job_sender, job_receiver) = crossbeam_channel::unbounded::<Arc<JobSlot>>();
    let slots = (0..thread_count)
        .map(|index| Arc::new(JobSlot::new(index)))
        .collect();
    let threads = (0..thread_count)
        .map(|index| {
            let shared = Arc::clone(shared);
            let receiver = job_receiver.clone();
            thread::Builder::new()
                .name(format!("update-worker-{index}"))
                .spawn(move || worker_main(shared, receiver))
                .unwrap_or_else(|error| panic!("failed to spawn update worker {index}: {error}"))
        })
        .collect();
    PoolState {
        slots,
        job_sender: Some(job_sender),
        threads,
    }
}

fn shutdown_threads(state: &mut PoolState) {
    drop(state.job_sender.take());
    let current = thread::current().id();
    for handle in state.threads.drain(..) {
        if handle.thread().id() == current {
            continue;
        }
        if handle.join().is_err() {
            tracing::error!("update worker thread panicked during shutdown");
        }
    }
}

fn worker_main(shared: Arc<PoolShared>, receiver: Receiver<Arc<JobSlot>>) {
    while let Ok(slot) = receiver.recv() {
        shared.run_slot(&slot);
    }
}

impl PoolShared {
    fn run_slot(&self, slot: &JobSlot) {
        loop {
            let (body, exclusivity) = slot.take_body();
            let completion = self.run_body(slot, body, exclusivity);

            let callbacks = self.callbacks.upgrade();
            if let (JobCompletion::RegionMerged(rect), Some(callbacks)) =
                (completion, callbacks.as_ref())
            {
                callbacks.region_merged(rect);
            }
            slot.set_done();
            if let Some(callbacks) = callbacks.as_ref() {
                callbacks.do_some_useful_work();
            }
            self.lod_counter.remove_lod();
            if let Some(callbacks) = callbacks.as_ref() {
                callbacks.spare_slot_appeared();
            }
            drop(callbacks);

            if slot.try_release() {
                let mut active = self.active_slots.lock();
                *active -= 1;
                if *active == 0 {
                    self.idle_condition.notify_all();
                }
                return;
            }
            tracing::trace!(slot = slot.index(), "job slot reused by finishing thread");
        }
    }

    /// Exclusive jobs hold the access lock for writing, all others for reading.
    fn run_body(&self, slot: &JobSlot, body: JobBody, exclusivity: Exclusivity) -> JobCompletion {
        let _shared_access = (!exclusivity.is_exclusive()).then(|| self.exclusive_access.read());
        let _exclusive_access = exclusivity
            .is_exclusive()
            .then(|| self.exclusive_access.write());
        match panic::catch_unwind(AssertUnwindSafe(body)) {
            Ok(completion) => completion,
            Err(_) => {
                tracing::error!(slot = slot.index(), "pool job panicked");
                JobCompletion::Done
            }
        }
    }
}

impl PoolGuard<'_> {
    pub fn thread_limit(&self) -> usize {
        self.state.slots.len()
    }

    pub fn has_spare_slot(&self) -> bool {
        self.state.slots.iter().any(|slot| !slot.state().is_running())
    }

    /// True when no slot is running a job. Slots still in their completion
    /// path count as idle.
    pub fn is_fully_idle(&self) -> bool {
        !self.state.slots.iter().any(|slot| slot.state().is_running())
    }

    pub fn current_level_of_detail(&self) -> Option<LevelOfDetail> {
        self.shared.lod_counter.read_lod()
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        let mut snapshot = ContextSnapshot::empty();
        for info in self.state.slots.iter().filter_map(|slot| slot.running_info()) {
            snapshot |= match info.kind {
                PoolJobKind::Merge => ContextSnapshot::HAS_MERGE_JOB,
                PoolJobKind::Spontaneous => ContextSnapshot::HAS_SPONTANEOUS_JOB,
                PoolJobKind::Stroke(Sequentiality::Sequential) => {
                    ContextSnapshot::HAS_SEQUENTIAL_JOB
                }
                PoolJobKind::Stroke(Sequentiality::Concurrent) => {
                    ContextSnapshot::HAS_CONCURRENT_JOB
                }
                PoolJobKind::Stroke(Sequentiality::Barrier) => ContextSnapshot::HAS_BARRIER_JOB,
                PoolJobKind::Stroke(Sequentiality::UniquelyConcurrent) => {
                    ContextSnapshot::HAS_UNIQUELY_CONCURRENT_JOB
                }
            };
        }
        snapshot
    }

    pub fn is_admissible(&self, job: &PoolJob) -> bool {
        self.is_region_admissible(job.access_rect(), job.change_rect(), job.level_of_detail())
    }

    /// A job is admissible when its level of detail matches the pinned one
    /// and it neither reads what a running job writes nor writes what a
    /// running job reads.
    pub fn is_region_admissible(
        &self,
        access_rect: Rect,
        change_rect: Rect,
        level_of_detail: LevelOfDetail,
    ) -> bool {
        if let Some(pinned) = self.current_level_of_detail()
            && pinned != level_of_detail
        {
            return false;
        }
        self.state
            .slots
            .iter()
            .filter_map(|slot| slot.running_info())
            .all(|running| {
                !access_rect.intersects(&running.change_rect)
                    && !change_rect.intersects(&running.access_rect)
            })
    }

    /// Starts `job` on a spare slot. Panics when none is free.
    pub fn dispatch(&mut self, job: PoolJob) {
        let slot = self
            .spare_slot()
            .unwrap_or_else(|| panic!("dispatched {job:?} into a pool with no spare slot"));
        self.shared.lod_counter.add_lod(job.level_of_detail());
        self.shared.dispatched_jobs.fetch_add(1, Ordering::AcqRel);
        tracing::trace!(slot = slot.index(), kind = ?job.kind(), "dispatching pool job");
        if !slot.assign(job) {
            return;
        }
        *self.shared.active_slots.lock() += 1;
        let Some(sender) = self.state.job_sender.as_ref() else {
            panic!("dispatch into a worker pool that is shutting down");
        };
        if sender.send(slot).is_err() {
            panic!("update worker threads exited while the pool is alive");
        }
    }

    /// Prefers a slot whose thread is still in its completion path.
    fn spare_slot(&self) -> Option<Arc<JobSlot>> {
        let slots = &self.state.slots;
        slots
            .iter()
            .find(|slot| slot.state() == crate::slot::SlotState::Waiting)
            .or_else(|| slots.iter().find(|slot| !slot.state().is_running()))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;

    #[derive(Default)]
    struct RecordingCallbacks {
        merged: Mutex<Vec<Rect>>,
        useful_work_calls: AtomicUsize,
        spare_slot_calls: AtomicUsize,
    }

    impl PoolCallbacks for RecordingCallbacks {
        fn region_merged(&self, rect: Rect) {
            self.merged.lock().push(rect);
        }

        fn do_some_useful_work(&self) {
            self.useful_work_calls.fetch_add(1, Ordering::SeqCst);
        }

        fn spare_slot_appeared(&self) {
            self.spare_slot_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pool_with_callbacks(thread_count: usize) -> (WorkerPool, Arc<RecordingCallbacks>) {
        let callbacks = Arc::new(RecordingCallbacks::default());
        let weak: Weak<dyn PoolCallbacks> = Arc::downgrade(&callbacks) as Weak<dyn PoolCallbacks>;
        (WorkerPool::new(thread_count, weak), callbacks)
    }

    fn blocking_stroke_job(
        sequentiality: Sequentiality,
        release: mpsc::Receiver<()>,
    ) -> PoolJob {
        PoolJob::stroke(
            sequentiality,
            Exclusivity::Normal,
            LevelOfDetail::FULL_RESOLUTION,
            Box::new(move || {
                let _ = release.recv_timeout(Duration::from_secs(5));
                JobCompletion::Done
            }),
        )
    }

    #[test]
    fn merge_completion_reports_region_and_callbacks() {
        let (pool, callbacks) = pool_with_callbacks(2);
        let rect = Rect::new(0, 0, 64, 64);
        pool.lock().dispatch(PoolJob::region_merge(
            rect,
            rect,
            LevelOfDetail::FULL_RESOLUTION,
            Box::new(move || JobCompletion::RegionMerged(rect)),
        ));
        pool.wait_for_idle();
        assert_eq!(callbacks.merged.lock().as_slice(), &[rect]);
        assert_eq!(callbacks.useful_work_calls.load(Ordering::SeqCst), 1);
        assert_eq!(callbacks.spare_slot_calls.load(Ordering::SeqCst), 1);
        assert_eq!(pool.current_level_of_detail(), None);
        assert_eq!(pool.dispatched_jobs(), 1);
    }

    #[test]
    fn snapshot_and_spare_slots_track_running_jobs() {
        let (pool, _callbacks) = pool_with_callbacks(2);
        let (release_first, first) = mpsc::channel();
        let (release_second, second) = mpsc::channel();
        {
            let mut guard = pool.lock();
            guard.dispatch(blocking_stroke_job(Sequentiality::Concurrent, first));
            guard.dispatch(blocking_stroke_job(Sequentiality::Barrier, second));
            assert!(!guard.has_spare_slot());
            let snapshot = guard.snapshot();
            assert!(snapshot.contains(ContextSnapshot::HAS_CONCURRENT_JOB));
            assert!(snapshot.contains(ContextSnapshot::HAS_BARRIER_JOB));
            assert!(snapshot.has_stroke_jobs());
            assert!(!snapshot.has_merge_jobs());
            assert_eq!(guard.current_level_of_detail(), Some(LevelOfDetail(0)));
        }
        release_first.send(()).unwrap();
        release_second.send(()).unwrap();
        pool.wait_for_idle();
        let guard = pool.lock();
        assert!(guard.is_fully_idle());
        assert_eq!(guard.snapshot(), ContextSnapshot::empty());
    }

    #[test]
    fn overlapping_region_is_not_admissible() {
        let (pool, _callbacks) = pool_with_callbacks(2);
        let (release, receiver) = mpsc::channel::<()>();
        let running = Rect::new(0, 0, 100, 100);
        {
            let mut guard = pool.lock();
            guard.dispatch(PoolJob::region_merge(
                running,
                running,
                LevelOfDetail::FULL_RESOLUTION,
                Box::new(move || {
                    let _ = receiver.recv_timeout(Duration::from_secs(5));
                    JobCompletion::RegionMerged(running)
                }),
            ));
            let lod = LevelOfDetail::FULL_RESOLUTION;
            assert!(!guard.is_region_admissible(Rect::new(50, 50, 10, 10), Rect::EMPTY, lod));
            assert!(!guard.is_region_admissible(Rect::EMPTY, Rect::new(99, 0, 5, 5), lod));
            assert!(guard.is_region_admissible(
                Rect::new(100, 0, 50, 50),
                Rect::new(100, 0, 50, 50),
                lod
            ));
            assert!(!guard.is_region_admissible(
                Rect::new(500, 0, 10, 10),
                Rect::new(500, 0, 10, 10),
                LevelOfDetail(1)
            ));
        }
        release.send(()).unwrap();
        pool.wait_for_idle();
    }

    #[test]
    fn resize_keeps_pool_usable() {
        let (pool, callbacks) = pool_with_callbacks(1);
        pool.set_thread_limit(3);
        assert_eq!(pool.thread_limit(), 3);
        {
            let mut guard = pool.lock();
            for _ in 0..3 {
                guard.dispatch(PoolJob::spontaneous(
                    Exclusivity::Exclusive,
                    LevelOfDetail::FULL_RESOLUTION,
                    Box::new(|| JobCompletion::Done),
                ));
            }
        }
        pool.wait_for_idle();
        assert_eq!(callbacks.spare_slot_calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn panicking_job_releases_its_slot() {
        let (pool, _callbacks) = pool_with_callbacks(1);
        pool.lock().dispatch(PoolJob::spontaneous(
            Exclusivity::Normal,
            LevelOfDetail::FULL_RESOLUTION,
            Box::new(|| panic!("job failure")),
        ));
        pool.wait_for_idle();
        assert!(pool.lock().has_spare_slot());
    }

    #[test]
    #[should_panic(expected = "no spare slot")]
    fn dispatch_without_spare_slot_panics() {
        let (pool, _callbacks) = pool_with_callbacks(1);
        let (_release, receiver) = mpsc::channel();
        let mut guard = pool.lock();
        guard.dispatch(blocking_stroke_job(Sequentiality::Sequential, receiver));
        guard.dispatch(PoolJob::spontaneous(
            Exclusivity::Normal,
            LevelOfDetail::FULL_RESOLUTION,
            Box::new(|| JobCompletion::Done),
        ));
    }
}
