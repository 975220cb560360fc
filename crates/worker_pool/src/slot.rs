use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;
use scheduler_protocol::{Exclusivity, LevelOfDetail, Rect, Sequentiality};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobCompletion {
    Done,
    /// A region merge finished and the projection under `Rect` is fresh.
    RegionMerged(Rect),
}

pub type JobBody = Box<dyn FnOnce() -> JobCompletion + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolJobKind {
    Merge,
    Stroke(Sequentiality),
    Spontaneous,
}

/// A job ready for dispatch, with everything the pool needs to admit it.
pub struct PoolJob {
    kind: PoolJobKind,
    exclusivity: Exclusivity,
    level_of_detail: LevelOfDetail,
    access_rect: Rect,
    change_rect: Rect,
    body: JobBody,
}

impl PoolJob {
    pub fn region_merge(
        access_rect: Rect,
        change_rect: Rect,
        level_of_detail: LevelOfDetail,
        body: JobBody,
    ) -> Self {
        Self {
            kind: PoolJobKind::Merge,
            exclusivity: Exclusivity::Normal,
            level_of_detail,
            access_rect,
            change_rect,
            body,
        }
    }

    pub fn stroke(
        sequentiality: Sequentiality,
        exclusivity: Exclusivity,
        level_of_detail: LevelOfDetail,
        body: JobBody,
    ) -> Self {
        Self {
            kind: PoolJobKind::Stroke(sequentiality),
            exclusivity,
            level_of_detail,
            access_rect: Rect::EMPTY,
            change_rect: Rect::EMPTY,
            body,
        }
    }

    pub fn spontaneous(
        exclusivity: Exclusivity,
        level_of_detail: LevelOfDetail,
        body: JobBody,
    ) -> Self {
        Self {
            kind: PoolJobKind::Spontaneous,
            exclusivity,
            level_of_detail,
            access_rect: Rect::EMPTY,
            change_rect: Rect::EMPTY,
            body,
        }
    }

    pub fn kind(&self) -> PoolJobKind {
        self.kind
    }

    pub fn exclusivity(&self) -> Exclusivity {
        self.exclusivity
    }

    pub fn level_of_detail(&self) -> LevelOfDetail {
        self.level_of_detail
    }

    pub fn access_rect(&self) -> Rect {
        self.access_rect
    }

    pub fn change_rect(&self) -> Rect {
        self.change_rect
    }
}

impl std::fmt::Debug for PoolJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolJob")
            .field("kind", &self.kind)
            .field("exclusivity", &self.exclusivity)
            .field("level_of_detail", &self.level_of_detail)
            .field("access_rect", &self.access_rect)
            .field("change_rect", &self.change_rect)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum SlotState {
    Empty = 0,
    /// Job body finished, the owning thread is still in its completion path.
    Waiting = 1,
    Merge = 2,
    StrokeJob = 3,
    Spontaneous = 4,
}

impl SlotState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Empty,
            1 => Self::Waiting,
            2 => Self::Merge,
            3 => Self::StrokeJob,
            4 => Self::Spontaneous,
            other => panic!("invalid job slot state {other}"),
        }
    }

    fn for_kind(kind: PoolJobKind) -> Self {
        match kind {
            PoolJobKind::Merge => Self::Merge,
            PoolJobKind::Stroke(_) => Self::StrokeJob,
            PoolJobKind::Spontaneous => Self::Spontaneous,
        }
    }

    pub(crate) fn is_running(self) -> bool {
        !matches!(self, Self::Empty | Self::Waiting)
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct RunningJobInfo {
    pub(crate) kind: PoolJobKind,
    pub(crate) exclusivity: Exclusivity,
    pub(crate) access_rect: Rect,
    pub(crate) change_rect: Rect,
}

pub(crate) struct JobSlot {
    index: usize,
    state: AtomicU8,
    running: Mutex<Option<RunningJobInfo>>,
    body: Mutex<Option<JobBody>>,
}

impl JobSlot {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            state: AtomicU8::new(SlotState::Empty as u8),
            running: Mutex::new(None),
            body: Mutex::new(None),
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn state(&self) -> SlotState {
        SlotState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn running_info(&self) -> Option<RunningJobInfo> {
        *self.running.lock()
    }

    /// Installs `job` and publishes the running state.
    ///
    /// Returns true when the slot was empty and needs a thread; false when
    /// the thread that just finished in this slot will pick the job up.
    pub(crate) fn assign(&self, job: PoolJob) -> bool {
        let PoolJob {
            kind,
            exclusivity,
            access_rect,
            change_rect,
            body,
            ..
        } = job;
        *self.running.lock() = Some(RunningJobInfo {
            kind,
            exclusivity,
            access_rect,
            change_rect,
        });
        *self.body.lock() = Some(body);
        let previous = SlotState::from_raw(
            self.state
                .swap(SlotState::for_kind(kind) as u8, Ordering::AcqRel),
        );
        match previous {
            SlotState::Empty => true,
            SlotState::Waiting => false,
            running => panic!(
                "job slot {} dispatched while still running {running:?}",
                self.index
            ),
        }
    }

    pub(crate) fn take_body(&self) -> (JobBody, Exclusivity) {
        let body = self.body.lock().take();
        let exclusivity = self
            .running_info()
            .map_or(Exclusivity::Normal, |info| info.exclusivity);
        match body {
            Some(body) => (body, exclusivity),
            None => panic!("job slot {} woke up without a job", self.index),
        }
    }

    pub(crate) fn set_done(&self) {
        *self.running.lock() = None;
        self.state
            .store(SlotState::Waiting as u8, Ordering::Release);
    }

    /// Fails when a new job was dispatched into the slot meanwhile.
    pub(crate) fn try_release(&self) -> bool {
        self.state
            .compare_exchange(
                SlotState::Waiting as u8,
                SlotState::Empty as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_job() -> PoolJob {
        PoolJob::stroke(
            Sequentiality::Sequential,
            Exclusivity::Normal,
            LevelOfDetail::FULL_RESOLUTION,
            Box::new(|| JobCompletion::Done),
        )
    }

    #[test]
    fn empty_slot_requests_a_thread_and_waiting_slot_does_not() {
        let slot = JobSlot::new(0);
        assert!(slot.assign(noop_job()));
        assert!(slot.state().is_running());
        let (_body, _) = slot.take_body();
        slot.set_done();
        assert_eq!(slot.state(), SlotState::Waiting);
        assert!(!slot.assign(noop_job()));
        assert!(!slot.try_release());
        let (_body, _) = slot.take_body();
        slot.set_done();
        assert!(slot.try_release());
        assert_eq!(slot.state(), SlotState::Empty);
    }

    #[test]
    #[should_panic(expected = "dispatched while still running")]
    fn dispatch_into_running_slot_panics() {
        let slot = JobSlot::new(3);
        slot.assign(noop_job());
        slot.assign(noop_job());
    }
}
