use std::collections::VecDeque;

use scheduler_protocol::{Exclusivity, LevelOfDetail, Sequentiality};

use crate::job::{NoopJob, StrokeJobData, StrokeJobPhase};
use crate::queue::StrokeId;
use crate::strategy::{StrokePhases, StrokeStrategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrokeType {
    /// Full-resolution stroke without a preview twin.
    Legacy,
    /// Full-resolution half of a preview pair.
    Lod0,
    /// Low-resolution half of a preview pair, or a resync stroke.
    LodN,
    Suspend,
    Resume,
}

struct QueuedJob {
    phase: StrokeJobPhase,
    data: Box<dyn StrokeJobData>,
    level_of_detail: LevelOfDetail,
    /// False for suspend/resume jobs injected by another stroke.
    is_own_job: bool,
}

impl QueuedJob {
    fn is_cancellable(&self) -> bool {
        self.is_own_job && self.data.is_cancellable()
    }
}

/// A job taken off a stroke, ready to be wrapped for the pool.
pub struct PoppedStrokeJob {
    pub phase: StrokeJobPhase,
    pub data: Box<dyn StrokeJobData>,
    pub level_of_detail: LevelOfDetail,
    pub sequentiality: Sequentiality,
    pub exclusivity: Exclusivity,
}

pub struct Stroke {
    strategy: Box<dyn StrokeStrategy>,
    phases: StrokePhases,
    stroke_type: StrokeType,
    level_of_detail: LevelOfDetail,
    jobs: VecDeque<QueuedJob>,
    initialized: bool,
    ended: bool,
    cancelled: bool,
    suspended: bool,
    lod_buddy: Option<StrokeId>,
}

impl Stroke {
    pub fn new(
        strategy: Box<dyn StrokeStrategy>,
        stroke_type: StrokeType,
        level_of_detail: LevelOfDetail,
    ) -> Self {
        let phases = strategy.phases();
        strategy.notify_user_started_stroke();
        let mut stroke = Self {
            strategy,
            phases,
            stroke_type,
            level_of_detail,
            jobs: VecDeque::new(),
            initialized: !phases.contains(StrokePhases::INIT),
            ended: false,
            cancelled: false,
            suspended: false,
            lod_buddy: None,
        };
        stroke.enqueue_phase_job(StrokeJobPhase::Init);
        stroke
    }

    fn phase_job(&self, phase: StrokeJobPhase) -> Box<dyn StrokeJobData> {
        self.strategy
            .create_job(phase)
            .unwrap_or_else(|| Box::new(NoopJob))
    }

    fn enqueue_phase_job(&mut self, phase: StrokeJobPhase) {
        if !self.phases.contains_phase(phase) {
            return;
        }
        let data = self.phase_job(phase);
        self.jobs.push_back(QueuedJob {
            phase,
            data,
            level_of_detail: self.level_of_detail,
            is_own_job: true,
        });
    }

    pub fn add_job(&mut self, data: Box<dyn StrokeJobData>) {
        assert!(
            !self.ended,
            "job added to stroke `{}` after it ended",
            self.strategy.id()
        );
        if !self.phases.contains(StrokePhases::DAB) {
            tracing::warn!(stroke = self.strategy.id(), "stroke takes no dab jobs, job dropped");
            return;
        }
        self.jobs.push_back(QueuedJob {
            phase: StrokeJobPhase::Dab,
            data,
            level_of_detail: self.level_of_detail,
            is_own_job: true,
        });
    }

    /// Inserts `jobs` in order right before the first own job still queued.
    pub fn add_mutated_jobs(&mut self, jobs: Vec<Box<dyn StrokeJobData>>) {
        if !self.phases.contains(StrokePhases::DAB) {
            tracing::warn!(stroke = self.strategy.id(), "stroke takes no dab jobs, mutated jobs dropped");
            return;
        }
        let mut position = self
            .jobs
            .iter()
            .position(|job| job.is_own_job)
            .unwrap_or(self.jobs.len());
        for data in jobs {
            self.jobs.insert(
                position,
                QueuedJob {
                    phase: StrokeJobPhase::Dab,
                    data,
                    level_of_detail: self.level_of_detail,
                    is_own_job: true,
                },
            );
            position += 1;
        }
    }

    pub fn pop_one_job(&mut self) -> Option<PoppedStrokeJob> {
        let job = self.jobs.pop_front()?;
        self.initialized = true;
        self.suspended = false;
        Some(PoppedStrokeJob {
            phase: job.phase,
            sequentiality: job.data.sequentiality(),
            level_of_detail: job.data.level_of_detail_override().unwrap_or(job.level_of_detail),
            exclusivity: job.data.exclusivity(),
            data: job.data,
        })
    }

    pub fn end_stroke(&mut self) {
        assert!(!self.ended, "stroke `{}` ended twice", self.strategy.id());
        self.enqueue_phase_job(StrokeJobPhase::Finish);
        self.ended = true;
        self.strategy.notify_user_ended_stroke();
    }

    /// Drops pending cancellable work and, when the stroke already started,
    /// queues its cancel job. Repeated calls do nothing.
    pub fn cancel_stroke(&mut self) {
        if self.cancelled {
            return;
        }
        let effectively_initialized = self.initialized || self.strategy.needs_explicit_cancel();
        if !effectively_initialized {
            self.clear_cancellable_jobs();
        } else if !self.jobs.is_empty() || !self.ended {
            self.clear_cancellable_jobs();
            self.enqueue_phase_job(StrokeJobPhase::Cancel);
        }
        self.cancelled = true;
        self.ended = true;
    }

    fn clear_cancellable_jobs(&mut self) {
        self.jobs.retain(|job| !job.is_cancellable());
    }

    /// False once the stroke finished all its work and cancelling could no
    /// longer revert anything.
    pub fn can_cancel(&self) -> bool {
        self.cancelled || !self.initialized || !self.jobs.is_empty() || !self.ended
    }

    pub fn supports_suspension(&self) -> bool {
        !self.initialized
            || self
                .phases
                .contains(StrokePhases::SUSPEND | StrokePhases::RESUME)
    }

    /// Lets `recipient` run ahead: it first runs our suspend job, and we
    /// resume before any of our own remaining jobs.
    pub fn suspend_stroke(&mut self, recipient: &mut Stroke) {
        if !self.initialized || self.suspended || (self.ended && self.jobs.is_empty()) {
            return;
        }
        assert!(
            self.phases
                .contains(StrokePhases::SUSPEND | StrokePhases::RESUME),
            "stroke `{}` cannot be suspended",
            self.strategy.id()
        );
        let resume = self.phase_job(StrokeJobPhase::Resume);
        self.jobs.push_front(QueuedJob {
            phase: StrokeJobPhase::Resume,
            data: resume,
            level_of_detail: self.level_of_detail,
            is_own_job: false,
        });
        let suspend = self.phase_job(StrokeJobPhase::Suspend);
        recipient.jobs.push_front(QueuedJob {
            phase: StrokeJobPhase::Suspend,
            data: suspend,
            level_of_detail: recipient.level_of_detail,
            is_own_job: false,
        });
        self.suspended = true;
    }

    pub fn next_job_sequentiality(&self) -> Option<Sequentiality> {
        self.jobs.front().map(|job| job.data.sequentiality())
    }

    pub fn next_job_level_of_detail(&self) -> Option<LevelOfDetail> {
        self.jobs
            .front()
            .map(|job| job.data.level_of_detail_override().unwrap_or(job.level_of_detail))
    }

    pub fn next_job_phase(&self) -> Option<StrokeJobPhase> {
        self.jobs.front().map(|job| job.phase)
    }

    pub fn has_jobs(&self) -> bool {
        !self.jobs.is_empty()
    }

    pub fn pending_jobs(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn is_exclusive(&self) -> bool {
        self.strategy.exclusivity().is_exclusive()
    }

    pub fn stroke_type(&self) -> StrokeType {
        self.stroke_type
    }

    pub fn level_of_detail(&self) -> LevelOfDetail {
        self.level_of_detail
    }

    pub fn id(&self) -> &str {
        self.strategy.id()
    }

    pub fn balancing_ratio_override(&self) -> Option<f64> {
        self.strategy.balancing_ratio_override()
    }

    pub fn requests_other_strokes_to_end(&self) -> bool {
        self.strategy.requests_other_strokes_to_end()
    }

    pub fn can_forget_about_me(&self) -> bool {
        self.strategy.can_forget_about_me()
    }

    pub fn lod_buddy(&self) -> Option<StrokeId> {
        self.lod_buddy
    }

    pub(crate) fn set_lod_buddy(&mut self, buddy: StrokeId) {
        self.lod_buddy = Some(buddy);
    }
}

impl std::fmt::Debug for Stroke {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stroke")
            .field("id", &self.strategy.id())
            .field("stroke_type", &self.stroke_type)
            .field("level_of_detail", &self.level_of_detail)
            .field("pending_jobs", &self.jobs.len())
            .field("initialized", &self.initialized)
            .field("ended", &self.ended)
            .field("cancelled", &self.cancelled)
            .finish()
    }
}
