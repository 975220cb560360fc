use scheduler_protocol::{Exclusivity, LevelOfDetail, Sequentiality};

use crate::queue::{StrokeId, StrokesQueue};
use crate::strategy::StrokePhases;
use crate::undo_store::LodNUndoAdapter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrokeJobPhase {
    Init,
    Dab,
    Finish,
    Cancel,
    Suspend,
    Resume,
}

impl StrokeJobPhase {
    pub fn flag(self) -> StrokePhases {
        match self {
            Self::Init => StrokePhases::INIT,
            Self::Dab => StrokePhases::DAB,
            Self::Finish => StrokePhases::FINISH,
            Self::Cancel => StrokePhases::CANCEL,
            Self::Suspend => StrokePhases::SUSPEND,
            Self::Resume => StrokePhases::RESUME,
        }
    }
}

/// One unit of stroke work. The data carries its own behaviour.
pub trait StrokeJobData: Send + 'static {
    fn run(self: Box<Self>, context: &StrokeJobContext<'_>);

    fn sequentiality(&self) -> Sequentiality {
        Sequentiality::Sequential
    }

    /// `Exclusive` runs the job with every other pool slot empty.
    fn exclusivity(&self) -> Exclusivity {
        Exclusivity::Normal
    }

    fn is_cancellable(&self) -> bool {
        true
    }

    /// Runs the job at this level instead of the stroke's own.
    fn level_of_detail_override(&self) -> Option<LevelOfDetail> {
        None
    }

    /// Copy of this job for the low-resolution twin of the stroke.
    fn create_lod_clone(&self, _level_of_detail: LevelOfDetail) -> Option<Box<dyn StrokeJobData>> {
        None
    }
}

pub(crate) struct NoopJob;

impl StrokeJobData for NoopJob {
    fn run(self: Box<Self>, _context: &StrokeJobContext<'_>) {}
}

/// What a running job knows about where it came from.
pub struct StrokeJobContext<'a> {
    stroke_id: StrokeId,
    phase: StrokeJobPhase,
    level_of_detail: LevelOfDetail,
    queue: Option<&'a StrokesQueue>,
}

impl<'a> StrokeJobContext<'a> {
    pub(crate) fn new(
        stroke_id: StrokeId,
        phase: StrokeJobPhase,
        level_of_detail: LevelOfDetail,
        queue: Option<&'a StrokesQueue>,
    ) -> Self {
        Self {
            stroke_id,
            phase,
            level_of_detail,
            queue,
        }
    }

    pub fn stroke_id(&self) -> StrokeId {
        self.stroke_id
    }

    pub fn phase(&self) -> StrokeJobPhase {
        self.phase
    }

    pub fn level_of_detail(&self) -> LevelOfDetail {
        self.level_of_detail
    }

    /// Inserts follow-up jobs ahead of the stroke's remaining own jobs.
    pub fn add_mutated_jobs(&self, jobs: Vec<Box<dyn StrokeJobData>>) {
        match self.queue {
            Some(queue) => queue.add_mutated_jobs(self.stroke_id, jobs),
            None => tracing::warn!(
                stroke = ?self.stroke_id,
                "mutated jobs dropped, stroke queue is gone"
            ),
        }
    }

    /// Undo sink for jobs of low-resolution strokes. `None` at full resolution.
    pub fn post_execution_undo_adapter(&self) -> Option<LodNUndoAdapter> {
        if self.level_of_detail.is_full_resolution() {
            return None;
        }
        self.queue.map(StrokesQueue::lodn_undo_adapter)
    }
}

/// Job built from a closure. Cloning the closure yields the LOD twin.
#[derive(Clone)]
pub struct FnStrokeJob<F> {
    run: F,
    sequentiality: Sequentiality,
    exclusivity: Exclusivity,
    cancellable: bool,
    level_of_detail_override: Option<LevelOfDetail>,
}

impl<F> FnStrokeJob<F>
where
    F: Fn(&StrokeJobContext<'_>) + Clone + Send + 'static,
{
    pub fn new(sequentiality: Sequentiality, run: F) -> Self {
        Self {
            run,
            sequentiality,
            exclusivity: Exclusivity::Normal,
            cancellable: true,
            level_of_detail_override: None,
        }
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusivity = Exclusivity::Exclusive;
        self
    }

    pub fn uncancellable(mut self) -> Self {
        self.cancellable = false;
        self
    }

    pub fn at_level_of_detail(mut self, level_of_detail: LevelOfDetail) -> Self {
        self.level_of_detail_override = Some(level_of_detail);
        self
    }

    pub fn boxed(self) -> Box<dyn StrokeJobData> {
        Box::new(self)
    }
}

impl<F> StrokeJobData for FnStrokeJob<F>
where
    F: Fn(&StrokeJobContext<'_>) + Clone + Send + 'static,
{
    fn run(self: Box<Self>, context: &StrokeJobContext<'_>) {
        (self.run)(context);
    }

    fn sequentiality(&self) -> Sequentiality {
        self.sequentiality
    }

    fn exclusivity(&self) -> Exclusivity {
        self.exclusivity
    }

    fn is_cancellable(&self) -> bool {
        self.cancellable
    }

    fn level_of_detail_override(&self) -> Option<LevelOfDetail> {
        self.level_of_detail_override
    }

    fn create_lod_clone(&self, _level_of_detail: LevelOfDetail) -> Option<Box<dyn StrokeJobData>> {
        let mut clone = self.clone();
        clone.level_of_detail_override = None;
        Some(Box::new(clone))
    }
}
