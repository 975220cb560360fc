use bitflags::bitflags;
use scheduler_protocol::{Exclusivity, LevelOfDetail};

use crate::job::{StrokeJobData, StrokeJobPhase};

bitflags! {
    /// Phases a strategy provides jobs for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StrokePhases: u8 {
        const INIT = 1 << 0;
        const DAB = 1 << 1;
        const FINISH = 1 << 2;
        const CANCEL = 1 << 3;
        const SUSPEND = 1 << 4;
        const RESUME = 1 << 5;
    }
}

impl StrokePhases {
    pub fn contains_phase(self, phase: StrokeJobPhase) -> bool {
        self.contains(phase.flag())
    }
}

/// Behaviour of one kind of stroke.
///
/// Phase jobs are created lazily: the init job when the stroke is created,
/// the finish job when it ends, the cancel job when it is cancelled and the
/// suspend/resume pair when a preview stroke has to overtake it. A phase
/// missing from [`StrokeStrategy::phases`] is never asked for.
pub trait StrokeStrategy: Send + 'static {
    fn id(&self) -> &str;

    fn phases(&self) -> StrokePhases {
        StrokePhases::DAB
    }

    /// `None` for a declared phase enqueues a job that does nothing.
    fn create_job(&self, _phase: StrokeJobPhase) -> Option<Box<dyn StrokeJobData>> {
        None
    }

    /// An exclusive stroke keeps region merges off the pool while it is the
    /// head of the queue. Its jobs still take the pool lock in their own mode.
    fn exclusivity(&self) -> Exclusivity {
        Exclusivity::Normal
    }

    /// Asks the owner of a running stroke to end it before this one starts.
    fn requests_other_strokes_to_end(&self) -> bool {
        false
    }

    fn clears_redo_on_start(&self) -> bool {
        true
    }

    /// Ended strokes with this flag are cancelled when a new stroke starts.
    fn can_forget_about_me(&self) -> bool {
        false
    }

    /// The cancel job must run even if the init job never did.
    fn needs_explicit_cancel(&self) -> bool {
        false
    }

    fn balancing_ratio_override(&self) -> Option<f64> {
        None
    }

    /// Strategy for the low-resolution twin of this stroke. `None` means the
    /// stroke always runs at full resolution.
    fn create_lod_clone(&self, _level_of_detail: LevelOfDetail) -> Option<Box<dyn StrokeStrategy>> {
        None
    }

    fn notify_user_started_stroke(&self) {}

    fn notify_user_ended_stroke(&self) {}
}
