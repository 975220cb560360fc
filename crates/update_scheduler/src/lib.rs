//! Schedules stroke jobs and projection region updates onto one worker pool.
//!
//! Strokes run in the order they were started, region updates are merged
//! and split into patch-sized walkers, and after every finished job the
//! scheduler hands the freed slot to whichever queue is further behind.

mod config;
mod lazy_wait;
mod scheduler;

pub use config::{SchedulerConfig, SchedulerConfigError};
pub use scheduler::UpdateScheduler;

pub use region_updates::RegionMergeSettings;
pub use scheduler_protocol::{
    Compositor, Exclusivity, LevelOfDetail, LodPreferences, MergeWalker, NodeId, ProgressListener,
    ProjectionUpdateListener, Rect, Sequentiality, SpontaneousJob, UndoCommand, UpdateKind,
};
pub use strokes::{
    FnStrokeJob, LodNUndoAdapter, Lod0ToNStrokeFactory, PostSyncLod0RefreshCallback,
    PurgeRedoStateCallback, StrokeId, StrokeInfo, StrokeJobContext, StrokeJobData, StrokeJobPhase,
    StrokePhases, StrokeStrategy, StrokeTemplate, StrokeType, SuspendResumeStrokeFactory,
    UndoResult,
};
