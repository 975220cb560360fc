//! Stroke lifecycle and the ordered queue of strokes waiting for pool slots.
//!
//! A stroke is a user-visible editing operation. Its jobs run strictly
//! after the jobs of every stroke queued before it, with the exception of
//! low-resolution preview strokes, which are inserted ahead of their
//! full-resolution twins.

mod job;
mod queue;
mod strategy;
mod stroke;
mod undo_store;

pub use job::{FnStrokeJob, StrokeJobContext, StrokeJobData, StrokeJobPhase};
pub use queue::{
    Lod0ToNStrokeFactory, PostSyncLod0RefreshCallback, PurgeRedoStateCallback, StrokeId,
    StrokeInfo, StrokeTemplate, StrokesQueue, SuspendResumeStrokeFactory, UndoResult,
};
pub use strategy::{StrokePhases, StrokeStrategy};
pub use stroke::{PoppedStrokeJob, Stroke, StrokeType};
pub use undo_store::{LodNUndoAdapter, LodNUndoStore};
