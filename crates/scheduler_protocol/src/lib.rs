//! Shared vocabulary between the update scheduler and the compositor it drives.
//!
//! Everything in here is plain data or a collaborator trait. The scheduler never
//! inspects pixels; it only moves rectangles, node ids and opaque jobs around.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct NodeId(pub u64);

/// Downscale level of a preview pass. `0` is full resolution, `n` means `2^n`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct LevelOfDetail(pub u8);

impl LevelOfDetail {
    pub const FULL_RESOLUTION: Self = Self(0);

    pub const fn get(self) -> u8 {
        self.0
    }

    pub const fn is_full_resolution(self) -> bool {
        self.0 == 0
    }
}

/// User preference for low-resolution preview strokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LodPreferences {
    pub enabled: bool,
    pub desired_level_of_detail: LevelOfDetail,
}

impl LodPreferences {
    pub fn effective_level_of_detail(&self) -> LevelOfDetail {
        if self.enabled {
            self.desired_level_of_detail
        } else {
            LevelOfDetail::FULL_RESOLUTION
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

pub type PatchRects = SmallVec<[Rect; 8]>;

impl Rect {
    pub const EMPTY: Self = Self {
        x: 0,
        y: 0,
        width: 0,
        height: 0,
    };

    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub const fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    pub const fn right(&self) -> i32 {
        self.x + self.width
    }

    pub const fn bottom(&self) -> i32 {
        self.y + self.height
    }

    pub fn area(&self) -> i64 {
        if self.is_empty() {
            return 0;
        }
        i64::from(self.width) * i64::from(self.height)
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        self.x < other.right()
            && other.x < self.right()
            && self.y < other.bottom()
            && other.y < self.bottom()
    }

    pub fn intersected(&self, other: &Rect) -> Rect {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        if right <= left || bottom <= top {
            return Rect::EMPTY;
        }
        Rect::new(left, top, right - left, bottom - top)
    }

    /// Bounding rectangle of both. Empty inputs do not contribute.
    pub fn united(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let left = self.x.min(other.x);
        let top = self.y.min(other.y);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        Rect::new(left, top, right - left, bottom - top)
    }

    pub fn contains(&self, other: &Rect) -> bool {
        !other.is_empty()
            && other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    pub fn fits_patch(&self, patch_width: i32, patch_height: i32) -> bool {
        self.width <= patch_width && self.height <= patch_height
    }

    /// Cuts the rectangle along a grid anchored at its own top-left corner.
    pub fn split_into_patches(&self, patch_width: i32, patch_height: i32) -> PatchRects {
        assert!(
            patch_width > 0 && patch_height > 0,
            "patch size must be positive, got {patch_width}x{patch_height}"
        );
        let mut patches = PatchRects::new();
        if self.is_empty() {
            return patches;
        }
        let mut y = self.y;
        while y < self.bottom() {
            let mut x = self.x;
            while x < self.right() {
                let patch = Rect::new(x, y, patch_width, patch_height).intersected(self);
                if !patch.is_empty() {
                    patches.push(patch);
                }
                x += patch_width;
            }
            y += patch_height;
        }
        patches
    }
}

/// Ordering requirement of a stroke job relative to other stroke jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Sequentiality {
    Concurrent,
    #[default]
    Sequential,
    Barrier,
    UniquelyConcurrent,
}

/// Whether a job must hold the pool's write lock while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Exclusivity {
    #[default]
    Normal,
    Exclusive,
}

impl Exclusivity {
    pub const fn is_exclusive(self) -> bool {
        matches!(self, Self::Exclusive)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum UpdateKind {
    #[default]
    Update,
    /// Recomposite without re-running filters that are marked dirty.
    UpdateNoFilthy,
    FullRefresh,
}

/// Computes the dependency region of one region-recomposite job.
///
/// A walker is created empty by the [`Compositor`] and then fed one
/// `collect` call. After that the scheduler only reads the rectangles back,
/// asks for a `recalculate` when the graph has changed underneath it, and
/// hands the walker back to [`Compositor::merge`] on a pool thread.
pub trait MergeWalker: Send {
    fn collect(&mut self, start_node: NodeId, requested_rect: Rect);

    fn recalculate(&mut self, requested_rect: Rect);

    fn start_node(&self) -> NodeId;

    fn requested_rect(&self) -> Rect;

    fn crop_rect(&self) -> Rect;

    fn update_kind(&self) -> UpdateKind;

    fn level_of_detail(&self) -> LevelOfDetail;

    /// Region of the graph this job reads.
    fn access_rect(&self) -> Rect;

    /// Region of the graph this job writes.
    fn change_rect(&self) -> Rect;

    /// False when the graph topology changed since the walker was collected.
    fn is_checksum_valid(&self) -> bool;
}

pub trait Compositor: Send + Sync {
    fn create_walker(
        &self,
        update_kind: UpdateKind,
        crop_rect: Rect,
        level_of_detail: LevelOfDetail,
    ) -> Box<dyn MergeWalker>;

    /// Recomposites the region described by `walker`. Runs on a pool thread.
    fn merge(&self, walker: &mut dyn MergeWalker);
}

pub trait ProjectionUpdateListener: Send + Sync {
    fn on_region_merged(&self, rect: Rect);
}

/// Receives the amount of queued work after every scheduling request.
pub trait ProgressListener: Send + Sync {
    /// `pending` is the stroke queue's size estimate, or the number of queued
    /// region jobs when no stroke is waiting.
    fn update_progress(&self, pending: usize, stroke_name: &str);

    /// Strokes are still being filled, so there is nothing to measure yet.
    fn hide(&self);
}

pub trait UndoCommand: Send {
    fn undo(&mut self);

    fn redo(&mut self);

    /// Commands sharing an id may be folded together by [`UndoCommand::merge_with`].
    fn id(&self) -> Option<u32> {
        None
    }

    /// Folds `other` into `self`. Returns false when the two cannot merge.
    fn merge_with(&mut self, _other: &dyn UndoCommand) -> bool {
        false
    }
}

/// Low-priority maintenance work run only when the pool is otherwise idle.
pub trait SpontaneousJob: Send {
    fn run(self: Box<Self>);

    fn name(&self) -> &str;

    /// True when running `self` makes the pending `other` redundant.
    fn overrides(&self, _other: &dyn SpontaneousJob) -> bool {
        false
    }

    fn exclusivity(&self) -> Exclusivity {
        Exclusivity::Normal
    }

    fn level_of_detail(&self) -> LevelOfDetail {
        LevelOfDetail::FULL_RESOLUTION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn united_ignores_empty_rects() {
        let rect = Rect::new(5, 5, 10, 10);
        assert_eq!(rect.united(&Rect::EMPTY), rect);
        assert_eq!(Rect::EMPTY.united(&rect), rect);
        assert_eq!(
            rect.united(&Rect::new(20, 0, 5, 5)),
            Rect::new(5, 0, 20, 15)
        );
    }

    #[test]
    fn touching_rects_do_not_intersect() {
        let left = Rect::new(0, 0, 50, 100);
        let right = Rect::new(50, 0, 50, 100);
        assert!(!left.intersects(&right));
        assert!(left.intersects(&Rect::new(49, 99, 10, 10)));
        assert!(!left.intersects(&Rect::EMPTY));
    }

    #[test]
    fn split_covers_source_rect_with_clipped_patches() {
        let rect = Rect::new(10, 20, 1100, 600);
        let patches = rect.split_into_patches(512, 512);
        assert_eq!(patches.len(), 6);
        assert_eq!(patches[0], Rect::new(10, 20, 512, 512));
        assert_eq!(patches[2], Rect::new(1034, 20, 76, 512));
        assert_eq!(patches[5], Rect::new(1034, 532, 76, 88));
        let covered: i64 = patches.iter().map(Rect::area).sum();
        assert_eq!(covered, rect.area());
    }

    #[test]
    fn split_of_small_rect_is_identity() {
        let rect = Rect::new(0, 0, 100, 100);
        let patches = rect.split_into_patches(512, 512);
        assert_eq!(patches.as_slice(), &[rect]);
    }

    #[test]
    #[should_panic(expected = "patch size must be positive")]
    fn split_rejects_zero_patch() {
        let _ = Rect::new(0, 0, 10, 10).split_into_patches(0, 10);
    }
}
