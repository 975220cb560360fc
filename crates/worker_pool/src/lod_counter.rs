use std::sync::atomic::{AtomicU32, Ordering};

use scheduler_protocol::LevelOfDetail;

const LOD_BITS: u32 = 8;
const LOD_MASK: u32 = (1 << LOD_BITS) - 1;

/// Count of running jobs together with the level of detail they pin.
///
/// Both halves live in one word so a reader never sees a count from one
/// state and a level from another.
#[derive(Debug, Default)]
pub struct LodCounter {
    packed: AtomicU32,
}

const fn unpack(packed: u32) -> (u32, LevelOfDetail) {
    (packed >> LOD_BITS, LevelOfDetail((packed & LOD_MASK) as u8))
}

const fn pack(count: u32, level_of_detail: LevelOfDetail) -> u32 {
    (count << LOD_BITS) | level_of_detail.0 as u32
}

impl LodCounter {
    pub const fn new() -> Self {
        Self {
            packed: AtomicU32::new(0),
        }
    }

    /// Registers one more job at `level_of_detail`.
    ///
    /// Panics when other jobs already pin a different level.
    pub fn add_lod(&self, level_of_detail: LevelOfDetail) {
        let update = self
            .packed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |packed| {
                let (count, current) = unpack(packed);
                if count > 0 && current != level_of_detail {
                    return None;
                }
                Some(pack(count + 1, level_of_detail))
            });
        if let Err(packed) = update {
            let (count, current) = unpack(packed);
            panic!(
                "cannot pin level of detail {} while {count} job(s) run at {}",
                level_of_detail.0, current.0
            );
        }
    }

    pub fn remove_lod(&self) {
        let update = self
            .packed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |packed| {
                let (count, current) = unpack(packed);
                if count == 0 {
                    return None;
                }
                Some(pack(count - 1, current))
            });
        if update.is_err() {
            panic!("level of detail counter underflow");
        }
    }

    /// The pinned level, or `None` when nothing runs.
    pub fn read_lod(&self) -> Option<LevelOfDetail> {
        let (count, current) = unpack(self.packed.load(Ordering::Acquire));
        (count > 0).then_some(current)
    }

    pub fn active_jobs(&self) -> u32 {
        unpack(self.packed.load(Ordering::Acquire)).0
    }
}
