use std::num::NonZeroUsize;
use std::thread;

use region_updates::RegionMergeSettings;
use scheduler_protocol::LodPreferences;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerConfigError {
    #[error("scheduler needs at least one worker thread")]
    NoWorkerThreads,
    #[error("update patch size must be positive, got {width}x{height}")]
    InvalidPatchSize { width: i32, height: i32 },
    #[error("{name} must be a positive finite number, got {value}")]
    InvalidRatio { name: &'static str, value: f64 },
    #[error("invalid scheduler config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Tunables of the update scheduler. Missing fields fall back to defaults
/// when deserialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub thread_count: usize,
    pub patch_width: i32,
    pub patch_height: i32,
    pub max_merge_alpha: f64,
    pub max_merge_collect_alpha: f64,
    pub max_collect_alpha: f64,
    /// How many queued region updates one queued stroke job is worth when
    /// the scheduler picks which queue to serve first.
    pub balancing_ratio: f64,
    pub lod: LodPreferences,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let merge = RegionMergeSettings::default();
        Self {
            thread_count: thread::available_parallelism().map_or(1, NonZeroUsize::get),
            patch_width: merge.patch_width,
            patch_height: merge.patch_height,
            max_merge_alpha: merge.max_merge_alpha,
            max_merge_collect_alpha: merge.max_merge_collect_alpha,
            max_collect_alpha: merge.max_collect_alpha,
            balancing_ratio: 100.0,
            lod: LodPreferences::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn from_json(text: &str) -> Result<Self, SchedulerConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SchedulerConfigError> {
        if self.thread_count == 0 {
            return Err(SchedulerConfigError::NoWorkerThreads);
        }
        if self.patch_width <= 0 || self.patch_height <= 0 {
            return Err(SchedulerConfigError::InvalidPatchSize {
                width: self.patch_width,
                height: self.patch_height,
            });
        }
        for (name, value) in [
            ("max_merge_alpha", self.max_merge_alpha),
            ("max_merge_collect_alpha", self.max_merge_collect_alpha),
            ("max_collect_alpha", self.max_collect_alpha),
            ("balancing_ratio", self.balancing_ratio),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(SchedulerConfigError::InvalidRatio { name, value });
            }
        }
        Ok(())
    }

    pub fn region_merge_settings(&self) -> RegionMergeSettings {
        RegionMergeSettings {
            patch_width: self.patch_width,
            patch_height: self.patch_height,
            max_merge_alpha: self.max_merge_alpha,
            max_merge_collect_alpha: self.max_merge_collect_alpha,
            max_collect_alpha: self.max_collect_alpha,
        }
    }
}
