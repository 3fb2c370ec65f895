//! Configuration for the prefetch layer.
//!
//! `PrefetchConfig` stores the options that control what the layer loads
//! and how each sample is transformed.
//!
//! Example:
//! ```ignore
//! let config = PrefetchConfig::builder()
//!     .source("train_manifest.txt")
//!     .batch_size(32)
//!     .crop_size(227)
//!     .mirror(true)
//!     .shuffle(true)
//!     .scale(1.0 / 255.0)
//!     .seed(42)
//!     .build();
//! ```
//!
//! Invalid combinations (mirror without crop, a resize target with only one
//! dimension set) are rejected once, when the layer is constructed, never
//! re-checked per sample.

use crate::error::PrefetchError;
use anyhow::Result;
use std::path::PathBuf;

/// Whether random transforms are active (training) or replaced by their
/// deterministic counterparts (evaluation/inference: centered crop).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Train,
    Eval,
}

/// Options recognized by the prefetch layer.
#[derive(Debug, Clone)]
pub struct PrefetchConfig {
    /// Manifest path. When absent, the background-prefetch path is disabled
    /// and only ad-hoc batch injection works.
    pub source: Option<PathBuf>,
    /// Number of samples per batch.
    pub batch_size: usize,
    /// Square crop edge in pixels; 0 disables cropping.
    pub crop_size: u32,
    /// Randomly mirror cropped windows. Requires `crop_size > 0`.
    pub mirror: bool,
    /// Resize target height; 0 leaves images at their native size.
    /// Must be set together with `new_width`.
    pub new_height: u32,
    /// Resize target width; 0 leaves images at their native size.
    pub new_width: u32,
    /// Decode images as 3-channel RGB (`true`) or single-channel gray.
    pub color: bool,
    /// Multiplicative factor applied after mean subtraction.
    pub scale: f32,
    /// Reshuffle the image list on every wraparound.
    pub shuffle: bool,
    /// Upper bound for the random initial skip; 0 disables skipping.
    pub rand_skip: usize,
    /// Optional safetensors file holding the per-pixel mean tensor.
    pub mean_file: Option<PathBuf>,
    /// Seed for all layer randomness. `None` draws from OS entropy.
    pub seed: Option<u64>,
    pub phase: Phase,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            source: None,
            batch_size: 1,
            crop_size: 0,
            mirror: false,
            new_height: 0,
            new_width: 0,
            color: true,
            scale: 1.0,
            shuffle: false,
            rand_skip: 0,
            mean_file: None,
            seed: None,
            phase: Phase::Train,
        }
    }
}

impl PrefetchConfig {
    pub fn builder() -> PrefetchConfigBuilder {
        PrefetchConfigBuilder::default()
    }

    /// The decode-time resize target, when one is configured.
    pub(crate) fn resize(&self) -> Option<(u32, u32)> {
        if self.new_height > 0 && self.new_width > 0 {
            Some((self.new_height, self.new_width))
        } else {
            None
        }
    }

    /// Validates option combinations. Called once at layer construction.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(PrefetchError::config("batch_size must be greater than 0").into());
        }
        if self.mirror && self.crop_size == 0 {
            return Err(PrefetchError::config(
                "mirror requires crop_size to be set at the same time",
            )
            .into());
        }
        if (self.new_height == 0) != (self.new_width == 0) {
            return Err(PrefetchError::config(
                "new_height and new_width must be set at the same time",
            )
            .into());
        }
        if !self.scale.is_finite() {
            return Err(
                PrefetchError::config(format!("scale must be finite (got {})", self.scale)).into(),
            );
        }
        Ok(())
    }
}

/// Builder for `PrefetchConfig` with method chaining.
#[derive(Default)]
pub struct PrefetchConfigBuilder {
    config: PrefetchConfig,
}

impl PrefetchConfigBuilder {
    /// Set the manifest path that drives background prefetching.
    pub fn source(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.source = Some(path.into());
        self
    }

    /// Set the batch size (must be > 0).
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Set the square crop edge (0 = no crop).
    pub fn crop_size(mut self, size: u32) -> Self {
        self.config.crop_size = size;
        self
    }

    /// Enable random horizontal mirroring of cropped windows.
    pub fn mirror(mut self, mirror: bool) -> Self {
        self.config.mirror = mirror;
        self
    }

    /// Set the decode-time resize target (both dimensions required).
    pub fn resize(mut self, height: u32, width: u32) -> Self {
        self.config.new_height = height;
        self.config.new_width = width;
        self
    }

    pub fn new_height(mut self, height: u32) -> Self {
        self.config.new_height = height;
        self
    }

    pub fn new_width(mut self, width: u32) -> Self {
        self.config.new_width = width;
        self
    }

    /// Decode as RGB (`true`, default) or grayscale (`false`).
    pub fn color(mut self, color: bool) -> Self {
        self.config.color = color;
        self
    }

    /// Set the multiplicative scale applied after mean subtraction.
    pub fn scale(mut self, scale: f32) -> Self {
        self.config.scale = scale;
        self
    }

    /// Reshuffle the image list each time it wraps around.
    pub fn shuffle(mut self, shuffle: bool) -> Self {
        self.config.shuffle = shuffle;
        self
    }

    /// Skip a random number of entries in `[0, bound)` at setup.
    pub fn rand_skip(mut self, bound: usize) -> Self {
        self.config.rand_skip = bound;
        self
    }

    /// Set the safetensors mean file.
    pub fn mean_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.mean_file = Some(path.into());
        self
    }

    /// Set the seed for reproducible shuffling, skipping, and transforms.
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self
    }

    /// Select training (random crop) or evaluation (centered crop) behavior.
    pub fn phase(mut self, phase: Phase) -> Self {
        self.config.phase = phase;
        self
    }

    /// Build the final configuration.
    pub fn build(self) -> PrefetchConfig {
        self.config
    }
}
