//! The consumer-facing prefetch layer.
//!
//! `ImagePrefetcher` coordinates the manifest list, the decoder, the
//! per-sample transform, and the background fill worker to hand complete
//! batches to a training loop without stalling it.
//!
//! # Architecture Overview
//!
//! ```text
//!                 ┌───────────┐
//!                 │ ImageList │ (manifest entries + cursor)
//!                 └─────┬─────┘
//!                       │ paths + labels
//!                       ▼
//!                 ┌───────────┐
//!                 │  Decoder  │ (disk → DecodedImage)
//!                 └─────┬─────┘
//!                       │ channel-major pixels
//!                       ▼
//!                 ┌───────────┐
//!                 │ transform │ (crop/mirror, (raw − mean) × scale)
//!                 └─────┬─────┘
//!                       │ one slot per image
//!                       ▼
//!              ┌────────────────┐
//!              │ PrefetchBuffer │ ◄── filled by one background run
//!              └────────┬───────┘
//!                       │ join → copy → restart
//!                       ▼
//!                  ┌─────────┐
//!                  │  Batch  │ (caller-owned tensors)
//!                  └─────────┘
//! ```
//!
//! # Overlap protocol
//!
//! `next_batch` blocks until the in-flight run completes, copies the filled
//! buffer into fresh tensors, and immediately restarts the worker before
//! returning, so the next batch is being produced while the caller
//! computes on the current one. Exactly one run is ever in flight, and the
//! returned tensors never alias the internal buffer.
//!
//! # Example
//!
//! ```ignore
//! let config = PrefetchConfig::builder()
//!     .source("train_manifest.txt")
//!     .batch_size(32)
//!     .crop_size(227)
//!     .mirror(true)
//!     .shuffle(true)
//!     .seed(42)
//!     .build();
//!
//! let mut layer = ImagePrefetcher::new(config)?;
//! loop {
//!     let batch = layer.next_batch()?;
//!     // batch.data: (32, 3, 227, 227) float, batch.labels: (32,) int64
//! }
//! ```
//!
//! Without a `source`, the background path is disabled and batches are
//! filled synchronously through [`ImagePrefetcher::add_images_and_labels`].

use crate::batch::{Batch, BatchGeometry, PrefetchBuffer};
use crate::config::PrefetchConfig;
use crate::decode::{DecodedImage, Decoder, FileDecoder};
use crate::error::PrefetchError;
use crate::manifest::ImageList;
use crate::mean::MeanBuffer;
use crate::producer::{FillWorker, RunHandle, RunParams};
use crate::rng::{RunRng, SeedSource};
use crate::transform::{write_sample, CropPolicy};
use anyhow::{Context, Result};
use image::DynamicImage;
use std::sync::Arc;
use tracing::info;

// ================================================================================================
// 1. Layer state
// ================================================================================================

pub struct ImagePrefetcher {
    config: PrefetchConfig,
    mode: Mode,
}

/// With a manifest source the layer runs the background producer; without
/// one, only synchronous ad-hoc injection is available and geometry is
/// established lazily from the first injected image.
enum Mode {
    Background {
        params: Arc<RunParams>,
        /// `Some` between calls; taken only for the join→copy→restart window.
        inflight: Option<RunHandle>,
    },
    Adhoc {
        seeds: SeedSource,
        state: Option<AdhocState>,
    },
}

struct AdhocState {
    params: Arc<RunParams>,
    buffer: PrefetchBuffer,
    filled: bool,
}

// ================================================================================================
// 2. Construction / setup
// ================================================================================================

impl ImagePrefetcher {
    /// Creates the layer with the default file decoder.
    pub fn new(config: PrefetchConfig) -> Result<Self> {
        Self::with_decoder(config, FileDecoder::new())
    }

    /// Creates the layer with a custom decoder (the narrow seam tests and
    /// embedders use to substitute the image-loading backend).
    ///
    /// With a manifest source configured, setup reads the manifest,
    /// optionally shuffles and random-skips, decodes one probe image to
    /// establish the batch geometry, loads (or zero-fills) the mean, and
    /// starts the first background run before returning.
    pub fn with_decoder(config: PrefetchConfig, decoder: impl Decoder + 'static) -> Result<Self> {
        config.validate()?;

        let mut seeds = match config.seed {
            Some(seed) => SeedSource::from_seed(seed),
            None => SeedSource::from_entropy(),
        };

        let mode = match &config.source {
            Some(source) => {
                let mut list = ImageList::from_manifest(source)?;
                info!(
                    manifest = %source.display(),
                    images = list.len(),
                    "loaded image manifest"
                );

                if config.shuffle {
                    info!("shuffling image list");
                    let mut rng = RunRng::new(seeds.next_seed());
                    list.shuffle(&mut rng);
                }

                if config.rand_skip > 0 {
                    let skip = RunRng::new(seeds.next_seed()).index(config.rand_skip);
                    info!(skip, "skipping initial data points");
                    list.skip(skip)?;
                }

                let decoder: Box<dyn Decoder> = Box::new(decoder);
                // Probe the entry under the cursor for sizing; the cursor
                // stays put, so the first run re-reads it as batch item 0.
                let probe = decoder
                    .decode(
                        &list.current().path,
                        list.current().label,
                        config.resize(),
                        config.color,
                    )
                    .with_context(|| {
                        format!(
                            "Failed to decode first image: {}",
                            list.current().path.display()
                        )
                    })?;

                let geometry =
                    BatchGeometry::from_first_image(config.batch_size, config.crop_size, &probe)?;
                let mean = load_mean(&config, &geometry)?;
                let params = Arc::new(run_params(&config, geometry, mean));
                info!(
                    batch_size = geometry.batch_size,
                    channels = geometry.channels,
                    height = geometry.out_height(),
                    width = geometry.out_width(),
                    "output batch shape established"
                );

                let buffer = PrefetchBuffer::new(&geometry);
                let worker = FillWorker {
                    list,
                    seeds,
                    decoder,
                };
                let inflight = Some(RunHandle::spawn(worker, buffer, params.clone())?);
                Mode::Background { params, inflight }
            }
            None => Mode::Adhoc { seeds, state: None },
        };

        Ok(Self { config, mode })
    }

    /// The batch geometry, once established (always available with a
    /// manifest source; `None` before the first ad-hoc injection).
    pub fn geometry(&self) -> Option<BatchGeometry> {
        match &self.mode {
            Mode::Background { params, .. } => Some(params.geometry),
            Mode::Adhoc { state, .. } => state.as_ref().map(|s| s.params.geometry),
        }
    }

    // ============================================================================================
    // 3. Consumer handoff
    // ============================================================================================

    /// Returns the next complete batch.
    ///
    /// With a manifest source this blocks until the in-flight fill run
    /// completes, copies the batch out, and immediately starts the next
    /// run. The copy happens strictly before the new run writes, so the
    /// returned tensors are never touched again. Without a source it
    /// returns a copy of the last injected batch.
    pub fn next_batch(&mut self) -> Result<Batch> {
        match &mut self.mode {
            Mode::Background { params, inflight } => {
                let handle = inflight.take().ok_or_else(|| PrefetchError::Runtime {
                    reason: "no fill run in flight".to_string(),
                })?;

                let outcome = handle.join()?;
                outcome.result?;

                let batch = Batch::copy_from(&outcome.buffer, &params.geometry);
                *inflight = Some(RunHandle::spawn(
                    outcome.worker,
                    outcome.buffer,
                    params.clone(),
                )?);
                Ok(batch)
            }
            Mode::Adhoc { state, .. } => {
                let state = state.as_ref().filter(|s| s.filled).ok_or_else(|| {
                    PrefetchError::config(
                        "no batch available: inject images first (no manifest source configured)",
                    )
                })?;
                Ok(Batch::copy_from(&state.buffer, &state.params.geometry))
            }
        }
    }

    // ============================================================================================
    // 4. Ad-hoc batch injection
    // ============================================================================================

    /// Fills the batch synchronously from externally supplied images,
    /// bypassing the manifest and the background worker.
    ///
    /// The batch is filled by cycling through the supplied images
    /// (`slot % images.len()`) until all `batch_size` slots are written,
    /// through the same crop/mirror/mean transform as the manifest path.
    /// Geometry is established from the first supplied image when the
    /// layer has produced nothing yet.
    ///
    /// # Errors
    /// - no images, more images than `batch_size`, or fewer labels than
    ///   images
    /// - a manifest source is configured (the background worker is the
    ///   buffer's only writer then)
    pub fn add_images_and_labels(
        &mut self,
        images: &[DynamicImage],
        labels: &[i64],
    ) -> Result<()> {
        let Mode::Adhoc { seeds, state } = &mut self.mode else {
            return Err(PrefetchError::config(
                "ad-hoc injection requires a layer without a manifest source",
            )
            .into());
        };

        if images.is_empty() {
            return Err(PrefetchError::argument("there is no image to add").into());
        }
        if images.len() > self.config.batch_size {
            return Err(PrefetchError::argument(format!(
                "the number of added images {} must be no greater than the batch size {}",
                images.len(),
                self.config.batch_size
            ))
            .into());
        }
        if labels.len() < images.len() {
            return Err(PrefetchError::argument(format!(
                "{} images were supplied with only {} labels",
                images.len(),
                labels.len()
            ))
            .into());
        }

        let decoded: Vec<DecodedImage> = images
            .iter()
            .zip(labels)
            .map(|(img, &label)| {
                DecodedImage::from_dynamic(img, label, self.config.resize(), self.config.color)
            })
            .collect::<Result<_>>()?;

        if state.is_none() {
            let geometry = BatchGeometry::from_first_image(
                self.config.batch_size,
                self.config.crop_size,
                &decoded[0],
            )?;
            let mean = load_mean(&self.config, &geometry)?;
            let buffer = PrefetchBuffer::new(&geometry);
            *state = Some(AdhocState {
                params: Arc::new(run_params(&self.config, geometry, mean)),
                buffer,
                filled: false,
            });
        }
        let state = state.as_mut().expect("state established above");
        let params = state.params.clone();

        let mut rng = params.needs_rng().then(|| RunRng::new(seeds.next_seed()));
        for slot in 0..params.geometry.batch_size {
            let image = &decoded[slot % decoded.len()];
            let policy =
                CropPolicy::resolve(&params.geometry, params.phase, params.mirror, rng.as_mut());
            write_sample(
                image,
                &params.mean,
                params.scale,
                &policy,
                slot,
                &mut state.buffer,
                &params.geometry,
            )?;
        }
        state.filled = true;
        Ok(())
    }
}

/// Joining the outstanding run before the buffers go away is what keeps
/// teardown free of dangling background work.
impl Drop for ImagePrefetcher {
    fn drop(&mut self) {
        if let Mode::Background { inflight, .. } = &mut self.mode {
            if let Some(handle) = inflight.take() {
                let _ = handle.join();
            }
        }
    }
}

// ================================================================================================
// 5. Setup helpers
// ================================================================================================

fn run_params(config: &PrefetchConfig, geometry: BatchGeometry, mean: MeanBuffer) -> RunParams {
    RunParams {
        geometry,
        mean: Arc::new(mean),
        scale: config.scale,
        mirror: config.mirror,
        shuffle: config.shuffle,
        phase: config.phase,
        resize: config.resize(),
        color: config.color,
    }
}

/// Loads the configured mean file, or zero-fills one, and checks its shape
/// against the established geometry.
fn load_mean(config: &PrefetchConfig, geometry: &BatchGeometry) -> Result<MeanBuffer> {
    match &config.mean_file {
        Some(path) => {
            info!(mean_file = %path.display(), "loading mean file");
            let mean = MeanBuffer::from_file(path)?;
            if !mean.matches(geometry.channels, geometry.height, geometry.width) {
                let (mc, mh, mw) = mean.shape();
                return Err(PrefetchError::geometry(format!(
                    "mean shape {}x{}x{} does not match decoded image shape {}x{}x{}",
                    mc, mh, mw, geometry.channels, geometry.height, geometry.width
                ))
                .into());
            }
            Ok(mean)
        }
        None => Ok(MeanBuffer::zeros(
            geometry.channels,
            geometry.height,
            geometry.width,
        )),
    }
}
