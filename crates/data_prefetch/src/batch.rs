//! Batch storage and the consumer-facing batch type.
//!
//! Geometry is fixed once at setup, from the first decoded image and the
//! configured crop size. The prefetch buffer is allocated once with that
//! shape and overwritten in place by every fill run; the consumer copy
//! step materializes fresh tensors, so nothing the caller holds aliases
//! internal storage.

use crate::decode::DecodedImage;
use crate::error::PrefetchError;
use anyhow::Result;
use tch::Tensor;

/// Fixed output shape of every batch the layer produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchGeometry {
    pub batch_size: usize,
    /// Channels of the decoded source images.
    pub channels: u32,
    /// Full decoded height, before any crop.
    pub height: u32,
    /// Full decoded width, before any crop.
    pub width: u32,
    /// Square crop edge; 0 means samples keep the full decoded size.
    pub crop_size: u32,
}

impl BatchGeometry {
    /// Establishes the geometry from the first decoded image.
    ///
    /// When cropping is configured, both spatial dimensions must be
    /// strictly larger than the crop edge.
    pub(crate) fn from_first_image(
        batch_size: usize,
        crop_size: u32,
        image: &DecodedImage,
    ) -> Result<Self> {
        if image.channels == 0 || image.height == 0 || image.width == 0 {
            return Err(PrefetchError::geometry(format!(
                "decoded image has degenerate shape {}x{}x{}",
                image.channels, image.height, image.width
            ))
            .into());
        }
        if crop_size > 0 && (image.height <= crop_size || image.width <= crop_size) {
            return Err(PrefetchError::geometry(format!(
                "crop size {} must be smaller than image height {} and width {}",
                crop_size, image.height, image.width
            ))
            .into());
        }
        Ok(Self {
            batch_size,
            channels: image.channels,
            height: image.height,
            width: image.width,
            crop_size,
        })
    }

    pub fn out_height(&self) -> u32 {
        if self.crop_size > 0 {
            self.crop_size
        } else {
            self.height
        }
    }

    pub fn out_width(&self) -> u32 {
        if self.crop_size > 0 {
            self.crop_size
        } else {
            self.width
        }
    }

    /// Values per sample in the output tensor.
    pub fn sample_len(&self) -> usize {
        (self.channels * self.out_height() * self.out_width()) as usize
    }

    /// Values in the whole batch data tensor.
    pub fn data_len(&self) -> usize {
        self.batch_size * self.sample_len()
    }
}

/// The reusable double-buffered batch storage.
///
/// Exactly one of the producer (while a run is in flight) and the consumer
/// (between runs) owns this at any time; ownership travels with the run
/// handle, which is what makes the no-tearing guarantee structural.
#[derive(Debug)]
pub(crate) struct PrefetchBuffer {
    pub(crate) data: Vec<f32>,
    pub(crate) labels: Vec<i64>,
}

impl PrefetchBuffer {
    pub(crate) fn new(geometry: &BatchGeometry) -> Self {
        Self {
            data: vec![0.0; geometry.data_len()],
            labels: vec![0; geometry.batch_size],
        }
    }
}

/// One complete batch, handed to the consumer as caller-owned tensors.
///
/// `data` has shape `(batch_size, channels, out_height, out_width)` and
/// kind `Float`; `labels` has shape `(batch_size,)` and kind `Int64`.
#[derive(Debug)]
pub struct Batch {
    pub data: Tensor,
    pub labels: Tensor,
}

impl Batch {
    /// Copies the filled buffer out into fresh tensors.
    pub(crate) fn copy_from(buffer: &PrefetchBuffer, geometry: &BatchGeometry) -> Self {
        let data = Tensor::from_slice(&buffer.data).reshape(&[
            geometry.batch_size as i64,
            geometry.channels as i64,
            geometry.out_height() as i64,
            geometry.out_width() as i64,
        ]);
        let labels = Tensor::from_slice(&buffer.labels);
        Self { data, labels }
    }
}
