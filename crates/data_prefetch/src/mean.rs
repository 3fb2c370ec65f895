//! The per-pixel mean buffer.
//!
//! Loaded once at setup (from a safetensors file when configured, all-zero
//! otherwise), then shared read-only by every transform invocation. The
//! buffer always has the full decoded-image shape `(channels, height,
//! width)`; cropped transforms index into it with uncropped coordinates.

use anyhow::{bail, Context, Result};
use safetensors::tensor::Dtype;
use safetensors::SafeTensors;
use std::fs;
use std::path::Path;

/// Name of the tensor looked up first in a mean file.
const MEAN_TENSOR_NAME: &str = "mean";

#[derive(Debug)]
pub struct MeanBuffer {
    channels: u32,
    height: u32,
    width: u32,
    values: Vec<f32>,
}

impl MeanBuffer {
    /// All-zero mean with the given full-image shape.
    pub fn zeros(channels: u32, height: u32, width: u32) -> Self {
        Self {
            channels,
            height,
            width,
            values: vec![0.0; (channels * height * width) as usize],
        }
    }

    /// Loads the mean from a safetensors file.
    ///
    /// The file must hold an f32 tensor named `mean` (or a single tensor of
    /// any name) with shape `(C, H, W)`; a leading batch dimension of 1 is
    /// accepted and squeezed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("Failed to read mean file: {}", path.display()))?;
        let tensors = SafeTensors::deserialize(&bytes)
            .with_context(|| format!("Failed to parse mean file: {}", path.display()))?;

        let names = tensors.names();
        let name = if names.iter().any(|n| n.as_str() == MEAN_TENSOR_NAME) {
            MEAN_TENSOR_NAME.to_string()
        } else if names.len() == 1 {
            names[0].to_string()
        } else {
            bail!(
                "Mean file {} holds {} tensors and none is named '{}'",
                path.display(),
                names.len(),
                MEAN_TENSOR_NAME
            );
        };

        let view = tensors
            .tensor(&name)
            .with_context(|| format!("Failed to access tensor '{}' in mean file", name))?;
        if view.dtype() != Dtype::F32 {
            bail!(
                "Mean tensor '{}' has dtype {:?}, expected F32",
                name,
                view.dtype()
            );
        }

        let mut shape = view.shape().to_vec();
        if shape.len() == 4 && shape[0] == 1 {
            shape.remove(0);
        }
        let &[channels, height, width] = shape.as_slice() else {
            bail!(
                "Mean tensor '{}' has shape {:?}, expected (channels, height, width)",
                name,
                view.shape()
            );
        };

        let values: Vec<f32> = bytemuck::pod_collect_to_vec(view.data());
        Ok(Self {
            channels: channels as u32,
            height: height as u32,
            width: width as u32,
            values,
        })
    }

    pub fn shape(&self) -> (u32, u32, u32) {
        (self.channels, self.height, self.width)
    }

    /// True when the mean covers images of the given decoded shape.
    pub(crate) fn matches(&self, channels: u32, height: u32, width: u32) -> bool {
        (self.channels, self.height, self.width) == (channels, height, width)
    }

    pub(crate) fn values(&self) -> &[f32] {
        &self.values
    }
}
