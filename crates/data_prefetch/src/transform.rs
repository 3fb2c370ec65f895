//! The per-sample transform: decoded image -> normalized batch slot.
//!
//! One call writes one sample into the batch data buffer and its label into
//! the label buffer. Every output value is `(raw - mean) * scale`, where the
//! mean is indexed with the same uncropped `(c, h + h_off, w + w_off)`
//! coordinates as the pixel itself. Cropped windows may additionally be
//! written column-reversed (horizontal mirror).

use crate::batch::{BatchGeometry, PrefetchBuffer};
use crate::config::Phase;
use crate::decode::{DecodedImage, PixelData};
use crate::error::PrefetchError;
use crate::mean::MeanBuffer;
use crate::rng::RunRng;
use anyhow::Result;

/// How one sample is windowed into the output slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CropPolicy {
    /// Copy the whole image, no crop, no mirror.
    Full,
    /// Copy a `size` x `size` window at `(h_off, w_off)`, optionally
    /// column-reversed.
    Window {
        size: u32,
        h_off: u32,
        w_off: u32,
        mirror: bool,
    },
}

impl CropPolicy {
    /// Resolves the policy for one sample.
    ///
    /// Training draws offsets uniformly from `[0, dim - crop)`; evaluation
    /// centers the window at `(dim - crop) / 2` with no randomness. The
    /// mirror coin is flipped in either phase when mirroring is enabled.
    /// Callers pass a generator whenever the policy can need one (random
    /// offsets or the mirror coin); the deterministic fallbacks keep the
    /// function total.
    pub(crate) fn resolve(
        geometry: &BatchGeometry,
        phase: Phase,
        mirror: bool,
        mut rng: Option<&mut RunRng>,
    ) -> CropPolicy {
        if geometry.crop_size == 0 {
            return CropPolicy::Full;
        }

        let size = geometry.crop_size;
        let h_range = geometry.height - size;
        let w_range = geometry.width - size;

        let (h_off, w_off) = match (phase, rng.as_mut()) {
            (Phase::Train, Some(rng)) => rng.crop_offsets(h_range, w_range),
            _ => (h_range / 2, w_range / 2),
        };

        let mirror = mirror && rng.map_or(false, |rng| rng.mirror_coin());

        CropPolicy::Window {
            size,
            h_off,
            w_off,
            mirror,
        }
    }
}

/// Writes one decoded image into batch slot `slot`.
///
/// The image must match the established geometry exactly; a mismatched
/// image would otherwise be indexed with the wrong strides and silently
/// corrupt the sample.
pub(crate) fn write_sample(
    image: &DecodedImage,
    mean: &MeanBuffer,
    scale: f32,
    policy: &CropPolicy,
    slot: usize,
    buffer: &mut PrefetchBuffer,
    geometry: &BatchGeometry,
) -> Result<()> {
    if (image.channels, image.height, image.width)
        != (geometry.channels, geometry.height, geometry.width)
    {
        return Err(PrefetchError::geometry(format!(
            "decoded image shape {}x{}x{} does not match the established {}x{}x{}",
            image.channels,
            image.height,
            image.width,
            geometry.channels,
            geometry.height,
            geometry.width
        ))
        .into());
    }

    let mean_values = mean.values();
    let sample = &mut buffer.data[slot * geometry.sample_len()..][..geometry.sample_len()];

    match policy {
        CropPolicy::Full => write_full(image, mean_values, scale, sample),
        CropPolicy::Window {
            size,
            h_off,
            w_off,
            mirror,
        } => write_window(
            image,
            mean_values,
            scale,
            *size,
            *h_off,
            *w_off,
            *mirror,
            sample,
        )?,
    }

    buffer.labels[slot] = image.label;
    Ok(())
}

fn write_full(image: &DecodedImage, mean: &[f32], scale: f32, sample: &mut [f32]) {
    match &image.pixels {
        PixelData::Bytes(bytes) => {
            for (j, (&byte, out)) in bytes.iter().zip(sample.iter_mut()).enumerate() {
                *out = (byte as f32 - mean[j]) * scale;
            }
        }
        PixelData::Floats(values) => {
            for (j, (&value, out)) in values.iter().zip(sample.iter_mut()).enumerate() {
                *out = (value - mean[j]) * scale;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn write_window(
    image: &DecodedImage,
    mean: &[f32],
    scale: f32,
    size: u32,
    h_off: u32,
    w_off: u32,
    mirror: bool,
    sample: &mut [f32],
) -> Result<()> {
    let PixelData::Bytes(bytes) = &image.pixels else {
        return Err(PrefetchError::geometry("image cropping requires byte pixel data").into());
    };

    let (channels, height, width) = (
        image.channels as usize,
        image.height as usize,
        image.width as usize,
    );
    let (size, h_off, w_off) = (size as usize, h_off as usize, w_off as usize);

    for c in 0..channels {
        for h in 0..size {
            let src_row = (c * height + h + h_off) * width + w_off;
            let dst_row = (c * size + h) * size;
            for w in 0..size {
                let src = src_row + w;
                let dst = if mirror {
                    dst_row + size - 1 - w
                } else {
                    dst_row + w
                };
                sample[dst] = (bytes[src] as f32 - mean[src]) * scale;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::PrefetchBuffer;
    use safetensors::tensor::{Dtype, TensorView};

    fn byte_image(channels: u32, height: u32, width: u32, label: i64) -> DecodedImage {
        let len = (channels * height * width) as usize;
        let bytes: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        DecodedImage::from_bytes(channels, height, width, bytes, label).unwrap()
    }

    /// Builds a MeanBuffer with explicit values by round-tripping through a
    /// temporary safetensors file (the only loading path the layer has).
    fn mean_with_values(channels: u32, height: u32, width: u32, values: &[f32]) -> MeanBuffer {
        let bytes: Vec<u8> = bytemuck::cast_slice(values).to_vec();
        let view = TensorView::new(
            Dtype::F32,
            vec![channels as usize, height as usize, width as usize],
            &bytes,
        )
        .unwrap();
        let file = tempfile::NamedTempFile::with_suffix(".safetensors").unwrap();
        safetensors::serialize_to_file(vec![("mean", view)], &None, file.path()).unwrap();
        MeanBuffer::from_file(file.path()).unwrap()
    }

    fn setup(
        batch_size: usize,
        crop: u32,
        image: &DecodedImage,
    ) -> (BatchGeometry, PrefetchBuffer, MeanBuffer) {
        let geometry = BatchGeometry::from_first_image(batch_size, crop, image).unwrap();
        let buffer = PrefetchBuffer::new(&geometry);
        let mean = MeanBuffer::zeros(image.channels, image.height, image.width);
        (geometry, buffer, mean)
    }

    #[test]
    fn test_full_copy_applies_mean_and_scale() -> Result<()> {
        let image = byte_image(1, 2, 3, 4);
        let (geometry, mut buffer, _) = setup(2, 0, &image);
        let mean_values: Vec<f32> = (0..6).map(|j| j as f32 / 10.0).collect();
        let mean = mean_with_values(1, 2, 3, &mean_values);

        write_sample(&image, &mean, 0.5, &CropPolicy::Full, 1, &mut buffer, &geometry)?;

        // byte_image value at j is j, so output j is (j - j/10) * 0.5.
        let sample = &buffer.data[geometry.sample_len()..];
        for j in 0..6 {
            let expected = (j as f32 - j as f32 / 10.0) * 0.5;
            assert_eq!(sample[j], expected);
        }
        assert_eq!(buffer.labels[1], 4);
        // Slot 0 untouched.
        assert!(buffer.data[..geometry.sample_len()]
            .iter()
            .all(|&v| v == 0.0));
        Ok(())
    }

    #[test]
    fn test_float_payload_copies_literal_values() -> Result<()> {
        let values: Vec<f32> = vec![0.25, -1.5, 3.0, 0.0];
        let image = DecodedImage::from_floats(1, 2, 2, values.clone(), 7).unwrap();
        let (geometry, mut buffer, mean) = setup(1, 0, &image);

        write_sample(&image, &mean, 2.0, &CropPolicy::Full, 0, &mut buffer, &geometry)?;
        for (j, &v) in values.iter().enumerate() {
            assert_eq!(buffer.data[j], v * 2.0);
        }
        assert_eq!(buffer.labels[0], 7);
        Ok(())
    }

    #[test]
    fn test_window_reads_offset_region_with_uncropped_mean_indexing() -> Result<()> {
        // 1x4x4 image whose byte value at index j is j, and a mean that is
        // also j at index j: any output differing from 0 would mean the two
        // lookups diverged (e.g. a re-cropped mean).
        let image = byte_image(1, 4, 4, 0);
        let (geometry, mut buffer, _) = setup(1, 2, &image);
        let mean_values: Vec<f32> = (0..16).map(|j| j as f32).collect();
        let mean = mean_with_values(1, 4, 4, &mean_values);

        let policy = CropPolicy::Window {
            size: 2,
            h_off: 1,
            w_off: 2,
            mirror: false,
        };
        write_sample(&image, &mean, 1.0, &policy, 0, &mut buffer, &geometry)?;

        for &v in &buffer.data {
            assert_eq!(v, 0.0);
        }
        Ok(())
    }

    #[test]
    fn test_window_copies_expected_pixels() -> Result<()> {
        let image = byte_image(1, 4, 4, 0);
        let (geometry, mut buffer, mean) = setup(1, 2, &image);

        let policy = CropPolicy::Window {
            size: 2,
            h_off: 1,
            w_off: 2,
            mirror: false,
        };
        write_sample(&image, &mean, 1.0, &policy, 0, &mut buffer, &geometry)?;

        // Window rows start at bytes (1)*4+2=6 and (2)*4+2=10.
        assert_eq!(buffer.data, vec![6.0, 7.0, 10.0, 11.0]);
        Ok(())
    }

    #[test]
    fn test_mirror_reverses_columns() -> Result<()> {
        let image = byte_image(2, 5, 5, 0);
        let (geometry, mut plain, mean) = setup(1, 3, &image);
        let mut mirrored = PrefetchBuffer::new(&geometry);

        let window = |mirror| CropPolicy::Window {
            size: 3,
            h_off: 1,
            w_off: 1,
            mirror,
        };
        write_sample(&image, &mean, 1.0, &window(false), 0, &mut plain, &geometry)?;
        write_sample(&image, &mean, 1.0, &window(true), 0, &mut mirrored, &geometry)?;

        for c in 0..2 {
            for h in 0..3 {
                for w in 0..3 {
                    let plain_v = plain.data[(c * 3 + h) * 3 + w];
                    let mirror_v = mirrored.data[(c * 3 + h) * 3 + (3 - 1 - w)];
                    assert_eq!(plain_v, mirror_v);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_cropping_float_payload_is_rejected() {
        let image = DecodedImage::from_floats(1, 4, 4, vec![0.0; 16], 0).unwrap();
        let (geometry, mut buffer, mean) = setup(1, 2, &image);

        let policy = CropPolicy::Window {
            size: 2,
            h_off: 0,
            w_off: 0,
            mirror: false,
        };
        let err = write_sample(&image, &mean, 1.0, &policy, 0, &mut buffer, &geometry).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PrefetchError>(),
            Some(PrefetchError::Geometry { .. })
        ));
    }

    #[test]
    fn test_shape_mismatch_is_fatal() {
        let first = byte_image(1, 4, 4, 0);
        let (geometry, mut buffer, mean) = setup(1, 0, &first);

        let other = byte_image(1, 4, 5, 0);
        let err = write_sample(&other, &mean, 1.0, &CropPolicy::Full, 0, &mut buffer, &geometry)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PrefetchError>(),
            Some(PrefetchError::Geometry { .. })
        ));
    }

    #[test]
    fn test_resolve_is_centered_in_eval_regardless_of_seed() {
        let image = byte_image(3, 10, 8, 0);
        let geometry = BatchGeometry::from_first_image(1, 4, &image).unwrap();

        let mut rng_a = RunRng::new(1);
        let mut rng_b = RunRng::new(999);
        let a = CropPolicy::resolve(&geometry, Phase::Eval, false, Some(&mut rng_a));
        let b = CropPolicy::resolve(&geometry, Phase::Eval, false, Some(&mut rng_b));

        let expected = CropPolicy::Window {
            size: 4,
            h_off: (10 - 4) / 2,
            w_off: (8 - 4) / 2,
            mirror: false,
        };
        assert_eq!(a, expected);
        assert_eq!(b, expected);
    }

    #[test]
    fn test_resolve_training_offsets_replay_under_fixed_seed() {
        let image = byte_image(3, 32, 48, 0);
        let geometry = BatchGeometry::from_first_image(1, 8, &image).unwrap();

        let mut rng_a = RunRng::new(42);
        let mut rng_b = RunRng::new(42);
        for _ in 0..16 {
            let a = CropPolicy::resolve(&geometry, Phase::Train, true, Some(&mut rng_a));
            let b = CropPolicy::resolve(&geometry, Phase::Train, true, Some(&mut rng_b));
            assert_eq!(a, b);
            match a {
                CropPolicy::Window { h_off, w_off, .. } => {
                    assert!(h_off < 32 - 8);
                    assert!(w_off < 48 - 8);
                }
                CropPolicy::Full => panic!("expected a window policy"),
            }
        }
    }
}
