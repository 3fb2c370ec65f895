#![allow(dead_code)]

use anyhow::Result;
use data_prefetch::Batch;
use image::{Rgb, RgbImage};
use std::fs;
use std::path::{Path, PathBuf};

/// Saves a `size` x `size` RGB image whose every pixel is `(value, value, value)`.
pub fn save_uniform_image(dir: &Path, name: &str, size: u32, value: u8) -> PathBuf {
    let mut img = RgbImage::new(size, size);
    for pixel in img.pixels_mut() {
        *pixel = Rgb([value, value, value]);
    }
    let path = dir.join(name);
    img.save(&path).unwrap();
    path
}

/// Saves a `size` x `size` RGB image where pixel `(y, x)` is
/// `step * (y * size + x)` in all three channels, giving every position a
/// distinct value (pick `step` so the maximum stays below 256).
pub fn save_gradient_image(dir: &Path, name: &str, size: u32, step: u8) -> PathBuf {
    let mut img = RgbImage::new(size, size);
    for y in 0..size {
        for x in 0..size {
            let v = (step as u32 * (y * size + x)) as u8;
            img.put_pixel(x, y, Rgb([v, v, v]));
        }
    }
    let path = dir.join(name);
    img.save(&path).unwrap();
    path
}

/// Writes a manifest of absolute-path `<path> <label>` lines.
pub fn write_manifest(dir: &Path, entries: &[(&Path, i64)]) -> PathBuf {
    let manifest = dir.join("manifest.txt");
    let contents: String = entries
        .iter()
        .map(|(path, label)| format!("{} {}\n", path.display(), label))
        .collect();
    fs::write(&manifest, contents).unwrap();
    manifest
}

/// Extracts the label tensor as a plain vector.
pub fn labels_of(batch: &Batch) -> Result<Vec<i64>> {
    Ok(Vec::<i64>::try_from(&batch.labels)?)
}

/// Reads one output value at `(b, c, h, w)`.
pub fn value_at(batch: &Batch, b: i64, c: i64, h: i64, w: i64) -> f64 {
    batch.data.double_value(&[b, c, h, w])
}
