//! Image decoding behind a narrow interface.
//!
//! The fill worker never touches image files directly; it goes through the
//! [`Decoder`] trait, which keeps on-disk formats and decode libraries out
//! of the core pipeline (and lets tests substitute a deterministic fake).
//! [`FileDecoder`] is the shipped implementation, built on the `image`
//! crate with buffered I/O and format sniffing.
//!
//! Decoded pixels are stored channel-major (planar): sample `(c, h, w)`
//! lives at index `(c * height + h) * width + w`. The transform and the
//! mean buffer index with the same formula.

use anyhow::{ensure, Context, Result};
use image::imageops::FilterType;
use image::{io::Reader as ImageReader, DynamicImage};
use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::Path;

/// Raw sample payload of one decoded image.
///
/// Byte payloads are unsigned 8-bit magnitudes (0–255); float payloads are
/// literal values copied through unchanged. Cropping requires bytes.
#[derive(Debug, Clone)]
pub enum PixelData {
    Bytes(Vec<u8>),
    Floats(Vec<f32>),
}

/// One decoded image plus its label, channel-major.
///
/// Ephemeral: produced by a [`Decoder`] and consumed by the slot transform
/// within a single fill iteration.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub channels: u32,
    pub height: u32,
    pub width: u32,
    pub pixels: PixelData,
    pub label: i64,
}

impl DecodedImage {
    /// Wraps a channel-major byte payload, checking the length against the
    /// declared dimensions.
    pub fn from_bytes(
        channels: u32,
        height: u32,
        width: u32,
        bytes: Vec<u8>,
        label: i64,
    ) -> Result<Self> {
        let expected = (channels * height * width) as usize;
        ensure!(
            bytes.len() == expected,
            "pixel payload has {} bytes, expected {} for {}x{}x{}",
            bytes.len(),
            expected,
            channels,
            height,
            width
        );
        Ok(Self {
            channels,
            height,
            width,
            pixels: PixelData::Bytes(bytes),
            label,
        })
    }

    /// Wraps a channel-major float payload.
    pub fn from_floats(
        channels: u32,
        height: u32,
        width: u32,
        values: Vec<f32>,
        label: i64,
    ) -> Result<Self> {
        let expected = (channels * height * width) as usize;
        ensure!(
            values.len() == expected,
            "pixel payload has {} values, expected {} for {}x{}x{}",
            values.len(),
            expected,
            channels,
            height,
            width
        );
        Ok(Self {
            channels,
            height,
            width,
            pixels: PixelData::Floats(values),
            label,
        })
    }

    /// Converts an in-memory image to the layer's channel-major byte layout,
    /// applying the same resize/color policy the file path takes. This is
    /// the entry point for ad-hoc batch injection.
    pub fn from_dynamic(
        img: &DynamicImage,
        label: i64,
        resize: Option<(u32, u32)>,
        color: bool,
    ) -> Result<Self> {
        let img = match resize {
            Some((height, width)) => img.resize_exact(width, height, FilterType::Triangle),
            None => img.clone(),
        };
        let (channels, height, width, bytes) = planar_bytes(&img, color);
        Self::from_bytes(channels, height, width, bytes, label)
    }

    /// Values per image (`channels * height * width`).
    pub fn len(&self) -> usize {
        (self.channels * self.height * self.width) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The external image-decoder interface.
///
/// `resize` asks for an exact `(height, width)` target; `color` selects
/// 3-channel RGB versus single-channel grayscale output.
pub trait Decoder: Send {
    fn decode(
        &self,
        path: &Path,
        label: i64,
        resize: Option<(u32, u32)>,
        color: bool,
    ) -> Result<DecodedImage>;
}

/// Default decoder reading image files from disk with the `image` crate.
#[derive(Debug, Clone)]
pub struct FileDecoder {
    buffer_size: usize,
}

impl FileDecoder {
    /// Creates a decoder with an 8KB read buffer.
    pub fn new() -> Self {
        Self { buffer_size: 8192 }
    }
}

impl Default for FileDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FileDecoder {
    fn decode(
        &self,
        path: &Path,
        label: i64,
        resize: Option<(u32, u32)>,
        color: bool,
    ) -> Result<DecodedImage> {
        let file =
            File::open(path).with_context(|| format!("Failed to open image: {}", path.display()))?;

        let file_size = file.metadata()?.len() as usize;
        let mut reader = BufReader::with_capacity(self.buffer_size, file);
        let mut buffer = Vec::with_capacity(file_size);
        reader
            .read_to_end(&mut buffer)
            .with_context(|| format!("Failed to read image: {}", path.display()))?;

        let img = ImageReader::new(Cursor::new(buffer))
            .with_guessed_format()?
            .decode()
            .with_context(|| format!("Failed to decode image: {}", path.display()))?;

        DecodedImage::from_dynamic(&img, label, resize, color)
    }
}

/// Reorders interleaved HWC pixels into the planar CHW layout.
fn planar_bytes(img: &DynamicImage, color: bool) -> (u32, u32, u32, Vec<u8>) {
    if color {
        let rgb = img.to_rgb8();
        let (width, height) = rgb.dimensions();
        let (w, h) = (width as usize, height as usize);
        let raw = rgb.as_raw();

        let mut planar = vec![0u8; 3 * h * w];
        for c in 0..3 {
            for y in 0..h {
                for x in 0..w {
                    planar[(c * h + y) * w + x] = raw[(y * w + x) * 3 + c];
                }
            }
        }
        (3, height, width, planar)
    } else {
        let gray = img.to_luma8();
        let (width, height) = gray.dimensions();
        (1, height, width, gray.into_raw())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use tempfile::NamedTempFile;

    fn save_test_image() -> Result<NamedTempFile> {
        // 2x2 with distinct corner colors.
        let mut img = RgbImage::new(2, 2);
        img.put_pixel(0, 0, Rgb([255, 0, 0]));
        img.put_pixel(1, 0, Rgb([0, 255, 0]));
        img.put_pixel(0, 1, Rgb([0, 0, 255]));
        img.put_pixel(1, 1, Rgb([9, 9, 9]));

        let file = NamedTempFile::with_suffix(".png")?;
        img.save(file.path())?;
        Ok(file)
    }

    #[test]
    fn test_decode_is_channel_major() -> Result<()> {
        let file = save_test_image()?;
        let decoder = FileDecoder::new();
        let img = decoder.decode(file.path(), 7, None, true)?;

        assert_eq!((img.channels, img.height, img.width), (3, 2, 2));
        assert_eq!(img.label, 7);

        let PixelData::Bytes(bytes) = &img.pixels else {
            panic!("expected byte payload");
        };
        // Red plane first: row-major [255, 0, 0, 9].
        assert_eq!(&bytes[0..4], &[255, 0, 0, 9]);
        // Green plane: [0, 255, 0, 9].
        assert_eq!(&bytes[4..8], &[0, 255, 0, 9]);
        // Blue plane: [0, 0, 255, 9].
        assert_eq!(&bytes[8..12], &[0, 0, 255, 9]);
        Ok(())
    }

    #[test]
    fn test_decode_grayscale_has_one_channel() -> Result<()> {
        let file = save_test_image()?;
        let decoder = FileDecoder::new();
        let img = decoder.decode(file.path(), 0, None, false)?;

        assert_eq!(img.channels, 1);
        assert_eq!(img.len(), 4);
        Ok(())
    }

    #[test]
    fn test_decode_resizes_exactly() -> Result<()> {
        let file = save_test_image()?;
        let decoder = FileDecoder::new();
        let img = decoder.decode(file.path(), 0, Some((4, 6)), true)?;

        assert_eq!((img.height, img.width), (4, 6));
        assert_eq!(img.len(), 3 * 4 * 6);
        Ok(())
    }

    #[test]
    fn test_decode_missing_file_fails() {
        let decoder = FileDecoder::new();
        assert!(decoder
            .decode(Path::new("nonexistent.jpg"), 0, None, true)
            .is_err());
    }

    #[test]
    fn test_payload_length_is_checked() {
        assert!(DecodedImage::from_bytes(3, 2, 2, vec![0u8; 5], 0).is_err());
        assert!(DecodedImage::from_floats(1, 2, 2, vec![0.0; 4], 0).is_ok());
    }
}
