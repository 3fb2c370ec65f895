//! Background image prefetching for training loops.
//!
//! The layer reads labeled image paths from a plain-text manifest, decodes
//! and normalizes them into fixed-shape batches on a background thread, and
//! hands each finished batch to the caller while the next one is already
//! being produced. Epoch ordering, shuffling, random crops, and mirroring
//! are all deterministic under a configured seed.

pub mod batch;
pub mod config;
pub mod decode;
pub mod error;
pub mod manifest;
pub mod mean;
pub mod prefetcher;
pub mod rng;

mod producer;
mod transform;

pub use batch::{Batch, BatchGeometry};
pub use config::{Phase, PrefetchConfig, PrefetchConfigBuilder};
pub use decode::{DecodedImage, Decoder, FileDecoder, PixelData};
pub use error::PrefetchError;
pub use manifest::{ImageEntry, ImageList};
pub use mean::MeanBuffer;
pub use prefetcher::ImagePrefetcher;
pub use rng::SeedSource;
