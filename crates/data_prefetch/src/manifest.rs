//! The manifest-backed image list.
//!
//! A manifest is a plain-text file of whitespace-separated
//! `<path> <integer label>` pairs, read once at setup:
//!
//! ```text
//! images/cat_001.jpg 0
//! images/dog_041.jpg 1
//! images/cat_007.jpg 0
//! ```
//!
//! The list keeps a cursor that the fill worker advances one entry per
//! produced sample. On wraparound the whole list is reshuffled when
//! shuffling is enabled, giving each epoch a fresh deterministic order.

use crate::error::PrefetchError;
use crate::rng::RunRng;
use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};

/// One manifest line: an image path and its integer class label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageEntry {
    pub path: PathBuf,
    pub label: i64,
}

/// Ordered collection of labeled image paths plus a read cursor.
#[derive(Debug)]
pub struct ImageList {
    entries: Vec<ImageEntry>,
    position: usize,
}

impl ImageList {
    /// Creates a list from already-collected entries. Fails on an empty list
    /// (the layer cannot produce batches from nothing).
    pub fn new(entries: Vec<ImageEntry>) -> Result<Self> {
        if entries.is_empty() {
            return Err(PrefetchError::Manifest {
                path: "<in-memory>".to_string(),
                reason: "image list is empty".to_string(),
            }
            .into());
        }
        Ok(Self {
            entries,
            position: 0,
        })
    }

    /// Reads a manifest file into a list.
    ///
    /// Parsing consumes whitespace-separated tokens in `(path, label)` pairs
    /// until end of input. A path without a label, or a label that is not an
    /// integer, is a manifest error rather than a silent truncation.
    pub fn from_manifest(path: &Path) -> Result<Self> {
        let manifest_error = |reason: String| PrefetchError::Manifest {
            path: path.display().to_string(),
            reason,
        };

        let text = fs::read_to_string(path).map_err(|e| manifest_error(e.to_string()))?;

        let mut entries = Vec::new();
        let mut tokens = text.split_whitespace();
        while let Some(file) = tokens.next() {
            let label_token = tokens
                .next()
                .ok_or_else(|| manifest_error(format!("entry '{}' has no label", file)))?;
            let label: i64 = label_token.parse().map_err(|_| {
                manifest_error(format!(
                    "entry '{}' has a non-integer label '{}'",
                    file, label_token
                ))
            })?;
            entries.push(ImageEntry {
                path: PathBuf::from(file),
                label,
            });
        }

        if entries.is_empty() {
            return Err(manifest_error("manifest contains no entries".to_string()).into());
        }

        Ok(Self {
            entries,
            position: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The entry under the cursor.
    pub fn current(&self) -> &ImageEntry {
        &self.entries[self.position]
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Returns the labels in current list order (cursor unaffected).
    pub fn labels(&self) -> Vec<i64> {
        self.entries.iter().map(|e| e.label).collect()
    }

    /// Sets the cursor to `k`, failing when the list is too short.
    pub fn skip(&mut self, k: usize) -> Result<()> {
        if k >= self.entries.len() {
            return Err(PrefetchError::InsufficientData {
                skip: k,
                len: self.entries.len(),
            }
            .into());
        }
        self.position = k;
        Ok(())
    }

    /// Reshuffles the whole list in place.
    pub(crate) fn shuffle(&mut self, rng: &mut RunRng) {
        rng.shuffle(&mut self.entries);
    }

    /// Advances the cursor one entry, wrapping to 0 at the end of the list.
    /// On wraparound the list is reshuffled when `reshuffle` is set and a
    /// generator is available. Returns `true` when a wraparound occurred.
    pub(crate) fn advance(&mut self, reshuffle: bool, rng: Option<&mut RunRng>) -> bool {
        self.position += 1;
        if self.position < self.entries.len() {
            return false;
        }

        self.position = 0;
        if reshuffle {
            if let Some(rng) = rng {
                tracing::debug!("restarting data prefetching from start, reshuffling");
                self.shuffle(rng);
            }
        }
        true
    }
}
