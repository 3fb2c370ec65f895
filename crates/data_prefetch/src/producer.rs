//! The background fill worker.
//!
//! One run fills exactly one batch on a dedicated thread, then sends the
//! buffer, together with everything else it exclusively owned for the
//! run's duration (image list cursor, seed source, decoder), back through
//! a single-slot channel. The consumer's receive is the join point: the
//! channel transfer plus the thread join form the happens-before edge that
//! makes every buffer write of run N visible before run N+1 starts.
//!
//! ```text
//!  consumer thread                        fill thread
//!  ───────────────                        ───────────
//!  RunHandle::spawn(worker, buffer) ────► fill_batch(...)
//!         │                                   │ decode → transform → slot
//!  (free to train on the                      │ ... batch_size times
//!   previous batch)                           ▼
//!  handle.join() ◄──────────────── send(RunOutcome { worker, buffer, .. })
//!         │
//!  copy out, respawn
//! ```

use crate::batch::{BatchGeometry, PrefetchBuffer};
use crate::config::Phase;
use crate::decode::Decoder;
use crate::error::PrefetchError;
use crate::manifest::ImageList;
use crate::mean::MeanBuffer;
use crate::rng::{RunRng, SeedSource};
use crate::transform::{write_sample, CropPolicy};
use anyhow::Result;
use crossbeam_channel::{bounded, Receiver};
use std::sync::Arc;
use std::thread;
use tracing::warn;

/// Immutable parameters shared by every run: frozen at setup, read-only
/// afterwards, so they need no synchronization beyond the `Arc`.
#[derive(Debug)]
pub(crate) struct RunParams {
    pub(crate) geometry: BatchGeometry,
    pub(crate) mean: Arc<MeanBuffer>,
    pub(crate) scale: f32,
    pub(crate) mirror: bool,
    pub(crate) shuffle: bool,
    pub(crate) phase: Phase,
    pub(crate) resize: Option<(u32, u32)>,
    pub(crate) color: bool,
}

impl RunParams {
    /// Whether a run needs a generator at all: shuffling, mirroring, or a
    /// random (training) crop. The centered-crop and no-crop paths run
    /// without one.
    pub(crate) fn needs_rng(&self) -> bool {
        self.shuffle
            || self.mirror
            || (self.geometry.crop_size > 0 && self.phase == Phase::Train)
    }
}

/// Everything the fill thread exclusively owns while a run is in flight.
pub(crate) struct FillWorker {
    pub(crate) list: ImageList,
    pub(crate) seeds: SeedSource,
    pub(crate) decoder: Box<dyn Decoder>,
}

/// What comes back through the channel when a run completes.
pub(crate) struct RunOutcome {
    pub(crate) worker: FillWorker,
    pub(crate) buffer: PrefetchBuffer,
    pub(crate) result: Result<()>,
}

/// Handle to one in-flight fill run.
pub(crate) struct RunHandle {
    handle: thread::JoinHandle<()>,
    outcome_rx: Receiver<RunOutcome>,
}

impl RunHandle {
    /// Starts a fill run on a fresh named thread, moving the worker state
    /// and the buffer into it.
    pub(crate) fn spawn(
        mut worker: FillWorker,
        mut buffer: PrefetchBuffer,
        params: Arc<RunParams>,
    ) -> Result<Self> {
        let (outcome_tx, outcome_rx) = bounded(1);

        let handle = thread::Builder::new()
            .name("prefetch-fill".to_string())
            .spawn(move || {
                let result = fill_batch(&mut worker, &mut buffer, &params);
                // A dropped receiver means the layer is being torn down;
                // nothing left to hand the buffer to.
                let _ = outcome_tx.send(RunOutcome {
                    worker,
                    buffer,
                    result,
                });
            })
            .map_err(|e| PrefetchError::Runtime {
                reason: format!("failed to spawn fill thread: {}", e),
            })?;

        Ok(Self { handle, outcome_rx })
    }

    /// Blocks until the run completes and returns its outcome (join
    /// semantics: the calling thread suspends, it does not poll).
    pub(crate) fn join(self) -> Result<RunOutcome> {
        let outcome = self.outcome_rx.recv();
        let joined = self.handle.join();

        match (outcome, joined) {
            (Ok(outcome), Ok(())) => Ok(outcome),
            _ => Err(PrefetchError::Runtime {
                reason: "fill thread panicked before completing its batch".to_string(),
            }
            .into()),
        }
    }
}

/// Fills every slot of the batch from the image list.
///
/// A decode failure consumes a list position but not a slot: the loop logs
/// it and retries the next entry, so no slot ever keeps stale data from a
/// previous run. A full fruitless pass over the list aborts the run.
fn fill_batch(
    worker: &mut FillWorker,
    buffer: &mut PrefetchBuffer,
    params: &RunParams,
) -> Result<()> {
    let mut rng = params
        .needs_rng()
        .then(|| RunRng::new(worker.seeds.next_seed()));

    for slot in 0..params.geometry.batch_size {
        fill_slot(worker, buffer, params, slot, &mut rng)?;
    }
    Ok(())
}

fn fill_slot(
    worker: &mut FillWorker,
    buffer: &mut PrefetchBuffer,
    params: &RunParams,
    slot: usize,
    rng: &mut Option<RunRng>,
) -> Result<()> {
    let mut failures = 0usize;
    loop {
        let entry = worker.list.current().clone();
        match worker
            .decoder
            .decode(&entry.path, entry.label, params.resize, params.color)
        {
            Ok(image) => {
                let policy =
                    CropPolicy::resolve(&params.geometry, params.phase, params.mirror, rng.as_mut());
                write_sample(
                    &image,
                    &params.mean,
                    params.scale,
                    &policy,
                    slot,
                    buffer,
                    &params.geometry,
                )?;
                worker.list.advance(params.shuffle, rng.as_mut());
                return Ok(());
            }
            Err(error) => {
                warn!(
                    path = %entry.path.display(),
                    %error,
                    "skipping image that failed to decode"
                );
                worker.list.advance(params.shuffle, rng.as_mut());
                failures += 1;
                if failures >= worker.list.len() {
                    return Err(PrefetchError::Runtime {
                        reason: "no image in the list could be decoded (full pass failed)"
                            .to_string(),
                    }
                    .into());
                }
            }
        }
    }
}
