//! Training checkpoint schedule
//!
//! Pythia checkpoints live on the hub as revisions named `step{N}`:
//! step 0, the log-spaced steps 1, 2, 4, …, 512, then every 1000 steps up
//! to 143000. That is 154 checkpoints per model.

use std::fmt;

use anyhow::Result;
use tracing::info;

use crate::forward_neox;

/// Last training step of the Pythia runs
pub const PYTHIA_FINAL_STEP: usize = 143_000;

/// A checkpoint index past the end of the schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointOutOfRange {
    pub model_id: String,
    pub index: usize,
    pub available: usize,
}

impl CheckpointOutOfRange {
    pub fn new(model_id: &str, index: usize) -> Self {
        Self {
            model_id: model_id.to_string(),
            index,
            available: pythia_steps().len(),
        }
    }
}

impl fmt::Display for CheckpointOutOfRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Checkpoint {} out of range for {} ({} available)",
            self.index, self.model_id, self.available
        )
    }
}

impl std::error::Error for CheckpointOutOfRange {}

/// Training steps with a published checkpoint, in order
pub fn pythia_steps() -> Vec<usize> {
    std::iter::once(0)
        .chain((0..10).map(|i| 1usize << i))
        .chain((1..=PYTHIA_FINAL_STEP / 1000).map(|k| k * 1000))
        .collect()
}

/// Whether a model publishes the Pythia checkpoint schedule
pub fn has_checkpoints(model_id: &str) -> bool {
    model_id.to_lowercase().contains("pythia")
}

/// Hub revision for a checkpoint index, or `None` past the last one
pub fn checkpoint_revision(model_id: &str, index: usize) -> Result<Option<String>> {
    anyhow::ensure!(
        has_checkpoints(model_id),
        "Model {model_id} has no training checkpoints"
    );
    Ok(pythia_steps().get(index).map(|step| format!("step{step}")))
}

/// Training step of a checkpoint index
pub fn checkpoint_step(model_id: &str, index: usize) -> Result<usize> {
    anyhow::ensure!(
        has_checkpoints(model_id),
        "Model {model_id} has no training checkpoints"
    );
    pythia_steps()
        .get(index)
        .copied()
        .ok_or_else(|| CheckpointOutOfRange::new(model_id, index).into())
}

/// Number of checkpoints to visit, capped by `limit`
pub fn num_checkpoints(model_id: &str, limit: Option<usize>) -> Result<usize> {
    anyhow::ensure!(
        has_checkpoints(model_id),
        "Model {model_id} has no training checkpoints"
    );
    let total = pythia_steps().len();
    Ok(limit.map_or(total, |l| l.min(total)))
}

/// Download checkpoints into the hub cache until the schedule runs out
///
/// Returns the number of checkpoints fetched.
pub fn preload_checkpoints(model_id: &str, limit: Option<usize>) -> Result<usize> {
    let mut index = 0;
    while let Some(revision) = checkpoint_revision(model_id, index)? {
        if limit.is_some_and(|l| index >= l) {
            break;
        }
        info!("Preloading checkpoint {} ({})", index, revision);
        forward_neox::prefetch(model_id, &revision)?;
        index += 1;
    }
    info!("Preloaded {} checkpoints of {}", index, model_id);
    Ok(index)
}
