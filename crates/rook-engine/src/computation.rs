//! Batch-building interface for search code that queues positions one at
//! a time and reads results back by index.

use rook_core::{Result, RookError};

use crate::engine::{Engine, EvalResult};
use crate::staging::{InputPlane, PositionPlanes};
use crate::weights::INPUT_PLANES;

/// Positions queued against one engine, at most its maximum batch size.
pub struct Computation<'e> {
    engine: &'e Engine,
    inputs: Vec<PositionPlanes>,
    results: Vec<EvalResult>,
}

impl<'e> Computation<'e> {
    pub(crate) fn new(engine: &'e Engine) -> Self {
        Self {
            engine,
            inputs: Vec::new(),
            results: Vec::new(),
        }
    }

    /// Queue a position. Fails with `BatchTooLarge` once the batch is full.
    pub fn add_input(&mut self, planes: &[InputPlane]) -> Result<()> {
        if planes.len() != INPUT_PLANES {
            return Err(RookError::shape("input planes", &[INPUT_PLANES], &[planes.len()]));
        }
        let capacity = self.engine.max_batch_size();
        if self.inputs.len() >= capacity {
            return Err(RookError::BatchTooLarge {
                requested: self.inputs.len() + 1,
                capacity,
            });
        }
        self.inputs.push(planes.to_vec());
        Ok(())
    }

    /// Positions queued so far.
    pub fn batch_size(&self) -> usize {
        self.inputs.len()
    }

    /// Evaluate everything queued. Results replace those of any earlier call.
    pub fn compute_blocking(&mut self) -> Result<()> {
        self.results.clear();
        self.results = self.engine.evaluate(&self.inputs)?;
        tracing::trace!(positions = self.inputs.len(), "computation done");
        Ok(())
    }

    /// Result of position `i`.
    ///
    /// # Panics
    ///
    /// If `i` is out of range or `compute_blocking` has not succeeded; the
    /// same holds for `q`, `d`, `p` and `m`.
    pub fn result(&self, i: usize) -> &EvalResult {
        &self.results[i]
    }

    pub fn q(&self, i: usize) -> f32 {
        self.result(i).value.q()
    }

    pub fn d(&self, i: usize) -> f32 {
        self.result(i).value.d()
    }

    /// Raw policy logit of `move_index` for position `i`.
    pub fn p(&self, i: usize, move_index: usize) -> f32 {
        self.result(i).policy[move_index]
    }

    /// Predicted moves left; zero when the network has no moves-left head.
    pub fn m(&self, i: usize) -> f32 {
        self.result(i).moves_left.unwrap_or(0.0)
    }
}
