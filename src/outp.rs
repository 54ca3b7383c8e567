//! The acoustic-likelihood boundary. The decoder consumes a single function
//! `outp(t, state)`; anything able to answer it can drive the search. The
//! bundled implementation is a precomputed matrix of per-frame, per-state log
//! likelihoods loaded from a `.npy` file, which is how scores move between
//! here and whatever neural network produced them.
use crate::error::{DecodeError, Result};
use crate::hmm::StateId;
use crate::logmath::LogFloat;
use ndarray::Array2;
use std::path::Path;

pub trait AcousticScorer {
    fn n_frames(&self) -> usize;
    /// ln output likelihood of scorer state `state` at frame `t`.
    fn outp(&self, t: usize, state: StateId) -> LogFloat;
}

/// Scorer backed by a frames-by-states matrix of log likelihoods.
#[derive(Debug, Clone)]
pub struct MatrixScorer {
    llh: Array2<f64>,
}

impl MatrixScorer {
    pub fn new(llh: Array2<f64>) -> Self {
        Self { llh }
    }

    /// Load a `(frames, states)` matrix of f32 log likelihoods.
    pub fn open_npy(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw: Array2<f32> = ndarray_npy::read_npy(path).map_err(|e| {
            DecodeError::Config(format!("cannot read likelihoods '{}': {}", path.display(), e))
        })?;
        Ok(Self {
            llh: raw.mapv(|x| x as f64),
        })
    }

    pub fn n_states(&self) -> usize {
        self.llh.ncols()
    }
}

impl AcousticScorer for MatrixScorer {
    fn n_frames(&self) -> usize {
        self.llh.nrows()
    }

    fn outp(&self, t: usize, state: StateId) -> LogFloat {
        self.llh[[t, state.0 as usize]]
    }
}

/// Memo of acoustically scaled output probabilities for the frames of the
/// current block. Within one frame many network nodes share tied states, so
/// even a block size of one saves a lot of recomputation.
#[derive(Debug)]
pub struct OutPCache {
    block: usize,
    n_states: usize,
    stamp: Vec<i64>,
    value: Vec<LogFloat>,
    pub hits: u64,
    pub misses: u64,
}

impl OutPCache {
    pub fn new(n_states: usize, block: usize) -> Self {
        let block = block.max(1);
        Self {
            block,
            n_states,
            stamp: vec![-1; n_states * block],
            value: vec![0.0; n_states * block],
            hits: 0,
            misses: 0,
        }
    }

    pub fn reset(&mut self) {
        self.stamp.fill(-1);
        self.hits = 0;
        self.misses = 0;
    }

    pub fn outp(
        &mut self,
        scorer: &dyn AcousticScorer,
        t: usize,
        state: StateId,
        ac_scale: f64,
    ) -> LogFloat {
        let idx = state.0 as usize * self.block + t % self.block;
        debug_assert!((state.0 as usize) < self.n_states);
        if self.stamp[idx] == t as i64 {
            self.hits += 1;
            return self.value[idx];
        }
        self.misses += 1;
        let v = scorer.outp(t, state) * ac_scale;
        self.stamp[idx] = t as i64;
        self.value[idx] = v;
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn cache_returns_scaled_values_and_counts() {
        let scorer = MatrixScorer::new(array![[-1.0, -2.0], [-3.0, -4.0]]);
        let mut cache = OutPCache::new(2, 1);
        assert_eq!(cache.outp(&scorer, 0, StateId(1), 0.5), -1.0);
        assert_eq!(cache.outp(&scorer, 0, StateId(1), 0.5), -1.0);
        assert_eq!(cache.outp(&scorer, 1, StateId(0), 0.5), -1.5);
        assert_eq!(cache.hits, 1);
        assert_eq!(cache.misses, 2);
    }
}
