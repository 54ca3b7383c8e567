//! Per-utterance search statistics: how busy the beam was, how often nodes
//! were woken up and put back to sleep, and how the caches behaved.
use tracing::info;

#[derive(Debug, Default, Clone)]
pub struct Stats {
    pub n_frames: u64,
    /// Token sets observed and total tokens in them, for the mean.
    pub n_tok_set: u64,
    pub sum_tok_per_set: u64,
    /// Active instances summed over frames.
    pub n_active: u64,
    pub n_activate: u64,
    pub n_deactivate: u64,
    pub lmla_hits: u64,
    pub lmla_misses: u64,
    pub outp_hits: u64,
    pub outp_misses: u64,
}

impl Stats {
    pub fn reset(&mut self) {
        *self = Stats::default();
    }

    pub fn report(&self) {
        if self.n_frames == 0 {
            return;
        }
        let frames = self.n_frames as f64;
        info!(
            "search stats: {:.2} tokens/set, {:.1} active/frame, {:.1} activations/frame, {:.1} deactivations/frame",
            self.sum_tok_per_set as f64 / (self.n_tok_set.max(1)) as f64,
            self.n_active as f64 / frames,
            self.n_activate as f64 / frames,
            self.n_deactivate as f64 / frames,
        );
        info!(
            "cache stats: lmla {}/{} hits, outp {}/{} hits",
            self.lmla_hits,
            self.lmla_hits + self.lmla_misses,
            self.outp_hits,
            self.outp_hits + self.outp_misses,
        );
    }
}
