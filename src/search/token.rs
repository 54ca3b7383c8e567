//! Tokens and token sets.
//!
//! A token is a partial hypothesis: an LM history, a score, the LM look-ahead
//! currently folded into that score, and a trace-back pointer. A `TokenSet`
//! holds up to `n_tok` tokens differing in LM state at one HMM state, stored
//! relative to the best so recombination and pruning work on small deltas.
//! Merging two sets keeps, per `(lm_state, we_tag)` identity, the token with
//! the higher absolute score, with a deterministic tie-break so reruns are
//! byte-identical.
use crate::lm::LmState;
use crate::logmath::{LogFloat, LZERO};
use crate::search::wordend::{MeHypIdx, WeHypIdx, WeHypArena, ME_NONE, WE_NONE};

pub type TokScore = LogFloat;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RelToken {
    pub lm_state: LmState,
    /// Distinguishes tokens by word-end history when lattices are generated;
    /// zero otherwise.
    pub we_tag: u32,
    /// Score relative to the set's best, always <= 0.
    pub delta: TokScore,
    /// LM look-ahead contribution currently included in the score.
    pub lm_score: TokScore,
    pub path: WeHypIdx,
    pub mod_path: MeHypIdx,
}

impl RelToken {
    pub fn initial() -> Self {
        RelToken {
            lm_state: LmState::Initial,
            we_tag: 0,
            delta: 0.0,
            lm_score: 0.0,
            path: WE_NONE,
            mod_path: ME_NONE,
        }
    }

    fn identity(&self) -> (LmState, u32) {
        (self.lm_state, self.we_tag)
    }
}

#[derive(Clone, Debug, Default)]
pub struct TokenSet {
    /// Absolute score of the best token; meaningless when empty.
    pub score: TokScore,
    /// Identity tag for cheap sharing detection; 0 means empty.
    pub id: u32,
    pub toks: Vec<RelToken>,
}

/// Bounds applied while merging.
#[derive(Clone, Copy, Debug)]
pub struct MergeLimits {
    pub n_tok: usize,
    pub rel_beam: TokScore,
    /// Tokens whose absolute score falls below this are dropped outright.
    pub beam_limit: TokScore,
}

impl TokenSet {
    pub fn is_empty(&self) -> bool {
        self.toks.is_empty()
    }

    pub fn clear(&mut self) {
        self.toks.clear();
        self.id = 0;
        self.score = LZERO;
    }

    /// Iterate tokens with their absolute scores.
    pub fn absolute(&self) -> impl Iterator<Item = (RelToken, TokScore)> + '_ {
        self.toks.iter().map(move |t| (*t, self.score + t.delta))
    }

    /// Merge tokens (given with absolute scores) into this set, applying the
    /// winner-per-identity rule, the relative beam, the global beam and the
    /// set size bound. `hyps` provides frame numbers for the deterministic
    /// tie-break. Returns true if the set changed.
    pub fn merge(
        &mut self,
        incoming: &[(RelToken, TokScore)],
        limits: &MergeLimits,
        hyps: &WeHypArena,
        id_counter: &mut u32,
    ) -> bool {
        if incoming.is_empty() {
            return false;
        }

        let mut pool: Vec<(RelToken, TokScore)> = self
            .absolute()
            .chain(incoming.iter().copied())
            .filter(|(_, abs)| *abs >= limits.beam_limit)
            .collect();
        if pool.is_empty() {
            let changed = !self.is_empty();
            self.clear();
            return changed;
        }

        // winner per (lm_state, we_tag): best first within each identity
        pool.sort_by(|a, b| {
            a.0.identity()
                .cmp(&b.0.identity())
                .then_with(|| better(a, b, hyps))
        });
        pool.dedup_by(|b, a| a.0.identity() == b.0.identity());

        let best = pool
            .iter()
            .map(|&(_, abs)| abs)
            .fold(f64::NEG_INFINITY, f64::max);
        pool.retain(|&(_, abs)| abs - best >= -limits.rel_beam);

        if pool.len() > limits.n_tok {
            pool.sort_by(|a, b| better(a, b, hyps));
            pool.truncate(limits.n_tok);
        }

        // renormalise, best first
        pool.sort_by(|a, b| better(a, b, hyps));
        self.score = best;
        self.toks.clear();
        for (mut tok, abs) in pool {
            tok.delta = abs - best;
            self.toks.push(tok);
        }
        *id_counter += 1;
        self.id = *id_counter;
        true
    }

    /// Copy `src` wholesale, keeping its identity tag. Only valid into an
    /// empty set with no score adjustment.
    pub fn adopt(&mut self, src: &TokenSet) {
        debug_assert!(self.is_empty());
        self.score = src.score;
        self.id = src.id;
        self.toks.clear();
        self.toks.extend_from_slice(&src.toks);
    }
}

/// Strict ordering of scored tokens: higher score first, ties broken by
/// earlier word-end frame, then lower trace-back index, then LM identity.
pub fn better(
    a: &(RelToken, TokScore),
    b: &(RelToken, TokScore),
    hyps: &WeHypArena,
) -> std::cmp::Ordering {
    b.1.total_cmp(&a.1)
        .then_with(|| hyps.frame_of(a.0.path).cmp(&hyps.frame_of(b.0.path)))
        .then_with(|| a.0.path.cmp(&b.0.path))
        .then_with(|| a.0.identity().cmp(&b.0.identity()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> MergeLimits {
        MergeLimits {
            n_tok: 4,
            rel_beam: 100.0,
            beam_limit: LZERO,
        }
    }

    fn tok(state: u32, path: WeHypIdx) -> RelToken {
        RelToken {
            lm_state: LmState::Hist(state),
            we_tag: 0,
            delta: 0.0,
            lm_score: 0.0,
            path,
            mod_path: ME_NONE,
        }
    }

    #[test]
    fn merge_keeps_winner_per_state() {
        let hyps = WeHypArena::new();
        let mut set = TokenSet::default();
        let mut ids = 0u32;
        set.merge(
            &[(tok(1, WE_NONE), -10.0), (tok(2, WE_NONE), -12.0)],
            &limits(),
            &hyps,
            &mut ids,
        );
        assert_eq!(set.toks.len(), 2);
        assert_eq!(set.score, -10.0);
        assert_eq!(set.toks[0].delta, 0.0);
        assert_eq!(set.toks[1].delta, -2.0);

        // a better token for state 2 replaces it, worse for state 1 loses
        set.merge(
            &[(tok(2, WE_NONE), -11.0), (tok(1, WE_NONE), -15.0)],
            &limits(),
            &hyps,
            &mut ids,
        );
        assert_eq!(set.toks.len(), 2);
        assert_eq!(set.score, -10.0);
        let s2 = set
            .toks
            .iter()
            .find(|t| t.lm_state == LmState::Hist(2))
            .unwrap();
        assert_eq!(set.score + s2.delta, -11.0);
    }

    #[test]
    fn merge_applies_relative_beam_and_cap() {
        let hyps = WeHypArena::new();
        let mut set = TokenSet::default();
        let mut ids = 0u32;
        let mut lim = limits();
        lim.rel_beam = 5.0;
        let incoming: Vec<_> = (0..8)
            .map(|i| (tok(i, WE_NONE), -(i as f64)))
            .collect();
        set.merge(&incoming, &lim, &hyps, &mut ids);
        // states 6 and 7 fall outside the relative beam of 5; cap of 4 trims
        // the rest to the best four
        assert_eq!(set.toks.len(), 4);
        assert_eq!(set.score, 0.0);
        assert!(set.toks.iter().all(|t| t.delta >= -3.0));
    }

    #[test]
    fn merge_tie_breaks_deterministically() {
        let mut hyps = WeHypArena::new();
        let early = hyps.publish(WE_NONE, crate::net::PronId(1), 3, -1.0, 0.0, ME_NONE);
        let late = hyps.publish(WE_NONE, crate::net::PronId(1), 7, -1.0, 0.0, ME_NONE);
        let mut set = TokenSet::default();
        let mut ids = 0u32;
        // same identity, same score, different paths: earlier frame wins
        set.merge(
            &[(tok(1, late), -5.0), (tok(1, early), -5.0)],
            &limits(),
            &hyps,
            &mut ids,
        );
        assert_eq!(set.toks.len(), 1);
        assert_eq!(set.toks[0].path, early);
    }

    #[test]
    fn beam_limit_drops_tokens() {
        let hyps = WeHypArena::new();
        let mut set = TokenSet::default();
        let mut ids = 0u32;
        let mut lim = limits();
        lim.beam_limit = -6.0;
        set.merge(
            &[(tok(1, WE_NONE), -5.0), (tok(2, WE_NONE), -7.0)],
            &lim,
            &hyps,
            &mut ids,
        );
        assert_eq!(set.toks.len(), 1);
    }
}
