//! Language models driving the search. Both variants expose the same three
//! operations: an initial state, a transition `(state, pronunciation) ->
//! (log prob, new state)` applied when a token crosses a word end, and an
//! interval-max look-ahead used for pruning inside words. States are opaque
//! handles; for the n-gram model a handle names a stored history, for the
//! lattice-constrained model it names a lattice node.
use crate::logmath::{LogFloat, LZERO};
use crate::net::PronId;

pub mod latlm;
pub mod ngram;

pub use latlm::LatticeLm;
pub use ngram::NgramLm;

/// An LM history handle. `Hist(0)` is the empty (unigram) history for the
/// n-gram model and the start node for the lattice model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LmState {
    /// Before the sentence-start word has been consumed.
    Initial,
    /// After the sentence-end word; no transitions leave this state.
    SentEnd,
    Hist(u32),
}

#[derive(Debug)]
pub enum LangModel {
    Ngram(NgramLm),
    Lattice(LatticeLm),
}

impl LangModel {
    pub fn initial_state(&self) -> LmState {
        match self {
            LangModel::Ngram(_) => LmState::Initial,
            LangModel::Lattice(lm) => lm.initial_state(),
        }
    }

    /// ln p(pron | state) and the successor state.
    pub fn transition(&self, src: LmState, pron: PronId) -> (LogFloat, LmState) {
        match self {
            LangModel::Ngram(lm) => lm.transition(src, pron),
            LangModel::Lattice(lm) => lm.transition(src, pron),
        }
    }

    /// max over `lo..=hi` of ln p(pron | state); an upper bound on any
    /// transition out of `state` into the interval.
    pub fn lookahead(&self, src: LmState, lo: PronId, hi: PronId) -> LogFloat {
        match self {
            LangModel::Ngram(lm) => lm.lookahead(src, lo, hi),
            LangModel::Lattice(lm) => lm.lookahead(src, lo, hi),
        }
    }

    /// A coarser state usable for cheap look-ahead when the decoder is
    /// outside the accurate-look-ahead beam: n-gram histories back off one
    /// order, everything else is unchanged.
    pub fn fast_la_state(&self, src: LmState) -> LmState {
        match self {
            LangModel::Ngram(lm) => lm.fast_la_state(src),
            LangModel::Lattice(_) => src,
        }
    }

    pub fn end_pron(&self) -> PronId {
        match self {
            LangModel::Ngram(lm) => lm.end_pron(),
            LangModel::Lattice(lm) => lm.end_pron(),
        }
    }
}

/// Shared by both variants: nothing leaves the sentence-end state.
pub(crate) fn dead_state() -> (LogFloat, LmState) {
    (LZERO, LmState::SentEnd)
}
