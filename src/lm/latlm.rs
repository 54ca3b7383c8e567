//! Lattice-constrained language model, as used for rescoring: an input word
//! lattice acts as a finite-state grammar, so an LM state is simply a lattice
//! node and the successor probabilities are the lattice's LM likelihoods.
//! Arcs are expanded per pronunciation and kept sorted by pronunciation id so
//! look-ahead is a binary search plus a short scan.
use super::{dead_state, LmState};
use crate::error::{DecodeError, Result};
use crate::lattice::Lattice;
use crate::lm::ngram::PronVocab;
use crate::logmath::{LogFloat, LZERO};
use crate::net::PronId;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
struct LatLmArc {
    word: u16,
    prob: LogFloat,
    dest: LmState,
}

#[derive(Debug, Default)]
struct LatLmNode {
    arcs: Vec<LatLmArc>,
}

#[derive(Debug)]
pub struct LatticeLm {
    nodes: Vec<LatLmNode>,
    initial: LmState,
    end_pron: PronId,
}

impl LatticeLm {
    /// Build the constraint model from a lattice over the given vocabulary.
    /// `end_word` transitions are redirected into the sentence-end state.
    pub fn from_lattice(lat: &Lattice, vocab: &PronVocab, end_word: &str) -> Result<LatticeLm> {
        let n = lat.nodes.len();
        let mut warned: std::collections::HashSet<String> = std::collections::HashSet::new();
        let mut out_arcs: Vec<Vec<usize>> = vec![vec![]; n];
        let mut has_pred = vec![false; n];
        let mut has_foll = vec![false; n];
        for (i, arc) in lat.arcs.iter().enumerate() {
            out_arcs[arc.start as usize].push(i);
            has_pred[arc.end as usize] = true;
            has_foll[arc.start as usize] = true;
        }

        let mut nodes: Vec<LatLmNode> = Vec::with_capacity(n);
        for i in 0..n {
            let mut arcs = vec![];
            for &ai in &out_arcs[i] {
                let arc = &lat.arcs[ai];
                let word = &lat.nodes[arc.end as usize].word;
                if word == "!NULL" {
                    continue;
                }
                let Some(prons) = vocab.get(word.as_str()) else {
                    // the branch through an unsayable word is impossible
                    if warned.insert(word.clone()) {
                        warn!("lattice word '{}' is not in the vocabulary, branch dropped", word);
                    }
                    continue;
                };
                // an arc whose target only continues to a final !NULL node
                // finishes the sentence
                let target = arc.end as usize;
                let terminal = !has_foll[target]
                    || (out_arcs[target].len() == 1
                        && lat.nodes[lat.arcs[out_arcs[target][0]].end as usize].word
                            == "!NULL");
                let dest = if terminal {
                    LmState::SentEnd
                } else {
                    LmState::Hist(arc.end)
                };
                for &pron in prons {
                    arcs.push(LatLmArc {
                        word: pron.0,
                        prob: arc.lmlike,
                        dest,
                    });
                }
            }
            arcs.sort_by_key(|a| a.word);
            // the constraint must be deterministic per word
            for pair in arcs.windows(2) {
                if pair[0].word == pair[1].word && pair[0].prob != pair[1].prob {
                    return Err(DecodeError::LatticeFormat(format!(
                        "lattice is not deterministic for pron {}",
                        pair[0].word
                    )));
                }
            }
            arcs.dedup_by_key(|a| a.word);
            nodes.push(LatLmNode { arcs });
        }

        let mut start = None;
        for (i, &p) in has_pred.iter().enumerate() {
            if !p && has_foll[i] {
                if start.is_some() {
                    return Err(DecodeError::LatticeFormat(
                        "lattice has multiple start nodes".into(),
                    ));
                }
                start = Some(i as u32);
            }
        }
        let start = start
            .ok_or_else(|| DecodeError::LatticeFormat("lattice has no start node".into()))?;

        let end_pron = vocab
            .get(end_word)
            .and_then(|prons| prons.first().copied())
            .ok_or_else(|| {
                DecodeError::ResourceMissing(format!("end word '{}' in vocabulary", end_word))
            })?;

        debug!("lattice LM: {} states", nodes.len());
        Ok(LatticeLm {
            nodes,
            initial: LmState::Hist(start),
            end_pron,
        })
    }

    pub fn initial_state(&self) -> LmState {
        self.initial
    }

    pub fn end_pron(&self) -> PronId {
        self.end_pron
    }

    pub fn transition(&self, src: LmState, pron: PronId) -> (LogFloat, LmState) {
        let LmState::Hist(idx) = src else {
            return dead_state();
        };
        let arcs = &self.nodes[idx as usize].arcs;
        match arcs.binary_search_by_key(&pron.0, |a| a.word) {
            Ok(i) => (arcs[i].prob, arcs[i].dest),
            Err(_) => (LZERO, LmState::SentEnd),
        }
    }

    pub fn lookahead(&self, src: LmState, lo: PronId, hi: PronId) -> LogFloat {
        let LmState::Hist(idx) = src else {
            return LZERO;
        };
        let arcs = &self.nodes[idx as usize].arcs;
        let mut max = LZERO;
        let from = arcs.partition_point(|a| a.word < lo.0);
        for arc in &arcs[from..] {
            if arc.word > hi.0 {
                break;
            }
            if arc.prob > max {
                max = arc.prob;
            }
        }
        max
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lattice::{LatArc, LatNode};

    fn vocab() -> PronVocab {
        let mut v = PronVocab::new();
        v.insert("<s>".into(), vec![PronId(1)]);
        v.insert("</s>".into(), vec![PronId(2)]);
        v.insert("A".into(), vec![PronId(3)]);
        v.insert("B".into(), vec![PronId(4)]);
        v.insert("C".into(), vec![PronId(5)]);
        v
    }

    fn rescoring_lattice() -> Lattice {
        // <s> -> A -> {B (-2) | C (-5)} -> </s>
        Lattice {
            utterance: None,
            lm_scale: 1.0,
            ac_scale: 1.0,
            pr_scale: 1.0,
            wd_penalty: 0.0,
            frame_dur: 0.01,
            nodes: vec![
                LatNode { time: 0.0, word: "!NULL".into(), variant: 1 },
                LatNode { time: 0.1, word: "<s>".into(), variant: 1 },
                LatNode { time: 0.5, word: "A".into(), variant: 1 },
                LatNode { time: 0.8, word: "B".into(), variant: 1 },
                LatNode { time: 0.8, word: "C".into(), variant: 1 },
                LatNode { time: 1.0, word: "</s>".into(), variant: 1 },
            ],
            arcs: vec![
                LatArc { start: 0, end: 1, aclike: 0.0, lmlike: 0.0, prlike: 0.0, align: vec![] },
                LatArc { start: 1, end: 2, aclike: 0.0, lmlike: -1.0, prlike: 0.0, align: vec![] },
                LatArc { start: 2, end: 3, aclike: 0.0, lmlike: -2.0, prlike: 0.0, align: vec![] },
                LatArc { start: 2, end: 4, aclike: 0.0, lmlike: -5.0, prlike: 0.0, align: vec![] },
                LatArc { start: 3, end: 5, aclike: 0.0, lmlike: -0.5, prlike: 0.0, align: vec![] },
                LatArc { start: 4, end: 5, aclike: 0.0, lmlike: -0.5, prlike: 0.0, align: vec![] },
            ],
        }
    }

    #[test]
    fn follows_the_lattice() {
        let lm = LatticeLm::from_lattice(&rescoring_lattice(), &vocab(), "</s>").unwrap();
        let s0 = lm.initial_state();
        let (p, s1) = lm.transition(s0, PronId(1));
        assert_eq!(p, 0.0);
        let (p, s2) = lm.transition(s1, PronId(3));
        assert_eq!(p, -1.0);
        // B is preferred over C
        let (pb, _) = lm.transition(s2, PronId(4));
        let (pc, _) = lm.transition(s2, PronId(5));
        assert_eq!(pb, -2.0);
        assert_eq!(pc, -5.0);
        // something impossible in the lattice
        let (px, _) = lm.transition(s2, PronId(1));
        assert_eq!(px, LZERO);
    }

    #[test]
    fn lookahead_is_max_over_interval() {
        let lm = LatticeLm::from_lattice(&rescoring_lattice(), &vocab(), "</s>").unwrap();
        let s0 = lm.initial_state();
        let (_, s1) = lm.transition(s0, PronId(1));
        let (_, s2) = lm.transition(s1, PronId(3));
        assert_eq!(lm.lookahead(s2, PronId(4), PronId(5)), -2.0);
        assert_eq!(lm.lookahead(s2, PronId(5), PronId(5)), -5.0);
        assert_eq!(lm.lookahead(s2, PronId(1), PronId(2)), LZERO);
    }

    #[test]
    fn end_word_reaches_sentence_end() {
        let lm = LatticeLm::from_lattice(&rescoring_lattice(), &vocab(), "</s>").unwrap();
        let s0 = lm.initial_state();
        let (_, s1) = lm.transition(s0, PronId(1));
        let (_, s2) = lm.transition(s1, PronId(3));
        let (_, s3) = lm.transition(s2, PronId(4));
        let (_, s4) = lm.transition(s3, PronId(2));
        assert_eq!(s4, LmState::SentEnd);
    }

    #[test]
    fn nondeterministic_lattice_is_rejected() {
        let mut lat = rescoring_lattice();
        // second A successor with a different probability
        lat.nodes.push(LatNode { time: 0.8, word: "B".into(), variant: 1 });
        lat.arcs.push(LatArc { start: 2, end: 6, aclike: 0.0, lmlike: -3.0, prlike: 0.0, align: vec![] });
        lat.arcs.push(LatArc { start: 6, end: 5, aclike: 0.0, lmlike: -0.5, prlike: 0.0, align: vec![] });
        assert!(matches!(
            LatticeLm::from_lattice(&lat, &vocab(), "</s>"),
            Err(DecodeError::LatticeFormat(_))
        ));
    }
}
