//! Trace-back: turning the surviving word-end chains into a 1-best
//! transcription or a word lattice.
use crate::lattice::{AlignSeg, LatArc, LatNode, Lattice};
use crate::logmath::LogFloat;
use crate::net::{NodeKind, PronId};
use crate::search::wordend::{MeHypIdx, WeHypIdx, ME_NONE, WE_NONE};
use crate::search::Decoder;
use std::collections::HashMap;
use tracing::{debug, warn};

/// One recognised word with its boundary frames and scores.
#[derive(Debug, Clone, PartialEq)]
pub struct WordHyp {
    pub word: String,
    pub pron: PronId,
    pub variant: u32,
    /// First frame of the word (inclusive).
    pub start_frame: i32,
    /// Last frame of the word (inclusive).
    pub end_frame: i32,
    /// Cumulative score at this word end.
    pub score: LogFloat,
    /// LM score of this word given its history.
    pub lm: LogFloat,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcription {
    pub words: Vec<WordHyp>,
    pub total_score: LogFloat,
}

/// Walk the best surviving sentence-end hypothesis back to the start. An
/// empty result means every path was pruned before the utterance ended.
pub fn trace_back(dec: &Decoder) -> Option<Transcription> {
    let inst = match dec.final_instance() {
        Some(inst) => inst,
        None => {
            warn!("no tokens survived to the sentence end");
            return None;
        }
    };
    let ts = &inst.ts[0];
    let best = ts.toks.first()?;
    let total_score = ts.score;

    let mut chain = vec![];
    let mut idx = best.path;
    while idx != WE_NONE {
        chain.push(idx);
        idx = dec.we_hyps.get(idx).prev;
    }
    chain.reverse();

    let mut words = Vec::with_capacity(chain.len());
    let mut prev_frame = -1i32;
    for idx in chain {
        let hyp = dec.we_hyps.get(idx);
        let info = dec.net.pron(hyp.pron);
        words.push(WordHyp {
            word: info.word.clone(),
            pron: hyp.pron,
            variant: info.variant,
            start_frame: prev_frame + 1,
            end_frame: hyp.frame,
            score: hyp.score,
            lm: hyp.lm,
        });
        prev_frame = hyp.frame;
    }
    debug!("trace-back found {} words, score {:.3}", words.len(), total_score);
    Some(Transcription { words, total_score })
}

/// Build a word lattice from every word-end hypothesis reachable from the
/// surviving sentence-end tokens, one lattice node per distinct
/// (pronunciation, end frame) and one arc per recorded predecessor,
/// including the N-best alternatives.
pub fn lat_trace_back(
    dec: &Decoder,
    utterance: Option<String>,
    frame_dur: f64,
) -> Option<Lattice> {
    let inst = dec.final_instance()?;

    // reachable hypotheses
    let mut stack: Vec<WeHypIdx> = inst
        .ts[0]
        .toks
        .iter()
        .filter(|tok| tok.path != WE_NONE)
        .map(|tok| tok.path)
        .collect();
    let mut visited: HashMap<WeHypIdx, ()> = HashMap::new();
    while let Some(idx) = stack.pop() {
        if visited.insert(idx, ()).is_some() {
            continue;
        }
        let hyp = dec.we_hyps.get(idx);
        if hyp.prev != WE_NONE {
            stack.push(hyp.prev);
        }
        for alt in &hyp.alt {
            if alt.prev != WE_NONE {
                stack.push(alt.prev);
            }
        }
    }

    let mut lat = Lattice {
        utterance,
        lm_scale: dec.opts.lm_scale,
        ac_scale: dec.opts.ac_scale,
        pr_scale: dec.opts.pron_scale,
        wd_penalty: dec.opts.ins_pen,
        frame_dur,
        nodes: vec![],
        arcs: vec![],
    };

    // lattice node per (pron, frame)
    let mut node_of: HashMap<(PronId, i32), u32> = HashMap::new();
    let mut hyp_order: Vec<WeHypIdx> = visited.keys().copied().collect();
    hyp_order.sort_unstable();
    for &idx in &hyp_order {
        let hyp = dec.we_hyps.get(idx);
        node_of.entry((hyp.pron, hyp.frame)).or_insert_with(|| {
            let info = dec.net.pron(hyp.pron);
            lat.nodes.push(LatNode {
                time: (hyp.frame + 1) as f64 * frame_dur,
                word: info.word.clone(),
                variant: info.variant,
            });
            lat.nodes.len() as u32 - 1
        });
    }

    for &idx in &hyp_order {
        let hyp = dec.we_hyps.get(idx);
        let end = node_of[&(hyp.pron, hyp.frame)];
        if hyp.prev != WE_NONE {
            let prev = dec.we_hyps.get(hyp.prev);
            let start = node_of[&(prev.pron, prev.frame)];
            lat.arcs.push(make_arc(
                dec, start, end, hyp.score, prev.score, hyp.lm, hyp.pron, hyp.mod_path,
                prev.frame,
            ));
        }
        for alt in &hyp.alt {
            if alt.prev == WE_NONE {
                continue;
            }
            let prev = dec.we_hyps.get(alt.prev);
            let start = node_of[&(prev.pron, prev.frame)];
            lat.arcs.push(make_arc(
                dec, start, end, alt.score, prev.score, alt.lm, hyp.pron, alt.mod_path,
                prev.frame,
            ));
        }
    }

    // duplicate arcs can arise via republished hypotheses; keep the best
    lat.arcs
        .sort_by(|a, b| (a.start, a.end).cmp(&(b.start, b.end)).then(b.aclike.total_cmp(&a.aclike)));
    lat.arcs.dedup_by(|b, a| a.start == b.start && a.end == b.end);
    Some(lat)
}

#[allow(clippy::too_many_arguments)]
fn make_arc(
    dec: &Decoder,
    start: u32,
    end: u32,
    score: LogFloat,
    prev_score: LogFloat,
    lm: LogFloat,
    pron: PronId,
    mod_path: MeHypIdx,
    prev_frame: i32,
) -> LatArc {
    let info = dec.net.pron(pron);
    let prlike = info.prob;
    // everything in the score delta that is not LM, pronunciation or
    // insertion penalty is acoustic
    let aclike = (score - prev_score
        - dec.opts.lm_scale * lm
        - dec.opts.pron_scale * prlike
        - dec.opts.ins_pen)
        / dec.opts.ac_scale;
    LatArc {
        start,
        end,
        aclike,
        lmlike: lm,
        prlike,
        align: alignment(dec, mod_path, prev_frame),
    }
}

/// Model alignment segments between the previous word boundary and this one,
/// oldest first.
fn alignment(dec: &Decoder, mod_path: MeHypIdx, prev_frame: i32) -> Vec<AlignSeg> {
    if mod_path == ME_NONE {
        return vec![];
    }
    let mut ends = vec![];
    let mut idx = mod_path;
    while idx != ME_NONE {
        let hyp = dec.mod_hyps.get(idx);
        if hyp.frame <= prev_frame {
            break;
        }
        ends.push((hyp.node, hyp.frame));
        idx = hyp.prev;
    }
    ends.reverse();
    let mut segs = Vec::with_capacity(ends.len());
    let mut last = prev_frame;
    for (node, frame) in ends {
        let label = match dec.net.node(node).kind {
            NodeKind::Model(h) => dec.hset.get(h).name.clone(),
            _ => continue,
        };
        segs.push(AlignSeg {
            label,
            frames: (frame - last).max(0) as u32,
        });
        last = frame;
    }
    segs
}
