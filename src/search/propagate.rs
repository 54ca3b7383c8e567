//! Token propagation: the internal HMM trellis step, the external sweep that
//! carries token sets across network links, and word-end handling.
use super::{Decoder, INST_NONE};
use crate::hmm::HmmId;
use crate::lm::LmState;
use crate::logmath::{LogFloat, LSMALL, LZERO};
use crate::net::{Layer, NodeIdx, NodeKind, PronId};
use crate::outp::AcousticScorer;
use crate::search::token::{MergeLimits, RelToken, TokenSet};
use crate::search::wordend::{AltWordEnd, MeHypIdx, WeHypIdx, WE_NONE};
use std::collections::BTreeMap;

/// Which pronunciation-variant probability a link crossing pays.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum PronCost {
    None,
    Base,
    Sp,
    Sil,
}

/// A word-end candidate after the LM transition, before recombination.
struct WeCand {
    prev: WeHypIdx,
    lm: LogFloat,
    score: LogFloat,
    mod_path: MeHypIdx,
}

impl<'a> Decoder<'a> {
    fn limits(&self) -> MergeLimits {
        MergeLimits {
            n_tok: self.opts.n_tok,
            rel_beam: self.opts.rel_beam_width,
            beam_limit: self.beam_limit,
        }
    }

    /// One Viterbi step through the trellis of a model node: internal states
    /// at frame `t` are fed from last frame's states plus the entry set, get
    /// their scaled output likelihood added, and produce a fresh exit set.
    pub(crate) fn propagate_internal(
        &mut self,
        inst_id: u32,
        hmm_id: HmmId,
        scorer: &dyn AcousticScorer,
        t: usize,
    ) {
        let hset = self.hset;
        let hmm = hset.get(hmm_id);
        let n = hmm.n_states;
        let limits = self.limits();

        let mut scratch = std::mem::take(&mut self.scratch);
        for ts in scratch.iter_mut().take(n) {
            ts.clear();
        }
        let mut buf: Vec<(RelToken, LogFloat)> = vec![];

        for j in 1..n - 1 {
            buf.clear();
            for i in 0..n - 1 {
                let a = hmm.trans[[i, j]];
                if a <= LZERO {
                    continue;
                }
                let src = &self.insts[inst_id as usize].ts[i];
                if src.is_empty() {
                    continue;
                }
                buf.extend(src.absolute().map(|(tok, abs)| (tok, abs + a)));
            }
            if buf.is_empty() {
                continue;
            }
            scratch[j].merge(&buf, &limits, &self.we_hyps, &mut self.ts_ids);
            if !scratch[j].is_empty() {
                let out = self
                    .outp
                    .outp(scorer, t, hmm.states[j - 1], self.opts.ac_scale);
                scratch[j].score += out;
            }
        }

        // exit set, from this frame's internal states
        buf.clear();
        for i in 1..n - 1 {
            let a = hmm.trans[[i, n - 1]];
            if a <= LZERO || scratch[i].is_empty() {
                continue;
            }
            buf.extend(scratch[i].absolute().map(|(tok, abs)| (tok, abs + a)));
        }
        scratch[n - 1].merge(&buf, &limits, &self.we_hyps, &mut self.ts_ids);

        let inst = &mut self.insts[inst_id as usize];
        inst.ts[0].clear(); // entry consumed
        let mut best = LZERO;
        for j in 1..n {
            std::mem::swap(&mut inst.ts[j], &mut scratch[j]);
            scratch[j].clear();
            if !inst.ts[j].is_empty() {
                best = best.max(inst.ts[j].score);
                self.stats.n_tok_set += 1;
                self.stats.sum_tok_per_set += inst.ts[j].toks.len() as u64;
            }
        }
        inst.best = best;
        self.scratch = scratch;
    }

    /// Carry an instance's outgoing tokens to its successors. For model
    /// nodes this is the exit set; connectors and word ends flush their
    /// single set and go back to sleep.
    pub(crate) fn propagate_external(&mut self, inst_id: u32, t: usize, we_limit: LogFloat) {
        let net = self.net;
        let node_idx = self.insts[inst_id as usize].node;
        let node = net.node(node_idx);
        let layer = self.layer_of(node_idx);

        match node.kind {
            NodeKind::Model(_) => {
                if self.insts[inst_id as usize].best < self.beam_limit {
                    self.deactivate(inst_id);
                    return;
                }
                let n = self.insts[inst_id as usize].ts.len();
                let exit = &self.insts[inst_id as usize].ts[n - 1];
                if exit.is_empty() {
                    return;
                }
                let src_id = exit.id;
                let src_best = self.insts[inst_id as usize].best;
                let mut buf: Vec<(RelToken, LogFloat)> = exit.absolute().collect();
                if self.opts.model_align {
                    for (tok, _) in &mut buf {
                        tok.mod_path = self.mod_hyps.publish(tok.mod_path, node_idx, t as i32);
                    }
                }
                let src_id = if self.opts.model_align { None } else { Some(src_id) };
                for &dest in &node.foll {
                    self.send(dest, &buf, 0.0, PronCost::None, src_best, src_id, 0);
                }
            }
            NodeKind::Connector => {
                let mut ts = std::mem::take(&mut self.insts[inst_id as usize].ts[0]);
                if ts.is_empty() {
                    self.deactivate(inst_id);
                    return;
                }
                if layer == Layer::Zs.index() {
                    let zs_limit = self.best_score - self.opts.zs_beam_width;
                    if ts.score < zs_limit {
                        self.deactivate(inst_id);
                        return;
                    }
                    let score = ts.score;
                    ts.toks.retain(|tok| score + tok.delta >= zs_limit);
                }
                if layer == Layer::Sa.index() {
                    self.update_word_end_boundaries(&mut ts, t);
                }
                let src_best = ts.score;
                let src_id = Some(ts.id).filter(|_| !self.opts.model_align);
                let buf: Vec<(RelToken, LogFloat)> = ts.absolute().collect();

                if net.sil_dict && layer == Layer::Zs.index() {
                    self.flush_zs_sil_dict(node_idx, &buf, src_best);
                } else {
                    for &dest in &node.foll {
                        self.send(dest, &buf, 0.0, PronCost::None, src_best, src_id, 0);
                    }
                }
                self.deactivate(inst_id);
            }
            NodeKind::WordEnd(pron) => {
                self.handle_wordend(inst_id, pron, t, we_limit);
            }
        }
    }

    /// sp/sil dictionaries pay their pronunciation probabilities on the way
    /// out of the ZS layer: the silence variant into a sil model, the
    /// short-pause variant into an sp model, and the bare variant either
    /// straight across (bypassing the sp model, which must not have a tee
    /// here) or into the sentence-end connector.
    fn flush_zs_sil_dict(
        &mut self,
        node_idx: NodeIdx,
        buf: &[(RelToken, LogFloat)],
        src_best: LogFloat,
    ) {
        let net = self.net;
        for &dest in &net.node(node_idx).foll {
            match net.node(dest).kind {
                NodeKind::Model(h) if h == net.hmm_sp => {
                    self.send(dest, buf, 0.0, PronCost::Sp, src_best, None, 0);
                    if Some(dest) != net.se_sp {
                        // bare variant skips the pause model entirely
                        for &d2 in &net.node(dest).foll {
                            self.send(d2, buf, 0.0, PronCost::Base, src_best, None, 1);
                        }
                    }
                }
                NodeKind::Model(h) if h == net.hmm_sil => {
                    self.send(dest, buf, 0.0, PronCost::Sil, src_best, None, 0);
                }
                _ => {
                    // the null connector in front of the sentence end
                    self.send(dest, buf, 0.0, PronCost::Base, src_best, None, 0);
                }
            }
        }
    }

    /// Word-end boundary times are pinned in the SA layer, directly before
    /// the first model of the next word: republish each token's last word
    /// end at the current frame and score.
    fn update_word_end_boundaries(&mut self, ts: &mut TokenSet, t: usize) {
        let score = ts.score;
        for tok in &mut ts.toks {
            if tok.path == WE_NONE {
                continue;
            }
            if self.we_hyps.get(tok.path).frame != t as i32 {
                let new_idx =
                    self.we_hyps.republish(tok.path, t as i32, score + tok.delta, tok.mod_path);
                tok.path = new_idx;
                if self.opts.latgen {
                    tok.we_tag = new_idx;
                }
            }
        }
    }

    /// Apply the LM at a word end: replace the look-ahead estimate by the
    /// real transition probability, publish a word-end hypothesis (plus
    /// alternatives for lattice generation) and recombine tokens that landed
    /// in the same LM state. Tokens at the sentence-end node stay put as
    /// final hypotheses; everything else flushes onward.
    fn handle_wordend(&mut self, inst_id: u32, pron: PronId, t: usize, we_limit: LogFloat) {
        let net = self.net;
        let node_idx = self.insts[inst_id as usize].node;
        let is_end = node_idx == net.end;
        let mut ts = std::mem::take(&mut self.insts[inst_id as usize].ts[0]);
        if ts.is_empty() {
            self.deactivate(inst_id);
            return;
        }

        let mut groups: BTreeMap<LmState, Vec<WeCand>> = BTreeMap::new();
        let mut out: Vec<(RelToken, LogFloat)> = vec![];
        for (tok, abs) in ts.absolute() {
            if tok.lm_state == LmState::SentEnd {
                // a finished hypothesis from an earlier frame; it had its
                // chance to be the utterance end and is now superseded
                continue;
            }
            if we_limit > LZERO && abs < we_limit {
                continue;
            }
            let (lmprob, dest) = self.lm.transition(tok.lm_state, pron);
            if lmprob <= LSMALL {
                continue;
            }
            let new_abs = abs - tok.lm_score + self.opts.lm_scale * lmprob + self.opts.ins_pen;
            if new_abs < self.beam_limit {
                continue;
            }
            groups.entry(dest).or_default().push(WeCand {
                prev: tok.path,
                lm: lmprob,
                score: new_abs,
                mod_path: tok.mod_path,
            });
        }
        ts.clear();

        for (dest, mut cands) in groups {
            cands.sort_by(|a, b| {
                b.score
                    .total_cmp(&a.score)
                    .then_with(|| self.we_hyps.frame_of(a.prev).cmp(&self.we_hyps.frame_of(b.prev)))
                    .then_with(|| a.prev.cmp(&b.prev))
            });
            let winner = &cands[0];
            let hyp = self.we_hyps.publish(
                winner.prev,
                pron,
                t as i32,
                winner.score,
                winner.lm,
                winner.mod_path,
            );
            let winner_score = winner.score;
            let winner_mod = winner.mod_path;
            if self.opts.latgen {
                for loser in &cands[1..] {
                    self.we_hyps.add_alt(
                        hyp,
                        AltWordEnd {
                            prev: loser.prev,
                            score: loser.score,
                            lm: loser.lm,
                            mod_path: loser.mod_path,
                        },
                        self.opts.n_alts,
                    );
                }
            }
            out.push((
                RelToken {
                    lm_state: dest,
                    we_tag: if self.opts.latgen { hyp } else { 0 },
                    delta: 0.0,
                    lm_score: 0.0,
                    path: hyp,
                    mod_path: winner_mod,
                },
                winner_score,
            ));
        }

        if out.is_empty() {
            self.deactivate(inst_id);
            return;
        }
        let mut merged = TokenSet::default();
        merged.clear();
        merged.merge(&out, &self.limits(), &self.we_hyps, &mut self.ts_ids);
        if merged.is_empty() {
            self.deactivate(inst_id);
            return;
        }

        if is_end {
            // final hypotheses accumulate here until trace-back
            let inst = &mut self.insts[inst_id as usize];
            inst.best = merged.score;
            inst.ts[0] = merged;
        } else {
            let src_best = merged.score;
            let buf: Vec<(RelToken, LogFloat)> = merged.absolute().collect();
            let node = net.node(node_idx);
            for &dest in &node.foll {
                self.send(dest, &buf, 0.0, PronCost::None, src_best, None, 0);
            }
            self.deactivate(inst_id);
        }
    }

    /// Merge tokens into a destination node's entry set, applying a
    /// transition cost, an optional pronunciation-variant probability, and
    /// the destination's LM look-ahead. Activates the node if necessary and
    /// follows one level of tee transition.
    #[allow(clippy::too_many_arguments)]
    fn send(
        &mut self,
        dest: NodeIdx,
        buf: &[(RelToken, LogFloat)],
        base_cost: LogFloat,
        pcost: PronCost,
        src_best: LogFloat,
        src_id: Option<u32>,
        depth: u8,
    ) {
        let net = self.net;
        let node = net.node(dest);

        let mut out: Vec<(RelToken, LogFloat)> = Vec::with_capacity(buf.len());
        for &(tok, abs) in buf {
            let mut abs = abs + base_cost;
            if pcost != PronCost::None && tok.path != WE_NONE {
                let info = net.pron(self.we_hyps.get(tok.path).pron);
                let prob = match pcost {
                    PronCost::Base => info.prob,
                    PronCost::Sp => info.sp_prob,
                    PronCost::Sil => info.sil_prob,
                    PronCost::None => unreachable!(),
                };
                abs += self.opts.pron_scale * prob;
            }
            out.push((tok, abs));
        }

        let pure = base_cost == 0.0 && pcost == PronCost::None && node.lmla_idx == 0;

        if node.lmla_idx != 0 {
            let fast = src_best < self.best_score - self.opts.fast_lmla_beam;
            let mut kept = 0;
            for k in 0..out.len() {
                let (mut tok, mut abs) = out[k];
                let mut state = tok.lm_state;
                if fast {
                    state = self.lm.fast_la_state(state);
                }
                let raw = self
                    .lmla
                    .lookahead(&net.la_tree, self.lm, node.lmla_idx, state);
                if raw <= LSMALL {
                    // no word reachable through this node is possible
                    continue;
                }
                let la = self.opts.lm_scale * raw;
                abs += la - tok.lm_score;
                tok.lm_score = la;
                out[kept] = (tok, abs);
                kept += 1;
            }
            out.truncate(kept);
        }

        if out.iter().all(|&(_, abs)| abs < self.beam_limit) {
            return;
        }
        let inst_id = match self.node_inst[dest as usize] {
            INST_NONE => self.activate(dest),
            id => id,
        };

        if let (Some(sid), true) = (src_id, pure) {
            if self.insts[inst_id as usize].ts[0].id == sid {
                // the destination already holds exactly these tokens
                return;
            }
        }

        let was_empty = self.insts[inst_id as usize].ts[0].is_empty();
        let mut ts = std::mem::take(&mut self.insts[inst_id as usize].ts[0]);
        ts.merge(&out, &self.limits(), &self.we_hyps, &mut self.ts_ids);
        if let (Some(sid), true, true) = (src_id, pure, was_empty) {
            // a pure copy keeps the source's identity so parallel copies of
            // the same set can be recognised
            if !ts.is_empty() {
                ts.id = sid;
            }
        }
        let inst = &mut self.insts[inst_id as usize];
        if !ts.is_empty() {
            inst.best = inst.best.max(ts.score);
        }
        inst.ts[0] = ts;

        // a tee transition lets the destination model emit nothing at all:
        // carry the tokens straight through to its successors
        if depth == 0 {
            if let NodeKind::Model(h) = node.kind {
                let hset = self.hset;
                let hmm = hset.get(h);
                if hmm.has_tee() {
                    let tee = hmm.tee_prob();
                    let tee_buf = out;
                    for &d2 in &node.foll {
                        self.send(d2, &tee_buf, tee, PronCost::None, src_best, None, 1);
                    }
                }
            }
        }
    }
}
