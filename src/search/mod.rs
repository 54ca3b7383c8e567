//! The time-synchronous Viterbi search.
//!
//! One `Decoder` drives one utterance over a built lexicon network and a
//! language model. Each call to [`Decoder::process_frame`] is a complete
//! synchronous step: an internal pass moves tokens through the HMM trellis of
//! every active model node, then an external pass sweeps the layers in
//! topological order, carrying token sets across links, applying LM
//! look-ahead, handling word ends and pruning. There are no suspension
//! points and no shared mutable state outside the decoder instance itself.
use crate::hmm::HmmSet;
use crate::lm::LangModel;
use crate::logmath::{LogFloat, LZERO};
use crate::net::{Layer, LexNet, NodeIdx, NodeKind, N_LAYERS};
use crate::outp::{AcousticScorer, OutPCache};
use tracing::{debug, warn};

pub mod cache;
pub mod propagate;
pub mod stats;
pub mod token;
pub mod wordend;

use cache::LmlaCache;
use stats::Stats;
use token::{RelToken, TokenSet};
use wordend::{MeHypArena, WeHypArena};

/// Everything tunable about the search.
#[derive(Debug, Clone)]
pub struct DecoderOpts {
    /// Max tokens (distinct LM states) per HMM state.
    pub n_tok: usize,
    pub beam_width: LogFloat,
    pub rel_beam_width: LogFloat,
    pub we_beam_width: LogFloat,
    pub zs_beam_width: LogFloat,
    /// 0 disables max-model pruning.
    pub max_model: usize,
    pub ins_pen: LogFloat,
    pub ac_scale: f64,
    pub pron_scale: f64,
    pub lm_scale: f64,
    /// Outside this beam look-ahead uses a backed-off LM state; infinite
    /// disables the fallback.
    pub fast_lmla_beam: LogFloat,
    pub latgen: bool,
    /// Keep per-model trace-back chains. Disables token-set identity
    /// sharing.
    pub model_align: bool,
    /// Alternatives kept per word end for lattice generation.
    pub n_alts: usize,
}

impl Default for DecoderOpts {
    fn default() -> Self {
        DecoderOpts {
            n_tok: 32,
            beam_width: -LZERO,
            rel_beam_width: -LZERO,
            we_beam_width: -LZERO,
            zs_beam_width: -LZERO,
            max_model: 0,
            ins_pen: 0.0,
            ac_scale: 1.0,
            pron_scale: 1.0,
            lm_scale: 1.0,
            fast_lmla_beam: -LZERO,
            latgen: false,
            model_align: false,
            n_alts: 8,
        }
    }
}

pub(crate) const INST_NONE: u32 = u32::MAX;

/// A node that currently holds tokens: one token set per HMM state for model
/// nodes (entry, emitting states, exit), a single set otherwise.
#[derive(Debug)]
pub(crate) struct Instance {
    pub node: NodeIdx,
    pub ts: Vec<TokenSet>,
    pub best: LogFloat,
    pub alive: bool,
}

pub struct Decoder<'a> {
    pub(crate) net: &'a LexNet,
    pub(crate) hset: &'a HmmSet,
    pub(crate) lm: &'a LangModel,
    pub(crate) opts: DecoderOpts,

    pub(crate) insts: Vec<Instance>,
    free: Vec<u32>,
    /// Node -> active instance, parallel to the network's node array.
    pub(crate) node_inst: Vec<u32>,
    node_layer: Vec<u8>,
    pub(crate) layers: [Vec<u32>; N_LAYERS],

    pub(crate) frame: usize,
    pub(crate) best_score: LogFloat,
    pub(crate) best_node: NodeIdx,
    pub(crate) beam_limit: LogFloat,
    cur_beam: LogFloat,
    starved: bool,

    pub(crate) we_hyps: WeHypArena,
    pub(crate) mod_hyps: MeHypArena,
    pub(crate) lmla: LmlaCache,
    pub(crate) outp: OutPCache,
    pub(crate) ts_ids: u32,
    pub stats: Stats,

    /// Scratch token sets for the trellis step, one per HMM state.
    pub(crate) scratch: Vec<TokenSet>,
}

impl<'a> Decoder<'a> {
    pub fn new(net: &'a LexNet, hset: &'a HmmSet, lm: &'a LangModel, opts: DecoderOpts) -> Self {
        let mut node_layer = vec![0u8; net.nodes.len()];
        for layer in Layer::ALL {
            for idx in net.layer_range(layer) {
                node_layer[idx] = layer.index() as u8;
            }
        }
        let max_states = hset.max_n_states().max(2);
        let mut scratch = Vec::with_capacity(max_states);
        scratch.resize_with(max_states, TokenSet::default);
        let mut dec = Decoder {
            net,
            hset,
            lm,
            opts,
            insts: vec![],
            free: vec![],
            node_inst: vec![INST_NONE; net.nodes.len()],
            node_layer,
            layers: Default::default(),
            frame: 0,
            best_score: 0.0,
            best_node: net.start,
            beam_limit: LZERO,
            cur_beam: 0.0,
            starved: false,
            we_hyps: WeHypArena::new(),
            mod_hyps: MeHypArena::new(),
            lmla: LmlaCache::new(net.la_tree.len()),
            outp: OutPCache::new(hset.n_pdfs(), 1),
            ts_ids: 0,
            stats: Stats::default(),
            scratch,
        };
        dec.init_utterance();
        dec
    }

    /// Reset all per-utterance state and seed the start node.
    pub fn init_utterance(&mut self) {
        for inst in &self.insts {
            if inst.alive {
                self.node_inst[inst.node as usize] = INST_NONE;
            }
        }
        self.insts.clear();
        self.free.clear();
        for layer in &mut self.layers {
            layer.clear();
        }
        self.frame = 0;
        self.best_score = 0.0;
        self.best_node = self.net.start;
        self.beam_limit = LZERO;
        self.cur_beam = self.opts.beam_width;
        self.starved = false;
        self.we_hyps.reset();
        self.mod_hyps.reset();
        self.lmla.reset();
        self.outp.reset();
        self.ts_ids = 0;
        self.stats.reset();

        let start = self.net.start;
        let inst = self.activate(start);
        let id = self.fresh_ts_id();
        let entry = &mut self.insts[inst as usize].ts[0];
        entry.score = 0.0;
        entry.id = id;
        entry.toks.push(RelToken::initial());
        self.insts[inst as usize].best = 0.0;
    }

    pub fn frame(&self) -> usize {
        self.frame
    }

    /// Best token score seen in the last processed frame.
    pub fn best_score(&self) -> LogFloat {
        self.best_score
    }

    /// Network node holding that best token.
    pub fn best_node(&self) -> NodeIdx {
        self.best_node
    }

    /// The beam width in effect after the last frame's max-model pruning;
    /// equals the configured beam when that pruning did not trigger.
    pub fn current_beam(&self) -> LogFloat {
        self.cur_beam
    }

    /// Number of currently active model-node instances.
    pub fn n_active_models(&self) -> usize {
        self.insts
            .iter()
            .filter(|inst| {
                inst.alive && matches!(self.net.node(inst.node).kind, NodeKind::Model(_))
            })
            .count()
    }

    /// True when every hypothesis was pruned before the utterance ended.
    pub fn starved(&self) -> bool {
        self.starved
    }

    pub(crate) fn fresh_ts_id(&mut self) -> u32 {
        self.ts_ids += 1;
        self.ts_ids
    }

    pub(crate) fn layer_of(&self, node: NodeIdx) -> usize {
        self.node_layer[node as usize] as usize
    }

    pub(crate) fn activate(&mut self, node: NodeIdx) -> u32 {
        debug_assert_eq!(self.node_inst[node as usize], INST_NONE);
        let n_sets = match self.net.node(node).kind {
            NodeKind::Model(hmm) => self.hset.get(hmm).n_states,
            _ => 1,
        };
        let id = match self.free.pop() {
            Some(id) => {
                let inst = &mut self.insts[id as usize];
                inst.node = node;
                inst.best = LZERO;
                inst.alive = true;
                inst.ts.resize_with(n_sets, TokenSet::default);
                for ts in &mut inst.ts {
                    ts.clear();
                }
                id
            }
            None => {
                let mut ts = Vec::with_capacity(n_sets);
                ts.resize_with(n_sets, TokenSet::default);
                self.insts.push(Instance {
                    node,
                    ts,
                    best: LZERO,
                    alive: true,
                });
                self.insts.len() as u32 - 1
            }
        };
        self.node_inst[node as usize] = id;
        self.layers[self.layer_of(node)].push(id);
        self.stats.n_activate += 1;
        id
    }

    pub(crate) fn deactivate(&mut self, inst_id: u32) {
        let inst = &mut self.insts[inst_id as usize];
        if !inst.alive {
            return;
        }
        inst.alive = false;
        self.node_inst[inst.node as usize] = INST_NONE;
        for ts in &mut inst.ts {
            ts.clear();
        }
        self.free.push(inst_id);
        self.stats.n_deactivate += 1;
    }

    /// Process one acoustic frame; a complete synchronous step.
    pub fn process_frame(&mut self, scorer: &dyn AcousticScorer) {
        let t = self.frame;

        // internal pass: trellis step for every active model node
        let mut frame_best = LZERO;
        let mut best_node = self.net.start;
        let mut model_bests: Vec<LogFloat> = vec![];
        for layer in 0..N_LAYERS {
            let snapshot: Vec<u32> = self.layers[layer].clone();
            for inst_id in snapshot {
                if !self.insts[inst_id as usize].alive {
                    continue;
                }
                let node = self.insts[inst_id as usize].node;
                if let NodeKind::Model(hmm) = self.net.node(node).kind {
                    if self.insts[inst_id as usize].ts.iter().all(|ts| ts.is_empty()) {
                        self.deactivate(inst_id);
                        continue;
                    }
                    self.propagate_internal(inst_id, hmm, scorer, t);
                    let best = self.insts[inst_id as usize].best;
                    if best > frame_best {
                        frame_best = best;
                        best_node = node;
                    }
                    model_bests.push(best);
                }
            }
        }
        self.best_score = frame_best;
        self.best_node = best_node;

        // max-model pruning tightens the beam to keep only the top scorers
        self.cur_beam = self.opts.beam_width;
        if self.opts.max_model > 0 && model_bests.len() > self.opts.max_model {
            model_bests.sort_by(|a, b| b.total_cmp(a));
            let limit = model_bests[self.opts.max_model - 1];
            self.cur_beam = self.cur_beam.min(frame_best - limit);
            debug!(
                "max-model pruning: {} active, beam tightened to {:.2}",
                model_bests.len(),
                self.cur_beam
            );
        }
        self.beam_limit = if frame_best > LZERO {
            frame_best - self.cur_beam
        } else {
            LZERO
        };

        // external pass: move token sets across links, layer by layer
        for layer in 0..N_LAYERS {
            let we_limit = if layer == Layer::We.index() {
                self.word_end_limit(layer)
            } else {
                LZERO
            };
            let mut idx = 0;
            while idx < self.layers[layer].len() {
                let inst_id = self.layers[layer][idx];
                idx += 1;
                if !self.insts[inst_id as usize].alive {
                    continue;
                }
                self.propagate_external(inst_id, t, we_limit);
            }
        }

        // compact layer lists and count the active
        let mut n_active = 0u64;
        for layer in 0..N_LAYERS {
            let insts = &self.insts;
            self.layers[layer].retain(|&id| insts[id as usize].alive);
            n_active += self.layers[layer].len() as u64;
        }
        if n_active == 0 && !self.starved {
            self.starved = true;
            warn!(
                "all tokens pruned at frame {}; utterance will produce no output",
                t
            );
        }
        self.stats.n_active += n_active;
        self.stats.n_frames += 1;
        self.stats.lmla_hits = self.lmla.hits;
        self.stats.lmla_misses = self.lmla.misses;
        self.stats.outp_hits = self.outp.hits;
        self.stats.outp_misses = self.outp.misses;

        self.frame += 1;
    }

    /// Best word-end token score in the layer, for the word-end beam.
    fn word_end_limit(&self, layer: usize) -> LogFloat {
        let mut best = LZERO;
        for &inst_id in &self.layers[layer] {
            let inst = &self.insts[inst_id as usize];
            if !inst.alive || inst.ts[0].is_empty() {
                continue;
            }
            if matches!(self.net.node(inst.node).kind, NodeKind::WordEnd(_))
                && inst.ts[0].score > best
            {
                best = inst.ts[0].score;
            }
        }
        if best > LZERO {
            best - self.opts.we_beam_width
        } else {
            LZERO
        }
    }

    /// The instance holding the end-of-sentence hypotheses, if any survived.
    pub(crate) fn final_instance(&self) -> Option<&Instance> {
        let id = self.node_inst[self.net.end as usize];
        if id == INST_NONE {
            return None;
        }
        let inst = &self.insts[id as usize];
        if inst.alive && !inst.ts[0].is_empty() {
            Some(inst)
        } else {
            None
        }
    }
}
