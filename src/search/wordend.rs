//! Word-end and model-end hypothesis arenas.
//!
//! Hypotheses are append-only for the duration of an utterance and immutable
//! once published; tokens refer to them by index, so chains are shared freely
//! between tokens without any reference counting. The whole arena is dropped
//! at utterance reset.
use crate::logmath::LogFloat;
use crate::net::{NodeIdx, PronId};

pub type WeHypIdx = u32;
pub const WE_NONE: WeHypIdx = u32::MAX;

pub type MeHypIdx = u32;
pub const ME_NONE: MeHypIdx = u32::MAX;

/// An alternative way of reaching the owning word end, kept for lattice
/// generation.
#[derive(Debug, Clone, Copy)]
pub struct AltWordEnd {
    pub prev: WeHypIdx,
    pub score: LogFloat,
    pub lm: LogFloat,
    pub mod_path: MeHypIdx,
}

/// A completed word: its pronunciation, end frame, total score, LM score and
/// the chain of what came before.
#[derive(Debug, Clone)]
pub struct WordEndHyp {
    pub prev: WeHypIdx,
    pub pron: PronId,
    pub frame: i32,
    pub score: LogFloat,
    pub lm: LogFloat,
    pub alt: Vec<AltWordEnd>,
    pub mod_path: MeHypIdx,
}

#[derive(Debug, Default)]
pub struct WeHypArena {
    hyps: Vec<WordEndHyp>,
}

impl WeHypArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.hyps.clear();
    }

    pub fn len(&self) -> usize {
        self.hyps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hyps.is_empty()
    }

    pub fn publish(
        &mut self,
        prev: WeHypIdx,
        pron: PronId,
        frame: i32,
        score: LogFloat,
        lm: LogFloat,
        mod_path: MeHypIdx,
    ) -> WeHypIdx {
        self.hyps.push(WordEndHyp {
            prev,
            pron,
            frame,
            score,
            lm,
            alt: vec![],
            mod_path,
        });
        self.hyps.len() as WeHypIdx - 1
    }

    /// Re-publish `hyp` with a later boundary, as done when a token crosses
    /// the layer where word-end times are pinned down. The model trace-back
    /// pointer moves with the token, which by now has passed the word-final
    /// and silence models.
    pub fn republish(
        &mut self,
        hyp: WeHypIdx,
        frame: i32,
        score: LogFloat,
        mod_path: MeHypIdx,
    ) -> WeHypIdx {
        let src = &self.hyps[hyp as usize];
        let cloned = WordEndHyp {
            frame,
            score,
            prev: src.prev,
            pron: src.pron,
            lm: src.lm,
            alt: src.alt.clone(),
            mod_path,
        };
        self.hyps.push(cloned);
        self.hyps.len() as WeHypIdx - 1
    }

    /// Record an N-best alternative on an existing hypothesis, keeping the
    /// list sorted by score and bounded.
    pub fn add_alt(&mut self, hyp: WeHypIdx, alt: AltWordEnd, max_alts: usize) {
        let alts = &mut self.hyps[hyp as usize].alt;
        let pos = alts.partition_point(|a| a.score >= alt.score);
        if pos < max_alts {
            alts.insert(pos, alt);
            alts.truncate(max_alts);
        }
    }

    pub fn get(&self, idx: WeHypIdx) -> &WordEndHyp {
        &self.hyps[idx as usize]
    }

    /// Frame of a hypothesis, with the empty chain sorting earliest; used in
    /// tie-breaking.
    pub fn frame_of(&self, idx: WeHypIdx) -> i32 {
        if idx == WE_NONE {
            -1
        } else {
            self.hyps[idx as usize].frame
        }
    }
}

/// One finished model instance on a token's path, for model-level trace-back.
#[derive(Debug, Clone, Copy)]
pub struct ModEndHyp {
    pub prev: MeHypIdx,
    pub node: NodeIdx,
    pub frame: i32,
}

#[derive(Debug, Default)]
pub struct MeHypArena {
    hyps: Vec<ModEndHyp>,
}

impl MeHypArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.hyps.clear();
    }

    pub fn publish(&mut self, prev: MeHypIdx, node: NodeIdx, frame: i32) -> MeHypIdx {
        self.hyps.push(ModEndHyp { prev, node, frame });
        self.hyps.len() as MeHypIdx - 1
    }

    pub fn get(&self, idx: MeHypIdx) -> &ModEndHyp {
        &self.hyps[idx as usize]
    }
}
