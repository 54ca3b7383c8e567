//! The static lexicon network the search runs over.
//!
//! The network is a layered directed graph. Model nodes evaluate an HMM,
//! connector nodes are free meeting points for context classes (they turn the
//! |A|*|B| cross product of left and right phone sets into |A|+|B| links), and
//! word-end nodes record the completion of a pronunciation. Nodes live in
//! nine layers that tokens visit in a fixed order each frame:
//!
//! ```text
//!  SA -> A -> AB -> BY... -> WE -> YZ -> Z -> ZS -> SIL -> SA -> ...
//! ```
//!
//! where A holds word-initial triphones, B..Y the shared pronunciation prefix
//! tree, Z word-final triphones and SIL the optional inter-word silence and
//! short-pause models.
//!
//! Every node also carries an index into the compressed LM look-ahead tree;
//! an index of zero means the set of word ends reachable from the node is the
//! same as from its predecessor and no look-ahead update is needed.
use crate::hmm::HmmId;
use crate::logmath::LogFloat;
use crate::phones::PhoneId;

pub mod build;

pub use build::{build_lex_net, NetConfig};

pub const N_LAYERS: usize = 9;

/// Network layers in the order they are processed within a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Layer {
    /// Word-final triphone models.
    Z = 0,
    /// Connectors between final phones and what follows.
    Zs = 1,
    /// Inter-word sil/sp models.
    Sil = 2,
    /// Connectors in front of word-initial models.
    Sa = 3,
    /// Word-initial triphone models.
    A = 4,
    /// Connectors behind the first two phones of a word.
    Ab = 5,
    /// The shared pronunciation prefix tree.
    By = 6,
    /// Word-end markers.
    We = 7,
    /// Connectors recording the last two phones of a word.
    Yz = 8,
}

impl Layer {
    pub const ALL: [Layer; N_LAYERS] = [
        Layer::Z,
        Layer::Zs,
        Layer::Sil,
        Layer::Sa,
        Layer::A,
        Layer::Ab,
        Layer::By,
        Layer::We,
        Layer::Yz,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Identifier of a pronunciation in the built network. Ids are assigned so
/// that the word ends reachable from any prefix-tree node form one contiguous
/// interval, which is what makes interval-max LM look-ahead possible. Zero is
/// reserved for "not in the network".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PronId(pub u16);

impl PronId {
    pub const NONE: PronId = PronId(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

pub type NodeIdx = u32;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum NodeKind {
    Model(HmmId),
    Connector,
    WordEnd(PronId),
}

#[derive(Debug, Clone)]
pub struct LexNode {
    pub kind: NodeKind,
    pub foll: Vec<NodeIdx>,
    /// Index into the look-ahead tree; 0 means "inherit the predecessor's".
    pub lmla_idx: u32,
}

/// What the network remembers about a pronunciation for LM lookup, output
/// labelling and pronunciation probabilities.
#[derive(Debug, Clone)]
pub struct PronInfo {
    pub word: String,
    pub variant: u32,
    pub phones: Vec<PhoneId>,
    pub prob: LogFloat,
    pub sp_prob: LogFloat,
    pub sil_prob: LogFloat,
}

/// Simple look-ahead node: the reachable word ends are exactly `lo..=hi`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LmlaNode {
    pub lo: u16,
    pub hi: u16,
}

/// Complex look-ahead node: union of the children's intervals. These occur at
/// layer-A fan-outs where a shared word-initial model leads into several
/// prefix subtrees.
#[derive(Debug, Clone)]
pub struct CompLmlaNode {
    pub children: Vec<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct LmlaTree {
    /// Simple nodes, indexed by `lmla_idx`; entry 0 is unused.
    pub nodes: Vec<LmlaNode>,
    /// Complex nodes, indexed by `lmla_idx - nodes.len()`.
    pub comp: Vec<CompLmlaNode>,
}

impl LmlaTree {
    pub fn is_complex(&self, idx: u32) -> bool {
        idx as usize >= self.nodes.len()
    }

    pub fn simple(&self, idx: u32) -> LmlaNode {
        self.nodes[idx as usize]
    }

    pub fn complex(&self, idx: u32) -> &CompLmlaNode {
        &self.comp[idx as usize - self.nodes.len()]
    }

    pub fn len(&self) -> usize {
        self.nodes.len() + self.comp.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
pub struct LexNet {
    pub nodes: Vec<LexNode>,
    /// `layer_start[l]..layer_start[l+1]` is the node index range of layer l.
    pub layer_start: [usize; N_LAYERS + 1],

    /// The sentence-start model node tokens are seeded into.
    pub start: NodeIdx,
    /// The sentence-end word-end node surviving tokens are read from.
    pub end: NodeIdx,
    /// The null connector in layer SA in front of the sentence-end model; a
    /// token passing it has its pending word-end time updated, which is what
    /// gives the final word its correct boundary.
    pub end_time_node: NodeIdx,

    pub start_pron: PronId,
    pub end_pron: PronId,

    /// Pronunciation info indexed by `PronId`; entry 0 is `None`.
    pub pronlist: Vec<Option<PronInfo>>,
    /// Dense dictionary pronunciation index -> assigned `PronId`
    /// (`PronId::NONE` for pronunciations left out of the network).
    pub pron_ids: Vec<PronId>,

    pub la_tree: LmlaTree,

    /// Whether the dictionary carried explicit -/sp/sil variants.
    pub sil_dict: bool,
    pub hmm_sp: HmmId,
    pub hmm_sil: HmmId,
    /// sp and sil models leading straight to the sentence end (sil_dict only).
    pub se_sp: Option<NodeIdx>,
    pub se_sil: Option<NodeIdx>,
}

impl LexNet {
    pub fn node(&self, idx: NodeIdx) -> &LexNode {
        &self.nodes[idx as usize]
    }

    pub fn layer_range(&self, layer: Layer) -> std::ops::Range<usize> {
        self.layer_start[layer.index()]..self.layer_start[layer.index() + 1]
    }

    pub fn layer_of(&self, idx: NodeIdx) -> Layer {
        let idx = idx as usize;
        for layer in Layer::ALL {
            let range = self.layer_range(layer);
            if range.contains(&idx) {
                return layer;
            }
        }
        unreachable!("node index {} out of range", idx)
    }

    /// Highest assigned PronId.
    pub fn n_prons(&self) -> usize {
        self.pronlist.len() - 1
    }

    pub fn pron(&self, id: PronId) -> &PronInfo {
        self.pronlist[id.0 as usize]
            .as_ref()
            .expect("PronId not assigned")
    }
}
