//! Per-node LM look-ahead cache.
//!
//! Look-ahead is queried once per (look-ahead node, LM state) pair per merge,
//! and the same pairs recur frame after frame while the beam is stable. Each
//! look-ahead node keeps a small bounded array of recent states, replaced
//! round-robin; distinct nodes never evict each other.
use crate::lm::{LangModel, LmState};
use crate::logmath::LogFloat;
use crate::net::{LmlaTree, PronId};

/// Entries kept per look-ahead node.
const NODE_CACHE_SIZE: usize = 64;

#[derive(Debug, Default)]
struct NodeCache {
    entries: Vec<(LmState, LogFloat)>,
    next: usize,
}

impl NodeCache {
    fn lookup(&self, state: LmState) -> Option<LogFloat> {
        self.entries
            .iter()
            .find(|(s, _)| *s == state)
            .map(|&(_, p)| p)
    }

    fn insert(&mut self, state: LmState, prob: LogFloat) {
        if self.entries.len() < NODE_CACHE_SIZE {
            self.entries.push((state, prob));
        } else {
            self.entries[self.next] = (state, prob);
            self.next = (self.next + 1) % NODE_CACHE_SIZE;
        }
    }
}

#[derive(Debug, Default)]
pub struct LmlaCache {
    nodes: Vec<Option<NodeCache>>,
    pub hits: u64,
    pub misses: u64,
}

impl LmlaCache {
    pub fn new(n_la_nodes: usize) -> Self {
        let mut nodes = Vec::with_capacity(n_la_nodes);
        nodes.resize_with(n_la_nodes, || None);
        LmlaCache {
            nodes,
            hits: 0,
            misses: 0,
        }
    }

    pub fn reset(&mut self) {
        for node in &mut self.nodes {
            *node = None;
        }
        self.hits = 0;
        self.misses = 0;
    }

    /// Look-ahead score for look-ahead node `idx` from `state`: the maximum
    /// LM probability over the node's reachable word-end interval(s).
    pub fn lookahead(
        &mut self,
        tree: &LmlaTree,
        lm: &LangModel,
        idx: u32,
        state: LmState,
    ) -> LogFloat {
        debug_assert_ne!(idx, 0);
        if let Some(Some(cache)) = self.nodes.get(idx as usize) {
            if let Some(prob) = cache.lookup(state) {
                self.hits += 1;
                return prob;
            }
        }
        self.misses += 1;
        let prob = if tree.is_complex(idx) {
            // union of the children's intervals
            let children = &tree.complex(idx).children;
            let mut max = f64::NEG_INFINITY;
            for &child in children {
                let node = tree.simple(child);
                let p = lm.lookahead(state, PronId(node.lo), PronId(node.hi));
                max = max.max(p);
            }
            max
        } else {
            let node = tree.simple(idx);
            lm.lookahead(state, PronId(node.lo), PronId(node.hi))
        };
        self.nodes[idx as usize]
            .get_or_insert_with(NodeCache::default)
            .insert(state, prob);
        prob
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lm::NgramLm;
    use crate::net::LmlaNode;

    fn tiny_lm() -> LangModel {
        let mut vocab = crate::lm::ngram::PronVocab::new();
        vocab.insert("<s>".into(), vec![PronId(1)]);
        vocab.insert("</s>".into(), vec![PronId(2)]);
        vocab.insert("A".into(), vec![PronId(3)]);
        let arpa = "\\data\\\nngram 1=3\n\n\\1-grams:\n-1.0 <s>\n-1.5 </s>\n-0.5 A\n\\end\\\n";
        LangModel::Ngram(NgramLm::read(arpa.as_bytes(), &vocab, 3, "<s>", "</s>").unwrap())
    }

    #[test]
    fn caches_and_counts() {
        let lm = tiny_lm();
        let tree = LmlaTree {
            nodes: vec![
                LmlaNode::default(),
                LmlaNode { lo: 2, hi: 3 },
            ],
            comp: vec![],
        };
        let mut cache = LmlaCache::new(tree.len());
        let s = LmState::Hist(0);
        let a = cache.lookahead(&tree, &lm, 1, s);
        let b = cache.lookahead(&tree, &lm, 1, s);
        assert_eq!(a, b);
        assert_eq!(cache.hits, 1);
        assert_eq!(cache.misses, 1);
        // max over [2,3] is the unigram of A
        assert!((a - -0.5 * crate::logmath::LN10).abs() < 1e-9);
    }

    #[test]
    fn complex_nodes_take_the_union() {
        let lm = tiny_lm();
        let tree = LmlaTree {
            nodes: vec![
                LmlaNode::default(),
                LmlaNode { lo: 2, hi: 2 },
                LmlaNode { lo: 3, hi: 3 },
            ],
            comp: vec![crate::net::CompLmlaNode {
                children: vec![1, 2],
            }],
        };
        let mut cache = LmlaCache::new(tree.len());
        let s = LmState::Hist(0);
        let union = cache.lookahead(&tree, &lm, 3, s);
        let a = cache.lookahead(&tree, &lm, 2, s);
        assert_eq!(union, a);
    }
}
