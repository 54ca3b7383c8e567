//! Static construction of the lexicon network.
//!
//! The build runs over a temporary, pointer-happy graph that is easy to grow
//! and dedup, then converts it into the compact layered arena the decoder
//! iterates over. The stages mirror the structure of the network itself:
//! scan the pronunciations for the phone sets, materialise the word-initial
//! (A) and word-final (Z) cross-word layers around their connector classes,
//! insert the inter-word silence models, grow the shared prefix tree, wire up
//! the sentence start/end boundary, then assign pronunciation ids by DFS so
//! every interior node can describe its reachable word ends as one interval.
use super::{
    CompLmlaNode, Layer, LexNet, LexNode, LmlaNode, LmlaTree, NodeKind, PronId, PronInfo,
    N_LAYERS,
};
use crate::dict::{Dictionary, Pron};
use crate::error::{DecodeError, Result};
use crate::hmm::{HmmId, HmmSet};
use crate::logmath::LogFloat;
use crate::phones::{PhoneId, PhoneTable};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct NetConfig {
    pub start_word: String,
    pub end_word: String,
    pub sp_label: String,
    pub sil_label: String,
    /// Dictionary carries -/sp/sil variants (must already be converted).
    pub sil_dict: bool,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            start_word: "<s>".into(),
            end_word: "</s>".into(),
            sp_label: "sp".into(),
            sil_label: "sil".into(),
            sil_dict: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum TKind {
    Model(HmmId),
    Con(PhoneId, PhoneId),
    /// Dense dictionary pronunciation index.
    WordEnd(usize),
}

#[derive(Debug)]
struct TNode {
    kind: TKind,
    layer: Layer,
    links: Vec<usize>,
    lo_we: u16,
    hi_we: u16,
    lmla_idx: u32,
}

struct Builder<'a> {
    dict: &'a Dictionary,
    hset: &'a HmmSet,
    phones: &'a PhoneTable,
    cfg: &'a NetConfig,

    sil: PhoneId,

    nodes: Vec<TNode>,

    /// First and last phones over all pronunciations, phones of one-phone
    /// words.
    lex_a: BTreeSet<PhoneId>,
    lex_z: BTreeSet<PhoneId>,
    lex_p: BTreeSet<PhoneId>,

    /// Connector classes, each mapping a phone pair to its temp node.
    ab: BTreeMap<(PhoneId, PhoneId), usize>,
    yz: BTreeMap<(PhoneId, PhoneId), usize>,
    zs: BTreeMap<(PhoneId, PhoneId), usize>,
    sa: BTreeMap<(PhoneId, PhoneId), usize>,

    /// Model-node sharing in the A and Z layers, keyed by physical model.
    node_a: BTreeMap<HmmId, usize>,
    node_z: BTreeMap<HmmId, usize>,

    /// Dense dictionary pron index -> assigned PronId value.
    pron_ids: Vec<u16>,
    n_pron_ids: u32,
    lmla_count: u32,

    hmm_sp: HmmId,
    hmm_sil: HmmId,

    start_mod: usize,
    end_we: usize,
    end_time: usize,
    se_sp: Option<usize>,
    se_sil: Option<usize>,
}

/// Build the lexicon network for all marked words and pronunciations.
pub fn build_lex_net(
    dict: &Dictionary,
    hset: &HmmSet,
    phones: &PhoneTable,
    cfg: &NetConfig,
) -> Result<LexNet> {
    let sil = phones
        .lookup(&cfg.sil_label)
        .ok_or_else(|| DecodeError::ResourceMissing(format!("phone '{}'", cfg.sil_label)))?;
    let hmm_sil = hset.find_hmm(&cfg.sil_label)?;
    let hmm_sp = hset.find_hmm(&cfg.sp_label)?;

    if cfg.sil_dict && hset.get(hmm_sp).has_tee() {
        return Err(DecodeError::BadSpModel(cfg.sp_label.clone()));
    }

    let mut b = Builder {
        dict,
        hset,
        phones,
        cfg,
        sil,
        nodes: vec![],
        lex_a: BTreeSet::new(),
        lex_z: BTreeSet::new(),
        lex_p: BTreeSet::new(),
        ab: BTreeMap::new(),
        yz: BTreeMap::new(),
        zs: BTreeMap::new(),
        sa: BTreeMap::new(),
        node_a: BTreeMap::new(),
        node_z: BTreeMap::new(),
        pron_ids: vec![0; dict.n_prons()],
        n_pron_ids: 0,
        lmla_count: 0,
        hmm_sp,
        hmm_sil,
        start_mod: 0,
        end_we: 0,
        end_time: 0,
        se_sp: None,
        se_sil: None,
    };

    b.collect_phone_stats()?;
    b.create_a_nodes()?;
    b.create_z_nodes()?;
    b.create_sil_nodes()?;
    b.create_by_nodes()?;
    b.create_start_end()?;
    b.assign_we_ids()?;
    b.convert()
}

impl<'a> Builder<'a> {
    fn new_node(&mut self, kind: TKind, layer: Layer) -> usize {
        self.nodes.push(TNode {
            kind,
            layer,
            links: vec![],
            lo_we: 0,
            hi_we: 0,
            lmla_idx: 0,
        });
        self.nodes.len() - 1
    }

    fn find_add_con(
        nodes: &mut Vec<TNode>,
        map: &mut BTreeMap<(PhoneId, PhoneId), usize>,
        layer: Layer,
        lc: PhoneId,
        rc: PhoneId,
    ) -> usize {
        *map.entry((lc, rc)).or_insert_with(|| {
            nodes.push(TNode {
                kind: TKind::Con(lc, rc),
                layer,
                links: vec![],
                lo_we: 0,
                hi_we: 0,
                lmla_idx: 0,
            });
            nodes.len() - 1
        })
    }

    fn find_add_model(
        nodes: &mut Vec<TNode>,
        map: &mut BTreeMap<HmmId, usize>,
        layer: Layer,
        hmm: HmmId,
    ) -> usize {
        *map.entry(hmm).or_insert_with(|| {
            nodes.push(TNode {
                kind: TKind::Model(hmm),
                layer,
                links: vec![],
                lo_we: 0,
                hi_we: 0,
                lmla_idx: 0,
            });
            nodes.len() - 1
        })
    }

    fn add_link(&mut self, from: usize, to: usize) {
        if !self.nodes[from].links.contains(&to) {
            self.nodes[from].links.push(to);
        }
    }

    /// Marked pronunciations of regular (non-boundary) words.
    fn each_pron(&self, mut f: impl FnMut(&str, &Pron) -> Result<()>) -> Result<()> {
        for (name, word) in self.dict.iter() {
            if !word.marked || name == &self.cfg.start_word || name == &self.cfg.end_word {
                continue;
            }
            for pron in &word.prons {
                if pron.marked {
                    f(name, pron)?;
                }
            }
        }
        Ok(())
    }

    /// Scan pronunciations for the phone sets A, Z, P and the AB/YZ
    /// connector classes. `sil` always counts as a possible left and right
    /// word context.
    fn collect_phone_stats(&mut self) -> Result<()> {
        let mut abs = vec![];
        let mut yzs = vec![];
        self.each_pron(|name, pron| {
            if pron.phones.is_empty() {
                return Err(DecodeError::DictStructure(format!(
                    "pronunciation of '{}' is empty",
                    name
                )));
            }
            Ok(())
        })?;

        let mut lex_a = BTreeSet::new();
        let mut lex_z = BTreeSet::new();
        let mut lex_p = BTreeSet::new();
        self.each_pron(|_, pron| {
            let first = pron.phones[0];
            let last = *pron.phones.last().unwrap();
            lex_a.insert(first);
            lex_z.insert(last);
            if pron.phones.len() >= 2 {
                abs.push((first, pron.phones[1]));
                yzs.push((pron.phones[pron.phones.len() - 2], last));
            } else {
                lex_p.insert(first);
            }
            Ok(())
        })?;
        lex_a.insert(self.sil);
        lex_z.insert(self.sil);
        self.lex_a = lex_a;
        self.lex_z = lex_z;
        self.lex_p = lex_p;

        for (a, bp) in abs {
            Self::find_add_con(&mut self.nodes, &mut self.ab, Layer::Ab, a, bp);
        }
        for (y, z) in yzs {
            Self::find_add_con(&mut self.nodes, &mut self.yz, Layer::Yz, y, z);
        }

        // One-phone words surface in the Z layer: each needs per-context
        // connectors in both SA and YZ.
        let lex_p: Vec<_> = self.lex_p.iter().copied().collect();
        let lex_z: Vec<_> = self.lex_z.iter().copied().collect();
        for p in &lex_p {
            for z in &lex_z {
                Self::find_add_con(&mut self.nodes, &mut self.sa, Layer::Sa, *z, *p);
                Self::find_add_con(&mut self.nodes, &mut self.yz, Layer::Yz, *z, *p);
            }
        }

        debug!(
            "phone sets: |A|={} |Z|={} |P|={} |AB|={} |YZ|={}",
            self.lex_a.len(),
            self.lex_z.len(),
            self.lex_p.len(),
            self.ab.len(),
            self.yz.len()
        );
        Ok(())
    }

    /// Word-initial layer: one model node per distinct `z-a+b`, shared via
    /// the SA and AB connector classes.
    fn create_a_nodes(&mut self) -> Result<()> {
        let pairs: Vec<_> = self.ab.iter().map(|(&k, &v)| (k, v)).collect();
        let lex_z: Vec<_> = self.lex_z.iter().copied().collect();
        for ((a, bp), ab_node) in pairs {
            for &z in &lex_z {
                let hmm = self.hset.find_triphone(self.phones, z, a, bp)?;
                let node = Self::find_add_model(&mut self.nodes, &mut self.node_a, Layer::A, hmm);
                let sa = Self::find_add_con(&mut self.nodes, &mut self.sa, Layer::Sa, z, a);
                self.add_link(sa, node);
                self.add_link(node, ab_node);
            }
        }
        Ok(())
    }

    /// Word-final layer: one model node per distinct `y-z+a` for every
    /// following word-initial phone a.
    fn create_z_nodes(&mut self) -> Result<()> {
        let pairs: Vec<_> = self.yz.iter().map(|(&k, &v)| (k, v)).collect();
        let lex_a: Vec<_> = self.lex_a.iter().copied().collect();
        for ((y, z), yz_node) in pairs {
            for &a in &lex_a {
                let hmm = self.hset.find_triphone(self.phones, y, z, a)?;
                let node = Self::find_add_model(&mut self.nodes, &mut self.node_z, Layer::Z, hmm);
                self.add_link(yz_node, node);
                let zs = Self::find_add_con(&mut self.nodes, &mut self.zs, Layer::Zs, z, a);
                self.add_link(node, zs);
            }
        }
        Ok(())
    }

    /// Optional silence between words: behind each ZS connector sits either a
    /// sil model (fanning out to every silence-context SA) or an sp model
    /// (connecting straight across to the matching SA).
    fn create_sil_nodes(&mut self) -> Result<()> {
        let pairs: Vec<_> = self.zs.iter().map(|(&k, &v)| (k, v)).collect();
        let lex_a: Vec<_> = self.lex_a.iter().copied().collect();
        for ((z, s), zs_node) in pairs {
            let is_sil = s == self.sil;
            let hmm = if is_sil { self.hmm_sil } else { self.hmm_sp };
            let node = self.new_node(TKind::Model(hmm), Layer::Sil);
            self.add_link(zs_node, node);
            if is_sil {
                for &a in &lex_a {
                    if a != self.sil {
                        let sa =
                            Self::find_add_con(&mut self.nodes, &mut self.sa, Layer::Sa, s, a);
                        self.add_link(node, sa);
                    }
                }
            } else {
                let sa = Self::find_add_con(&mut self.nodes, &mut self.sa, Layer::Sa, z, s);
                self.add_link(node, sa);
            }
        }
        Ok(())
    }

    /// The shared prefix tree from second to second-to-last phone, plus the
    /// word-end nodes. One-phone pronunciations get their own structure.
    fn create_by_nodes(&mut self) -> Result<()> {
        struct PronWork {
            dense: usize,
            phones: Vec<PhoneId>,
        }
        let mut work = vec![];
        self.each_pron(|_, pron| {
            work.push(PronWork {
                dense: pron.index,
                phones: pron.phones.clone(),
            });
            Ok(())
        })?;

        let mut shared = 0usize;
        for pron in &work {
            if pron.phones.len() >= 2 {
                let n = pron.phones.len();
                let mut cur = self.ab[&(pron.phones[0], pron.phones[1])];
                for p in 1..n - 1 {
                    let hmm = self.hset.find_triphone(
                        self.phones,
                        pron.phones[p - 1],
                        pron.phones[p],
                        pron.phones[p + 1],
                    )?;
                    // reuse an existing successor for the same model
                    let existing = self.nodes[cur]
                        .links
                        .iter()
                        .copied()
                        .find(|&l| self.nodes[l].kind == TKind::Model(hmm));
                    cur = match existing {
                        Some(next) => {
                            shared += 1;
                            next
                        }
                        None => {
                            let next = self.new_node(TKind::Model(hmm), Layer::By);
                            self.add_link(cur, next);
                            next
                        }
                    };
                }
                let we = self.new_node(TKind::WordEnd(pron.dense), Layer::We);
                self.add_link(cur, we);
                let yz = self.yz[&(pron.phones[n - 2], pron.phones[n - 1])];
                self.add_link(we, yz);
            } else {
                self.handle_one_phone_pron(pron.dense, pron.phones[0])?;
            }
        }
        debug!("nodes shared in prefix tree: {}", shared);
        Ok(())
    }

    /// One-phone words: the model itself lives in the Z layer (it is a
    /// word-final phone), so all that is needed here is a word-end node per
    /// preceding context z, bridging SA(z,p) to YZ(z,p).
    fn handle_one_phone_pron(&mut self, dense: usize, p: PhoneId) -> Result<()> {
        let pronid = self.next_pron_id()?;
        self.lmla_count += 1;
        let lmla_idx = self.lmla_count;
        self.pron_ids[dense] = pronid;

        let lex_z: Vec<_> = self.lex_z.iter().copied().collect();
        for z in lex_z {
            let sa = self.sa[&(z, p)];
            let yz = self.yz[&(z, p)];
            let we = self.new_node(TKind::WordEnd(dense), Layer::We);
            self.nodes[we].lo_we = pronid;
            self.nodes[we].hi_we = pronid;
            self.nodes[we].lmla_idx = lmla_idx;
            self.add_link(sa, we);
            self.add_link(we, yz);
        }
        Ok(())
    }

    fn next_pron_id(&mut self) -> Result<u16> {
        self.n_pron_ids += 1;
        u16::try_from(self.n_pron_ids).map_err(|_| {
            DecodeError::NetworkTooLarge(format!(
                "more than {} pronunciations in the network",
                u16::MAX
            ))
        })
    }

    /// One model + word-end pair for a boundary word; returns (model, we).
    fn create_boundary(
        &mut self,
        word: &str,
        mod_layer: Layer,
        we_layer: Layer,
    ) -> Result<(usize, usize)> {
        let phone = self.dict.boundary_phone(word)?;
        let hmm = self.hset.find_hmm(self.phones.name(phone))?;
        let dense = self.dict.get(word).unwrap().prons[0].index;

        let mod_node = self.new_node(TKind::Model(hmm), mod_layer);
        let we_node = self.new_node(TKind::WordEnd(dense), we_layer);
        self.add_link(mod_node, we_node);

        let pronid = self.next_pron_id()?;
        self.lmla_count += 1;
        self.nodes[we_node].lo_we = pronid;
        self.nodes[we_node].hi_we = pronid;
        self.nodes[we_node].lmla_idx = self.lmla_count;
        self.pron_ids[dense] = pronid;
        Ok((mod_node, we_node))
    }

    /// Sentence start and end. The start word's word end fans out to every
    /// SA connector matching its phone. The end word sits behind a null SA
    /// connector so that trace-back picks up the right boundary time; every
    /// ZS connector whose right context matches feeds that null node, and
    /// with an sp/sil dictionary dedicated sp and sil models lead there too.
    fn create_start_end(&mut self) -> Result<()> {
        // start: model in layer Z, word end in layer SIL, both in front of SA
        let (start_mod, start_we) = self.create_boundary(
            &self.cfg.start_word.clone(),
            Layer::Z,
            Layer::Sil,
        )?;
        self.start_mod = start_mod;
        let start_phone = self.dict.boundary_phone(&self.cfg.start_word)?;
        let matching: Vec<usize> = self
            .sa
            .iter()
            .filter(|((lc, _), _)| *lc == start_phone)
            .map(|(_, &n)| n)
            .collect();
        for sa in matching {
            self.add_link(start_we, sa);
        }

        // end: model in layer A, word end in layer AB
        let (end_mod, end_we) = self.create_boundary(
            &self.cfg.end_word.clone(),
            Layer::A,
            Layer::Ab,
        )?;
        self.end_we = end_we;
        let end_phone = self.dict.boundary_phone(&self.cfg.end_word)?;

        let time_node = self.new_node(TKind::Con(end_phone, end_phone), Layer::Sa);
        self.end_time = time_node;
        self.add_link(time_node, end_mod);

        let matching: Vec<usize> = self
            .zs
            .iter()
            .filter(|((_, rc), _)| *rc == end_phone)
            .map(|(_, &n)| n)
            .collect();
        for zs in &matching {
            self.add_link(*zs, time_node);
        }

        if self.cfg.sil_dict {
            let se_sp = self.new_node(TKind::Model(self.hmm_sp), Layer::Sil);
            let se_sil = self.new_node(TKind::Model(self.hmm_sil), Layer::Sil);
            self.add_link(se_sp, time_node);
            self.add_link(se_sil, time_node);
            for zs in &matching {
                self.add_link(*zs, se_sp);
                self.add_link(*zs, se_sil);
            }
            self.se_sp = Some(se_sp);
            self.se_sil = Some(se_sil);
        }
        Ok(())
    }

    /// DFS below an AB connector, numbering word ends and recording the
    /// reachable interval in every interior node. Nodes with a unique
    /// successor share look-ahead state with it (index 0); fan-outs give
    /// each branch its own fresh index.
    fn traverse_tree(&mut self, node: usize, start: u16) -> Result<u16> {
        debug_assert_eq!(self.nodes[node].lo_we, 0);

        if let TKind::WordEnd(dense) = self.nodes[node].kind {
            let id = self.next_pron_id()?;
            debug_assert_eq!(id, start);
            self.nodes[node].lo_we = id;
            self.nodes[node].hi_we = id;
            self.pron_ids[dense] = id;
            return Ok(id);
        }

        self.nodes[node].lo_we = start;
        let mut cur_hi = start - 1;
        let links = self.nodes[node].links.clone();
        for link in &links {
            cur_hi = self.traverse_tree(*link, cur_hi + 1)?;
        }
        self.nodes[node].hi_we = cur_hi;

        if links.len() > 1 {
            for link in &links {
                self.lmla_count += 1;
                self.nodes[*link].lmla_idx = self.lmla_count;
            }
        } else {
            // interval identical to ours, no look-ahead update needed
            self.nodes[links[0]].lmla_idx = 0;
        }
        Ok(cur_hi)
    }

    fn assign_we_ids(&mut self) -> Result<()> {
        let roots: Vec<usize> = self.ab.values().copied().collect();
        for root in roots {
            self.lmla_count += 1;
            self.nodes[root].lmla_idx = self.lmla_count;
            let start = self.n_pron_ids as u16 + 1;
            self.traverse_tree(root, start)?;
        }
        info!(
            "assigned {} pronunciation ids, {} look-ahead intervals",
            self.n_pron_ids, self.lmla_count
        );
        Ok(())
    }

    /// Convert the temp graph into the layered arena, filling in the
    /// look-ahead tree (simple entries from the traversal intervals, complex
    /// entries for multi-successor A-layer models) along the way.
    fn convert(mut self) -> Result<LexNet> {
        // A-layer nodes: inherit the unique successor's interval, or become
        // a complex look-ahead node over all successors.
        let n_simple = self.lmla_count as usize + 1;
        let mut comp: Vec<CompLmlaNode> = vec![];
        let a_nodes: Vec<usize> = self.node_a.values().copied().collect();
        for a in a_nodes {
            let links = self.nodes[a].links.clone();
            if links.len() == 1 {
                let child = links[0];
                self.nodes[a].lmla_idx = self.nodes[child].lmla_idx;
                self.nodes[a].lo_we = self.nodes[child].lo_we;
                self.nodes[a].hi_we = self.nodes[child].hi_we;
            } else {
                let children = links.iter().map(|&l| self.nodes[l].lmla_idx).collect();
                self.nodes[a].lmla_idx = (n_simple + comp.len()) as u32;
                comp.push(CompLmlaNode { children });
            }
        }

        // order nodes by layer, preserving creation order within a layer
        let mut layer_count = [0usize; N_LAYERS];
        for node in &self.nodes {
            layer_count[node.layer.index()] += 1;
        }
        let mut layer_start = [0usize; N_LAYERS + 1];
        for l in 0..N_LAYERS {
            layer_start[l + 1] = layer_start[l] + layer_count[l];
        }
        let mut cursor = layer_start;
        let mut order = vec![0u32; self.nodes.len()];
        for (i, node) in self.nodes.iter().enumerate() {
            let l = node.layer.index();
            order[i] = cursor[l] as u32;
            cursor[l] += 1;
        }

        // dense pron index -> info for the pronlist
        let mut dense_info: Vec<Option<(&str, &Pron)>> = vec![None; self.dict.n_prons()];
        for (name, word) in self.dict.iter() {
            for pron in &word.prons {
                dense_info[pron.index] = Some((name, pron));
            }
        }

        let mut la_nodes = vec![LmlaNode::default(); n_simple];
        let mut pronlist: Vec<Option<PronInfo>> = vec![None; self.n_pron_ids as usize + 1];
        let mut nodes: Vec<LexNode> = (0..self.nodes.len())
            .map(|_| LexNode {
                kind: NodeKind::Connector,
                foll: vec![],
                lmla_idx: 0,
            })
            .collect();

        for (i, tnode) in self.nodes.iter().enumerate() {
            let idx = order[i] as usize;
            let kind = match tnode.kind {
                TKind::Model(hmm) => NodeKind::Model(hmm),
                TKind::Con(..) => NodeKind::Connector,
                TKind::WordEnd(dense) => {
                    debug_assert_eq!(tnode.lo_we, tnode.hi_we);
                    let pronid = PronId(tnode.lo_we);
                    if pronlist[pronid.0 as usize].is_none() {
                        let (word, pron) = dense_info[dense].expect("word end without pron");
                        pronlist[pronid.0 as usize] = Some(PronInfo {
                            word: word.to_string(),
                            variant: pron.variant,
                            phones: pron.phones.clone(),
                            prob: pron.prob,
                            sp_prob: pron.sp_prob,
                            sil_prob: pron.sil_prob,
                        });
                    }
                    NodeKind::WordEnd(pronid)
                }
            };
            if (tnode.lmla_idx as usize) < n_simple {
                la_nodes[tnode.lmla_idx as usize] = LmlaNode {
                    lo: tnode.lo_we,
                    hi: tnode.hi_we,
                };
            }
            nodes[idx] = LexNode {
                kind,
                foll: tnode.links.iter().map(|&l| order[l]).collect(),
                lmla_idx: tnode.lmla_idx,
            };
        }

        let start_pron = PronId(
            self.pron_ids[self.dict.get(&self.cfg.start_word).unwrap().prons[0].index],
        );
        let end_pron =
            PronId(self.pron_ids[self.dict.get(&self.cfg.end_word).unwrap().prons[0].index]);

        info!(
            "lexicon network: {} nodes, {} prons, {} simple + {} complex look-ahead nodes",
            nodes.len(),
            self.n_pron_ids,
            n_simple,
            comp.len()
        );

        Ok(LexNet {
            nodes,
            layer_start,
            start: order[self.start_mod],
            end: order[self.end_we],
            end_time_node: order[self.end_time],
            start_pron,
            end_pron,
            pronlist,
            pron_ids: self.pron_ids.iter().map(|&v| PronId(v)).collect(),
            la_tree: LmlaTree {
                nodes: la_nodes,
                comp,
            },
            sil_dict: self.cfg.sil_dict,
            hmm_sp: self.hmm_sp,
            hmm_sil: self.hmm_sil,
            se_sp: self.se_sp.map(|n| order[n]),
            se_sil: self.se_sil.map(|n| order[n]),
        })
    }
}
