//! Back-off n-gram language model.
//!
//! The model is read from an ARPA file (text, or the tagged binary flavour
//! where the n-gram sections carry packed entries). Histories are stored as
//! explicit entries with their successor probabilities in arrays sorted by
//! pronunciation id, which is what makes the interval-max look-ahead cheap:
//! walking an id interval is a linear merge over the per-order successor
//! arrays rather than one full back-off lookup per word.
//!
//! Word identities in the file are mapped onto pronunciation ids of the
//! built network, duplicating probabilities across a word's pronunciations.
//! Words the dictionary does not know are skipped, with one warning per
//! distinct symbol.
use super::{dead_state, LmState};
use crate::error::{DecodeError, Result};
use crate::logmath::{LogFloat, LN10, LZERO};
use crate::net::PronId;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::str;
use tracing::{debug, warn};

/// Maximum supported context: histories of up to `NSIZE - 1` words.
pub const NSIZE: usize = 4;

const BIN_ARPA_HAS_BOWT: u8 = 1;
const BIN_ARPA_INT_LMID: u8 = 2;

type LmWordId = u32;
type Hist = [LmWordId; NSIZE - 1];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SEntry {
    pub word: u16,
    pub prob: LogFloat,
}

#[derive(Debug)]
struct NEntry {
    /// History words, most recent first, zero padded.
    hist: Hist,
    bowt: LogFloat,
    /// Successors sorted by pronunciation id.
    se: Vec<SEntry>,
    /// Entry for the history with the oldest word dropped; only present for
    /// histories of two or more words.
    nebo: Option<u32>,
}

#[derive(Debug)]
pub struct NgramLm {
    nsize: usize,
    entries: Vec<NEntry>,
    index: HashMap<Hist, u32>,
    /// ln unigram probability per pronunciation id.
    unigrams: Vec<LogFloat>,
    /// Pronunciation id -> LM word id.
    pron_to_lmid: Vec<LmWordId>,
    start_pron: PronId,
    end_pron: PronId,
}

const ROOT: u32 = 0;

/// Word -> assigned pronunciation ids, as needed to read an LM against a
/// built network.
pub type PronVocab = BTreeMap<String, Vec<PronId>>;

/// Collect the vocabulary mapping from a dictionary and the network built
/// over it.
pub fn pron_vocab(dict: &crate::dict::Dictionary, net: &crate::net::LexNet) -> PronVocab {
    let mut vocab = PronVocab::new();
    for (name, word) in dict.iter() {
        let ids: Vec<PronId> = word
            .prons
            .iter()
            .map(|p| net.pron_ids[p.index])
            .filter(|id| !id.is_none())
            .collect();
        if !ids.is_empty() {
            vocab.insert(name.clone(), ids);
        }
    }
    vocab
}

/// Byte cursor over an LM file that can switch between text lines and the
/// packed binary entry encoding.
struct LmSource<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> LmSource<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_line(&mut self) -> Option<&'a str> {
        if self.pos >= self.data.len() {
            return None;
        }
        let start = self.pos;
        let end = self.data[start..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|i| start + i)
            .unwrap_or(self.data.len());
        self.pos = (end + 1).min(self.data.len());
        str::from_utf8(&self.data[start..end]).ok().map(|s| s.trim_end_matches('\r'))
    }

    fn read_until(&mut self, line: &str) -> Result<()> {
        while let Some(l) = self.read_line() {
            if l.trim() == line {
                return Ok(());
            }
        }
        Err(DecodeError::LmParse(format!("'{}' section not found", line)))
    }

    fn read_u8(&mut self) -> Result<u8> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| DecodeError::LmParse("unexpected end of binary data".into()))?;
        self.pos += 1;
        Ok(b)
    }

    fn read_f32(&mut self) -> Result<f32> {
        let bytes: [u8; 4] = self
            .data
            .get(self.pos..self.pos + 4)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| DecodeError::LmParse("unexpected end of binary data".into()))?;
        self.pos += 4;
        Ok(f32::from_be_bytes(bytes))
    }

    fn read_u16(&mut self) -> Result<u16> {
        let bytes: [u8; 2] = self
            .data
            .get(self.pos..self.pos + 2)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| DecodeError::LmParse("unexpected end of binary data".into()))?;
        self.pos += 2;
        Ok(u16::from_be_bytes(bytes))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let bytes: [u8; 4] = self
            .data
            .get(self.pos..self.pos + 4)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| DecodeError::LmParse("unexpected end of binary data".into()))?;
        self.pos += 4;
        Ok(u32::from_be_bytes(bytes))
    }
}

/// One parsed n-gram line: ln probability, word ids oldest first, optional
/// back-off weight, and whether any word was unknown.
struct RawEntry {
    prob: LogFloat,
    ids: Vec<LmWordId>,
    bowt: Option<LogFloat>,
    has_unk: bool,
}

impl NgramLm {
    /// Read an ARPA LM, resolving words against `vocab` (word -> assigned
    /// pronunciation ids; see [`pron_vocab`]).
    pub fn read(
        data: &[u8],
        vocab: &PronVocab,
        n_prons: usize,
        start_word: &str,
        end_word: &str,
    ) -> Result<NgramLm> {
        let mut src = LmSource::new(data);
        src.read_until("\\data\\")?;

        let mut counts = [0usize; NSIZE + 1];
        let mut binary = [false; NSIZE + 1];
        let mut order = 0usize;
        loop {
            let save = src.pos;
            let Some(line) = src.read_line() else { break };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some(rest) = line.strip_prefix("ngram ") else {
                src.pos = save;
                break;
            };
            order += 1;
            if order > NSIZE {
                return Err(DecodeError::LmParse(format!(
                    "n-gram order {} above the supported maximum {}",
                    order, NSIZE
                )));
            }
            let (n_str, bin, count_str) = if let Some((n, c)) = rest.split_once('=') {
                (n, false, c)
            } else if let Some((n, c)) = rest.split_once('~') {
                (n, true, c)
            } else {
                return Err(DecodeError::LmParse(format!("bad ngram count line '{}'", line)));
            };
            let n: usize = n_str
                .trim()
                .parse()
                .map_err(|_| DecodeError::LmParse(format!("bad ngram count line '{}'", line)))?;
            if n != order {
                return Err(DecodeError::LmParse("ngram count lines out of order".into()));
            }
            counts[n] = count_str.trim().parse().map_err(|_| {
                DecodeError::LmParse(format!("bad ngram count line '{}'", line))
            })?;
            binary[n] = bin;
        }
        if order == 0 {
            return Err(DecodeError::LmParse("no ngram counts found".into()));
        }
        if binary[1] {
            return Err(DecodeError::LmParse("unigrams must be stored as text".into()));
        }

        let mut lm = NgramLm {
            nsize: order,
            entries: vec![],
            index: HashMap::new(),
            unigrams: vec![LZERO; n_prons + 1],
            pron_to_lmid: vec![0; n_prons + 1],
            start_pron: PronId::NONE,
            end_pron: PronId::NONE,
        };
        let _ = lm.get_entry([0; NSIZE - 1], true);

        let mut lmid_of: HashMap<String, LmWordId> = HashMap::new();
        let mut word_of: Vec<Option<String>> = vec![None]; // lmid 0 unused
        let mut warned: HashSet<String> = HashSet::new();

        for n in 1..=order {
            src.read_until(&format!("\\{}-grams:", n))?;
            lm.read_section(
                &mut src,
                n,
                counts[n],
                binary[n],
                vocab,
                &mut lmid_of,
                &mut word_of,
                &mut warned,
            )?;
        }

        lm.set_back_off_links()?;

        lm.start_pron = single_pron(vocab, start_word)?;
        lm.end_pron = single_pron(vocab, end_word)?;
        debug!(
            "read {}-gram LM: {} histories, {} prons",
            lm.nsize,
            lm.entries.len(),
            n_prons
        );
        Ok(lm)
    }

    fn get_entry(&mut self, hist: Hist, create: bool) -> Option<u32> {
        if let Some(&idx) = self.index.get(&hist) {
            return Some(idx);
        }
        if !create {
            return None;
        }
        let idx = self.entries.len() as u32;
        self.entries.push(NEntry {
            hist,
            bowt: 0.0,
            se: vec![],
            nebo: None,
        });
        self.index.insert(hist, idx);
        Some(idx)
    }

    #[allow(clippy::too_many_arguments)]
    fn read_section(
        &mut self,
        src: &mut LmSource,
        n: usize,
        count: usize,
        binary: bool,
        vocab: &PronVocab,
        lmid_of: &mut HashMap<String, LmWordId>,
        word_of: &mut Vec<Option<String>>,
        warned: &mut HashSet<String>,
    ) -> Result<()> {
        // successor batch for the entry currently being filled
        let mut cur: Option<u32> = None;
        let mut batch: Vec<SEntry> = vec![];

        for i in 1..=count {
            let raw = if binary {
                read_binary_entry(src, n)?
            } else {
                read_text_entry(src, n, vocab, lmid_of, word_of, warned)?
            };

            if n == 1 {
                // record unigram probabilities for each pronunciation
                if !raw.has_unk {
                    let word = word_of[raw.ids[0] as usize]
                        .as_ref()
                        .expect("known unigram with no word");
                    for &pron in &vocab[word] {
                        self.unigrams[pron.0 as usize] = raw.prob;
                        self.pron_to_lmid[pron.0 as usize] = raw.ids[0];
                    }
                }
            }

            if raw.has_unk {
                continue;
            }

            // history = all but the newest word, most recent first
            let mut hist: Hist = [0; NSIZE - 1];
            for (k, &id) in raw.ids[..n - 1].iter().rev().enumerate() {
                hist[k] = id;
            }
            let entry = self.get_entry(hist, false).ok_or_else(|| {
                DecodeError::LmParse(format!(
                    "back-off weight not seen for {}th {}-gram",
                    i, n
                ))
            })?;

            if cur != Some(entry) {
                if let Some(prev) = cur {
                    self.flush_batch(prev, &mut batch)?;
                }
                if !self.entries[entry as usize].se.is_empty() {
                    return Err(DecodeError::LmParse(format!(
                        "{}th {}-gram out of order",
                        i, n
                    )));
                }
                cur = Some(entry);
            }
            let word = word_of[*raw.ids.last().unwrap() as usize]
                .as_ref()
                .expect("known ngram with no word");
            for &pron in &vocab[word] {
                batch.push(SEntry {
                    word: pron.0,
                    prob: raw.prob,
                });
            }

            if let Some(bowt) = raw.bowt {
                if n == NSIZE {
                    return Err(DecodeError::LmParse(format!(
                        "back-off weight on a {}-gram is unsupported",
                        NSIZE
                    )));
                }
                let mut full: Hist = [0; NSIZE - 1];
                for (k, &id) in raw.ids.iter().rev().enumerate() {
                    full[k] = id;
                }
                let idx = self.get_entry(full, true).unwrap();
                self.entries[idx as usize].bowt = bowt;
            }
        }
        if let Some(prev) = cur {
            self.flush_batch(prev, &mut batch)?;
        }
        Ok(())
    }

    fn flush_batch(&mut self, entry: u32, batch: &mut Vec<SEntry>) -> Result<()> {
        batch.sort_by_key(|se| se.word);
        self.entries[entry as usize].se = std::mem::take(batch);
        Ok(())
    }

    /// Precompute, for every history of two or more words, the entry with
    /// the oldest word dropped.
    fn set_back_off_links(&mut self) -> Result<()> {
        let links: Vec<Option<u32>> = self
            .entries
            .iter()
            .map(|e| {
                let hi_idx = (0..NSIZE - 1).rev().find(|&k| e.hist[k] != 0);
                match hi_idx {
                    None | Some(0) => Ok(None),
                    Some(k) => {
                        let mut hist = e.hist;
                        hist[k] = 0;
                        self.index
                            .get(&hist)
                            .copied()
                            .map(Some)
                            .ok_or_else(|| {
                                DecodeError::LmParse(
                                    "missing back-off history entry".into(),
                                )
                            })
                    }
                }
            })
            .collect::<Result<_>>()?;
        for (e, l) in self.entries.iter_mut().zip(links) {
            e.nebo = l;
        }
        Ok(())
    }

    pub fn order(&self) -> usize {
        self.nsize
    }

    pub fn start_pron(&self) -> PronId {
        self.start_pron
    }

    pub fn end_pron(&self) -> PronId {
        self.end_pron
    }

    /// ln p(pron | src) with back-off, and the successor state.
    pub fn transition(&self, src: LmState, pron: PronId) -> (LogFloat, LmState) {
        let p = pron.0;
        if p == 0 || p as usize >= self.unigrams.len() {
            debug_assert!(false, "pron {} not in LM wordlist", p);
            return dead_state();
        }

        // from the initial state only the start word may leave
        if src == LmState::Initial {
            debug_assert_eq!(pron, self.start_pron);
            let hist = [self.pron_to_lmid[p as usize], 0, 0];
            let dest = self.get_index(hist).unwrap_or(ROOT);
            return (0.0, LmState::Hist(dest));
        }
        let LmState::Hist(src_idx) = src else {
            debug_assert!(false, "transition out of the sentence-end state");
            return dead_state();
        };

        let prob = if src_idx == ROOT {
            self.unigrams[p as usize]
        } else {
            let mut ne = &self.entries[src_idx as usize];
            match find_sentry(&ne.se, p) {
                Some(se) => se.prob,
                None => {
                    // back off order by order, accumulating weights
                    let mut prob = 0.0;
                    let mut hist = ne.hist;
                    let mut l = (0..NSIZE - 1).rev().find(|&k| hist[k] != 0).unwrap_or(0);
                    let mut found = None;
                    while l > 0 {
                        prob += ne.bowt;
                        hist[l] = 0;
                        l -= 1;
                        let idx = self.get_index(hist).unwrap_or(ROOT);
                        ne = &self.entries[idx as usize];
                        if let Some(se) = find_sentry(&ne.se, p) {
                            found = Some(prob + se.prob);
                            break;
                        }
                    }
                    match found {
                        Some(v) => v,
                        // backed off all the way to the unigram
                        None => prob + ne.bowt + self.unigrams[p as usize],
                    }
                }
            }
        };

        if pron == self.end_pron {
            return (prob, LmState::SentEnd);
        }

        // successor history: prepend the new word, truncate to what exists
        let mut hist: Hist = [0; NSIZE - 1];
        hist[0] = self.pron_to_lmid[p as usize];
        if src_idx != ROOT {
            let ne = &self.entries[src_idx as usize];
            hist[1] = ne.hist[0];
            hist[2] = ne.hist[1];
        }
        let mut l = (0..NSIZE - 1).rev().find(|&k| hist[k] != 0).unwrap_or(0);
        let dest = loop {
            if let Some(idx) = self.get_index(hist) {
                break idx;
            }
            if l == 0 {
                break ROOT;
            }
            hist[l] = 0;
            l -= 1;
        };
        (prob, LmState::Hist(dest))
    }

    fn get_index(&self, hist: Hist) -> Option<u32> {
        self.index.get(&hist).copied()
    }

    /// max over `lo..=hi` of ln p(pron | src).
    pub fn lookahead(&self, src: LmState, lo: PronId, hi: PronId) -> LogFloat {
        match src {
            LmState::Initial => {
                if (lo.0..=hi.0).contains(&self.start_pron.0) {
                    0.0
                } else {
                    LZERO
                }
            }
            LmState::SentEnd => LZERO,
            LmState::Hist(_) => match self.nsize {
                2 => self.lookahead_2gram(src, lo.0, hi.0),
                3 => self.lookahead_3gram(src, lo.0, hi.0),
                _ => self.lookahead_ngram(src, lo.0, hi.0),
            },
        }
    }

    fn unigram_max(&self, lo: u16, hi: u16) -> LogFloat {
        let mut max = LZERO;
        for p in lo..=hi {
            if self.unigrams[p as usize] > max {
                max = self.unigrams[p as usize];
            }
        }
        max
    }

    /// Bigram look-ahead: one merge of the history's successors against the
    /// unigram array.
    fn lookahead_2gram(&self, src: LmState, lo: u16, hi: u16) -> LogFloat {
        let LmState::Hist(idx) = src else { return LZERO };
        let mut max = LZERO;
        let mut ug_max = LZERO;
        let mut bowt = 0.0;
        let mut p = lo;

        if idx != ROOT {
            let ne = &self.entries[idx as usize];
            bowt = ne.bowt;
            if let Some(mut i) = find_min_sentry(&ne.se, lo) {
                let last = ne.se.last().unwrap().word;
                let pend = hi.min(last);
                while p <= pend {
                    if ne.se[i].word != p {
                        ug_max = ug_max.max(self.unigrams[p as usize]);
                    } else {
                        max = max.max(ne.se[i].prob);
                        i += 1;
                    }
                    p += 1;
                }
            }
        }
        if p <= hi {
            ug_max = ug_max.max(self.unigram_max(p, hi));
        }
        if ug_max > LZERO {
            max = max.max(ug_max + bowt);
        }
        max
    }

    /// Trigram look-ahead: lockstep merge of the trigram and bigram
    /// successor arrays, with the inner loops of the bigram case inlined for
    /// the tail.
    fn lookahead_3gram(&self, src: LmState, lo: u16, hi: u16) -> LogFloat {
        let LmState::Hist(idx) = src else { return LZERO };
        if idx == ROOT {
            return self.unigram_max(lo, hi);
        }
        let ne_tg = &self.entries[idx as usize];
        if ne_tg.hist[1] == 0 {
            // one-word history: this is really a bigram state
            return self.lookahead_2gram(src, lo, hi);
        }

        let mut max = LZERO;
        let mut bg_max = LZERO;
        let mut ug_max = LZERO;
        let mut p = lo;

        let bowt_bg = ne_tg.bowt;
        let ne_bg = &self.entries[ne_tg.nebo.expect("trigram history without back-off") as usize];
        let bowt_ug = bowt_bg + ne_bg.bowt;

        let mut se_tg = find_min_sentry(&ne_tg.se, lo);
        let mut se_bg = find_min_sentry(&ne_bg.se, lo);

        if let Some(mut ti) = se_tg.take() {
            let pend = hi.min(ne_tg.se.last().unwrap().word);
            while p <= pend {
                if ne_tg.se[ti].word != p {
                    match se_bg {
                        None => ug_max = ug_max.max(self.unigrams[p as usize]),
                        Some(bi) => {
                            if ne_bg.se[bi].word != p {
                                ug_max = ug_max.max(self.unigrams[p as usize]);
                            } else {
                                bg_max = bg_max.max(ne_bg.se[bi].prob);
                                se_bg = advance(&ne_bg.se, bi);
                            }
                        }
                    }
                } else {
                    max = max.max(ne_tg.se[ti].prob);
                    ti += 1;
                    if let Some(bi) = se_bg {
                        se_bg = advance(&ne_bg.se, bi);
                    }
                    if ti >= ne_tg.se.len() {
                        p += 1;
                        break;
                    }
                }
                p += 1;
            }
        }
        // tail: at best a bigram hit from here on
        if let Some(mut bi) = se_bg.take() {
            let pend = hi.min(ne_bg.se.last().unwrap().word);
            while p <= pend {
                if ne_bg.se[bi].word != p {
                    ug_max = ug_max.max(self.unigrams[p as usize]);
                } else {
                    bg_max = bg_max.max(ne_bg.se[bi].prob);
                    bi += 1;
                    if bi >= ne_bg.se.len() {
                        p += 1;
                        break;
                    }
                }
                p += 1;
            }
        }
        if p <= hi {
            ug_max = ug_max.max(self.unigram_max(p, hi));
        }
        if bg_max > LZERO {
            max = max.max(bg_max + bowt_bg);
        }
        if ug_max > LZERO {
            max = max.max(ug_max + bowt_ug);
        }
        max
    }

    /// General case: lockstep over every back-off level of the history.
    fn lookahead_ngram(&self, src: LmState, lo: u16, hi: u16) -> LogFloat {
        let LmState::Hist(idx) = src else { return LZERO };
        if idx == ROOT {
            return self.unigram_max(lo, hi);
        }

        let src_ne = &self.entries[idx as usize];
        let hi_idx = match (0..NSIZE - 1).rev().find(|&k| src_ne.hist[k] != 0) {
            Some(k) => k,
            None => return self.unigram_max(lo, hi),
        };

        // ne[l] is the entry for the history truncated to l+1 words and
        // bowt[l] the total back-off weight paid to reach it
        let mut ne: Vec<&NEntry> = vec![src_ne; hi_idx + 1];
        let mut bowt = vec![0.0; hi_idx + 1];
        let mut hist = src_ne.hist;
        for l in (0..hi_idx).rev() {
            hist[l + 1] = 0;
            let e = self
                .get_index(hist)
                .expect("back-off history entry missing");
            ne[l] = &self.entries[e as usize];
            bowt[l] = bowt[l + 1] + ne[l + 1].bowt;
        }

        let mut se: Vec<Option<usize>> = ne
            .iter()
            .map(|e| find_min_sentry(&e.se, lo))
            .collect();

        let mut max = LZERO;
        for p in lo..=hi {
            let mut hit = false;
            for l in (0..=hi_idx).rev() {
                let Some(i) = se[l] else { continue };
                if ne[l].se[i].word != p {
                    continue;
                }
                let prob = ne[l].se[i].prob + bowt[l];
                max = max.max(prob);
                se[l] = advance(&ne[l].se, i);
                // drag the lower-order cursors past p
                for ll in (0..l).rev() {
                    while let Some(j) = se[ll] {
                        if ne[ll].se[j].word <= p {
                            se[ll] = advance(&ne[ll].se, j);
                        } else {
                            break;
                        }
                    }
                }
                hit = true;
                break;
            }
            if !hit {
                let prob = self.unigrams[p as usize] + bowt[0] + ne[0].bowt;
                max = max.max(prob);
            }
        }
        max
    }

    /// Back off trigram-or-longer histories one order for cheap look-ahead.
    pub fn fast_la_state(&self, src: LmState) -> LmState {
        match src {
            LmState::Hist(idx) if idx != ROOT => {
                let ne = &self.entries[idx as usize];
                if ne.hist[1] == 0 {
                    src
                } else {
                    LmState::Hist(ne.nebo.expect("long history without back-off link"))
                }
            }
            _ => src,
        }
    }
}

fn single_pron(vocab: &PronVocab, word: &str) -> Result<PronId> {
    vocab
        .get(word)
        .and_then(|prons| prons.first().copied())
        .ok_or_else(|| DecodeError::ResourceMissing(format!("word '{}' in LM vocabulary", word)))
}

fn find_sentry(se: &[SEntry], pron: u16) -> Option<&SEntry> {
    se.binary_search_by_key(&pron, |e| e.word)
        .ok()
        .map(|i| &se[i])
}

/// Index of the first successor entry with `word >= min`.
fn find_min_sentry(se: &[SEntry], min: u16) -> Option<usize> {
    if se.is_empty() || min > se.last().unwrap().word {
        return None;
    }
    Some(se.partition_point(|e| e.word < min))
}

fn advance(se: &[SEntry], i: usize) -> Option<usize> {
    if i + 1 < se.len() {
        Some(i + 1)
    } else {
        None
    }
}

fn read_text_entry(
    src: &mut LmSource,
    n: usize,
    vocab: &PronVocab,
    lmid_of: &mut HashMap<String, LmWordId>,
    word_of: &mut Vec<Option<String>>,
    warned: &mut HashSet<String>,
) -> Result<RawEntry> {
    let line = loop {
        let line = src
            .read_line()
            .ok_or_else(|| DecodeError::LmParse("unexpected end of n-gram section".into()))?;
        if !line.trim().is_empty() {
            break line;
        }
    };
    let mut toks = line.split_whitespace();
    let prob: f64 = toks
        .next()
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| DecodeError::LmParse(format!("bad n-gram line '{}'", line)))?;
    let mut ids = Vec::with_capacity(n);
    let mut has_unk = false;
    for _ in 0..n {
        let word = toks
            .next()
            .ok_or_else(|| DecodeError::LmParse(format!("bad n-gram line '{}'", line)))?;
        let id = if n == 1 {
            // ids are assigned by position in the unigram section
            let id = word_of.len() as LmWordId;
            if vocab.contains_key(word) {
                if lmid_of.contains_key(word) {
                    return Err(DecodeError::LmParse(format!(
                        "duplicate word '{}' in unigram list",
                        word
                    )));
                }
                lmid_of.insert(word.to_string(), id);
                word_of.push(Some(word.to_string()));
                id
            } else {
                word_of.push(None);
                warn_unknown(warned, word);
                0
            }
        } else {
            match lmid_of.get(word) {
                Some(&id) => id,
                None => {
                    warn_unknown(warned, word);
                    0
                }
            }
        };
        if id == 0 {
            has_unk = true;
        }
        ids.push(id);
    }
    let bowt = toks.next().map(|t| {
        t.parse::<f64>()
            .map_err(|_| DecodeError::LmParse(format!("bad back-off weight in '{}'", line)))
    });
    let bowt = match bowt {
        Some(r) => Some(r? * LN10),
        None => None,
    };
    Ok(RawEntry {
        prob: prob * LN10,
        ids,
        bowt,
        has_unk,
    })
}

fn read_binary_entry(src: &mut LmSource, n: usize) -> Result<RawEntry> {
    src.read_u8()?; // marker
    let flags = src.read_u8()?;
    let prob = src.read_f32()? as f64 * LN10;
    let mut ids = vec![0; n];
    for i in 0..n {
        // stored oldest first
        let id = if flags & BIN_ARPA_INT_LMID != 0 {
            src.read_u32()?
        } else {
            src.read_u16()? as u32
        };
        ids[i] = id;
    }
    let has_unk = ids.iter().any(|&id| id == 0);
    let bowt = if flags & BIN_ARPA_HAS_BOWT != 0 {
        Some(src.read_f32()? as f64 * LN10)
    } else {
        None
    };
    Ok(RawEntry {
        prob,
        ids,
        bowt,
        has_unk,
    })
}

fn warn_unknown(warned: &mut HashSet<String>, word: &str) {
    if word != "!!UNK" && word != "<unk>" && warned.insert(word.to_string()) {
        warn!("word '{}' in LM is not in the dictionary, skipped", word);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab() -> PronVocab {
        // PronIds as a network build over {<s>, </s>, A, B, C} would assign
        let mut v = PronVocab::new();
        v.insert("<s>".into(), vec![PronId(1)]);
        v.insert("</s>".into(), vec![PronId(2)]);
        v.insert("A".into(), vec![PronId(3)]);
        v.insert("B".into(), vec![PronId(4)]);
        v.insert("C".into(), vec![PronId(5)]);
        v
    }

    const TRIGRAM: &str = "\
some header junk

\\data\\
ngram 1=6
ngram 2=4
ngram 3=2

\\1-grams:
-1.00 <s> -0.40
-1.10 </s>
-0.70 A -0.30
-0.90 B -0.20
-1.20 C -0.10
-2.00 ZONK

\\2-grams:
-0.30 <s> A -0.10
-0.50 A B -0.20
-0.60 A C
-0.80 B </s>

\\3-grams:
-0.20 <s> A B
-0.40 A B </s>

\\end\\
";

    fn lm() -> NgramLm {
        NgramLm::read(TRIGRAM.as_bytes(), &vocab(), 5, "<s>", "</s>").unwrap()
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn reads_counts_and_assigns_prons() {
        let lm = lm();
        assert_eq!(lm.order(), 3);
        assert_eq!(lm.start_pron(), PronId(1));
        assert_eq!(lm.end_pron(), PronId(2));
        assert!(close(lm.unigrams[3], -0.70 * LN10));
        // ZONK is not in the dictionary and must not crash anything
        assert!(close(lm.unigrams[5], -1.20 * LN10));
    }

    #[test]
    fn transition_uses_highest_order_and_backs_off() {
        let lm = lm();
        let (p0, s0) = lm.transition(LmState::Initial, PronId(1));
        assert!(close(p0, 0.0));

        // <s> A: bigram hit
        let (p1, s1) = lm.transition(s0, PronId(3));
        assert!(close(p1, -0.30 * LN10));

        // <s> A B: trigram hit
        let (p2, s2) = lm.transition(s1, PronId(4));
        assert!(close(p2, -0.20 * LN10));

        // A B C: no trigram, no bigram "B C": bowt(A B) + bowt(B) + ug(C)
        let (p3, _) = lm.transition(s2, PronId(5));
        assert!(close(p3, (-0.20 + -0.20 + -1.20) * LN10));

        // A B </s>: trigram hit, dest is the sentence end
        let (p4, s4) = lm.transition(s2, PronId(2));
        assert!(close(p4, -0.40 * LN10));
        assert_eq!(s4, LmState::SentEnd);
    }

    #[test]
    fn transition_backoff_through_one_level() {
        let lm = lm();
        let (_, s0) = lm.transition(LmState::Initial, PronId(1));
        let (_, s1) = lm.transition(s0, PronId(3)); // hist = A <s>
        // A C exists as a bigram but "<s> A C" is no trigram:
        // bowt(<s> A) + p(C | A)
        let (p, _) = lm.transition(s1, PronId(5));
        assert!(close(p, (-0.10 + -0.60) * LN10));
    }

    #[test]
    fn lookahead_bounds_transitions() {
        let lm = lm();
        let (_, s0) = lm.transition(LmState::Initial, PronId(1));
        let (_, s1) = lm.transition(s0, PronId(3));
        let (_, s2) = lm.transition(s1, PronId(4));
        for src in [s0, s1, s2, LmState::Hist(ROOT)] {
            for lo in 1..=5u16 {
                for hi in lo..=5u16 {
                    let la = lm.lookahead(src, PronId(lo), PronId(hi));
                    let mut max = LZERO;
                    for p in lo..=hi {
                        let (prob, _) = lm.transition(src, PronId(p));
                        max = max.max(prob);
                    }
                    assert!(
                        la >= max - 1e-9,
                        "lookahead below max for {:?} [{},{}]: {} < {}",
                        src,
                        lo,
                        hi,
                        la,
                        max
                    );
                    // for the n-gram model the bound is exact
                    assert!(
                        close(la, max),
                        "lookahead not tight for {:?} [{},{}]: {} vs {}",
                        src,
                        lo,
                        hi,
                        la,
                        max
                    );
                }
            }
        }
    }

    #[test]
    fn specialised_lookaheads_agree_with_general() {
        let lm = lm();
        let (_, s0) = lm.transition(LmState::Initial, PronId(1));
        let (_, s1) = lm.transition(s0, PronId(3));
        let (_, s2) = lm.transition(s1, PronId(4));
        for src in [s0, s1, s2] {
            for lo in 1..=5u16 {
                for hi in lo..=5u16 {
                    let general = lm.lookahead_ngram(src, lo, hi);
                    let special = lm.lookahead_3gram(src, lo, hi);
                    assert!(close(general, special), "{:?} [{},{}]", src, lo, hi);
                }
            }
        }
    }

    #[test]
    fn fast_la_state_backs_off_to_bigram() {
        let lm = lm();
        let (_, s0) = lm.transition(LmState::Initial, PronId(1));
        let (_, s1) = lm.transition(s0, PronId(3)); // two-word history A <s>
        let fast = lm.fast_la_state(s1);
        assert_ne!(fast, s1);
        // the backed-off state is the one-word history "A"
        assert_eq!(lm.fast_la_state(fast), fast);
        assert_eq!(lm.fast_la_state(s0), s0);
    }

    #[test]
    fn binary_sections_roundtrip() {
        // same LM with the bigram section in the packed binary encoding
        let mut data = Vec::new();
        data.extend_from_slice(
            b"\\data\\\nngram 1=6\nngram 2~4\n\n\\1-grams:\n-1.00 <s> -0.40\n-1.10 </s>\n-0.70 A -0.30\n-0.90 B -0.20\n-1.20 C -0.10\n-2.00 ZONK\n\n\\2-grams:\n",
        );
        let bigrams: [(f32, u16, u16, Option<f32>); 4] = [
            (-0.30, 1, 3, Some(-0.10)),
            (-0.50, 3, 4, Some(-0.20)),
            (-0.60, 3, 5, None),
            (-0.80, 4, 2, None),
        ];
        for (prob, h, w, bowt) in bigrams {
            data.push(0x00);
            data.push(if bowt.is_some() { BIN_ARPA_HAS_BOWT } else { 0 });
            data.extend_from_slice(&prob.to_be_bytes());
            data.extend_from_slice(&h.to_be_bytes());
            data.extend_from_slice(&w.to_be_bytes());
            if let Some(b) = bowt {
                data.extend_from_slice(&b.to_be_bytes());
            }
        }
        data.extend_from_slice(b"\n\\end\\\n");

        let bin = NgramLm::read(&data, &vocab(), 5, "<s>", "</s>").unwrap();
        let text = NgramLm::read(
            TRIGRAM
                .replace("ngram 3=2\n", "")
                .replace("\\3-grams:\n-0.20 <s> A B\n-0.40 A B </s>\n", "")
                .as_bytes(),
            &vocab(),
            5,
            "<s>",
            "</s>",
        )
        .unwrap();
        let (_, s0) = bin.transition(LmState::Initial, PronId(1));
        for p in 2..=5u16 {
            let (a, _) = bin.transition(s0, PronId(p));
            let (b, _) = text.transition(s0, PronId(p));
            assert!(close(a, b), "pron {}: {} vs {}", p, a, b);
        }
    }

    #[test]
    fn rejects_binary_unigrams_and_missing_sections() {
        let bad = "\\data\\\nngram 1~5\n\\1-grams:\n";
        assert!(matches!(
            NgramLm::read(bad.as_bytes(), &vocab(), 5, "<s>", "</s>"),
            Err(DecodeError::LmParse(_))
        ));
        let empty = "no data section at all\n";
        assert!(matches!(
            NgramLm::read(empty.as_bytes(), &vocab(), 5, "<s>", "</s>"),
            Err(DecodeError::LmParse(_))
        ));
    }
}
