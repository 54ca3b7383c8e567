//! Pronunciation dictionary handling. The decoder wants a map from word to
//! one or more phone sequences, optionally with pronunciation probabilities.
//! Two dictionary conventions are supported: a plain dictionary where every
//! pronunciation is written out in full, and the -/sp/sil convention where
//! each pronunciation appears three times, bare and with a trailing short
//! pause or silence model, each variant carrying its own probability. The
//! latter gets collapsed into a single entry per base pronunciation holding
//! all three probabilities so the network builder only ever sees base phone
//! sequences.
use crate::error::{DecodeError, Result};
use crate::logmath::LogFloat;
use crate::phones::{PhoneId, PhoneTable};
use std::collections::{btree_map, BTreeMap};
use std::fs;
use std::io::{self, prelude::*};
use std::path::Path;
use tracing::warn;

/// A single (base) pronunciation of a word.
#[derive(Debug, Clone, PartialEq)]
pub struct Pron {
    /// Dense index over all pronunciations in the dictionary, stable until
    /// the dictionary is restructured by [`Dictionary::convert_sil_dict`].
    pub index: usize,
    /// 1-based variant number within the word, used for lattice output.
    pub variant: u32,
    pub phones: Vec<PhoneId>,
    /// ln probability of the bare pronunciation.
    pub prob: LogFloat,
    /// ln probability of the variant with a trailing short pause. Only
    /// meaningful after sp/sil conversion.
    pub sp_prob: LogFloat,
    /// ln probability of the variant with trailing silence.
    pub sil_prob: LogFloat,
    /// Whether this pronunciation takes part in the next network build.
    pub marked: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Word {
    pub prons: Vec<Pron>,
    pub marked: bool,
}

/// The dictionary itself, backed by a `BTreeMap` so iteration order (and with
/// it pronunciation numbering) is deterministic.
#[derive(Debug, Default, Clone)]
pub struct Dictionary {
    words: BTreeMap<String, Word>,
    n_prons: usize,
    sil_converted: bool,
}

impl Dictionary {
    /// Opens a dictionary from a file.
    pub fn open(path: impl AsRef<Path>, phones: &mut PhoneTable) -> io::Result<Self> {
        let file = fs::File::open(path)?;
        Self::from_reader(io::BufReader::new(file), phones)
    }

    /// Reads `WORD [prob] ph1 ph2 ...` lines. Working from a reader keeps the
    /// parser testable from in-memory strings.
    pub fn from_reader(reader: impl BufRead, phones: &mut PhoneTable) -> io::Result<Self> {
        let mut words: BTreeMap<String, Word> = BTreeMap::new();

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let word = match fields.next() {
                Some(w) => w.to_string(),
                None => continue,
            };
            let mut fields = fields.peekable();
            // a pronunciation probability is a bare number between the word
            // and its phones
            let prob = match fields.peek().and_then(|tok| tok.parse::<f64>().ok()) {
                Some(p) if p > 0.0 => {
                    fields.next();
                    p.ln()
                }
                Some(_) => {
                    warn!("non-positive pronunciation probability for '{}', ignored", word);
                    fields.next();
                    0.0
                }
                None => 0.0,
            };
            let pron_phones: Vec<PhoneId> = fields.map(|p| phones.intern(p)).collect();
            if pron_phones.is_empty() {
                warn!("pronunciation of '{}' is empty, line skipped", word);
                continue;
            }
            let entry = words.entry(word).or_default();
            entry.prons.push(Pron {
                index: 0,
                variant: entry.prons.len() as u32 + 1,
                phones: pron_phones,
                prob,
                sp_prob: 0.0,
                sil_prob: 0.0,
                marked: false,
            });
        }

        let mut dict = Self {
            words,
            n_prons: 0,
            sil_converted: false,
        };
        dict.reindex();
        Ok(dict)
    }

    fn reindex(&mut self) {
        let mut next = 0;
        for word in self.words.values_mut() {
            for (i, pron) in word.prons.iter_mut().enumerate() {
                pron.index = next;
                pron.variant = i as u32 + 1;
                next += 1;
            }
        }
        self.n_prons = next;
    }

    /// Total number of pronunciations.
    pub fn n_prons(&self) -> usize {
        self.n_prons
    }

    /// Number of words.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn get(&self, word: &str) -> Option<&Word> {
        self.words.get(word)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Word> {
        self.words.iter()
    }

    /// Whether [`Self::convert_sil_dict`] has restructured the entries.
    pub fn sil_converted(&self) -> bool {
        self.sil_converted
    }

    /// Include every word and pronunciation in the next network build.
    pub fn mark_all(&mut self) {
        for word in self.words.values_mut() {
            word.marked = true;
            for pron in &mut word.prons {
                pron.marked = true;
            }
        }
    }

    pub fn unmark_all(&mut self) {
        for word in self.words.values_mut() {
            word.marked = false;
            for pron in &mut word.prons {
                pron.marked = false;
            }
        }
    }

    /// Mark exactly the named words (all of their pronunciations), as needed
    /// when constraining the network to the vocabulary of an input lattice.
    /// Unknown words are reported back to the caller.
    pub fn mark_words<'a>(&mut self, names: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        let mut missing = vec![];
        for name in names {
            match self.words.get_mut(name) {
                Some(word) => {
                    word.marked = true;
                    for pron in &mut word.prons {
                        pron.marked = true;
                    }
                }
                None => missing.push(name.to_string()),
            }
        }
        missing
    }

    /// Collapse a -/sp/sil dictionary into one entry per base pronunciation.
    ///
    /// Every word other than the sentence start/end markers must carry its
    /// pronunciations in groups of three: the base form, the base form with a
    /// trailing `sp`, and the base form with a trailing `sil`. The variants
    /// are matched up by comparing phone sequences, not by file order.
    pub fn convert_sil_dict(
        &mut self,
        sp: PhoneId,
        sil: PhoneId,
        start_word: &str,
        end_word: &str,
    ) -> Result<()> {
        for (name, word) in self.words.iter_mut() {
            if name.as_str() == start_word || name.as_str() == end_word || word.prons.is_empty() {
                continue;
            }
            if word.prons.len() % 3 != 0 {
                return Err(DecodeError::DictStructure(format!(
                    "word '{}' does not have -/sp/sil variants",
                    name
                )));
            }

            let mut base = vec![];
            let mut sp_variants = vec![];
            let mut sil_variants = vec![];
            for pron in word.prons.drain(..) {
                match pron.phones.last() {
                    Some(&last) if last == sp => sp_variants.push(pron),
                    Some(&last) if last == sil => sil_variants.push(pron),
                    _ => base.push(pron),
                }
            }

            let mut merged = Vec::with_capacity(base.len());
            for b in base {
                let sp_prob = take_variant(&mut sp_variants, &b.phones).ok_or_else(|| {
                    DecodeError::DictStructure(format!("word '{}' lacks an sp variant", name))
                })?;
                let sil_prob = take_variant(&mut sil_variants, &b.phones).ok_or_else(|| {
                    DecodeError::DictStructure(format!("word '{}' lacks a sil variant", name))
                })?;
                merged.push(Pron {
                    sp_prob,
                    sil_prob,
                    ..b
                });
            }
            if !sp_variants.is_empty() || !sil_variants.is_empty() {
                return Err(DecodeError::DictStructure(format!(
                    "word '{}' has sp/sil variants with no matching base pronunciation",
                    name
                )));
            }
            word.prons = merged;
        }
        self.sil_converted = true;
        self.reindex();
        Ok(())
    }

    /// The start/end words must exist and have exactly one single-phone
    /// pronunciation; returns that phone.
    pub fn boundary_phone(&self, word: &str) -> Result<PhoneId> {
        let entry = self
            .words
            .get(word)
            .ok_or_else(|| DecodeError::ResourceMissing(format!("boundary word '{}'", word)))?;
        if entry.prons.len() != 1 || entry.prons[0].phones.len() != 1 {
            return Err(DecodeError::DictStructure(format!(
                "boundary word '{}' must have exactly one single-phone pronunciation",
                word
            )));
        }
        Ok(entry.prons[0].phones[0])
    }
}

/// Remove and return the probability of the variant matching `base` plus one
/// trailing phone.
fn take_variant(variants: &mut Vec<Pron>, base: &[PhoneId]) -> Option<LogFloat> {
    let pos = variants.iter().position(|v| {
        v.phones.len() == base.len() + 1 && v.phones[..base.len()] == *base
    })?;
    Some(variants.swap_remove(pos).prob)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(text: &str) -> (Dictionary, PhoneTable) {
        let mut phones = PhoneTable::new();
        let dict = Dictionary::from_reader(io::Cursor::new(text), &mut phones).unwrap();
        (dict, phones)
    }

    #[test]
    fn parses_words_probs_and_phones() {
        let (dict, phones) = read("CAT  k ae t\nCAT 0.5 k ae t s\nDOG  d ao g\n");
        assert_eq!(dict.len(), 2);
        assert_eq!(dict.n_prons(), 3);
        let cat = dict.get("CAT").unwrap();
        assert_eq!(cat.prons.len(), 2);
        assert_eq!(cat.prons[0].prob, 0.0);
        assert!((cat.prons[1].prob - 0.5f64.ln()).abs() < 1e-12);
        assert_eq!(cat.prons[1].variant, 2);
        assert_eq!(cat.prons[0].phones[0], phones.lookup("k").unwrap());
    }

    #[test]
    fn sil_conversion_merges_triples() {
        let text = "\
<s>  sil
</s>  sil
CAT 0.6 k ae t
CAT 0.3 k ae t sp
CAT 0.1 k ae t sil
";
        let (mut dict, mut phones) = read(text);
        let sp = phones.intern("sp");
        let sil = phones.intern("sil");
        dict.convert_sil_dict(sp, sil, "<s>", "</s>").unwrap();

        let cat = dict.get("CAT").unwrap();
        assert_eq!(cat.prons.len(), 1);
        let pron = &cat.prons[0];
        assert_eq!(pron.phones.len(), 3);
        assert!((pron.prob - 0.6f64.ln()).abs() < 1e-12);
        assert!((pron.sp_prob - 0.3f64.ln()).abs() < 1e-12);
        assert!((pron.sil_prob - 0.1f64.ln()).abs() < 1e-12);
        assert_eq!(dict.n_prons(), 3); // CAT + both boundary words
    }

    #[test]
    fn sil_conversion_rejects_broken_words() {
        let (mut dict, mut phones) = read("CAT  k ae t\nCAT  k ae t sp\n");
        let sp = phones.intern("sp");
        let sil = phones.intern("sil");
        let err = dict.convert_sil_dict(sp, sil, "<s>", "</s>").unwrap_err();
        assert!(matches!(err, DecodeError::DictStructure(_)));
    }

    #[test]
    fn marking() {
        let (mut dict, _) = read("A  ah\nB  b iy\n");
        dict.mark_all();
        assert!(dict.get("A").unwrap().marked);
        dict.unmark_all();
        let missing = dict.mark_words(["B", "Z"].into_iter());
        assert_eq!(missing, vec!["Z".to_string()]);
        assert!(!dict.get("A").unwrap().marked);
        assert!(dict.get("B").unwrap().marked);
    }

    #[test]
    fn boundary_checks() {
        let (dict, _) = read("<s>  sil\nCAT  k ae t\n");
        assert!(dict.boundary_phone("<s>").is_ok());
        assert!(matches!(
            dict.boundary_phone("CAT"),
            Err(DecodeError::DictStructure(_))
        ));
        assert!(matches!(
            dict.boundary_phone("</s>"),
            Err(DecodeError::ResourceMissing(_))
        ));
    }
}
