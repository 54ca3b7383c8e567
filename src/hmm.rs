//! The HMM inventory. The decoder never evaluates output distributions
//! itself, the acoustic scorer does that, so a model here is just a name, a
//! transition matrix and the scorer state ids of its emitting states. The
//! reader understands a small text dialect in the macro-file tradition, plus
//! an optional logical-to-physical model list so context-dependent names can
//! share physical models.
use crate::error::{DecodeError, Result};
use crate::logmath::{LogFloat, LZERO};
use crate::phones::{PhoneId, PhoneTable};
use ndarray::Array2;
use std::collections::HashMap;
use std::fs;
use std::io::{self, prelude::*};
use std::path::Path;

/// A physical HMM in the set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HmmId(pub u32);

/// Identifier of an output distribution, i.e. a column of the acoustic
/// scorer's per-frame likelihood vector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StateId(pub u32);

#[derive(Debug, Clone)]
pub struct Hmm {
    pub name: String,
    /// Total number of states including the non-emitting entry and exit.
    pub n_states: usize,
    /// ln transition probabilities, `trans[[i, j]]`, floored to `LZERO`.
    pub trans: Array2<LogFloat>,
    /// Scorer state ids for the emitting states `1..n_states-1`.
    pub states: Vec<StateId>,
}

impl Hmm {
    /// ln probability of the entry-to-exit tee transition.
    pub fn tee_prob(&self) -> LogFloat {
        self.trans[[0, self.n_states - 1]]
    }

    pub fn has_tee(&self) -> bool {
        self.tee_prob() > LZERO
    }
}

#[derive(Debug, Default, Clone)]
pub struct HmmSet {
    hmms: Vec<Hmm>,
    index: HashMap<String, HmmId>,
    n_pdfs: usize,
    max_n_states: usize,
}

impl HmmSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a model with the given emitting-state pdf ids and a *linear*
    /// transition matrix (rows = source state).
    pub fn add(&mut self, name: &str, state_pdfs: &[u32], trans: Array2<f64>) -> Result<HmmId> {
        let n = trans.nrows();
        if trans.ncols() != n || n < 3 {
            return Err(DecodeError::Config(format!(
                "model '{}': transition matrix must be square with at least 3 states",
                name
            )));
        }
        if state_pdfs.len() != n - 2 {
            return Err(DecodeError::Config(format!(
                "model '{}': expected {} emitting states, got {}",
                name,
                n - 2,
                state_pdfs.len()
            )));
        }
        if self.index.contains_key(name) {
            return Err(DecodeError::Config(format!("duplicate model '{}'", name)));
        }
        let trans = trans.mapv(|p| if p > 0.0 { p.ln() } else { LZERO });
        let id = HmmId(self.hmms.len() as u32);
        self.n_pdfs = self
            .n_pdfs
            .max(state_pdfs.iter().map(|&s| s as usize + 1).max().unwrap_or(0));
        self.max_n_states = self.max_n_states.max(n);
        self.hmms.push(Hmm {
            name: name.to_string(),
            n_states: n,
            trans,
            states: state_pdfs.iter().map(|&s| StateId(s)).collect(),
        });
        self.index.insert(name.to_string(), id);
        Ok(id)
    }

    /// Map an extra logical name onto an existing physical model.
    pub fn alias(&mut self, logical: &str, physical: &str) -> Result<()> {
        let id = self.find_hmm(physical)?;
        self.index.insert(logical.to_string(), id);
        Ok(())
    }

    pub fn get(&self, id: HmmId) -> &Hmm {
        &self.hmms[id.0 as usize]
    }

    pub fn find_hmm(&self, name: &str) -> Result<HmmId> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| DecodeError::ResourceMissing(format!("model '{}'", name)))
    }

    /// Look up the model for a triphone context. Falls back to the bare
    /// centre phone when no `l-c+r` entry exists, which is how a fully tied
    /// logical list behaves.
    pub fn find_triphone(
        &self,
        phones: &PhoneTable,
        lc: PhoneId,
        c: PhoneId,
        rc: PhoneId,
    ) -> Result<HmmId> {
        let name = format!("{}-{}+{}", phones.name(lc), phones.name(c), phones.name(rc));
        if let Some(&id) = self.index.get(&name) {
            return Ok(id);
        }
        self.index
            .get(phones.name(c))
            .copied()
            .ok_or(DecodeError::ResourceMissing(format!("triphone '{}'", name)))
    }

    /// Number of distinct output distributions referenced by the set.
    pub fn n_pdfs(&self) -> usize {
        self.n_pdfs
    }

    pub fn max_n_states(&self) -> usize {
        self.max_n_states
    }

    pub fn len(&self) -> usize {
        self.hmms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hmms.is_empty()
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = fs::File::open(path)?;
        Self::from_reader(io::BufReader::new(file))
    }

    /// Parse the model definition dialect:
    ///
    /// ```text
    /// ~h "sil"
    /// <NUMSTATES> 5
    /// <STATE> 2 <PDF> 0
    /// <STATE> 3 <PDF> 1
    /// <STATE> 4 <PDF> 2
    /// <TRANSP> 5
    ///  0.0 1.0 0.0 0.0 0.0
    ///  ...
    /// ```
    pub fn from_reader(reader: impl BufRead) -> Result<Self> {
        let mut set = Self::new();
        let mut lines = reader.lines();

        let mut pending: Option<String> = None;
        loop {
            let line = match pending.take() {
                Some(l) => l,
                None => match lines.next() {
                    Some(l) => l?,
                    None => break,
                },
            };
            let line = line.trim().to_string();
            if !line.starts_with("~h") {
                continue;
            }
            let name = unquote(line[2..].trim()).to_string();

            let mut n_states = 0usize;
            let mut pdfs: Vec<u32> = vec![];
            let mut trans: Option<Array2<f64>> = None;
            for raw in lines.by_ref() {
                let raw = raw?;
                let l = raw.trim();
                if l.starts_with("~h") {
                    pending = Some(raw.clone());
                    break;
                } else if let Some(rest) = l.strip_prefix("<NUMSTATES>") {
                    n_states = parse_num(rest, &name)?;
                    pdfs = vec![0; n_states.saturating_sub(2)];
                } else if let Some(rest) = l.strip_prefix("<STATE>") {
                    let mut toks = rest.split_whitespace();
                    let idx: usize = toks
                        .next()
                        .and_then(|t| t.parse().ok())
                        .ok_or_else(|| bad_model(&name, "state index"))?;
                    if n_states < 3 {
                        return Err(bad_model(&name, "<STATE> before <NUMSTATES>"));
                    }
                    match (toks.next(), toks.next()) {
                        (Some("<PDF>"), Some(p)) => {
                            let pdf: u32 =
                                p.parse().map_err(|_| bad_model(&name, "pdf index"))?;
                            if idx < 2 || idx > n_states - 1 {
                                return Err(bad_model(&name, "state index out of range"));
                            }
                            pdfs[idx - 2] = pdf;
                        }
                        _ => return Err(bad_model(&name, "<STATE> without <PDF>")),
                    }
                } else if let Some(rest) = l.strip_prefix("<TRANSP>") {
                    let n: usize = parse_num(rest, &name)?;
                    let mut values = Vec::with_capacity(n * n);
                    while values.len() < n * n {
                        let row = lines
                            .next()
                            .ok_or_else(|| bad_model(&name, "truncated <TRANSP>"))??;
                        for tok in row.split_whitespace() {
                            values.push(
                                tok.parse::<f64>()
                                    .map_err(|_| bad_model(&name, "transition value"))?,
                            );
                        }
                    }
                    trans = Some(
                        Array2::from_shape_vec((n, n), values)
                            .map_err(|_| bad_model(&name, "<TRANSP> shape"))?,
                    );
                    break;
                }
            }

            let trans = trans.ok_or_else(|| bad_model(&name, "missing <TRANSP>"))?;
            if n_states != trans.nrows() {
                return Err(bad_model(&name, "<NUMSTATES> does not match <TRANSP>"));
            }
            set.add(&name, &pdfs, trans)?;
        }
        Ok(set)
    }

    /// Read a model list of `logical [physical]` lines and install the
    /// aliases. A line with a single name just asserts the model exists.
    pub fn read_model_list(&mut self, reader: impl BufRead) -> Result<()> {
        for line in reader.lines() {
            let line = line?;
            let mut toks = line.split_whitespace();
            match (toks.next(), toks.next()) {
                (Some(logical), Some(physical)) => self.alias(logical, physical)?,
                (Some(logical), None) => {
                    self.find_hmm(logical)?;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn unquote(s: &str) -> &str {
    s.trim_matches('"')
}

fn parse_num(s: &str, model: &str) -> Result<usize> {
    s.trim()
        .parse()
        .map_err(|_| bad_model(model, "expected a number"))
}

fn bad_model(name: &str, what: &str) -> DecodeError {
    DecodeError::Config(format!("model '{}': {}", name, what))
}


#[cfg(test)]
mod tests {
    use super::*;

    const SET: &str = r#"
~h "sil"
<NUMSTATES> 5
<STATE> 2 <PDF> 0
<STATE> 3 <PDF> 1
<STATE> 4 <PDF> 2
<TRANSP> 5
 0.0 1.0 0.0 0.0 0.0
 0.0 0.6 0.4 0.0 0.0
 0.0 0.0 0.6 0.4 0.0
 0.0 0.0 0.0 0.6 0.4
 0.0 0.0 0.0 0.0 0.0
~h "sp"
<NUMSTATES> 3
<STATE> 2 <PDF> 1
<TRANSP> 3
 0.0 0.7 0.3
 0.0 0.5 0.5
 0.0 0.0 0.0
"#;

    #[test]
    fn reads_models() {
        let set = HmmSet::from_reader(io::Cursor::new(SET)).unwrap();
        assert_eq!(set.len(), 2);
        let sil = set.get(set.find_hmm("sil").unwrap());
        assert_eq!(sil.n_states, 5);
        assert_eq!(sil.states, vec![StateId(0), StateId(1), StateId(2)]);
        assert!(!sil.has_tee());
        assert!((sil.trans[[1, 2]] - 0.4f64.ln()).abs() < 1e-12);

        let sp = set.get(set.find_hmm("sp").unwrap());
        assert!(sp.has_tee());
        assert!((sp.tee_prob() - 0.3f64.ln()).abs() < 1e-12);
        assert_eq!(set.n_pdfs(), 3);
        assert_eq!(set.max_n_states(), 5);
    }

    #[test]
    fn triphone_lookup_falls_back_to_monophone() {
        let mut set = HmmSet::from_reader(io::Cursor::new(SET)).unwrap();
        set.alias("a-sil+b", "sil").unwrap();

        let mut phones = PhoneTable::new();
        let a = phones.intern("a");
        let sil = phones.intern("sil");
        let b = phones.intern("b");
        let sp = phones.intern("sp");

        // explicit triphone entry wins
        assert_eq!(
            set.find_triphone(&phones, a, sil, b).unwrap(),
            set.find_hmm("sil").unwrap()
        );
        // fallback to the centre monophone
        assert_eq!(
            set.find_triphone(&phones, b, sp, a).unwrap(),
            set.find_hmm("sp").unwrap()
        );
        // nothing to fall back to
        assert!(set.find_triphone(&phones, sil, a, b).is_err());
    }

    #[test]
    fn model_list_aliases() {
        let mut set = HmmSet::from_reader(io::Cursor::new(SET)).unwrap();
        set.read_model_list(io::Cursor::new("x-sil+y sil\nsp\n"))
            .unwrap();
        assert_eq!(set.find_hmm("x-sil+y").unwrap(), set.find_hmm("sil").unwrap());
        assert!(set
            .read_model_list(io::Cursor::new("foo bar\n"))
            .is_err());
    }
}
