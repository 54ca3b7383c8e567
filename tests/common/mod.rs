//! Shared fixtures for the decoder integration tests: a tiny phone set, a
//! one-emitting-state model inventory, small dictionaries and LMs, and an
//! independent brute-force search used to check Viterbi optimality.
#![allow(dead_code)]
use lv_decoder::dict::Dictionary;
use lv_decoder::hmm::{HmmId, HmmSet};
use lv_decoder::lattice::Lattice;
use lv_decoder::lm::ngram::pron_vocab;
use lv_decoder::lm::{LangModel, LmState, NgramLm};
use lv_decoder::logmath::{LogFloat, LZERO};
use lv_decoder::net::{build_lex_net, LexNet, NetConfig};
use lv_decoder::outp::MatrixScorer;
use lv_decoder::phones::PhoneTable;
use lv_decoder::search::stats::Stats;
use lv_decoder::search::{Decoder, DecoderOpts};
use lv_decoder::traceback::{self, Transcription};
use ndarray::Array2;
use std::io::Cursor;

pub struct Fixture {
    pub phones: PhoneTable,
    pub dict: Dictionary,
    pub hset: HmmSet,
    pub net: LexNet,
    pub lm: LangModel,
}

/// A plain model with one emitting state: enter 1.0, self-loop 0.5, exit 0.5.
pub fn add_model(set: &mut HmmSet, name: &str, pdf: u32) -> HmmId {
    let trans = ndarray::array![[0.0, 1.0, 0.0], [0.0, 0.5, 0.5], [0.0, 0.0, 0.0]];
    set.add(name, &[pdf], trans).unwrap()
}

/// A short-pause model with a tee transition: enter 0.7, skip 0.3.
pub fn add_sp_model(set: &mut HmmSet, name: &str, pdf: u32, tee: f64) -> HmmId {
    let trans = ndarray::array![
        [0.0, 1.0 - tee, tee],
        [0.0, 0.5, 0.5],
        [0.0, 0.0, 0.0]
    ];
    set.add(name, &[pdf], trans).unwrap()
}

pub const SP_TEE: f64 = 0.3;

/// pdf assignment used throughout: sil=0, k=1, d=2, sp=3.
pub const PDF_SIL: usize = 0;
pub const PDF_K: usize = 1;
pub const PDF_D: usize = 2;
pub const PDF_SP: usize = 3;

const ONE_PHONE_DICT: &str = "\
</s>  sil
<s>  sil
CAT  k
DOG  d
";

const ONE_PHONE_LM: &str = "\
\\data\\
ngram 1=4
ngram 2=5

\\1-grams:
-1.00 <s> -0.30
-1.00 </s>
-0.60 CAT -0.20
-0.80 DOG -0.20

\\2-grams:
-0.30 <s> CAT
-0.70 <s> DOG
-0.50 CAT </s>
-0.40 CAT DOG
-0.45 DOG </s>

\\end\\
";

pub fn build(dict_text: &str, lm_text: &str, model_names: &[&str]) -> Fixture {
    let mut phones = PhoneTable::new();
    let mut dict = Dictionary::from_reader(Cursor::new(dict_text), &mut phones).unwrap();
    let mut hset = HmmSet::new();
    for (pdf, name) in model_names.iter().enumerate() {
        add_model(&mut hset, name, pdf as u32);
    }
    add_sp_model(&mut hset, "sp", model_names.len() as u32, SP_TEE);
    dict.mark_all();
    let net = build_lex_net(&dict, &hset, &phones, &NetConfig::default()).unwrap();
    let vocab = pron_vocab(&dict, &net);
    let lm = LangModel::Ngram(
        NgramLm::read(lm_text.as_bytes(), &vocab, net.n_prons(), "<s>", "</s>").unwrap(),
    );
    Fixture {
        phones,
        dict,
        hset,
        net,
        lm,
    }
}

/// The standard fixture: one-phone words CAT and DOG around silences.
pub fn one_phone_fixture() -> Fixture {
    build(ONE_PHONE_DICT, ONE_PHONE_LM, &["sil", "k", "d"])
}

pub struct DecodeOut {
    pub trans: Option<Transcription>,
    pub lat: Option<Lattice>,
    pub starved: bool,
    pub stats: Stats,
}

pub fn decode(fix: &Fixture, llh: &Array2<f64>, opts: DecoderOpts) -> DecodeOut {
    let scorer = MatrixScorer::new(llh.clone());
    let mut dec = Decoder::new(&fix.net, &fix.hset, &fix.lm, opts);
    for _ in 0..llh.nrows() {
        dec.process_frame(&scorer);
    }
    DecodeOut {
        trans: traceback::trace_back(&dec),
        lat: traceback::lat_trace_back(&dec, None, 0.01),
        starved: dec.starved(),
        stats: dec.stats.clone(),
    }
}

pub fn wide_open(n_tok: usize) -> DecoderOpts {
    DecoderOpts {
        n_tok,
        ..DecoderOpts::default()
    }
}

/// Likelihood matrix with one sharply favoured pdf per frame.
pub fn peaked_llh(favoured: &[usize], n_pdfs: usize) -> Array2<f64> {
    let mut llh = Array2::from_elem((favoured.len(), n_pdfs), -10.0);
    for (t, &p) in favoured.iter().enumerate() {
        llh[[t, p]] = 0.0;
    }
    llh
}

/// Deterministic mildly varied likelihoods for optimality sweeps.
pub fn synthetic_llh(n_frames: usize, n_pdfs: usize) -> Array2<f64> {
    Array2::from_shape_fn((n_frames, n_pdfs), |(t, p)| {
        -(((t * 31 + p * 17) % 7) as f64) * 0.35
    })
}

/// One model in a brute-force chain.
#[derive(Clone, Copy, Debug)]
pub struct ChainModel {
    pub pdf: usize,
    pub enter: LogFloat,
    pub loop_: LogFloat,
    pub exit: LogFloat,
    /// ln probability of skipping the model entirely; LZERO if impossible.
    pub tee: LogFloat,
}

pub fn chain_plain(pdf: usize) -> ChainModel {
    ChainModel {
        pdf,
        enter: 0.0,
        loop_: 0.5f64.ln(),
        exit: 0.5f64.ln(),
        tee: LZERO,
    }
}

pub fn chain_sp() -> ChainModel {
    ChainModel {
        pdf: PDF_SP,
        enter: (1.0 - SP_TEE).ln(),
        loop_: 0.5f64.ln(),
        exit: 0.5f64.ln(),
        tee: SP_TEE.ln(),
    }
}

/// Exact best alignment score of a linear model chain over all frames:
/// dynamic programming over (frame, chain position) with tee skips.
pub fn chain_score(chain: &[ChainModel], llh: &Array2<f64>) -> LogFloat {
    let t_max = llh.nrows();
    let n = chain.len();
    let neg = f64::NEG_INFINITY;

    // cost of skipping models j..i (exclusive of endpoints' own costs)
    let skip = |from: usize, to: usize| -> LogFloat {
        chain[from..to].iter().map(|m| m.tee).sum()
    };

    let mut dp = vec![neg; n];
    for (i, m) in chain.iter().enumerate() {
        let skipped = skip(0, i);
        if skipped > LZERO {
            dp[i] = llh[[0, m.pdf]] + m.enter + skipped;
        }
    }
    for t in 1..t_max {
        let mut next = vec![neg; n];
        for (i, m) in chain.iter().enumerate() {
            let mut best = dp[i] + m.loop_;
            for j in 0..i {
                let skipped = skip(j + 1, i);
                if skipped <= LZERO {
                    continue;
                }
                best = best.max(dp[j] + chain[j].exit + m.enter + skipped);
            }
            next[i] = if best.is_finite() {
                best + llh[[t, m.pdf]]
            } else {
                neg
            };
        }
        dp = next;
    }
    dp[n - 1] + chain[n - 1].exit
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Sep {
    /// Optional short pause (tee makes it skippable).
    Sp,
    /// Full silence.
    Sil,
}

/// Brute-force best total score over all word sequences up to `max_words`:
/// every sequence, every inter-word separator choice, exact alignment DP,
/// plus the LM and insertion penalties the decoder applies.
pub fn brute_force_best(
    fix: &Fixture,
    llh: &Array2<f64>,
    word_pdfs: &[(&str, usize)],
    max_words: usize,
    lm_scale: f64,
    ins_pen: f64,
) -> LogFloat {
    let mut best = f64::NEG_INFINITY;
    let n_words = word_pdfs.len();

    // iterate sequences as base-n numbers
    for len in 1..=max_words {
        let mut seq = vec![0usize; len];
        loop {
            for sep_mask in 0..(1u32 << (len - 1)) {
                let seps: Vec<Sep> = (0..len - 1)
                    .map(|g| {
                        if sep_mask & (1 << g) != 0 {
                            Sep::Sil
                        } else {
                            Sep::Sp
                        }
                    })
                    .collect();
                let score = sequence_score(fix, llh, word_pdfs, &seq, &seps, lm_scale, ins_pen);
                best = best.max(score);
            }
            // next sequence
            let mut i = 0;
            loop {
                if i == len {
                    break;
                }
                seq[i] += 1;
                if seq[i] < n_words {
                    break;
                }
                seq[i] = 0;
                i += 1;
            }
            if i == len {
                break;
            }
        }
    }
    best
}

fn sequence_score(
    fix: &Fixture,
    llh: &Array2<f64>,
    word_pdfs: &[(&str, usize)],
    seq: &[usize],
    seps: &[Sep],
    lm_scale: f64,
    ins_pen: f64,
) -> LogFloat {
    // language model part
    let vocab = pron_vocab(&fix.dict, &fix.net);
    let mut state = fix.lm.initial_state();
    let mut lm_total = ins_pen; // <s>
    let (p, s) = fix.lm.transition(state, vocab["<s>"][0]);
    lm_total += lm_scale * p;
    state = s;
    for &w in seq {
        let (p, s) = fix.lm.transition(state, vocab[word_pdfs[w].0][0]);
        if p <= LZERO {
            return f64::NEG_INFINITY;
        }
        lm_total += lm_scale * p + ins_pen;
        state = s;
    }
    let (p, _) = fix.lm.transition(state, vocab["</s>"][0]);
    lm_total += lm_scale * p + ins_pen;
    debug_assert_ne!(state, LmState::SentEnd);

    // acoustic chain
    let mut chain = vec![chain_plain(PDF_SIL)];
    for (i, &w) in seq.iter().enumerate() {
        chain.push(chain_plain(word_pdfs[w].1));
        if i + 1 < seq.len() {
            match seps[i] {
                Sep::Sp => chain.push(chain_sp()),
                Sep::Sil => chain.push(chain_plain(PDF_SIL)),
            }
        }
    }
    chain.push(chain_plain(PDF_SIL));

    chain_score(&chain, llh) + lm_total
}
