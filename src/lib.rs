#![doc = include_str!("../README.md")]
use crate::config::DecoderConfig;
use crate::dict::Dictionary;
use crate::error::DecodeError;
use crate::hmm::HmmSet;
use crate::lattice::Lattice;
use crate::lm::{LangModel, LatticeLm, NgramLm};
use crate::net::{build_lex_net, LexNet, NetConfig};
use crate::outp::AcousticScorer;
use crate::phones::PhoneTable;
use crate::search::{Decoder, DecoderOpts};
use crate::traceback::Transcription;
use anyhow::Context;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::{Layer, Registry};

pub mod config;
pub mod dict;
pub mod error;
pub mod hmm;
pub mod lattice;
pub mod lm;
pub mod logmath;
pub mod net;
pub mod outp;
pub mod phones;
pub mod search;
pub mod traceback;

pub use config::DecoderConfig as Config;
pub use outp::MatrixScorer;

/// Everything one utterance produces.
#[derive(Debug)]
pub struct UtteranceResult {
    /// Empty when every hypothesis was pruned away.
    pub transcription: Transcription,
    pub lattice: Option<Lattice>,
    pub starved: bool,
}

/// The assembled recognition system: dictionary, models, network and LM.
#[derive(Debug)]
pub struct Recognizer {
    pub config: DecoderConfig,
    phones: PhoneTable,
    dict: Dictionary,
    hset: HmmSet,
    /// Static network and LM; absent in lattice-rescoring mode, where both
    /// are rebuilt per utterance.
    net: Option<LexNet>,
    lm: Option<LangModel>,
}

impl Recognizer {
    /// Load the dictionary and models and, unless `lm_path` is `None`
    /// (lattice-rescoring mode), build the network and read the LM.
    pub fn new(
        config: DecoderConfig,
        dict_path: &Path,
        hmm_path: &Path,
        lm_path: Option<&Path>,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        info!("Reading dictionary from {}", dict_path.display());
        let mut phones = PhoneTable::new();
        let mut dict = Dictionary::open(dict_path, &mut phones)
            .with_context(|| format!("reading dictionary {}", dict_path.display()))?;

        info!("Reading acoustic models from {}", hmm_path.display());
        let hset = HmmSet::open(hmm_path)?;
        info!(
            "Read {} models, {} output distributions",
            hset.len(),
            hset.n_pdfs()
        );

        if config.use_sp_sil_dict {
            let sp = phones.intern(&config.sp_model_label);
            let sil = phones.intern(&config.sil_model_label);
            dict.convert_sil_dict(sp, sil, &config.start_word, &config.end_word)?;
        }

        let mut recognizer = Recognizer {
            config,
            phones,
            dict,
            hset,
            net: None,
            lm: None,
        };

        if let Some(lm_path) = lm_path {
            recognizer.dict.mark_all();
            let net = recognizer.build_net()?;

            info!("Reading language model from {}", lm_path.display());
            let data = fs::read(lm_path)?;
            let vocab = lm::ngram::pron_vocab(&recognizer.dict, &net);
            let lm = NgramLm::read(
                &data,
                &vocab,
                net.n_prons(),
                &recognizer.config.start_word,
                &recognizer.config.end_word,
            )?;
            recognizer.net = Some(net);
            recognizer.lm = Some(LangModel::Ngram(lm));
        }
        Ok(recognizer)
    }

    fn net_config(&self) -> NetConfig {
        NetConfig {
            start_word: self.config.start_word.clone(),
            end_word: self.config.end_word.clone(),
            sp_label: self.config.sp_model_label.clone(),
            sil_label: self.config.sil_model_label.clone(),
            sil_dict: self.config.use_sp_sil_dict,
        }
    }

    fn build_net(&self) -> Result<LexNet, DecodeError> {
        let start = Instant::now();
        let net = build_lex_net(&self.dict, &self.hset, &self.phones, &self.net_config())?;
        info!("Network built in {:?}", start.elapsed());
        Ok(net)
    }

    /// Recognise one utterance against the static network and LM.
    pub fn recognize(
        &self,
        utterance: Option<String>,
        scorer: &dyn AcousticScorer,
    ) -> anyhow::Result<UtteranceResult> {
        let net = self
            .net
            .as_ref()
            .context("no static network; this recognizer is in lattice-rescoring mode")?;
        let lm = self.lm.as_ref().expect("network without LM");
        self.run(net, lm, utterance, scorer, &mut |_| {})
    }

    /// Like [`Self::recognize`], but invoking `on_frame` after every
    /// processed frame, as used for search-space diagnostics.
    pub fn recognize_with(
        &self,
        utterance: Option<String>,
        scorer: &dyn AcousticScorer,
        on_frame: &mut dyn FnMut(&Decoder),
    ) -> anyhow::Result<UtteranceResult> {
        let net = self
            .net
            .as_ref()
            .context("no static network; this recognizer is in lattice-rescoring mode")?;
        let lm = self.lm.as_ref().expect("network without LM");
        self.run(net, lm, utterance, scorer, on_frame)
    }

    /// Rescore one utterance constrained to the paths of an input lattice:
    /// the network is rebuilt over the lattice's vocabulary and the lattice
    /// itself acts as the LM.
    pub fn rescore_lattice(
        &mut self,
        utterance: Option<String>,
        scorer: &dyn AcousticScorer,
        lat: &Lattice,
    ) -> anyhow::Result<UtteranceResult> {
        self.dict.unmark_all();
        let words = lat.words();
        let missing = self.dict.mark_words(
            words
                .iter()
                .copied()
                .filter(|w| *w != self.config.start_word && *w != self.config.end_word),
        );
        for word in &missing {
            warn!("lattice word '{}' is not in the dictionary", word);
        }
        self.dict
            .mark_words([self.config.start_word.as_str(), self.config.end_word.as_str()]);

        let net = self.build_net()?;
        let vocab = lm::ngram::pron_vocab(&self.dict, &net);
        let lm = LangModel::Lattice(LatticeLm::from_lattice(lat, &vocab, &self.config.end_word)?);
        self.run(&net, &lm, utterance, scorer, &mut |_| {})
    }

    fn run(
        &self,
        net: &LexNet,
        lm: &LangModel,
        utterance: Option<String>,
        scorer: &dyn AcousticScorer,
        on_frame: &mut dyn FnMut(&Decoder),
    ) -> anyhow::Result<UtteranceResult> {
        let start = Instant::now();
        let opts: DecoderOpts = self.config.to_opts();
        let mut dec = Decoder::new(net, &self.hset, lm, opts);

        let n_frames = scorer.n_frames();
        for _ in 0..n_frames {
            dec.process_frame(scorer);
            on_frame(&dec);
        }

        let transcription = traceback::trace_back(&dec).unwrap_or_default();
        let lattice = if self.config.lat_gen {
            match traceback::lat_trace_back(&dec, utterance, self.config.frame_dur) {
                Some(lat) => {
                    Some(lat.prune(self.config.lat_prune_beam(), self.config.lat_prune_aps)?)
                }
                None => None,
            }
        } else {
            None
        };
        if let Some(lat) = &lattice {
            lattice::report(lat);
        }

        let elapsed = start.elapsed();
        info!(
            "Decoded {} frames in {:?} ({:.2}x real time)",
            n_frames,
            elapsed,
            elapsed.as_secs_f64() / (n_frames.max(1) as f64 * self.config.frame_dur)
        );
        dec.stats.report();

        Ok(UtteranceResult {
            transcription,
            lattice,
            starved: dec.starved(),
        })
    }

    pub fn dictionary(&self) -> &Dictionary {
        &self.dict
    }

    pub fn models(&self) -> &HmmSet {
        &self.hset
    }

    pub fn network(&self) -> Option<&LexNet> {
        self.net.as_ref()
    }
}

/// Convenience function to setup logging for any binaries I create.
/// Automatically sets all binaries and the decoder library crate to `info`
/// logging by default.
pub fn setup_logging() {
    let filter = match env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_env("RUST_LOG"),
        _ => EnvFilter::new("lv_decoder=info,decode=info"),
    };

    let fmt = tracing_subscriber::fmt::Layer::default();

    let subscriber = filter.and_then(fmt).with_subscriber(Registry::default());

    tracing::subscriber::set_global_default(subscriber).unwrap();
}
