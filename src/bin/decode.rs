use anyhow::Context;
use clap::Parser;
use lv_decoder::config::{mask_match, DecoderConfig};
use lv_decoder::lattice::Lattice;
use lv_decoder::search::Decoder;
use lv_decoder::traceback::Transcription;
use lv_decoder::{MatrixScorer, Recognizer, UtteranceResult};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info};

#[derive(Parser, Debug)]
pub struct Args {
    /// JSON configuration file; individual flags below override it
    #[clap(long)]
    config: Option<PathBuf>,
    /// Pronunciation dictionary
    #[clap(long, short)]
    dict: PathBuf,
    /// Acoustic model definitions
    #[clap(long)]
    hmms: PathBuf,
    /// ARPA n-gram language model; omit to rescore input lattices instead
    #[clap(long, short)]
    lm: Option<PathBuf>,
    /// Directory of input lattices for rescoring mode
    #[clap(long)]
    lat_in_dir: Option<PathBuf>,
    /// Input lattice extension
    #[clap(long, default_value = "lat")]
    lat_in_ext: String,
    /// Directory for label and lattice output
    #[clap(short, long, default_value = ".")]
    output_dir: PathBuf,
    /// Output label file extension
    #[clap(long, default_value = "rec")]
    lab_ext: String,
    /// Generate lattices with this extension
    #[clap(long)]
    lat_ext: Option<String>,
    /// Lattice output format flags (subset of ABtvaldmr)
    #[clap(long)]
    lat_out_form: Option<String>,
    /// Dictionary carries -/sp/sil variants with pronunciation probs
    #[clap(long)]
    sp_sil_dict: bool,
    /// Main beam width (optionally also sets the relative beam)
    #[clap(short = 't', long)]
    beam: Option<f64>,
    #[clap(long)]
    rel_beam: Option<f64>,
    /// Word-end beam width
    #[clap(short = 'v', long)]
    we_beam: Option<f64>,
    #[clap(long)]
    zs_beam: Option<f64>,
    /// Max model pruning limit
    #[clap(short = 'u', long)]
    max_model: Option<usize>,
    /// Number of tokens per state
    #[clap(short, long)]
    n_tok: Option<usize>,
    /// Word insertion penalty
    #[clap(short = 'p', long)]
    ins_pen: Option<f64>,
    /// Acoustic scale factor
    #[clap(short = 'a', long)]
    ac_scale: Option<f64>,
    /// Pronunciation scale factor
    #[clap(short = 'r', long)]
    pron_scale: Option<f64>,
    /// LM scale factor
    #[clap(short = 's', long)]
    lm_scale: Option<f64>,
    /// Reference label files for per-frame best-alignment diagnostics
    #[clap(long)]
    best_align: Option<PathBuf>,
    /// Per-utterance log-likelihood matrices (frames x states, .npy)
    #[clap(required = true)]
    inputs: Vec<PathBuf>,
}

fn apply_overrides(config: &mut DecoderConfig, args: &Args) {
    if args.sp_sil_dict {
        config.use_sp_sil_dict = true;
    }
    if let Some(b) = args.beam {
        config.beam_width = Some(b);
        if config.rel_beam_width.is_none() {
            config.rel_beam_width = Some(b);
        }
    }
    if let Some(b) = args.rel_beam {
        config.rel_beam_width = Some(b);
    }
    if let Some(b) = args.we_beam {
        config.we_beam_width = Some(b);
    }
    if let Some(b) = args.zs_beam {
        config.zs_beam_width = Some(b);
    }
    if let Some(m) = args.max_model {
        config.max_model = m;
    }
    if let Some(n) = args.n_tok {
        config.n_tok = n;
    }
    if let Some(p) = args.ins_pen {
        config.ins_pen = p;
    }
    if let Some(a) = args.ac_scale {
        config.ac_scale = a;
    }
    if let Some(r) = args.pron_scale {
        config.pron_scale = r;
        // pronunciation probabilities only exist in sp/sil dictionaries
        config.use_sp_sil_dict = true;
    }
    if let Some(s) = args.lm_scale {
        config.lm_scale = s;
    }
    if args.lat_ext.is_some() {
        config.lat_gen = true;
    }
    if let Some(form) = &args.lat_out_form {
        config.lat_out_form = Some(form.clone());
    }
    if let Some(path) = &args.best_align {
        config.best_align_ref = Some(path.clone());
    }
}

/// Map an utterance name through an optional filename mask.
fn masked_name(mask: Option<&str>, name: &str) -> anyhow::Result<String> {
    match mask {
        Some(mask) => mask_match(mask, name)
            .with_context(|| format!("mask '{}' has no match with segment '{}'", mask, name)),
        None => Ok(name.to_string()),
    }
}

/// Write the 1-best transcription as label lines of
/// `start end word score`, with times in 100 ns units.
fn write_label_file(
    path: &Path,
    trans: &Transcription,
    frame_dur: f64,
) -> anyhow::Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    for word in &trans.words {
        let start = (word.start_frame as f64 * frame_dur * 1.0e7).round() as i64;
        let end = ((word.end_frame + 1) as f64 * frame_dur * 1.0e7).round() as i64;
        writeln!(w, "{} {} {} {:.4}", start, end, word.word, word.score)?;
    }
    Ok(())
}

/// Reference segments for the best-align diagnostic: `(start end label)`
/// lines with times in 100 ns units.
fn read_align_ref(path: &Path, frame_dur: f64) -> anyhow::Result<Vec<(usize, usize, String)>> {
    let text = fs::read_to_string(path)?;
    let mut segments = vec![];
    for line in text.lines() {
        let mut toks = line.split_whitespace();
        let (Some(start), Some(end), Some(label)) = (toks.next(), toks.next(), toks.next())
        else {
            continue;
        };
        let (Ok(start), Ok(end)) = (start.parse::<f64>(), end.parse::<f64>()) else {
            continue;
        };
        let to_frame = |t: f64| (t / (frame_dur * 1.0e7)).round() as usize;
        segments.push((to_frame(start), to_frame(end), label.to_string()));
    }
    Ok(segments)
}

fn report_transcription(name: &str, result: &UtteranceResult) {
    if result.starved || result.transcription.words.is_empty() {
        error!("{}: no transcription (all hypotheses pruned)", name);
        return;
    }
    let words: Vec<&str> = result
        .transcription
        .words
        .iter()
        .map(|w| w.word.as_str())
        .collect();
    info!(
        "{}: {} (score {:.3})",
        name,
        words.join(" "),
        result.transcription.total_score
    );
}

fn main() -> anyhow::Result<()> {
    lv_decoder::setup_logging();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => DecoderConfig::load(path)?,
        None => DecoderConfig::default(),
    };
    apply_overrides(&mut config, &args);
    config.validate()?;

    let lat_rescore = args.lm.is_none();
    if lat_rescore && args.lat_in_dir.is_none() {
        anyhow::bail!("either --lm or --lat-in-dir is required");
    }

    info!("Loading resources");
    let mut recognizer = Recognizer::new(
        config.clone(),
        &args.dict,
        &args.hmms,
        args.lm.as_deref(),
    )?;

    let align_ref = match &config.best_align_ref {
        Some(path) => Some(read_align_ref(path, config.frame_dur)?),
        None => None,
    };

    for input in &args.inputs {
        let name = input
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("utterance")
            .to_string();
        info!("File: {}", input.display());
        let scorer = MatrixScorer::open_npy(input)?;

        let result = if lat_rescore {
            let lat_name = masked_name(config.latfile_mask.as_deref(), &name)?;
            let lat_path = args
                .lat_in_dir
                .as_ref()
                .unwrap()
                .join(format!("{}.{}", lat_name, args.lat_in_ext));
            info!("Loading lattice from {}", lat_path.display());
            let lat = Lattice::read(&fs::read(&lat_path)?)?;
            recognizer.rescore_lattice(Some(name.clone()), &scorer, &lat)
        } else if let Some(segments) = &align_ref {
            let mut on_frame = |dec: &Decoder| {
                let t = dec.frame() - 1;
                let label = segments
                    .iter()
                    .find(|(s, e, _)| *s <= t && t < *e)
                    .map(|(_, _, l)| l.as_str())
                    .unwrap_or("?");
                info!("BESTALIGN frame {:4} best {:10.3} ref {}", t, dec.best_score(), label);
            };
            recognizer.recognize_with(Some(name.clone()), &scorer, &mut on_frame)
        } else {
            recognizer.recognize(Some(name.clone()), &scorer)
        };

        let result = match result {
            Ok(result) => result,
            Err(e) => {
                // carry on with the next utterance
                error!("{}: {}", name, e);
                continue;
            }
        };
        report_transcription(&name, &result);

        let lab_name = masked_name(config.labfile_mask.as_deref(), &name)?;
        let lab_path = args
            .output_dir
            .join(format!("{}.{}", lab_name, args.lab_ext));
        write_label_file(&lab_path, &result.transcription, config.frame_dur)?;

        if let (Some(lat), Some(ext)) = (&result.lattice, &args.lat_ext) {
            let lat_name = masked_name(config.latfile_mask.as_deref(), &name)?;
            let lat_path = args.output_dir.join(format!("{}.{}", lat_name, ext));
            let mut file = BufWriter::new(File::create(&lat_path)?);
            if let Err(e) = lat.write(&mut file, config.lat_format()?) {
                error!("cannot write lattice {}: {}", lat_path.display(), e);
            }
        }
    }
    Ok(())
}
