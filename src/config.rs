//! Decoder configuration. All the knobs live in one serde-backed struct so a
//! JSON file can configure a run, with the command line overriding single
//! fields on top. Validation happens once, up front; everything downstream
//! works from the resolved [`DecoderOpts`].
use crate::error::{DecodeError, Result};
use crate::lattice::LatFormat;
use crate::logmath::LZERO;
use crate::search::DecoderOpts;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DecoderConfig {
    pub start_word: String,
    pub end_word: String,
    pub sp_model_label: String,
    pub sil_model_label: String,
    /// Dictionary carries explicit -/sp/sil variants with probabilities.
    pub use_sp_sil_dict: bool,

    /// Max tokens per HMM state.
    pub n_tok: usize,
    pub beam_width: Option<f64>,
    /// Defaults to `beam_width`.
    pub rel_beam_width: Option<f64>,
    pub we_beam_width: Option<f64>,
    /// Defaults to `we_beam_width`.
    pub zs_beam_width: Option<f64>,
    /// Defaults to `beam_width`.
    pub lat_prune_beam: Option<f64>,
    /// Max lattice arcs per second; 0 disables the density cap.
    pub lat_prune_aps: f64,
    /// Accurate look-ahead only inside this beam; absent disables the
    /// fallback.
    pub fast_lmla_beam: Option<f64>,
    /// Max active model instances; 0 disables.
    pub max_model: usize,

    pub ins_pen: f64,
    pub ac_scale: f64,
    pub pron_scale: f64,
    pub lm_scale: f64,

    pub lat_gen: bool,
    /// Lattice field flags, a subset of `ABtvaldmr`.
    pub lat_out_form: Option<String>,
    pub latfile_mask: Option<String>,
    pub labfile_mask: Option<String>,
    /// Reference label file for per-frame best-alignment diagnostics.
    pub best_align_ref: Option<PathBuf>,

    /// Frame duration in seconds.
    pub frame_dur: f64,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        DecoderConfig {
            start_word: "<s>".into(),
            end_word: "</s>".into(),
            sp_model_label: "sp".into(),
            sil_model_label: "sil".into(),
            use_sp_sil_dict: false,
            n_tok: 32,
            beam_width: None,
            rel_beam_width: None,
            we_beam_width: None,
            zs_beam_width: None,
            lat_prune_beam: None,
            lat_prune_aps: 0.0,
            fast_lmla_beam: None,
            max_model: 0,
            ins_pen: 0.0,
            ac_scale: 1.0,
            pron_scale: 1.0,
            lm_scale: 1.0,
            lat_gen: false,
            lat_out_form: None,
            latfile_mask: None,
            labfile_mask: None,
            best_align_ref: None,
            frame_dur: 0.01,
        }
    }
}

impl DecoderConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let config: DecoderConfig = serde_json::from_str(&text)
            .map_err(|e| DecodeError::Config(format!("{}: {}", path.as_ref().display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("beam_width", self.beam_width),
            ("rel_beam_width", self.rel_beam_width),
            ("we_beam_width", self.we_beam_width),
            ("zs_beam_width", self.zs_beam_width),
            ("lat_prune_beam", self.lat_prune_beam),
            ("fast_lmla_beam", self.fast_lmla_beam),
        ] {
            if let Some(v) = value {
                if !(v > 0.0) {
                    return Err(DecodeError::Config(format!("{} must be positive", name)));
                }
            }
        }
        if let Some(b) = self.beam_width {
            if b >= -crate::logmath::LSMALL {
                return Err(DecodeError::Config("main beam is too wide".into()));
            }
        }
        if self.n_tok == 0 || self.n_tok > 1024 {
            return Err(DecodeError::Config(format!(
                "n_tok must be between 1 and 1024, got {}",
                self.n_tok
            )));
        }
        if self.lat_prune_aps < 0.0 {
            return Err(DecodeError::Config("lat_prune_aps must not be negative".into()));
        }
        if !(self.frame_dur > 0.0) {
            return Err(DecodeError::Config("frame_dur must be positive".into()));
        }
        if let Some(form) = &self.lat_out_form {
            LatFormat::parse(form)?;
        }
        Ok(())
    }

    /// Resolve the beam-default chain into concrete search options. A word
    /// end or ZS beam wider than the main beam is clamped down to it.
    pub fn to_opts(&self) -> DecoderOpts {
        let beam = self.beam_width.unwrap_or(-LZERO);
        let we_beam = self.we_beam_width.unwrap_or(-LZERO).min(beam);
        DecoderOpts {
            n_tok: self.n_tok,
            beam_width: beam,
            rel_beam_width: self.rel_beam_width.unwrap_or(beam),
            we_beam_width: we_beam,
            zs_beam_width: self.zs_beam_width.unwrap_or(we_beam).min(beam),
            max_model: self.max_model,
            ins_pen: self.ins_pen,
            ac_scale: self.ac_scale,
            pron_scale: self.pron_scale,
            lm_scale: self.lm_scale,
            fast_lmla_beam: self.fast_lmla_beam.unwrap_or(-LZERO),
            latgen: self.lat_gen,
            model_align: self.model_align(),
            n_alts: self.n_tok.min(32),
        }
    }

    /// Model-level trace-back is needed exactly when lattice output asks for
    /// alignment fields.
    pub fn model_align(&self) -> bool {
        self.lat_out_form
            .as_deref()
            .map(|f| f.contains('d') || f.contains('m'))
            .unwrap_or(false)
    }

    pub fn lat_format(&self) -> Result<LatFormat> {
        match &self.lat_out_form {
            Some(form) => LatFormat::parse(form),
            None => Ok(LatFormat::standard()),
        }
    }

    pub fn lat_prune_beam(&self) -> f64 {
        self.lat_prune_beam
            .or(self.beam_width)
            .unwrap_or(-LZERO)
    }
}

/// Match a filename against a mask where `%` captures one character, `*`
/// matches any run of characters, and everything else is literal. Returns
/// the captured characters, as used to map utterance names onto output
/// files.
pub fn mask_match(mask: &str, name: &str) -> Option<String> {
    fn go(mask: &[char], name: &[char], captured: &mut String) -> bool {
        match mask.split_first() {
            None => name.is_empty(),
            Some(('*', rest)) => {
                for skip in 0..=name.len() {
                    let mark = captured.len();
                    if go(rest, &name[skip..], captured) {
                        return true;
                    }
                    captured.truncate(mark);
                }
                false
            }
            Some(('%', rest)) => match name.split_first() {
                Some((c, tail)) => {
                    captured.push(*c);
                    if go(rest, tail, captured) {
                        true
                    } else {
                        captured.pop();
                        false
                    }
                }
                None => false,
            },
            Some((m, rest)) => match name.split_first() {
                Some((c, tail)) if c == m => go(rest, tail, captured),
                _ => false,
            },
        }
    }
    let mask: Vec<char> = mask.chars().collect();
    let name: Vec<char> = name.chars().collect();
    let mut captured = String::new();
    go(&mask, &name, &mut captured).then_some(captured)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_and_resolve() {
        let config = DecoderConfig::default();
        config.validate().unwrap();
        let opts = config.to_opts();
        assert_eq!(opts.n_tok, 32);
        assert_eq!(opts.beam_width, -LZERO);
        assert!(!opts.model_align);
    }

    #[test]
    fn beam_defaults_chain() {
        let config = DecoderConfig {
            beam_width: Some(200.0),
            we_beam_width: Some(300.0),
            ..Default::default()
        };
        let opts = config.to_opts();
        // wordend beam clamps to the main beam, zs follows wordend
        assert_eq!(opts.we_beam_width, 200.0);
        assert_eq!(opts.zs_beam_width, 200.0);
        assert_eq!(opts.rel_beam_width, 200.0);
    }

    #[test]
    fn rejects_bad_values() {
        let bad = DecoderConfig {
            n_tok: 0,
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(DecodeError::Config(_))));

        let bad = DecoderConfig {
            beam_width: Some(-5.0),
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let bad = DecoderConfig {
            lat_out_form: Some("tn".into()),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn unknown_fields_are_config_errors() {
        let err = serde_json::from_str::<DecoderConfig>("{\"no_such_option\": 1}");
        assert!(err.is_err());
    }

    #[test]
    fn model_align_follows_lattice_format() {
        let config = DecoderConfig {
            lat_out_form: Some("tvald".into()),
            ..Default::default()
        };
        assert!(config.model_align());
    }

    #[test]
    fn masks_capture_segments() {
        assert_eq!(mask_match("%%%_*.rec", "abc_x.rec"), Some("abc".into()));
        assert_eq!(mask_match("*-%%", "utt-07"), Some("07".into()));
        assert_eq!(mask_match("%%%.rec", "ab.rec"), None);
        assert_eq!(mask_match("*", "anything"), Some(String::new()));
    }
}
