//! Lattice rescoring through the full `Recognizer` stack: resources come
//! from files, the input lattice constrains the search, and its LM scores
//! pick the winning path.
mod common;

use lv_decoder::config::DecoderConfig;
use lv_decoder::error::DecodeError;
use lv_decoder::lattice::{LatArc, LatNode, Lattice};
use lv_decoder::{MatrixScorer, Recognizer};
use ndarray::Array2;
use std::fs;
use std::path::PathBuf;

const DICT: &str = "\
</s>  sil
<s>  sil
A  ah
B  b
C  k
";

const HMMS: &str = r#"
~h "sil"
<NUMSTATES> 3
<STATE> 2 <PDF> 0
<TRANSP> 3
 0.0 1.0 0.0
 0.0 0.5 0.5
 0.0 0.0 0.0
~h "ah"
<NUMSTATES> 3
<STATE> 2 <PDF> 1
<TRANSP> 3
 0.0 1.0 0.0
 0.0 0.5 0.5
 0.0 0.0 0.0
~h "b"
<NUMSTATES> 3
<STATE> 2 <PDF> 2
<TRANSP> 3
 0.0 1.0 0.0
 0.0 0.5 0.5
 0.0 0.0 0.0
~h "k"
<NUMSTATES> 3
<STATE> 2 <PDF> 3
<TRANSP> 3
 0.0 1.0 0.0
 0.0 0.5 0.5
 0.0 0.0 0.0
~h "sp"
<NUMSTATES> 3
<STATE> 2 <PDF> 4
<TRANSP> 3
 0.0 0.7 0.3
 0.0 0.5 0.5
 0.0 0.0 0.0
"#;

fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("lv-decoder-{}-{}", tag, std::process::id()));
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn write_resources(tag: &str) -> (PathBuf, PathBuf) {
    let dir = scratch_dir(tag);
    let dict = dir.join("lexicon.dic");
    let hmms = dir.join("models.mmf");
    fs::write(&dict, DICT).unwrap();
    fs::write(&hmms, HMMS).unwrap();
    (dict, hmms)
}

/// `<s> -> A -> {B | C} -> </s>` with the B branch 3 ln cheaper.
fn input_lattice() -> Lattice {
    let node = |time: f64, word: &str| LatNode {
        time,
        word: word.into(),
        variant: 1,
    };
    let arc = |start: u32, end: u32, lmlike: f64| LatArc {
        start,
        end,
        aclike: 0.0,
        lmlike,
        prlike: 0.0,
        align: vec![],
    };
    Lattice {
        utterance: Some("utt1".into()),
        lm_scale: 1.0,
        ac_scale: 1.0,
        pr_scale: 1.0,
        wd_penalty: 0.0,
        frame_dur: 0.01,
        nodes: vec![
            node(0.00, "!NULL"),
            node(0.01, "<s>"),
            node(0.02, "A"),
            node(0.03, "B"),
            node(0.03, "C"),
            node(0.04, "</s>"),
        ],
        arcs: vec![
            arc(0, 1, 0.0),
            arc(1, 2, -1.0),
            arc(2, 3, -2.0),
            arc(2, 4, -5.0),
            arc(3, 5, -0.5),
            arc(4, 5, -0.5),
        ],
    }
}

/// Acoustically B and C are indistinguishable; the lattice LM prefers B.
#[test]
fn rescoring_follows_lattice_lm() {
    let (dict, hmms) = write_resources("rescore");
    let config = DecoderConfig::default();
    let mut recognizer = Recognizer::new(config, &dict, &hmms, None).unwrap();

    // pdfs: sil=0 ah=1 b=2 k=3 sp=4
    let mut llh = Array2::from_elem((4, 5), -10.0);
    llh[[0, 0]] = 0.0;
    llh[[1, 1]] = 0.0;
    llh[[2, 2]] = 0.0;
    llh[[2, 3]] = 0.0; // b and c equally likely
    llh[[3, 0]] = 0.0;
    let scorer = MatrixScorer::new(llh);

    let result = recognizer
        .rescore_lattice(Some("utt1".into()), &scorer, &input_lattice())
        .unwrap();
    let words: Vec<&str> = result
        .transcription
        .words
        .iter()
        .map(|w| w.word.as_str())
        .collect();
    assert_eq!(words, vec!["<s>", "A", "B", "</s>"]);

    // the same request again must rebuild and agree (per-utterance reset)
    let llh2 = {
        let mut llh = Array2::from_elem((4, 5), -10.0);
        llh[[0, 0]] = 0.0;
        llh[[1, 1]] = 0.0;
        llh[[2, 2]] = 0.0;
        llh[[2, 3]] = 0.0;
        llh[[3, 0]] = 0.0;
        llh
    };
    let again = recognizer
        .rescore_lattice(Some("utt1".into()), &MatrixScorer::new(llh2), &input_lattice())
        .unwrap();
    assert_eq!(
        again.transcription.total_score,
        result.transcription.total_score
    );
}

/// A word in the lattice that the dictionary cannot say is reported, not
/// fatal.
#[test]
fn rescoring_warns_on_unknown_lattice_words() {
    let (dict, hmms) = write_resources("rescore-oov");
    let mut recognizer = Recognizer::new(DecoderConfig::default(), &dict, &hmms, None).unwrap();

    let mut lat = input_lattice();
    lat.nodes[3].word = "ZONK".into();
    let llh = Array2::from_elem((4, 5), -1.0);
    // the unknown word makes the B branch unusable; C must win
    let result = recognizer
        .rescore_lattice(None, &MatrixScorer::new(llh), &lat)
        .unwrap();
    let words: Vec<&str> = result
        .transcription
        .words
        .iter()
        .map(|w| w.word.as_str())
        .collect();
    assert_eq!(words, vec!["<s>", "A", "C", "</s>"]);
}

/// An sp model with a tee transition is rejected as soon as an sp/sil
/// dictionary is in use.
#[test]
fn sil_dict_with_tee_sp_fails_at_build() {
    let dir = scratch_dir("tee-sp");
    let dict_path = dir.join("lexicon.dic");
    let hmm_path = dir.join("models.mmf");
    fs::write(
        &dict_path,
        "</s>  sil\n<s>  sil\nA 0.6 ah\nA 0.3 ah sp\nA 0.1 ah sil\n",
    )
    .unwrap();
    fs::write(&hmm_path, HMMS).unwrap(); // sp carries a tee
    let lm_path = dir.join("lm.arpa");
    fs::write(&lm_path, "\\data\\\nngram 1=3\n\n\\1-grams:\n-1 <s>\n-1 </s>\n-1 A\n\\end\\\n")
        .unwrap();

    let config = DecoderConfig {
        use_sp_sil_dict: true,
        ..DecoderConfig::default()
    };
    let err = Recognizer::new(config, &dict_path, &hmm_path, Some(&lm_path)).unwrap_err();
    let err = err.downcast::<DecodeError>().unwrap();
    assert!(matches!(err, DecodeError::BadSpModel(_)));
}
