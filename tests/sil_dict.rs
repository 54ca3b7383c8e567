//! Decoding with an sp/sil dictionary: pronunciation-variant probabilities
//! are paid when leaving the word-final layer, the bare variant bypasses the
//! pause model, and dedicated sp/sil models lead into the sentence end.
mod common;

use common::{add_model, decode, peaked_llh, wide_open};
use lv_decoder::dict::Dictionary;
use lv_decoder::hmm::HmmSet;
use lv_decoder::lm::ngram::pron_vocab;
use lv_decoder::lm::{LangModel, NgramLm};
use lv_decoder::logmath::LN10;
use lv_decoder::net::{build_lex_net, NetConfig};
use lv_decoder::phones::PhoneTable;
use std::io::Cursor;

const DICT: &str = "\
</s>  sil
<s>  sil
CAT 0.6 k
CAT 0.3 k sp
CAT 0.1 k sil
";

const LM: &str = "\
\\data\\
ngram 1=3
ngram 2=3

\\1-grams:
-1.00 <s> -0.30
-1.00 </s>
-0.60 CAT -0.20

\\2-grams:
-0.30 <s> CAT
-0.50 CAT </s>
-0.90 CAT CAT

\\end\\
";

fn sil_fixture() -> common::Fixture {
    let mut phones = PhoneTable::new();
    let mut dict = Dictionary::from_reader(Cursor::new(DICT), &mut phones).unwrap();
    let mut hset = HmmSet::new();
    add_model(&mut hset, "sil", 0);
    add_model(&mut hset, "k", 1);
    add_model(&mut hset, "sp", 2); // no tee with an sp/sil dictionary
    let sp = phones.intern("sp");
    let sil = phones.intern("sil");
    dict.convert_sil_dict(sp, sil, "<s>", "</s>").unwrap();
    dict.mark_all();
    let cfg = NetConfig {
        sil_dict: true,
        ..NetConfig::default()
    };
    let net = build_lex_net(&dict, &hset, &phones, &cfg).unwrap();
    let vocab = pron_vocab(&dict, &net);
    let lm = LangModel::Ngram(
        NgramLm::read(LM.as_bytes(), &vocab, net.n_prons(), "<s>", "</s>").unwrap(),
    );
    common::Fixture {
        phones,
        dict,
        hset,
        net,
        lm,
    }
}

/// Direct word-to-sentence-end path pays the bare-variant probability.
#[test]
fn bare_variant_prob_is_applied() {
    let fix = sil_fixture();
    // pdfs: sil=0 k=1 sp=2
    let llh = peaked_llh(&[0, 1, 0], 3);
    let out = decode(&fix, &llh, wide_open(32));
    let trans = out.trans.expect("1-best survives");
    let words: Vec<&str> = trans.words.iter().map(|w| w.word.as_str()).collect();
    assert_eq!(words, vec!["<s>", "CAT", "</s>"]);

    // three frames of 0.5 transitions, the two LM scores, and the bare
    // pronunciation variant's probability
    let expect = 3.0 * 0.5f64.ln() + (-0.30 + -0.50) * LN10 + 0.6f64.ln();
    assert!(
        (trans.total_score - expect).abs() < 1e-6,
        "score {} vs expected {}",
        trans.total_score,
        expect
    );
}

/// With silence frames between the words, the sil variant's probability and
/// model are used and the boundary lands at the end of the silence.
#[test]
fn sil_variant_between_words() {
    let fix = sil_fixture();
    // CAT, two frames of silence, CAT
    let llh = peaked_llh(&[0, 1, 0, 0, 1, 0], 3);
    let out = decode(&fix, &llh, wide_open(32));
    let trans = out.trans.expect("1-best survives");
    let words: Vec<&str> = trans.words.iter().map(|w| w.word.as_str()).collect();
    assert_eq!(words, vec!["<s>", "CAT", "CAT", "</s>"]);

    // six frames of 0.5 transitions; LM <s>->CAT, CAT->CAT, CAT-></s>;
    // the first CAT pays its sil variant, the second its bare variant
    let expect = 6.0 * 0.5f64.ln()
        + (-0.30 + -0.90 + -0.50) * LN10
        + 0.1f64.ln()
        + 0.6f64.ln();
    assert!(
        (trans.total_score - expect).abs() < 1e-6,
        "score {} vs expected {}",
        trans.total_score,
        expect
    );

    // the first CAT's boundary covers the inter-word silence
    assert_eq!(trans.words[1].end_frame, 3);
}

/// The sentence-end sp and sil models exist exactly in sp/sil mode.
#[test]
fn sentence_end_silences_only_in_sil_dict_mode() {
    let fix = sil_fixture();
    assert!(fix.net.se_sp.is_some());
    assert!(fix.net.se_sil.is_some());
    assert!(fix.net.sil_dict);

    let plain = common::one_phone_fixture();
    assert!(plain.net.se_sp.is_none());
    assert!(plain.net.se_sil.is_none());
}
