//! Error kinds shared across the crate. Build-time problems (missing models,
//! malformed dictionaries or LMs, id overflow) are fatal and surface through
//! these variants; purely per-utterance conditions like pruning starvation are
//! reported in the result types instead so a batch run can continue.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    /// Unknown or inconsistent configuration option.
    #[error("configuration error: {0}")]
    Config(String),

    /// A model, triphone, word or label that the network build requires is
    /// absent from its inventory.
    #[error("missing resource: {0}")]
    ResourceMissing(String),

    /// The short-pause model carries a tee transition while the dictionary
    /// provides explicit sp/sil variants; the two mechanisms would double
    /// count the optional pause.
    #[error("model '{0}' has a tee transition but the dictionary carries sp/sil variants")]
    BadSpModel(String),

    /// Pronunciation or LM word ids ran out of range.
    #[error("network too large: {0}")]
    NetworkTooLarge(String),

    /// Malformed n-gram file.
    #[error("language model parse error: {0}")]
    LmParse(String),

    /// sp/sil-mode dictionary whose pronunciations do not form -/sp/sil
    /// triples.
    #[error("dictionary structure error: {0}")]
    DictStructure(String),

    /// Lattice file could not be parsed or written.
    #[error("lattice format error: {0}")]
    LatticeFormat(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DecodeError>;
