use thiserror::Error;

use crate::family::Family;

/// Errors raised by parameter conversions and natural-parameter arithmetic.
///
/// All of these are fatal for the caller: a mismatch between a factor and a
/// posterior is never zero-padded or silently skipped.
#[derive(Error, Debug)]
pub enum ParamError {
    #[error("parameter keys do not match: expected {expected:?}, got {got:?}")]
    KeyMismatch {
        expected: Vec<String>,
        got: Vec<String>,
    },

    #[error("shape mismatch for '{key}': {left:?} vs. {right:?}")]
    ShapeMismatch {
        key: String,
        left: Vec<usize>,
        right: Vec<usize>,
    },

    #[error("family mismatch: {left} vs. {right}")]
    FamilyMismatch { left: Family, right: Family },

    #[error("{0} is not trainable")]
    NotTrainable(Family),

    #[error("{family} does not support {what}")]
    Unsupported { family: Family, what: &'static str },

    #[error("factor not found: {0}")]
    FactorNotFound(usize),

    #[error("non-finite value in {0}")]
    NonFinite(&'static str),

    #[error("unknown distribution family '{0}'")]
    UnknownFamily(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, ParamError>;
