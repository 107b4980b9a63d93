use thiserror::Error;

use expfam_param::ParamError;

/// Errors surfaced by `fit` and `tick`. None of them is retried.
#[derive(Error, Debug)]
pub enum PviError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("not implemented: {0}")]
    Unimplemented(&'static str),

    #[error("consistency check failed: {0}")]
    Consistency(String),

    #[error("client {0} is already optimising")]
    ClientBusy(usize),

    #[error(transparent)]
    Param(#[from] ParamError),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PviError>;
