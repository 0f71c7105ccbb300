use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FilingError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde json error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("pdf extract failed for {path:?}: {message}")]
    PdfExtract { path: PathBuf, message: String },
    #[error("unsupported input format: {0:?}")]
    UnsupportedInput(PathBuf),
    #[error("unknown tokenizer: {0}")]
    UnknownTokenizer(String),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("other: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, FilingError>;

impl From<anyhow::Error> for FilingError {
    fn from(value: anyhow::Error) -> Self {
        Self::Other(value.to_string())
    }
}
