use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can stop a training run.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to download `{url}`: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("`{file}` has magic number {found}, expected {expected}")]
    BadMagic {
        file: String,
        expected: u32,
        found: u32,
    },

    #[error("`{file}` is truncated: expected {expected} bytes, found {found}")]
    Truncated {
        file: String,
        expected: usize,
        found: usize,
    },

    #[error("found {images} images but {labels} labels")]
    CountMismatch { images: usize, labels: usize },

    #[error("images have {found} pixels, expected {expected}")]
    ImageSize { expected: usize, found: usize },

    #[error("label {label} is out of range for {classes} classes")]
    LabelOutOfRange { label: u8, classes: usize },

    #[error("invalid config: {0}")]
    Config(String),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),

    #[error("the {0} split is empty")]
    EmptySplit(&'static str),

    #[error("invalid batching: {0}")]
    InvalidBatching(String),
}
