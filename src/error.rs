use thiserror::Error;

/// Fatal startup errors. Anything here is reported to stderr and the
/// process exits with code 1.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("model load error: {0}")]
    ModelLoad(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
