use thiserror::Error;

/// Errors of the tools.
#[derive(Error, Debug)]
pub(crate) enum Error {
    #[error("mvpool: {0}")]
    Pool(#[from] mvpool::Error),
    #[error("IO {0}")]
    Io(#[from] std::io::Error),
    #[error("Verify: {0}")]
    Verify(String),
}

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;
