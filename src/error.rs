use thiserror::Error;

#[derive(Debug, Error)]
pub enum HaloclineError {
    #[error("Invalid dimension: {0}")]
    InvalidDim(String),

    #[error("Layout mismatch: {0}")]
    LayoutMismatch(String),

    #[error("Domain too small: {0}")]
    DomainTooSmall(String),

    #[error("Bad rank layout: {0}")]
    BadRankLayout(String),

    #[error("Misaligned ranks: {0}")]
    MisalignedRanks(String),

    #[error("Solution not prepared: {0}")]
    NotPrepared(String),

    #[error("No storage: {0}")]
    NoStorage(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("MPI failure: {0}")]
    Mpi(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HaloclineError>;
