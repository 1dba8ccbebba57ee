//! Crate-wide error and result types.

use thiserror::Error;

/// Errors surfaced by [`Patcher`](crate::Patcher) operations.
///
/// Missing optional ELF entries (no PT_INTERP, no DT_SONAME, ...) are not
/// errors; those are reported through `log::warn!` and the operation
/// becomes a no-op. Errors are reserved for conditions that make the save
/// impossible or the result meaningless.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed ELF: {0}")]
    Parse(#[from] goblin::error::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("{0}")]
    Structural(String),
}

pub type Result<T> = std::result::Result<T, Error>;
