//! Crate-wide error type.
//!
//! Individual modules define their own `Error` enum scoped to the failures they
//! can actually produce (`stats::Error`, `providers::Error`, `engine::Error`,
//! `retention::Error`); this top-level enum unifies them at the process
//! boundary (REST handlers, the CLI binary) and carries the HTTP-status
//! taxonomy from the specification's error-handling design.

use thiserror::Error;

/// Top-level result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type surfaced at the API boundary.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Stats(#[from] crate::stats::Error),

    // Boxed rather than `#[from]`-unwrapped: `providers`/`engine`/`retention`
    // each embed this type back (for their own database-failure variant), so
    // an unboxed field here would make `Error` infinitely recursive. `From`
    // impls below box manually; `?` at call sites still works unchanged.
    #[error(transparent)]
    Providers(Box<crate::providers::Error>),

    #[error(transparent)]
    Engine(Box<crate::engine::Error>),

    #[error(transparent)]
    Retention(Box<crate::retention::Error>),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("database pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("credential encryption error: {0}")]
    Crypto(String),
}

impl From<crate::providers::Error> for Error {
    fn from(e: crate::providers::Error) -> Self {
        Error::Providers(Box::new(e))
    }
}

impl From<crate::engine::Error> for Error {
    fn from(e: crate::engine::Error) -> Self {
        Error::Engine(Box::new(e))
    }
}

impl From<crate::retention::Error> for Error {
    fn from(e: crate::retention::Error) -> Self {
        Error::Retention(Box::new(e))
    }
}

impl Error {
    /// Maps this error to the HTTP status taxonomy described in the spec's
    /// error-handling design (§7): validation/state errors surface as 400,
    /// not-found as 404, conflicts as 409, everything else as 500.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Validation(_) | Error::Stats(_) | Error::Providers(_) => 400,
            Error::Unauthorized(_) => 401,
            Error::Forbidden(_) => 403,
            Error::NotFound(_) => 404,
            Error::Conflict(_) => 409,
            Error::Engine(_) | Error::Retention(_) | Error::Database(_) | Error::Pool(_) => 500,
            Error::Config(_) | Error::Crypto(_) => 500,
        }
    }
}
