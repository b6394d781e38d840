//! Retention policy resolution and the background purge engine (§4.9).

pub mod policy;
pub mod purge;

pub use policy::resolve_policy;
pub use purge::PurgeEngine;

use thiserror::Error;

/// Errors raised while resolving a policy or running a purge cycle.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    #[error("hierarchy node {0} not found while resolving ancestors")]
    HierarchyNodeNotFound(i64),

    #[error(transparent)]
    Database(#[from] crate::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for crate::Error {
    fn from(e: Error) -> Self {
        crate::Error::Retention(Box::new(e))
    }
}
