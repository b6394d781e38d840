//! Persistence: connection pooling and the repository layer.
//!
//! Repository traits are the seam tests mock (`mockall`, §4.15); the `pg`
//! submodules are the only code in the crate that knows SQL.

pub mod models;
pub mod pool;
pub mod repositories;

pub use pool::build_pool;
