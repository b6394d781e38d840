//! Connection pooling over `tokio_postgres`, via `deadpool_postgres`.

use std::str::FromStr;

use deadpool_postgres::{ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::NoTls;

use crate::error::{Error, Result};

/// Builds a pool from a `postgres://` URL. TLS is intentionally out of scope
/// here (deployments that need it terminate at a sidecar/proxy); the DB
/// connection itself carries no secrets beyond what's already in `database_url`.
pub fn build_pool(database_url: &str) -> Result<Pool> {
    let pg_config = tokio_postgres::Config::from_str(database_url)
        .map_err(|e| Error::Config(format!("invalid database_url: {e}")))?;

    let manager_config = ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    };
    let manager = deadpool_postgres::Manager::from_config(pg_config, NoTls, manager_config);

    Pool::builder(manager)
        .runtime(Runtime::Tokio1)
        .max_size(16)
        .build()
        .map_err(|e| Error::Config(format!("failed to build pool: {e}")))
}
