//! The REST submit-sample surface and the live-subscriber WebSocket (§6).

pub mod auth;
pub mod middleware;
pub mod routes;
pub mod server;
pub mod state;
pub mod types;

pub use auth::{hash_key, AuthVerifier, RepositoryAuthVerifier};
pub use server::{ApiConfig, ApiServer};
pub use state::{AppState, ServerConfig};
