//! API route handlers (§6).

pub mod data_entry;
pub mod health;
pub mod live;
pub mod metrics;

use axum::middleware;
use axum::Router;

use crate::api::middleware as mw;
use crate::api::state::AppState;

/// Builds the complete route tree. Auth is applied only to the routes that
/// need it (submit, batch, live) — the schema and health endpoints stay
/// reachable without a key (§6: "`GET .../schema` (no auth)").
pub fn api_router(state: AppState) -> Router<AppState> {
    let protected = Router::new()
        .nest("/api/v1/data-entry", data_entry::protected_routes())
        .nest("/api/v1/live", live::routes())
        .layer(middleware::from_fn_with_state(state.clone(), mw::auth_middleware));

    let public = Router::new()
        .nest("/api/v1/data-entry", data_entry::public_routes())
        .merge(health::routes())
        .merge(metrics::routes());

    protected.merge(public)
}
