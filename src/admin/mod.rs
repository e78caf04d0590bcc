//! Thin admin surface: stats reads and affinity clearing, behind the
//! shared-secret admin auth. Model/backend/key CRUD lives elsewhere.

pub mod auth;
pub mod handlers;

use axum::{
    middleware,
    routing::{delete, get},
    Router,
};

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::http::server::AppState;

pub fn setup_admin_router(state: AppState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/stats", get(get_stats))
        .route("/admin/stats/history", get(get_stats_history))
        .route("/admin/active-requests", get(get_active_requests))
        .route("/admin/affinity", delete(clear_affinity))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            admin_auth_middleware,
        ))
        .with_state(state)
}
