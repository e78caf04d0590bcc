use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;

use crate::affinity::AffinityFilter;
use crate::http::server::AppState;
use crate::metrics::{HistoricalQuery, TimeWindow};

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub instance_id: String,
    pub models: usize,
    pub affinity_mappings: usize,
}

pub async fn get_status(State(state): State<AppState>) -> Json<SystemStatus> {
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        instance_id: state.instance.to_string(),
        models: state.registry.snapshot().model_count(),
        affinity_mappings: state.affinity.len(),
    })
}

fn default_minutes() -> i64 {
    15
}

#[derive(Deserialize)]
pub struct StatsQuery {
    pub backend_id: Option<String>,
    #[serde(default = "default_minutes")]
    pub minutes: i64,
}

pub async fn get_stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Json<serde_json::Value> {
    let window = TimeWindow::last_minutes(query.minutes.max(1));
    let stats = match query.backend_id {
        Some(backend_id) => {
            let stats = state.metrics.get_stats(&backend_id, window).await;
            HashMap::from([(backend_id, stats)])
        }
        None => state.metrics.get_all_stats(window).await,
    };
    Json(json!({ "window_minutes": query.minutes, "backends": stats }))
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub backend_id: Option<String>,
    pub instance_id: Option<String>,
    #[serde(default = "default_minutes")]
    pub minutes: i64,
    pub limit: Option<usize>,
}

pub async fn get_stats_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Json<serde_json::Value> {
    let series = state
        .metrics
        .get_historical_stats(HistoricalQuery {
            backend_id: query.backend_id,
            instance_id: query.instance_id,
            window: TimeWindow::last_minutes(query.minutes.max(1)),
            limit: query.limit,
        })
        .await;
    Json(json!({ "buckets": series }))
}

pub async fn get_active_requests(State(state): State<AppState>) -> Json<serde_json::Value> {
    let counts = match &state.store {
        Some(store) => match store.get_all_counts().await {
            Ok(counts) => counts,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read active-request counts");
                HashMap::new()
            }
        },
        None => HashMap::new(),
    };
    Json(json!({ "backends": counts }))
}

pub async fn clear_affinity(
    State(state): State<AppState>,
    Json(filter): Json<AffinityFilter>,
) -> Response {
    match state.affinity.clear_mappings(&filter) {
        Ok(removed) => Json(json!({ "removed": removed })).into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": { "message": e.to_string() } })),
        )
            .into_response(),
    }
}
