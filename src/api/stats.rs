use crate::api::AppState;
use crate::api::schemas::stats::AppStats;
use axum::{Json, extract::State};

pub async fn app_stats(State(state): State<AppState>) -> Json<AppStats> {
    Json(state.engine.snapshot().into())
}
