//! /sdk/health ハンドラ実装

use std::sync::Arc;

use axum::extract::State;
use axum::Json;

use challenge_types::HealthResponse;

use crate::state::SidecarState;

/// /sdk/health エンドポイントハンドラ。認証なし。
pub async fn handle_health(State(state): State<Arc<SidecarState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: state.orchestrator.health_status().to_string(),
    })
}
