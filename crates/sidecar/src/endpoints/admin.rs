//! /sdk/admin/db/credentials ハンドラ実装

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;

use challenge_types::{PeerRole, SealedCredentialsRequest, SealedCredentialsResponse};

use crate::error::SidecarError;
use crate::infra::request_auth::verify_signed_request;
use crate::state::SidecarState;

/// /sdk/admin/db/credentials エンドポイントハンドラ。
///
/// 署名検証の信頼鍵はAdminの長期公開鍵のみ。封緘済みDSNは
/// credentials.sealフレームと同じ経路でオーケストレータへ渡される。
pub async fn handle_db_credentials(
    State(state): State<Arc<SidecarState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<SealedCredentialsResponse>, SidecarError> {
    let trusted: Vec<_> = state.manager.peer_key(PeerRole::Admin).into_iter().collect();
    if trusted.is_empty() && !state.settings.dev_mode {
        return Err(SidecarError::Unavailable(
            "Adminセッションがまだ確立されていません".to_string(),
        ));
    }
    verify_signed_request(
        &headers,
        "POST",
        "/sdk/admin/db/credentials",
        &body,
        &trusted,
        &state.nonce_cache,
        state.settings.dev_mode,
    )?;

    let request: SealedCredentialsRequest = serde_json::from_slice(&body).map_err(|e| {
        SidecarError::BadRequest(format!("SealedCredentialsRequestのパースに失敗: {e}"))
    })?;

    if !(1..=16).contains(&request.version) {
        return Err(SidecarError::BadRequest(format!(
            "データベースバージョンが範囲外です: {}",
            request.version
        )));
    }
    if request.version != state.settings.db_version {
        return Err(SidecarError::BadRequest(format!(
            "データベースバージョンが設定と一致しません（設定: {}, 要求: {}）",
            state.settings.db_version, request.version
        )));
    }

    let accepted = state
        .orchestrator
        .accept_sealed_credentials(&state.identity, &request.sealed)?;
    Ok(Json(SealedCredentialsResponse { accepted }))
}
