//! /sdk/public/{name} ハンドラ実装

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;

use challenge_types::PeerRole;

use crate::context::PublicContext;
use crate::error::SidecarError;
use crate::infra::miner_token::{parse_bearer, verify_miner_token};
use crate::registry::PublicHandler;
use crate::state::SidecarState;

/// /sdk/public/{name} エンドポイントハンドラ。
///
/// プロキシ発行トークンをAdminの長期公開鍵で検証し、検証済みクレームを
/// ハンドラコンテキストへ注入する。
pub async fn handle_public(
    State(state): State<Arc<SidecarState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, SidecarError> {
    // 公開エンドポイントはAdminモードでのみ提供される
    if !state.settings.admin_mode {
        return Err(SidecarError::NotFound(
            "公開エンドポイントは無効です".to_string(),
        ));
    }

    let auth = headers
        .get("Authorization")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            SidecarError::Unauthorized("Authorizationヘッダがありません".to_string())
        })?;
    let token = parse_bearer(auth)?;

    // 検証鍵はハンドシェイクで記録したAdminの長期公開鍵に固定
    let admin_key = state.manager.peer_key(PeerRole::Admin).ok_or_else(|| {
        SidecarError::Unavailable("Admin鍵がまだ記録されていません".to_string())
    })?;
    let claims = verify_miner_token(&token, &admin_key, state.settings.token_ttl)?;

    let handler = state
        .registry
        .resolve_public(&name)
        .cloned()
        .ok_or_else(|| SidecarError::NotFound(format!("公開ハンドラがありません: {name}")))?;

    let payload: serde_json::Value = if body.is_empty() {
        serde_json::json!({})
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| SidecarError::BadRequest(format!("ボディのパースに失敗: {e}")))?
    };

    let ctx = PublicContext {
        claims,
        challenge_id: state.settings.challenge_id.clone(),
        orm: state.orm.clone(),
    };

    let result = match handler {
        PublicHandler::Async(f) => f(ctx, payload)
            .await
            .map_err(|e| SidecarError::Internal(format!("公開ハンドラが失敗: {e}")))?,
        PublicHandler::Blocking(f) => tokio::task::spawn_blocking(move || f(ctx, payload))
            .await
            .map_err(|e| SidecarError::Internal(format!("公開ハンドラが異常終了: {e}")))?
            .map_err(|e| SidecarError::Internal(format!("公開ハンドラが失敗: {e}")))?,
    };

    Ok(Json(result))
}
