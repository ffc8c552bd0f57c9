//! /sdk/weights ハンドラ実装

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;

use challenge_types::{WeightsRequest, WeightsResponse};

use crate::error::SidecarError;
use crate::infra::request_auth::verify_signed_request;
use crate::registry::{default_weights, WeightsHandler};
use crate::state::SidecarState;

/// /sdk/weights エンドポイントハンドラ。
/// 署名ヘッダを検証し、on_weightsハンドラ（未登録なら既定計算）で
/// UID→重みを計算する。
pub async fn handle_weights(
    State(state): State<Arc<SidecarState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WeightsResponse>, SidecarError> {
    verify_signed_request(
        &headers,
        "POST",
        "/sdk/weights",
        &body,
        &state.manager.trusted_keys(),
        &state.nonce_cache,
        state.settings.dev_mode,
    )?;

    let request: WeightsRequest = serde_json::from_slice(&body)
        .map_err(|e| SidecarError::BadRequest(format!("WeightsRequestのパースに失敗: {e}")))?;

    let weights = match state.registry.on_weights() {
        None => default_weights(&request.jobs),
        Some(WeightsHandler::Async(f)) => f(request.jobs)
            .await
            .map_err(|e| SidecarError::Internal(format!("weightsハンドラが失敗: {e}")))?,
        Some(WeightsHandler::Blocking(f)) => {
            let f = Arc::clone(f);
            tokio::task::spawn_blocking(move || f(request.jobs))
                .await
                .map_err(|e| SidecarError::Internal(format!("weightsハンドラが異常終了: {e}")))?
                .map_err(|e| SidecarError::Internal(format!("weightsハンドラが失敗: {e}")))?
        }
    };

    Ok(Json(WeightsResponse { weights }))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::Settings;
    use crate::endpoints::test_helpers::test_state_with;
    use crate::registry::ChallengeRegistry;

    fn dev_settings() -> Settings {
        let mut settings = Settings::for_tests();
        settings.dev_mode = true;
        settings
    }

    /// 既定のweights計算が使われることを確認（開発モードで認証スキップ）
    #[tokio::test]
    async fn test_default_weights_path() {
        let state = test_state_with(dev_settings(), ChallengeRegistry::new()).await;

        let body = serde_json::to_vec(&serde_json::json!({
            "jobs": [
                {"uid": 1, "score": 0.9},
                {"uid": 2, "score": -1.0},
            ]
        }))
        .unwrap();

        let response = handle_weights(State(state), HeaderMap::new(), Bytes::from(body))
            .await
            .unwrap();
        assert_eq!(response.0.weights.get("1"), Some(&0.9));
        assert_eq!(response.0.weights.get("2"), Some(&0.0));
    }

    /// 登録済みハンドラが優先されることを確認
    #[tokio::test]
    async fn test_registered_handler_used() {
        let mut registry = ChallengeRegistry::new();
        registry.register_weights(WeightsHandler::Blocking(Arc::new(|jobs| {
            let mut weights = std::collections::BTreeMap::new();
            weights.insert("all".to_string(), jobs.len() as f64);
            Ok(weights)
        })));
        let state = test_state_with(dev_settings(), registry).await;

        let body = serde_json::to_vec(&serde_json::json!({"jobs": [{}, {}]})).unwrap();
        let response = handle_weights(State(state), HeaderMap::new(), Bytes::from(body))
            .await
            .unwrap();
        assert_eq!(response.0.weights.get("all"), Some(&2.0));
    }

    /// 署名なしリクエストが非開発モードで拒否されることを確認
    #[tokio::test]
    async fn test_unsigned_rejected() {
        let state = test_state_with(Settings::for_tests(), ChallengeRegistry::new()).await;
        let body = serde_json::to_vec(&serde_json::json!({"jobs": []})).unwrap();
        let err = handle_weights(State(state), HeaderMap::new(), Bytes::from(body))
            .await
            .unwrap_err();
        assert!(matches!(err, SidecarError::Unauthorized(_)));
    }
}
