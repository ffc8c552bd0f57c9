//! # 署名付きリクエスト検証
//!
//! 署名付きHTTPクライアントが付与するヘッダ群を検証する。
//! 検証鍵はハンドシェイクで記録したピアの長期Ed25519公開鍵に限られる。
//!
//! ## 検証手順
//! 1. ヘッダの存在確認（欠落は401）
//! 2. タイムスタンプの鮮度（許容スキューを超えたら401）
//! 3. ノンスのリプレイキャッシュ照合（再利用は401）
//! 4. 公開鍵が信頼集合に含まれるか（含まれなければ403）
//! 5. 正準文字列の再構築とEd25519署名検証（不一致は401）
//!
//! 開発モードでは検証全体をスキップする。

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::http::HeaderMap;
use base64::Engine;

use challenge_crypto::{ed25519_verify, Ed25519Signature, Ed25519VerifyingKey};

use crate::error::SidecarError;
use crate::http_client::canonical_string;
use crate::identity::b64;

/// タイムスタンプの許容スキュー
const TIMESTAMP_SKEW: Duration = Duration::from_secs(120);
/// リプレイキャッシュの保持上限
const NONCE_CACHE_CAP: usize = 4096;

/// プロセス内ノンスリプレイキャッシュ。
#[derive(Debug, Default)]
pub struct NonceCache {
    seen: Mutex<HashSet<String>>,
}

impl NonceCache {
    /// 空のキャッシュを作る。
    pub fn new() -> Self {
        Self::default()
    }

    /// ノンスを記録する。既出ならfalse。
    /// 上限到達時は全消去する（以後のリプレイ窓はタイムスタンプ鮮度が覆う）。
    pub fn insert(&self, nonce: &str) -> bool {
        let mut seen = self
            .seen
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if seen.len() >= NONCE_CACHE_CAP {
            seen.clear();
        }
        seen.insert(nonce.to_string())
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, SidecarError> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| SidecarError::Unauthorized(format!("{name}ヘッダがありません")))
}

/// 署名付きリクエストを検証し、署名した公開鍵を返す。
#[allow(clippy::too_many_arguments)]
pub fn verify_signed_request(
    headers: &HeaderMap,
    method: &str,
    path: &str,
    body: &[u8],
    trusted: &[Ed25519VerifyingKey],
    nonce_cache: &NonceCache,
    dev_mode: bool,
) -> Result<Option<Ed25519VerifyingKey>, SidecarError> {
    if dev_mode {
        return Ok(None);
    }

    let signature_b64 = header_value(headers, "X-Signature")?;
    let timestamp = header_value(headers, "X-Timestamp")?;
    let nonce = header_value(headers, "X-Nonce")?;
    let public_key_b64 = header_value(headers, "X-Public-Key")?;

    // タイムスタンプ鮮度
    let ts: u64 = timestamp
        .parse()
        .map_err(|_| SidecarError::Unauthorized("X-Timestampが不正です".to_string()))?;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    if now.abs_diff(ts) > TIMESTAMP_SKEW.as_secs() {
        return Err(SidecarError::Unauthorized(
            "タイムスタンプが許容範囲外です".to_string(),
        ));
    }

    // ノンスリプレイ
    if !nonce_cache.insert(nonce) {
        return Err(SidecarError::Unauthorized(
            "ノンスが再利用されました".to_string(),
        ));
    }

    // 公開鍵の信頼確認
    let key_bytes: [u8; 32] = b64()
        .decode(public_key_b64)
        .map_err(|e| SidecarError::Unauthorized(format!("X-Public-Keyのデコードに失敗: {e}")))?
        .try_into()
        .map_err(|_| {
            SidecarError::Unauthorized("X-Public-Keyは32バイトである必要があります".to_string())
        })?;
    let verifying_key = Ed25519VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| SidecarError::Unauthorized(format!("X-Public-Keyが不正です: {e}")))?;
    if !trusted.contains(&verifying_key) {
        return Err(SidecarError::Forbidden(
            "ハンドシェイクで記録されていない鍵です".to_string(),
        ));
    }

    // 署名検証
    let sig_bytes: [u8; 64] = b64()
        .decode(signature_b64)
        .map_err(|e| SidecarError::Unauthorized(format!("X-Signatureのデコードに失敗: {e}")))?
        .try_into()
        .map_err(|_| {
            SidecarError::Unauthorized("X-Signatureは64バイトである必要があります".to_string())
        })?;
    let signature = Ed25519Signature::from_bytes(&sig_bytes);
    let canonical = canonical_string(method, path, body, timestamp, nonce);
    ed25519_verify(&verifying_key, canonical.as_bytes(), &signature)
        .map_err(|_| SidecarError::Unauthorized("署名の検証に失敗しました".to_string()))?;

    Ok(Some(verifying_key))
}
