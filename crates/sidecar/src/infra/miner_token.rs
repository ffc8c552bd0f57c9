//! # 公開エンドポイント用トークン検証
//!
//! コントロールプレーンのプロキシが公開エンドポイント呼び出しに付与する
//! ベアラートークンを検証する。トークンはクレームセットのJSON直列化に
//! 対するEd25519署名を持ち、検証鍵はハンドシェイクで記録したAdminの
//! 長期公開鍵に固定される。

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;

use challenge_crypto::{ed25519_verify, Ed25519Signature, Ed25519VerifyingKey};
use challenge_types::{MinerClaims, MinerToken};

use crate::error::SidecarError;
use crate::identity::b64;

/// 発行時刻の未来方向の許容スキュー（秒）
const FUTURE_SKEW_SECS: u64 = 30;

/// AuthorizationヘッダからMinerTokenを取り出す。
/// 形式: `Bearer <base64(JSON)>`
pub fn parse_bearer(header_value: &str) -> Result<MinerToken, SidecarError> {
    let encoded = header_value
        .strip_prefix("Bearer ")
        .ok_or_else(|| SidecarError::Unauthorized("Bearerトークンがありません".to_string()))?;
    let decoded = b64()
        .decode(encoded.trim())
        .map_err(|e| SidecarError::Unauthorized(format!("トークンのデコードに失敗: {e}")))?;
    serde_json::from_slice(&decoded)
        .map_err(|e| SidecarError::Unauthorized(format!("トークンのパースに失敗: {e}")))
}

/// トークンを検証し、検証済みクレームを返す。
///
/// 署名対象はクレームセットの正準JSON直列化（[`MinerClaims`]のフィールド順）。
/// TTLを超えた発行時刻は拒否する。
pub fn verify_miner_token(
    token: &MinerToken,
    admin_key: &Ed25519VerifyingKey,
    ttl: Duration,
) -> Result<MinerClaims, SidecarError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    if token.claims.issued_at > now + FUTURE_SKEW_SECS {
        return Err(SidecarError::Unauthorized(
            "トークンの発行時刻が未来です".to_string(),
        ));
    }
    if now.saturating_sub(token.claims.issued_at) > ttl.as_secs() {
        return Err(SidecarError::Unauthorized(
            "トークンの有効期限が切れています".to_string(),
        ));
    }

    let canonical = serde_json::to_vec(&token.claims)
        .map_err(|e| SidecarError::Internal(format!("クレームの直列化に失敗: {e}")))?;
    let sig_bytes: [u8; 64] = b64()
        .decode(&token.sig)
        .map_err(|e| SidecarError::Unauthorized(format!("sigのデコードに失敗: {e}")))?
        .try_into()
        .map_err(|_| {
            SidecarError::Unauthorized("sigは64バイトである必要があります".to_string())
        })?;
    let signature = Ed25519Signature::from_bytes(&sig_bytes);

    ed25519_verify(admin_key, &canonical, &signature)
        .map_err(|_| SidecarError::Unauthorized("トークン署名の検証に失敗しました".to_string()))?;

    Ok(token.claims.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    use challenge_crypto::{ed25519_sign, Ed25519SigningKey};

    fn issue_token(key: &Ed25519SigningKey, issued_at: u64) -> MinerToken {
        let claims = MinerClaims {
            uid: 42,
            miner_hotkey: "miner-hk".to_string(),
            job_id: "j1".to_string(),
            challenge_id: "c1".to_string(),
            job_type: "eval".to_string(),
            issued_at,
        };
        let canonical = serde_json::to_vec(&claims).unwrap();
        let signature = ed25519_sign(key, &canonical);
        MinerToken {
            claims,
            sig: b64().encode(signature.to_bytes()),
        }
    }

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    /// 正当なトークンが検証を通ることを確認
    #[test]
    fn test_valid_token() {
        let key = Ed25519SigningKey::generate(&mut rand::rngs::OsRng);
        let token = issue_token(&key, now());
        let claims =
            verify_miner_token(&token, &key.verifying_key(), Duration::from_secs(120)).unwrap();
        assert_eq!(claims.uid, 42);
        assert_eq!(claims.miner_hotkey, "miner-hk");
    }

    /// TTL超過トークンが拒否されることを確認
    #[test]
    fn test_expired_token() {
        let key = Ed25519SigningKey::generate(&mut rand::rngs::OsRng);
        let token = issue_token(&key, now() - 300);
        let err = verify_miner_token(&token, &key.verifying_key(), Duration::from_secs(120))
            .unwrap_err();
        assert!(matches!(err, SidecarError::Unauthorized(_)));
    }

    /// 別鍵の署名・クレーム改竄が拒否されることを確認
    #[test]
    fn test_forged_token() {
        let key = Ed25519SigningKey::generate(&mut rand::rngs::OsRng);
        let other = Ed25519SigningKey::generate(&mut rand::rngs::OsRng);

        // Admin鍵以外で署名されたトークン
        let token = issue_token(&other, now());
        assert!(
            verify_miner_token(&token, &key.verifying_key(), Duration::from_secs(120)).is_err()
        );

        // クレーム改竄
        let mut token = issue_token(&key, now());
        token.claims.uid = 99;
        assert!(
            verify_miner_token(&token, &key.verifying_key(), Duration::from_secs(120)).is_err()
        );
    }

    /// Bearerヘッダのパースを確認
    #[test]
    fn test_parse_bearer() {
        let key = Ed25519SigningKey::generate(&mut rand::rngs::OsRng);
        let token = issue_token(&key, now());
        let encoded = b64().encode(serde_json::to_vec(&token).unwrap());

        let parsed = parse_bearer(&format!("Bearer {encoded}")).unwrap();
        assert_eq!(parsed.claims.uid, token.claims.uid);
        assert_eq!(parsed.sig, token.sig);

        assert!(parse_bearer("Basic abc").is_err());
        assert!(parse_bearer("Bearer !!!").is_err());
    }
}
