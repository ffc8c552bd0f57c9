//! # 署名付きHTTPクライアント
//!
//! 全ての外向きHTTP呼び出しに正準文字列へのEd25519署名と
//! アンチリプレイヘッダを付与する。
//!
//! ## 正準文字列
//! ```text
//! METHOD '\n' PATH '\n' hex(SHA-256(body)) '\n' timestamp '\n' nonce
//! ```
//!
//! ## ヘッダ
//! | ヘッダ | 内容 |
//! |--------|------|
//! | `X-Signature` | Base64エンコードされたEd25519署名 |
//! | `X-Timestamp` | UNIX秒（10進） |
//! | `X-Nonce` | 16バイトのhex乱数 |
//! | `X-Public-Key` | Base64エンコードされたEd25519公開鍵 |
//! | `X-Session-Token` | ブートストラップで付与されたセッショントークン |
//!
//! 冪等動詞（GET, PUT）のみトランスポート障害時に最大3回まで指数バックオフで
//! 再試行する。認証失敗・ステータスエラーは再試行しない。

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;

use challenge_crypto::{ed25519_sign, sha256, Ed25519SigningKey};

use crate::error::HttpError;
use crate::identity::b64;

/// リクエストタイムアウトの既定値
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// 冪等動詞の最大試行回数
const MAX_ATTEMPTS: u32 = 3;
/// バックオフの初期値
const BACKOFF_BASE: Duration = Duration::from_millis(500);
/// エラーレスポンスボディの保持上限
const ERROR_BODY_LIMIT: usize = 4096;

/// HTTPメソッド。冪等性の判定に使用する。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
}

impl Method {
    fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
        }
    }

    /// トランスポート障害時に再試行してよい動詞かどうか。
    fn is_idempotent(&self) -> bool {
        matches!(self, Method::Get | Method::Put)
    }
}

/// 署名済みレスポンス。
#[derive(Debug)]
pub struct HttpResponse {
    /// HTTPステータスコード
    pub status: u16,
    /// レスポンスボディ
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// ボディをJSONとして解釈する。
    pub fn json(&self) -> Result<serde_json::Value, HttpError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| HttpError::Network(format!("JSONのパースに失敗: {e}")))
    }
}

/// 署名付きHTTPクライアント。
#[derive(Clone)]
pub struct SignedHttpClient {
    base_url: String,
    signing: Arc<Ed25519SigningKey>,
    session_token: String,
    client: reqwest::Client,
}

impl SignedHttpClient {
    /// クライアントを構築する。
    pub fn new(
        base_url: impl Into<String>,
        signing: Arc<Ed25519SigningKey>,
        session_token: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into(),
            signing,
            session_token: session_token.into(),
            client,
        }
    }

    /// 署名付きGET。
    pub async fn get(&self, path: &str) -> Result<HttpResponse, HttpError> {
        self.request(Method::Get, path, None).await
    }

    /// 署名付きPOST。
    pub async fn post(
        &self,
        path: &str,
        json: &serde_json::Value,
    ) -> Result<HttpResponse, HttpError> {
        let body =
            serde_json::to_vec(json).map_err(|e| HttpError::Network(e.to_string()))?;
        self.request(Method::Post, path, Some(body)).await
    }

    /// 署名付きPUT。
    pub async fn put(
        &self,
        path: &str,
        json: &serde_json::Value,
    ) -> Result<HttpResponse, HttpError> {
        let body =
            serde_json::to_vec(json).map_err(|e| HttpError::Network(e.to_string()))?;
        self.request(Method::Put, path, Some(body)).await
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<HttpResponse, HttpError> {
        let body = body.unwrap_or_default();
        let max_attempts = if method.is_idempotent() {
            MAX_ATTEMPTS
        } else {
            1
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.send_once(method, path, &body).await {
                Ok(response) => return Ok(response),
                // 認証拒否・ステータスエラーは再試行しない
                Err(e @ (HttpError::Status { .. } | HttpError::SignatureRejected)) => {
                    return Err(e)
                }
                Err(HttpError::Network(reason)) => {
                    if attempt >= max_attempts {
                        return Err(HttpError::Network(reason));
                    }
                    let backoff = BACKOFF_BASE * 2u32.pow(attempt - 1);
                    tracing::debug!(
                        path,
                        attempt,
                        "HTTP再試行します（{}ms後）: {reason}",
                        backoff.as_millis()
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    async fn send_once(
        &self,
        method: Method,
        path: &str,
        body: &[u8],
    ) -> Result<HttpResponse, HttpError> {
        let url = format!("{}{}", self.base_url, path);
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            .to_string();
        let nonce = hex::encode(
            challenge_crypto::random_bytes(16)
                .map_err(|e| HttpError::Network(e.to_string()))?,
        );

        let canonical = canonical_string(method.as_str(), path, body, &timestamp, &nonce);
        let signature = ed25519_sign(&self.signing, canonical.as_bytes());

        let request = match method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
            Method::Put => self.client.put(&url),
        };
        let response = request
            .header("Content-Type", "application/json")
            .header("X-Signature", b64().encode(signature.to_bytes()))
            .header("X-Timestamp", timestamp.as_str())
            .header("X-Nonce", nonce.as_str())
            .header(
                "X-Public-Key",
                b64().encode(self.signing.verifying_key().to_bytes()),
            )
            .header("X-Session-Token", self.session_token.as_str())
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| HttpError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| HttpError::Network(e.to_string()))?
            .to_vec();

        if status == 401 || status == 403 {
            return Err(HttpError::SignatureRejected);
        }
        if status >= 400 {
            let text: String = String::from_utf8_lossy(&body)
                .chars()
                .take(ERROR_BODY_LIMIT)
                .collect();
            return Err(HttpError::Status { code: status, body: text });
        }
        Ok(HttpResponse { status, body })
    }
}

/// 正準文字列を構築する。署名と検証の双方で同じ形を使う。
pub fn canonical_string(
    method: &str,
    path: &str,
    body: &[u8],
    timestamp: &str,
    nonce: &str,
) -> String {
    format!(
        "{method}\n{path}\n{}\n{timestamp}\n{nonce}",
        hex::encode(sha256(body))
    )
}
