//! # Consumer向けHTTPクライアント群
//!
//! 署名付きHTTPクライアントの上に載る値ストア・結果送信・CVMハートビートの
//! 薄いクライアント。いずれもジョブコンテキスト経由でハンドラに渡される。

use challenge_types::JobReport;

use crate::error::HttpError;
use crate::http_client::SignedHttpClient;

/// チャレンジ単位の永続値ストアクライアント。
#[derive(Clone)]
pub struct ValuesClient {
    http: SignedHttpClient,
    challenge_id: String,
}

impl ValuesClient {
    /// クライアントを構築する。
    pub fn new(http: SignedHttpClient, challenge_id: impl Into<String>) -> Self {
        Self {
            http,
            challenge_id: challenge_id.into(),
        }
    }

    /// キーに対応する値を取得する。存在しない場合はNone。
    pub async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, HttpError> {
        let response = self
            .http
            .post(
                &format!("/values/{}", self.challenge_id),
                &serde_json::json!({ "key": key }),
            )
            .await?;
        let json = response.json()?;
        Ok(match json.get("value") {
            None | Some(serde_json::Value::Null) => None,
            Some(value) => Some(value.clone()),
        })
    }

    /// キーに値を設定する。
    pub async fn set(&self, key: &str, value: &serde_json::Value) -> Result<(), HttpError> {
        self.http
            .post(
                &format!("/values/{}", self.challenge_id),
                &serde_json::json!({ "key": key, "value": value }),
            )
            .await?;
        Ok(())
    }

    /// キーを削除する。
    pub async fn delete(&self, key: &str) -> Result<(), HttpError> {
        self.http
            .post(
                &format!("/values/{}/delete", self.challenge_id),
                &serde_json::json!({ "key": key }),
            )
            .await?;
        Ok(())
    }
}

/// ジョブ結果の送信クライアント。
/// 応答フレームとは独立した通知経路であり、送信失敗は応答フレームに影響しない。
#[derive(Clone)]
pub struct ResultsClient {
    http: SignedHttpClient,
}

impl ResultsClient {
    /// クライアントを構築する。
    pub fn new(http: SignedHttpClient) -> Self {
        Self { http }
    }

    /// 検証済みのジョブ結果を送信する。
    /// Consumer側はjob_idで重複排除するため、再送しても二重計上されない。
    pub async fn submit(&self, report: &JobReport) -> Result<(), HttpError> {
        let payload = serde_json::to_value(report)
            .map_err(|e| HttpError::Network(e.to_string()))?;
        self.http.post("/results/submit", &payload).await?;
        Ok(())
    }
}

/// CVMハートビートクライアント。
#[derive(Clone)]
pub struct CvmClient {
    http: SignedHttpClient,
    challenge_id: String,
}

impl CvmClient {
    /// クライアントを構築する。
    pub fn new(http: SignedHttpClient, challenge_id: impl Into<String>) -> Self {
        Self {
            http,
            challenge_id: challenge_id.into(),
        }
    }

    /// 生存通知を送る。
    pub async fn heartbeat(&self) -> Result<(), HttpError> {
        self.http
            .post(
                "/cvm/heartbeat",
                &serde_json::json!({ "challenge_id": self.challenge_id }),
            )
            .await?;
        Ok(())
    }
}
