//! # ハンドラコンテキスト
//!
//! ジョブハンドラに渡される不変のクライアント束。寿命は1ジョブ呼び出し。
//! ライフサイクルフックには設定値から構築した既定コンテキストを渡す。

use std::sync::Arc;

use challenge_crypto::Ed25519SigningKey;
use challenge_types::{JobRequest, MinerClaims};

use crate::clients::{CvmClient, ResultsClient, ValuesClient};
use crate::config::Settings;
use crate::http_client::SignedHttpClient;
use crate::orm::OrmClient;

/// ジョブハンドラ・ライフサイクルフックに渡されるコンテキスト。
#[derive(Clone)]
pub struct Context {
    /// ConsumerのベースURL
    pub consumer_base_url: String,
    /// セッショントークン
    pub session_token: String,
    /// ジョブID
    pub job_id: String,
    /// チャレンジID
    pub challenge_id: String,
    /// バリデータのホットキー
    pub validator_hotkey: String,
    /// 署名付きHTTPクライアント
    pub signed_http: SignedHttpClient,
    /// CVMハートビートクライアント
    pub cvm: CvmClient,
    /// 値ストアクライアント
    pub values: ValuesClient,
    /// 結果送信クライアント
    pub results: ResultsClient,
    /// ORMクライアント
    pub orm: OrmClient,
}

impl Context {
    /// 設定値から既定コンテキストを構築する（ライフサイクルフック用）。
    pub fn from_settings(
        settings: &Settings,
        signing: Arc<Ed25519SigningKey>,
        orm: OrmClient,
    ) -> Self {
        let http = SignedHttpClient::new(
            settings.consumer_base_url.clone(),
            signing,
            settings.session_token.clone(),
        );
        Self {
            consumer_base_url: settings.consumer_base_url.clone(),
            session_token: settings.session_token.clone(),
            job_id: settings.job_id.clone(),
            challenge_id: settings.challenge_id.clone(),
            validator_hotkey: settings.validator_hotkey.clone(),
            cvm: CvmClient::new(http.clone(), settings.challenge_id.clone()),
            values: ValuesClient::new(http.clone(), settings.challenge_id.clone()),
            results: ResultsClient::new(http.clone()),
            signed_http: http,
            orm,
        }
    }

    /// ジョブ要求に合わせてコンテキストを特殊化する。
    /// セッショントークンはジョブ要求のものが優先される。
    pub fn for_job(
        &self,
        request: &JobRequest,
        signing: Arc<Ed25519SigningKey>,
    ) -> Self {
        let http = SignedHttpClient::new(
            self.consumer_base_url.clone(),
            signing,
            request.session_token.clone(),
        );
        Self {
            consumer_base_url: self.consumer_base_url.clone(),
            session_token: request.session_token.clone(),
            job_id: request.job_id.clone(),
            challenge_id: request.challenge_id.clone(),
            validator_hotkey: request.validator_hotkey.clone(),
            cvm: CvmClient::new(http.clone(), request.challenge_id.clone()),
            values: ValuesClient::new(http.clone(), request.challenge_id.clone()),
            results: ResultsClient::new(http.clone()),
            signed_http: http,
            orm: self.orm.clone(),
        }
    }
}

/// 公開エンドポイントハンドラに渡されるコンテキスト。
/// 検証済みトークンのクレームが注入される。
#[derive(Clone)]
pub struct PublicContext {
    /// 検証済みクレームセット
    pub claims: MinerClaims,
    /// チャレンジID
    pub challenge_id: String,
    /// ORMクライアント
    pub orm: OrmClient,
}
