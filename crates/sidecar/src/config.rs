//! # サイドカー設定
//!
//! 環境変数からランタイム設定を読み込む。
//! 運用系は `SDK_` プレフィックス、チャレンジ固有の識別子は
//! `CHALLENGE_` / `VALIDATOR_` プレフィックスを使用する。

use std::time::Duration;

use crate::error::ConfigError;

/// ジョブデッドラインの既定値（秒）
pub const DEFAULT_JOB_DEADLINE_SECS: u64 = 300;
/// 並列ジョブ数の既定値
pub const DEFAULT_MAX_PARALLEL_JOBS: usize = 1;
/// ハートビート間隔の既定値（秒）
pub const DEFAULT_HEARTBEAT_SECS: u64 = 15;
/// フレームサイズ上限の既定値: 16MiB
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;
/// 送信キュー長の既定値
pub const DEFAULT_OUTBOUND_QUEUE: usize = 1024;
/// ジョブログ合計サイズ上限の既定値: 1MiB
pub const DEFAULT_MAX_LOG_BYTES: usize = 1024 * 1024;
/// 公開エンドポイントトークンTTLの既定値（秒）
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 120;
/// Attestation拒否の再試行上限の既定値
pub const DEFAULT_ATTESTATION_RETRIES: u32 = 3;
/// ドレイン待機上限の既定値（秒）
pub const DEFAULT_DRAIN_DEADLINE_SECS: u64 = 30;
/// ORM応答待ちの既定値（秒）
pub const DEFAULT_ORM_TIMEOUT_SECS: u64 = 30;
/// HTTPサーバーポートの既定値
pub const DEFAULT_HTTP_PORT: u16 = 10000;
/// ピアトランスポートポートの既定値
pub const DEFAULT_PEER_PORT: u16 = 10001;

/// サイドカーのランタイム設定。起動時に一度だけ構築され、以後は読み取り専用。
#[derive(Debug, Clone)]
pub struct Settings {
    /// Consumer（バリデータ）のベースURL
    pub consumer_base_url: String,
    /// ブートストラップ時に付与されたセッショントークン
    pub session_token: String,
    /// 既定のジョブID（ライフサイクルフック用コンテキストに使用）
    pub job_id: String,
    /// チャレンジID
    pub challenge_id: String,
    /// チャレンジ名（マイグレーションスキーマ名に使用）
    pub challenge_name: String,
    /// バリデータのホットキー
    pub validator_hotkey: String,
    /// HTTPサーバーを起動するかどうか
    pub run_server: bool,
    /// Admin機能（公開エンドポイント登録）を有効にするかどうか
    pub admin_mode: bool,
    /// 開発モード。AttestationをスタブしAEADを無効化する
    pub dev_mode: bool,
    /// 開発モードでAdminピア接続中のServing遷移を明示的に許可する
    pub allow_insecure_admin: bool,
    /// HTTPサーバーのバインドホスト
    pub host: String,
    /// HTTPサーバーのポート
    pub port: u16,
    /// ピアトランスポートのポート
    pub peer_port: u16,
    /// データベースバージョン（1..=16）
    pub db_version: u32,
    /// ジョブデッドライン
    pub job_deadline: Duration,
    /// 並列ジョブ数の上限
    pub max_parallel_jobs: usize,
    /// ハートビート間隔
    pub heartbeat_interval: Duration,
    /// フレームサイズ上限（バイト）
    pub max_frame_bytes: usize,
    /// セッションごとの送信キュー長
    pub outbound_queue: usize,
    /// ジョブログ合計サイズ上限（バイト）
    pub max_log_bytes: usize,
    /// 公開エンドポイントトークンのTTL
    pub token_ttl: Duration,
    /// Attestation拒否の再試行上限
    pub attestation_retries: u32,
    /// ドレイン待機の上限
    pub drain_deadline: Duration,
    /// ORM応答待ちの上限
    pub orm_timeout: Duration,
}

impl Settings {
    /// 環境変数から設定を構築する。不正値は[`ConfigError`]（終了コード2）。
    pub fn from_env() -> Result<Self, ConfigError> {
        let db_version = parse_env_i64("SDK_DB_VERSION", 1)?;
        if !(1..=16).contains(&db_version) {
            return Err(ConfigError::DbVersion(db_version));
        }

        Ok(Self {
            consumer_base_url: env_or("SDK_CONSUMER_BASE_URL", "http://127.0.0.1:9000"),
            session_token: env_or("SDK_SESSION_TOKEN", ""),
            job_id: env_or("SDK_JOB_ID", ""),
            challenge_id: env_or("CHALLENGE_ID", "challenge"),
            challenge_name: env_or("CHALLENGE_NAME", "challenge"),
            validator_hotkey: env_or("VALIDATOR_HOTKEY", ""),
            run_server: parse_env_bool("SDK_RUN_SERVER", true)?,
            admin_mode: parse_env_bool("CHALLENGE_ADMIN", false)?,
            dev_mode: parse_env_bool("SDK_DEV_MODE", false)?,
            allow_insecure_admin: parse_env_bool("SDK_ALLOW_INSECURE_ADMIN", false)?,
            host: env_or("SDK_HOST", "0.0.0.0"),
            port: parse_env_u16("SDK_PORT", DEFAULT_HTTP_PORT)?,
            peer_port: parse_env_u16("SDK_PEER_PORT", DEFAULT_PEER_PORT)?,
            db_version: db_version as u32,
            job_deadline: Duration::from_secs(parse_env_u64(
                "SDK_JOB_DEADLINE_SECS",
                DEFAULT_JOB_DEADLINE_SECS,
            )?),
            max_parallel_jobs: parse_env_usize(
                "SDK_MAX_PARALLEL_JOBS",
                DEFAULT_MAX_PARALLEL_JOBS,
            )?
            .max(1),
            heartbeat_interval: Duration::from_secs(parse_env_u64(
                "SDK_HEARTBEAT_SECS",
                DEFAULT_HEARTBEAT_SECS,
            )?),
            max_frame_bytes: parse_env_usize("SDK_MAX_FRAME_BYTES", DEFAULT_MAX_FRAME_BYTES)?,
            outbound_queue: parse_env_usize("SDK_OUTBOUND_QUEUE", DEFAULT_OUTBOUND_QUEUE)?.max(1),
            max_log_bytes: parse_env_usize("SDK_MAX_LOG_BYTES", DEFAULT_MAX_LOG_BYTES)?,
            token_ttl: Duration::from_secs(parse_env_u64(
                "SDK_TOKEN_TTL_SECS",
                DEFAULT_TOKEN_TTL_SECS,
            )?),
            attestation_retries: parse_env_u64(
                "SDK_ATTESTATION_RETRIES",
                u64::from(DEFAULT_ATTESTATION_RETRIES),
            )? as u32,
            drain_deadline: Duration::from_secs(parse_env_u64(
                "SDK_DRAIN_DEADLINE_SECS",
                DEFAULT_DRAIN_DEADLINE_SECS,
            )?),
            orm_timeout: Duration::from_secs(parse_env_u64(
                "SDK_ORM_TIMEOUT_SECS",
                DEFAULT_ORM_TIMEOUT_SECS,
            )?),
        })
    }

    /// テスト・組み込み用の既定設定。
    pub fn for_tests() -> Self {
        Self {
            consumer_base_url: "http://127.0.0.1:0".to_string(),
            session_token: "test-session".to_string(),
            job_id: String::new(),
            challenge_id: "test-challenge".to_string(),
            challenge_name: "test_challenge".to_string(),
            validator_hotkey: "hotkey".to_string(),
            run_server: false,
            admin_mode: true,
            dev_mode: false,
            allow_insecure_admin: false,
            host: "127.0.0.1".to_string(),
            port: 0,
            peer_port: 0,
            db_version: 1,
            job_deadline: Duration::from_secs(DEFAULT_JOB_DEADLINE_SECS),
            max_parallel_jobs: DEFAULT_MAX_PARALLEL_JOBS,
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            max_log_bytes: DEFAULT_MAX_LOG_BYTES,
            token_ttl: Duration::from_secs(DEFAULT_TOKEN_TTL_SECS),
            attestation_retries: DEFAULT_ATTESTATION_RETRIES,
            drain_deadline: Duration::from_secs(DEFAULT_DRAIN_DEADLINE_SECS),
            orm_timeout: Duration::from_secs(DEFAULT_ORM_TIMEOUT_SECS),
        }
    }
}

fn env_or(name: &'static str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_env_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(v) => match v.to_ascii_lowercase().as_str() {
            "" => Ok(default),
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            other => Err(ConfigError::Invalid {
                name,
                reason: format!("真偽値として解釈できません: {other}"),
            }),
        },
    }
}

fn parse_env_i64(name: &'static str, default: i64) -> Result<i64, ConfigError> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(v) if v.is_empty() => Ok(default),
        Ok(v) => v.parse::<i64>().map_err(|e| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
    }
}

fn parse_env_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(v) if v.is_empty() => Ok(default),
        Ok(v) => v.parse::<u64>().map_err(|e| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
    }
}

fn parse_env_u16(name: &'static str, default: u16) -> Result<u16, ConfigError> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(v) if v.is_empty() => Ok(default),
        Ok(v) => v.parse::<u16>().map_err(|e| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
    }
}

fn parse_env_usize(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(v) if v.is_empty() => Ok(default),
        Ok(v) => v.parse::<usize>().map_err(|e| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    /// 環境変数を触るテストの直列化用ロック
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    /// 範囲外のデータベースバージョンが拒否されることを確認
    #[test]
    fn test_db_version_bounds() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("SDK_DB_VERSION", "17");
        let result = Settings::from_env();
        assert!(matches!(result, Err(ConfigError::DbVersion(17))));

        std::env::set_var("SDK_DB_VERSION", "0");
        let result = Settings::from_env();
        assert!(matches!(result, Err(ConfigError::DbVersion(0))));

        std::env::set_var("SDK_DB_VERSION", "16");
        let settings = Settings::from_env().unwrap();
        assert_eq!(settings.db_version, 16);

        std::env::remove_var("SDK_DB_VERSION");
    }

    /// 既定値が適用されることを確認
    #[test]
    fn test_defaults() {
        let settings = Settings::for_tests();
        assert_eq!(settings.job_deadline, Duration::from_secs(300));
        assert_eq!(settings.max_parallel_jobs, 1);
        assert_eq!(settings.max_frame_bytes, 16 * 1024 * 1024);
        assert_eq!(settings.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(settings.outbound_queue, 1024);
    }

    /// 真偽値の解釈を確認
    #[test]
    fn test_bool_parsing() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("SDK_DEV_MODE", "true");
        assert!(Settings::from_env().unwrap().dev_mode);
        std::env::set_var("SDK_DEV_MODE", "0");
        assert!(!Settings::from_env().unwrap().dev_mode);
        std::env::set_var("SDK_DEV_MODE", "banana");
        assert!(Settings::from_env().is_err());
        std::env::remove_var("SDK_DEV_MODE");
    }
}
