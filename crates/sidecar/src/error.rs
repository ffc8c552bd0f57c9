//! # サイドカー エラー型
//!
//! エラー分類ごとにthiserror列挙型を定義する。
//!
//! ## 伝播ポリシー
//! - トランスポート・セッション層のエラーはセッション破棄と再接続で局所回復する
//! - ハンドラ層のエラーは応答フレームのフィールドになる（プロセスは落ちない）
//! - 設定エラーとエントロピー枯渇はプロセス致命
//! - ワイヤにはスタックトレースを流さず、安定タグと任意メッセージのみを送る

use axum::http::StatusCode;

use challenge_types::PeerRole;

// ---------------------------------------------------------------------------
// 設定エラー（終了コード2）
// ---------------------------------------------------------------------------

/// 設定の不備。プロセス致命。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// 必須オプションが未設定
    #[error("必須オプションが未設定です: {0}")]
    Missing(&'static str),
    /// オプションの値が不正
    #[error("オプション {name} の値が不正です: {reason}")]
    Invalid {
        /// オプション名
        name: &'static str,
        /// 不正の内容
        reason: String,
    },
    /// データベースバージョンが[1, 16]の範囲外
    #[error("データベースバージョンが範囲外です（1..=16）: {0}")]
    DbVersion(i64),
}

// ---------------------------------------------------------------------------
// Attestationエラー（再接続 → 終了コード3）
// ---------------------------------------------------------------------------

/// TEE QuoteまたはピアによるAttestation拒否。
#[derive(Debug, thiserror::Error)]
pub enum AttestationError {
    /// TEEドライバが利用できずQuoteを取得できない
    #[error("TEE Quoteを取得できません: {0}")]
    QuoteUnavailable(String),
    /// ピアがAttestationを拒否した
    #[error("ピアがAttestationを拒否しました: {0}")]
    Rejected(String),
}

// ---------------------------------------------------------------------------
// トランスポートエラー（セッション致命 → 再接続）
// ---------------------------------------------------------------------------

/// 暗号化トランスポートのエラー。いずれもセッションを閉じる。
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// シーケンス番号の重複・欠落（リプレイの疑い）
    #[error("シーケンス番号が不正です（期待: {expected}, 受信: {got}）")]
    Replay {
        /// 期待したシーケンス番号
        expected: u64,
        /// 実際に受信したシーケンス番号
        got: u64,
    },
    /// AEAD認証失敗
    #[error("フレームの認証に失敗しました")]
    Integrity,
    /// フレームサイズ超過（復号前に拒否）
    #[error("フレームサイズが上限を超えています: {len} bytes (上限: {max} bytes)")]
    Oversize {
        /// 宣言されたフレーム長
        len: usize,
        /// 設定上の上限
        max: usize,
    },
    /// ハートビート途絶
    #[error("ピアからのフレームが途絶しました")]
    Idle,
    /// ハンドシェイクの手順違反・不正メッセージ
    #[error("ハンドシェイクに失敗しました: {0}")]
    Handshake(String),
    /// セッションが存在しない・既に閉じられている
    #[error("ロール {0} のセッションがありません")]
    Closed(PeerRole),
    /// フレームペイロードのデコード失敗
    #[error("フレームのデコードに失敗しました: {0}")]
    Codec(String),
    /// 下位I/Oエラー
    #[error("I/Oエラー: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// ORMエラー（ハンドラにそのまま渡る）
// ---------------------------------------------------------------------------

/// ORMブリッジのエラー。ハンドラに逐語的に返される。
#[derive(Debug, thiserror::Error)]
pub enum OrmError {
    /// ポリシーで許可されていないカラム・テーブル
    #[error("ポリシーで許可されていません: {0}")]
    Forbidden(String),
    /// Adminセッションが存在しないため書き込み不可
    #[error("Adminセッションがないため書き込みできません")]
    NoAdmin,
    /// WHERE句のないDELETE
    #[error("WHERE句のないDELETEは拒否されます")]
    UnsafeDelete,
    /// 対象行が存在しない
    #[error("対象が見つかりません: {0}")]
    NotFound(String),
    /// 制約違反
    #[error("制約違反: {0}")]
    Constraint(String),
    /// クエリ構造がピア側で拒否された
    #[error("クエリが拒否されました: {0}")]
    SyntaxRejected(String),
    /// 応答待ちタイムアウト
    #[error("ORM応答がタイムアウトしました")]
    Timeout,
    /// 応答前にセッションが破棄された（再送はしない）
    #[error("応答前にピアセッションが閉じられました")]
    SessionClosed,
}

impl From<challenge_types::OrmFailureKind> for OrmError {
    fn from(kind: challenge_types::OrmFailureKind) -> Self {
        use challenge_types::OrmFailureKind;
        match kind {
            OrmFailureKind::NotFound => OrmError::NotFound(String::new()),
            OrmFailureKind::Constraint => OrmError::Constraint(String::new()),
            OrmFailureKind::SyntaxRejected => OrmError::SyntaxRejected(String::new()),
            OrmFailureKind::Timeout => OrmError::Timeout,
        }
    }
}

impl OrmError {
    /// ピアからの構造化エラーをメッセージ付きで写像する。
    pub fn from_failure(kind: challenge_types::OrmFailureKind, message: String) -> Self {
        use challenge_types::OrmFailureKind;
        match kind {
            OrmFailureKind::NotFound => OrmError::NotFound(message),
            OrmFailureKind::Constraint => OrmError::Constraint(message),
            OrmFailureKind::SyntaxRejected => OrmError::SyntaxRejected(message),
            OrmFailureKind::Timeout => OrmError::Timeout,
        }
    }
}

// ---------------------------------------------------------------------------
// ジョブエラー（Consumerへの応答フレームに載る）
// ---------------------------------------------------------------------------

/// ジョブ実行のエラー。プロセスを落とすことはない。
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// 該当するハンドラが登録されていない
    #[error("ジョブハンドラが登録されていません")]
    NoHandler,
    /// Serving状態以外でのジョブ要求
    #[error("サイドカーがServing状態ではありません")]
    NotReady,
    /// ハンドラの返却値が不正
    #[error("ハンドラの返却値が不正です")]
    InvalidResult,
    /// ジョブのデッドライン超過
    #[error("ジョブがデッドラインを超過しました")]
    Timeout,
}

impl JobError {
    /// 応答フレームのerrorフィールドに載せる安定タグ。
    pub fn wire_tag(&self) -> &'static str {
        match self {
            JobError::NoHandler => "no_handler",
            JobError::NotReady => "not_ready",
            JobError::InvalidResult => "invalid_result",
            JobError::Timeout => "timeout",
        }
    }
}

// ---------------------------------------------------------------------------
// 署名付きHTTPエラー
// ---------------------------------------------------------------------------

/// 署名付きHTTPクライアントのエラー。
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    /// HTTPステータス >= 400
    #[error("HTTPエラー: {code}")]
    Status {
        /// HTTPステータスコード
        code: u16,
        /// レスポンスボディ（先頭のみ）
        body: String,
    },
    /// トランスポート障害（冪等動詞のみ再試行対象）
    #[error("HTTP通信に失敗しました: {0}")]
    Network(String),
    /// 署名が拒否された（再試行しない）
    #[error("リクエスト署名が拒否されました")]
    SignatureRejected,
}

// ---------------------------------------------------------------------------
// HTTPエンドポイント用エラー
// ---------------------------------------------------------------------------

/// axumエンドポイント共通のエラー型。
#[derive(Debug, thiserror::Error)]
pub enum SidecarError {
    /// 不正なリクエスト（パース失敗、Base64デコード失敗等）
    #[error("不正なリクエスト: {0}")]
    BadRequest(String),
    /// 認証失敗（署名ヘッダ不足・署名不一致・トークン期限切れ）
    #[error("認証に失敗しました: {0}")]
    Unauthorized(String),
    /// 権限不足（鍵は正当だがロールが不一致）
    #[error("権限がありません: {0}")]
    Forbidden(String),
    /// 対象が存在しない
    #[error("見つかりません: {0}")]
    NotFound(String),
    /// サーバー状態が不正（まだServingに達していない等）
    #[error("サーバーが要求を受け付けられる状態ではありません: {0}")]
    Unavailable(String),
    /// 内部エラー
    #[error("内部エラー: {0}")]
    Internal(String),
}

impl axum::response::IntoResponse for SidecarError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            SidecarError::BadRequest(_) => StatusCode::BAD_REQUEST,
            SidecarError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            SidecarError::Forbidden(_) => StatusCode::FORBIDDEN,
            SidecarError::NotFound(_) => StatusCode::NOT_FOUND,
            SidecarError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            SidecarError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

// ---------------------------------------------------------------------------
// プロセス終了コード
// ---------------------------------------------------------------------------

/// ランタイム全体の終了理由。終了コードに写像される。
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// 設定エラー（終了コード2）
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// 回復不能なAttestation失敗（終了コード3）
    #[error(transparent)]
    Attestation(#[from] AttestationError),
    /// 再試行上限後のトランスポート失敗（終了コード4）
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl RunError {
    /// プロセス終了コード。正常ドレインは0。
    pub fn exit_code(&self) -> i32 {
        match self {
            RunError::Config(_) => 2,
            RunError::Attestation(_) => 3,
            RunError::Transport(_) => 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 終了コードの対応を確認
    #[test]
    fn test_exit_codes() {
        assert_eq!(RunError::from(ConfigError::DbVersion(17)).exit_code(), 2);
        assert_eq!(
            RunError::from(AttestationError::Rejected("replayed nonce".into())).exit_code(),
            3
        );
        assert_eq!(RunError::from(TransportError::Idle).exit_code(), 4);
    }

    /// ジョブエラーのワイヤタグを確認
    #[test]
    fn test_job_error_tags() {
        assert_eq!(JobError::NotReady.wire_tag(), "not_ready");
        assert_eq!(JobError::Timeout.wire_tag(), "timeout");
        assert_eq!(JobError::NoHandler.wire_tag(), "no_handler");
    }

    /// ピア失敗種別の写像を確認
    #[test]
    fn test_orm_failure_mapping() {
        use challenge_types::OrmFailureKind;
        assert!(matches!(
            OrmError::from_failure(OrmFailureKind::Constraint, "dup key".into()),
            OrmError::Constraint(_)
        ));
        assert!(matches!(
            OrmError::from_failure(OrmFailureKind::Timeout, String::new()),
            OrmError::Timeout
        ));
    }
}
