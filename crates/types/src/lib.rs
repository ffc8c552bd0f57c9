//! # Challenge Sidecar 共有型定義
//!
//! Admin / Consumer ピアとの間で交換されるデータ構造をRust構造体として提供する。
//!
//! ## エンコーディング規則
//! - Base64: バイナリデータ（公開鍵、Quote、署名、暗号文等）
//! - JSON: ハンドシェイクメッセージおよび復号後のフレームペイロード
//! - 数値スコア・メトリクスは有限のf64のみ

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ピアロール
// ---------------------------------------------------------------------------

/// 接続ピアのロール。同時に各ロール1セッションのみ有効。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    /// 管理コントロールプレーン。ORM全権限・マイグレーション・封緘済みDB資格情報の配送。
    Admin,
    /// 評価コンシューマ。ORM読み取りとジョブ実行要求のみ。
    Consumer,
}

impl PeerRole {
    /// AADに埋め込むロールバイト。
    pub fn role_byte(&self) -> u8 {
        match self {
            PeerRole::Admin => b'A',
            PeerRole::Consumer => b'C',
        }
    }

    /// HKDF infoラベル等に使用するASCIIロール名。
    pub fn label(&self) -> &'static str {
        match self {
            PeerRole::Admin => "admin",
            PeerRole::Consumer => "consumer",
        }
    }
}

impl std::fmt::Display for PeerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// ---------------------------------------------------------------------------
// ハンドシェイクメッセージ（length-prefixed JSON）
// ---------------------------------------------------------------------------

/// Attestationハンドシェイク中に交換されるメッセージ。
/// AEAD確立前のため平文JSONで流れる。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandshakeMessage {
    /// ピア → サイドカー: ロール宣言・ノンス・ピアのX25519エフェメラル公開鍵。
    Hello(HelloMessage),
    /// サイドカー → ピア: 署名付きAttestationエンベロープ。
    Attestation(AttestationEnvelope),
    /// ピア → サイドカー: Attestation受理。HKDFソルトを配送する。
    Accept(HandshakeAccept),
    /// ピア → サイドカー: Attestation拒否。
    Reject(HandshakeReject),
}

/// ハンドシェイク開始メッセージ。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloMessage {
    /// ピアが宣言するロール
    pub role: PeerRole,
    /// Base64エンコードされた32バイトのAttestationノンス
    pub nonce: String,
    /// Base64エンコードされたピアのX25519エフェメラル公開鍵（32バイト）
    pub peer_x25519_pub: String,
    /// Base64エンコードされたピアの長期Ed25519公開鍵。
    /// 署名付きHTTP・公開エンドポイントトークンの検証鍵として記録される。
    pub peer_ed25519_pub: String,
}

/// 署名付きAttestationエンベロープ。
/// 署名は `nonce || ed25519_pub || x25519_pub || role_byte || quote || event_log`
/// の連結に対するEd25519署名。ピア受理後は破棄される。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationEnvelope {
    /// エンベロープが応答するロール宣言（helloのロールのエコー、署名対象に含まれる）
    pub role: PeerRole,
    /// Base64エンコードされた32バイトノンス（helloのエコー）
    pub nonce: String,
    /// Base64エンコードされた長期Ed25519公開鍵
    pub ed25519_pub: String,
    /// Base64エンコードされたセッション用X25519エフェメラル公開鍵
    pub x25519_pub: String,
    /// Base64エンコードされたTEE Quote（report_dataに両鍵とノンスを束縛）
    pub quote: String,
    /// Base64エンコードされたイベントログ（不透明バイト列）
    pub event_log: String,
    /// Base64エンコードされたEd25519署名
    pub signature: String,
}

/// Attestation受理。ここで配送されたソルトからセッション鍵を導出する。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeAccept {
    /// Base64エンコードされた32バイトHKDFソルト
    pub hkdf_salt: String,
}

/// Attestation拒否。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeReject {
    /// 拒否理由（ログ用、機密情報を含まない）
    pub reason: String,
}

// ---------------------------------------------------------------------------
// ピアフレームペイロード（AEAD復号後のJSON）
// ---------------------------------------------------------------------------

/// 暗号化フレームの復号後ペイロード。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    /// Consumer → サイドカー: ジョブ実行要求。
    JobExecute(JobRequest),
    /// サイドカー → Consumer: ジョブ結果。
    JobResult(JobReport),
    /// サイドカー → ピア: ORMクエリ要求。
    OrmRequest {
        /// 相関ID（16バイトhex）
        query_id: String,
        /// クエリ本体
        query: OrmQuery,
    },
    /// ピア → サイドカー: ORMクエリ成功応答。
    OrmResult {
        /// 対応する要求の相関ID
        query_id: String,
        /// 行セット
        result: QueryRows,
    },
    /// ピア → サイドカー: ORMクエリ失敗応答。
    OrmFailure {
        /// 対応する要求の相関ID
        query_id: String,
        /// 失敗種別
        kind: OrmFailureKind,
        /// 人間可読メッセージ
        message: String,
    },
    /// Admin → サイドカー: 設定バージョンのマイグレーション適用完了通知。
    MigrationsApply {
        /// 適用されたデータベースバージョン
        version: u32,
        /// 適用されたマイグレーションファイル名（辞書順）
        files: Vec<String>,
    },
    /// Admin → サイドカー: 封緘済みDB資格情報（sealed box）。
    CredentialsSeal {
        /// Base64エンコードされた封緘済みDSN
        sealed: String,
    },
    /// サイドカー → Admin: 資格情報の再送要求。
    CredentialsRequest,
    /// サイドカー → Admin: 適用済みORMポリシーの通知。
    PolicyAnnounce {
        /// テーブル名 → 許可ルール
        tables: BTreeMap<String, TableRuleWire>,
    },
    /// 双方向: ハートビート。
    Heartbeat,
}

// ---------------------------------------------------------------------------
// ジョブ要求・結果
// ---------------------------------------------------------------------------

/// Consumerからのジョブ実行要求。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    /// ジョブID（結果フレームとの相関に使用）
    pub job_id: String,
    /// チャレンジID
    pub challenge_id: String,
    /// 要求元バリデータのホットキー
    pub validator_hotkey: String,
    /// セッショントークン（署名付きHTTPで使用）
    pub session_token: String,
    /// 名前付きハンドラの指定（省略時はデフォルトハンドラ）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
    /// ハンドラに渡される構造化ペイロード
    pub payload: serde_json::Value,
}

/// ジョブ結果。応答フレームと結果エンドポイント送信の両方で同じ形を使う。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    /// 対応するジョブID
    pub job_id: String,
    /// スコア（[0, 1]にクランプ済み）
    pub score: f64,
    /// 有限値のみのフラットなメトリクスマップ
    pub metrics: BTreeMap<String, f64>,
    /// ジョブ種別
    pub job_type: String,
    /// ハンドラが出力したログ（バイト上限で切り詰め済み）
    #[serde(default)]
    pub logs: Vec<String>,
    /// ログ閲覧を許可するコンテナの一覧
    #[serde(default)]
    pub allowed_log_containers: Vec<String>,
    /// エラータグ（成功時はnull）
    pub error: Option<String>,
}

impl JobReport {
    /// エラーのみを持つ結果を構築する。スコアは0.0に固定される。
    pub fn failed(job_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            score: 0.0,
            metrics: BTreeMap::new(),
            job_type: String::new(),
            logs: Vec::new(),
            allowed_log_containers: Vec::new(),
            error: Some(error.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// ORMクエリモデル
// ---------------------------------------------------------------------------

/// ORM操作種別。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrmOperation {
    Select,
    Count,
    Insert,
    Update,
    Delete,
}

impl OrmOperation {
    /// 書き込み系操作かどうか。書き込みはAdminセッションにのみ送られる。
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            OrmOperation::Insert | OrmOperation::Update | OrmOperation::Delete
        )
    }
}

/// WHERE句のフィルタ条件。値はサーバー側でバインドされる。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryFilter {
    /// 対象カラム
    pub column: String,
    /// 比較演算子（"=", "<", ">", "<=", ">=", "!=", "like", "in"）
    pub operator: String,
    /// 比較値
    pub value: serde_json::Value,
}

/// ORDER BY句。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBy {
    /// 対象カラム
    pub column: String,
    /// ソート方向（"ASC" / "DESC"）
    pub direction: String,
}

/// INSERT / UPDATE用のカラム・値ペア。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnValue {
    /// 対象カラム
    pub column: String,
    /// 設定値
    pub value: serde_json::Value,
}

/// 構造化ORMクエリ。SQL文字列は一切流さない。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrmQuery {
    /// 操作種別
    pub operation: OrmOperation,
    /// テーブル名
    pub table: String,
    /// スキーマ名（省略時はピア側でチャレンジ既定スキーマを使用）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    /// 取得カラム（SELECT用。省略時は許可済み全カラム）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
    /// WHERE句フィルタ
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<QueryFilter>,
    /// ORDER BY句
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order_by: Vec<OrderBy>,
    /// LIMIT
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    /// OFFSET
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    /// INSERT用の値一覧
    #[serde(skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<ColumnValue>>,
    /// UPDATE用のSET値一覧
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set_values: Option<Vec<ColumnValue>>,
}

/// ORMクエリの行セット結果。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRows {
    /// 行の一覧（カラム名 → 値のマップ）
    #[serde(default)]
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
    /// 影響・取得行数
    #[serde(default)]
    pub row_count: u64,
    /// ピア側での実行時間（ミリ秒）
    #[serde(default)]
    pub execution_time_ms: u64,
}

/// ピアが返すORM失敗の種別。ブリッジ側のエラー型に1:1で写像される。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrmFailureKind {
    /// 対象行が存在しない
    NotFound,
    /// 制約違反
    Constraint,
    /// クエリ構造がピア側で拒否された
    SyntaxRejected,
    /// ピア側でのタイムアウト
    Timeout,
}

/// PolicyAnnounceで送るテーブルルールのワイヤ表現。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableRuleWire {
    /// 読み取りを許可するカラム
    #[serde(default)]
    pub read_columns: Vec<String>,
    /// INSERTを許可するカラム
    #[serde(default)]
    pub insert_columns: Vec<String>,
    /// UPDATEを許可するカラム
    #[serde(default)]
    pub update_columns: Vec<String>,
    /// DELETEの可否
    #[serde(default)]
    pub delete_allowed: bool,
}

// ---------------------------------------------------------------------------
// 公開エンドポイント用トークン
// ---------------------------------------------------------------------------

/// コントロールプレーンのプロキシが発行するクレームセット。
/// 署名対象はこの構造体のJSON直列化（フィールド順固定）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinerClaims {
    /// マイナーUID
    pub uid: i64,
    /// マイナーのホットキー
    pub miner_hotkey: String,
    /// 関連ジョブID
    pub job_id: String,
    /// チャレンジID
    pub challenge_id: String,
    /// ジョブ種別
    pub job_type: String,
    /// 発行時刻（UNIX秒）
    pub issued_at: u64,
}

/// 公開エンドポイントに付与されるベアラートークン。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinerToken {
    /// クレームセット本体
    #[serde(flatten)]
    pub claims: MinerClaims,
    /// Base64エンコードされたAdmin鍵によるEd25519署名
    pub sig: String,
}

// ---------------------------------------------------------------------------
// HTTPエンドポイント DTO
// ---------------------------------------------------------------------------

/// GET /sdk/health 応答。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// "starting" または "ready"
    pub status: String,
}

/// POST /sdk/weights 要求。評価済みジョブの一覧を渡す。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightsRequest {
    /// ジョブレコードの一覧（uid / score を含むマップ）
    pub jobs: Vec<serde_json::Value>,
}

/// POST /sdk/weights 応答。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightsResponse {
    /// UID → 重み
    pub weights: BTreeMap<String, f64>,
}

/// POST /sdk/admin/db/credentials 要求。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedCredentialsRequest {
    /// Base64エンコードされた封緘済みDSN
    pub sealed: String,
    /// チャレンジ名
    pub challenge_name: String,
    /// データベースバージョン
    pub version: u32,
}

/// POST /sdk/admin/db/credentials 応答。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedCredentialsResponse {
    /// 資格情報を受理したかどうか
    pub accepted: bool,
}
