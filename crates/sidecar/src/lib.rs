//! # Challenge Sidecar ランタイムコア
//!
//! ハードウェア検証済みTEE内で動作し、管理コントロールプレーン（Admin）と
//! 評価コンシューマ（Consumer）の2ピアとユーザー定義ハンドラの間の全ての
//! やり取りを仲介する常駐プロセス。
//!
//! ## 構成
//! | モジュール | 責務 |
//! |-----------|------|
//! | [`identity`] / [`runtime`] | 長期Ed25519アイデンティティ・TEE Quote取得・Attestationエンベロープ |
//! | [`transport`] | 暗号化フレームトランスポート（鍵合意・AEAD・リプレイ防止）とロール別セッション |
//! | [`http_client`] / [`clients`] | 正準文字列署名付きの外向きHTTP |
//! | [`orm`] | 能力ポリシー下でDB操作をプロキシするORMブリッジ |
//! | [`registry`] / [`executor`] | ハンドラレジストリとジョブ実行パイプライン |
//! | [`lifecycle`] / [`runner`] | 起動 → マイグレーションバリア → ready → 供用 → クリーンアップ |
//! | [`endpoints`] / [`infra`] | HTTPサーフェスとインバウンド認証 |

pub mod clients;
pub mod config;
pub mod context;
pub mod endpoints;
pub mod error;
pub mod executor;
pub mod http_client;
pub mod identity;
pub mod infra;
pub mod lifecycle;
pub mod migrate;
pub mod orm;
pub mod registry;
pub mod runner;
pub mod runtime;
pub mod state;
pub mod transport;

pub use config::Settings;
pub use context::{Context, PublicContext};
pub use error::{
    AttestationError, ConfigError, HttpError, JobError, OrmError, RunError, TransportError,
};
pub use lifecycle::{LifecycleState, Orchestrator};
pub use orm::{OrmClient, OrmPolicy, TableRule};
pub use registry::{
    ChallengeRegistry, JobHandler, JobOutcome, LifecycleHook, PublicHandler, WeightsHandler,
};
pub use runner::run;
