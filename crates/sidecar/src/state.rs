//! # サイドカー共有状態
//!
//! HTTPエンドポイントとランナーが共有するランタイム状態。
//! `run()` 開始時に一度だけ構築され、以後は内部の同期プリミティブ越しにのみ
//! 変化する。

use std::sync::Arc;

use crate::config::Settings;
use crate::context::Context;
use crate::identity::Identity;
use crate::infra::request_auth::NonceCache;
use crate::lifecycle::Orchestrator;
use crate::orm::OrmClient;
use crate::registry::FrozenRegistry;
use crate::transport::manager::PeerSessionManager;

/// サイドカーの共有状態。
pub struct SidecarState {
    /// ランタイム設定
    pub settings: Arc<Settings>,
    /// 凍結済みハンドラレジストリ
    pub registry: Arc<FrozenRegistry>,
    /// プロセスアイデンティティ
    pub identity: Arc<Identity>,
    /// ライフサイクルオーケストレータ
    pub orchestrator: Arc<Orchestrator>,
    /// ピアセッションマネージャ
    pub manager: Arc<PeerSessionManager>,
    /// ORMクライアント
    pub orm: OrmClient,
    /// 署名付きリクエストのノンスリプレイキャッシュ
    pub nonce_cache: NonceCache,
    /// ライフサイクルフック用の既定コンテキスト
    pub base_context: Context,
}
