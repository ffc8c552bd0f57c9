//! # エンドポイントテスト用共通ヘルパー
//!
//! ハンドラ単体テストで共有する状態構築ヘルパー。

use std::sync::Arc;
use std::time::Duration;

use crate::config::Settings;
use crate::context::Context;
use crate::identity::Identity;
use crate::infra::request_auth::NonceCache;
use crate::lifecycle::Orchestrator;
use crate::orm::{OrmBridge, OrmClient, PolicyCell};
use crate::registry::ChallengeRegistry;
use crate::runtime::dev::DevQuoteProvider;
use crate::runtime::QuoteProvider;
use crate::state::SidecarState;
use crate::transport::manager::PeerSessionManager;

/// 既定設定でテスト用状態を構築する。
pub(crate) async fn test_state() -> Arc<SidecarState> {
    test_state_with(Settings::for_tests(), ChallengeRegistry::new()).await
}

/// 設定とレジストリを指定してテスト用状態を構築する。
pub(crate) async fn test_state_with(
    settings: Settings,
    registry: ChallengeRegistry,
) -> Arc<SidecarState> {
    let settings = Arc::new(settings);
    let identity = Arc::new(Identity::generate());
    let provider: Arc<dyn QuoteProvider> = Arc::new(DevQuoteProvider::new());
    let (manager, _channels) =
        PeerSessionManager::new(Arc::clone(&identity), provider, Arc::clone(&settings));
    let orchestrator = Orchestrator::new(Arc::clone(&settings));

    let bridge = OrmBridge::new(
        Arc::new(PolicyCell::new()),
        Arc::clone(&manager),
        Duration::from_secs(1),
        Arc::new(|| {}),
    );
    let orm = OrmClient::new(bridge);
    let signing = Arc::new(identity.signing_key());
    let base_context = Context::from_settings(&settings, signing, orm.clone());

    Arc::new(SidecarState {
        settings,
        registry: registry.freeze(),
        identity,
        orchestrator,
        manager,
        orm,
        nonce_cache: NonceCache::new(),
        base_context,
    })
}
