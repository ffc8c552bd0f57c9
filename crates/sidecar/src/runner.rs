//! # ランタイムランナー
//!
//! 全コンポーネントを配線し、ライフサイクルを駆動するエントリポイント。
//!
//! ## 起動シーケンス
//! 1. アイデンティティ生成・Quoteプロバイダ選択
//! 2. `on_startup` 実行（ピア接続の受け入れ開始前）
//! 3. ピアリスナーとHTTPサーバーの起動、AwaitingAdminへ遷移
//! 4. マイグレーションバリア通過後に `on_ready` → ポリシー適用 → Serving
//! 5. 終了シグナルでドレイン → `on_cleanup` → Terminated

use std::sync::Arc;

use tokio::sync::mpsc;

use challenge_types::{PeerMessage, PeerRole};

use crate::config::Settings;
use crate::context::Context;
use crate::executor::JobExecutor;
use crate::identity::Identity;
use crate::infra::request_auth::NonceCache;
use crate::lifecycle::{LifecycleState, Orchestrator};
use crate::orm::{OrmBridge, OrmClient, PolicyCell};
use crate::registry::{invoke_lifecycle, ChallengeRegistry};
use crate::runtime::provider_from_settings;
use crate::state::SidecarState;
use crate::transport::manager::PeerSessionManager;
use crate::transport::RuntimeEvent;

/// ランタイムを起動し、終了コードを返す。
///
/// 正常ドレインは0、設定エラーは2、回復不能なAttestation失敗は3、
/// 再試行上限後のトランスポート失敗は4。
pub async fn run(registry: ChallengeRegistry, settings: Settings) -> i32 {
    let settings = Arc::new(settings);
    let registry = registry.freeze();
    let identity = Arc::new(Identity::generate());
    let provider = provider_from_settings(&settings);
    let orchestrator = Orchestrator::new(Arc::clone(&settings));

    orchestrator.mark_startup();

    let (manager, channels) = PeerSessionManager::new(
        Arc::clone(&identity),
        provider,
        Arc::clone(&settings),
    );
    let crate::transport::manager::ManagerChannels {
        events_rx,
        jobs_rx,
        mut fatal_rx,
    } = channels;

    let policy_cell = Arc::new(PolicyCell::new());
    let bridge = OrmBridge::new(
        Arc::clone(&policy_cell),
        Arc::clone(&manager),
        settings.orm_timeout,
        {
            let orchestrator = Arc::clone(&orchestrator);
            Arc::new(move || orchestrator.note_write_without_admin())
        },
    );
    let orm = OrmClient::new(Arc::clone(&bridge));
    let signing = Arc::new(identity.signing_key());
    let base_context = Context::from_settings(&settings, Arc::clone(&signing), orm.clone());

    // on_startupはピア接続の受け入れ開始前に実行する
    if let Some(hook) = registry.on_startup() {
        if let Err(e) = invoke_lifecycle(hook, base_context.clone()).await {
            tracing::error!("on_startupが失敗しました: {e}");
        }
    }

    // 開発モードではローカルのマイグレーションレイアウトを検証しておく
    if settings.dev_mode {
        let root = std::path::Path::new("db/migrations");
        match crate::migrate::discover_migrations(root, settings.db_version) {
            Ok(files) if !files.is_empty() => {
                tracing::info!(
                    version = settings.db_version,
                    count = files.len(),
                    "ローカルマイグレーションを検出しました"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("マイグレーションレイアウトが不正です: {e}"),
        }
    }

    let executor = JobExecutor::new(
        Arc::clone(&registry),
        Arc::clone(&settings),
        Arc::clone(&orchestrator),
        Arc::clone(&manager),
        base_context.clone(),
        Arc::clone(&signing),
    );
    tokio::spawn(Arc::clone(&executor).run(jobs_rx));

    // ピアトランスポートリスナー
    let peer_addr = format!("{}:{}", settings.host, settings.peer_port);
    let peer_listener = match tokio::net::TcpListener::bind(&peer_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("ピアリスナーのバインドに失敗しました（{peer_addr}）: {e}");
            return 2;
        }
    };
    tracing::info!(%peer_addr, "ピアトランスポートを受け付けます");
    tokio::spawn(Arc::clone(&manager).serve(peer_listener));

    // HTTPサーバー
    if settings.run_server {
        let state = Arc::new(SidecarState {
            settings: Arc::clone(&settings),
            registry: Arc::clone(&registry),
            identity: Arc::clone(&identity),
            orchestrator: Arc::clone(&orchestrator),
            manager: Arc::clone(&manager),
            orm: orm.clone(),
            nonce_cache: NonceCache::new(),
            base_context: base_context.clone(),
        });
        let http_addr = format!("{}:{}", settings.host, settings.port);
        match tokio::net::TcpListener::bind(&http_addr).await {
            Ok(listener) => {
                tracing::info!(%http_addr, "HTTPサーバーを起動します");
                let app = crate::endpoints::router(state);
                tokio::spawn(async move {
                    if let Err(e) = axum::serve(listener, app).await {
                        tracing::error!("HTTPサーバーが停止しました: {e}");
                    }
                });
            }
            Err(e) => {
                tracing::error!("HTTPリスナーのバインドに失敗しました（{http_addr}）: {e}");
                return 2;
            }
        }
    }

    orchestrator.mark_awaiting_admin();

    // トランスポートイベントのディスパッチャ
    tokio::spawn(dispatch_events(
        events_rx,
        Arc::clone(&manager),
        Arc::clone(&orchestrator),
        Arc::clone(&bridge),
        Arc::clone(&identity),
    ));

    // メインループ: 状態遷移・致命エラー・終了シグナルを監視する
    let mut state_rx = orchestrator.subscribe();
    let mut ready_ran = false;
    loop {
        tokio::select! {
            fatal = fatal_rx.recv() => {
                if let Some(error) = fatal {
                    tracing::error!("致命エラーにより終了します: {error}");
                    return error.exit_code();
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("終了シグナルを受信しました");
                break;
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *state_rx.borrow_and_update();
                if state == LifecycleState::Ready && !ready_ran {
                    ready_ran = true;
                    enter_serving(
                        &registry,
                        &orchestrator,
                        &manager,
                        &policy_cell,
                        base_context.clone(),
                    )
                    .await;
                }
            }
        }
    }

    // ドレイン: 新規ジョブを拒否し、実行中ジョブの完了を待つ
    orchestrator.begin_drain();
    if executor.drain(settings.drain_deadline).await {
        tracing::info!("実行中ジョブのドレインが完了しました");
    } else {
        tracing::warn!("ドレイン期限に達したため実行中ジョブを放棄します");
    }

    if let Some(hook) = registry.on_cleanup() {
        if let Err(e) = invoke_lifecycle(hook, base_context).await {
            tracing::error!("on_cleanupが失敗しました: {e}");
        }
    }

    orchestrator.mark_terminated();
    0
}

/// Ready到達後の処理: on_ready → ポリシー適用 → ポリシー通知 → Serving。
async fn enter_serving(
    registry: &Arc<crate::registry::FrozenRegistry>,
    orchestrator: &Arc<Orchestrator>,
    manager: &Arc<PeerSessionManager>,
    policy_cell: &Arc<PolicyCell>,
    base_context: Context,
) {
    if let Some(hook) = registry.on_ready() {
        if let Err(e) = invoke_lifecycle(hook, base_context).await {
            tracing::error!("on_readyが失敗しました: {e}");
        }
    }

    if let Some(policy) = registry.orm_policy() {
        match policy_cell.apply(policy.clone()) {
            Ok(()) => {
                // 適用済みポリシーをAdminへ通知する（存在する場合）
                let announce = PeerMessage::PolicyAnnounce {
                    tables: policy.to_wire(),
                };
                if let Err(e) = manager.send_to(PeerRole::Admin, announce).await {
                    tracing::debug!("ポリシー通知を送信できませんでした: {e}");
                }
            }
            Err(e) => tracing::warn!("ポリシーの適用に失敗しました: {e}"),
        }
    }

    if let Err(e) = orchestrator.mark_serving() {
        tracing::error!("供用開始を拒否しました: {e}");
    }
}

/// トランスポートイベントをコンポーネントへ回送する。
async fn dispatch_events(
    mut events_rx: mpsc::Receiver<RuntimeEvent>,
    manager: Arc<PeerSessionManager>,
    orchestrator: Arc<Orchestrator>,
    bridge: Arc<OrmBridge>,
    identity: Arc<Identity>,
) {
    while let Some(event) = events_rx.recv().await {
        match event {
            RuntimeEvent::PeerConnected { role, .. } => {
                orchestrator.peer_connected(role);
            }
            RuntimeEvent::PeerDisconnected { role, id, reason } => {
                tracing::info!(%role, id, "セッション破棄を処理します: {reason}");
                manager.forget(role, id);
                // 破棄セッション宛の応答待ちは退役させる（再送しない）
                bridge.retire_role(role);
                orchestrator.peer_disconnected(role);
            }
            RuntimeEvent::Frame { role, message } => match message {
                PeerMessage::OrmResult { query_id, result } => {
                    bridge.resolve_success(&query_id, result);
                }
                PeerMessage::OrmFailure {
                    query_id,
                    kind,
                    message,
                } => {
                    bridge.resolve_failure(&query_id, kind, message);
                }
                PeerMessage::CredentialsSeal { sealed } => {
                    if let Err(e) = orchestrator.accept_sealed_credentials(&identity, &sealed) {
                        tracing::warn!("資格情報フレームを拒否しました: {e}");
                    }
                }
                PeerMessage::MigrationsApply { version, files } => {
                    orchestrator.migrations_applied(version, &files);
                }
                other => {
                    tracing::debug!(%role, "処理対象外のフレームを無視します: {other:?}");
                }
            },
        }
    }
}
