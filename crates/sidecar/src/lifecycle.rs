//! # ライフサイクルオーケストレータ
//!
//! 起動 → マイグレーションバリア → ready → ジョブ供用 → クリーンアップを
//! 駆動する状態機械。
//!
//! ```text
//! Init → Startup → AwaitingAdmin → Migrating → Ready → Serving → Draining → Terminated
//! ```
//!
//! 遷移は単調だが、`Serving ↔ AwaitingAdmin` のみ例外。Adminが切断しても
//! 読み取り供用は継続し、ハンドラからの書き込み試行で初めて
//! `AwaitingAdmin` へ退行する。

use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use zeroize::Zeroizing;

use base64::Engine;

use challenge_crypto::sealed_open;
use challenge_types::PeerRole;

use crate::config::Settings;
use crate::error::SidecarError;
use crate::identity::{b64, Identity};

/// ライフサイクル状態。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// プロセス起動直後
    Init,
    /// on_startup実行中
    Startup,
    /// Adminセッションと資格情報の待機
    AwaitingAdmin,
    /// マイグレーションバリア通過待ち
    Migrating,
    /// on_ready実行待ち・実行中
    Ready,
    /// ジョブ供用中
    Serving,
    /// ドレイン中（新規ジョブ拒否）
    Draining,
    /// 終了
    Terminated,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            LifecycleState::Init => "init",
            LifecycleState::Startup => "startup",
            LifecycleState::AwaitingAdmin => "awaiting_admin",
            LifecycleState::Migrating => "migrating",
            LifecycleState::Ready => "ready",
            LifecycleState::Serving => "serving",
            LifecycleState::Draining => "draining",
            LifecycleState::Terminated => "terminated",
        };
        f.write_str(label)
    }
}

struct Inner {
    /// 復号済みDSN。メモリ内のみ、Terminatedでゼロ化される
    dsn: Option<Zeroizing<String>>,
    /// 資格情報を受理済みかどうか（再要求なしの再送は無視）
    credentials_accepted: bool,
    /// オーケストレータが明示的に再送要求を出しているかどうか
    rerequest_pending: bool,
    /// 設定バージョンのマイグレーションが適用済みかどうか
    migrations_done: bool,
    /// Adminセッションの生存
    admin_connected: bool,
    /// on_readyが完了済みかどうか（Admin復帰時のServing再開判定）
    ready_completed: bool,
}

/// ライフサイクルオーケストレータ。
pub struct Orchestrator {
    settings: Arc<Settings>,
    state_tx: watch::Sender<LifecycleState>,
    inner: Mutex<Inner>,
}

fn lock<'a>(mutex: &'a Mutex<Inner>) -> std::sync::MutexGuard<'a, Inner> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl Orchestrator {
    /// 初期状態（Init）のオーケストレータを作る。
    pub fn new(settings: Arc<Settings>) -> Arc<Self> {
        let (state_tx, _) = watch::channel(LifecycleState::Init);
        Arc::new(Self {
            settings,
            state_tx,
            inner: Mutex::new(Inner {
                dsn: None,
                credentials_accepted: false,
                rerequest_pending: false,
                migrations_done: false,
                admin_connected: false,
                ready_completed: false,
            }),
        })
    }

    /// 現在の状態。
    pub fn state(&self) -> LifecycleState {
        *self.state_tx.borrow()
    }

    /// 状態変化の購読。
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, next: LifecycleState) {
        let prev = self.state();
        if prev != next {
            tracing::info!(%prev, %next, "ライフサイクル遷移");
            let _ = self.state_tx.send(next);
        }
    }

    /// ジョブ供用中かどうか。
    pub fn is_serving(&self) -> bool {
        self.state() == LifecycleState::Serving
    }

    /// /sdk/health 用のステータス文字列。
    pub fn health_status(&self) -> &'static str {
        match self.state() {
            LifecycleState::Ready | LifecycleState::Serving => "ready",
            _ => "starting",
        }
    }

    /// on_startup開始。プロセス起動時に一度だけ。
    pub fn mark_startup(&self) {
        self.set_state(LifecycleState::Startup);
    }

    /// on_startup完了。ピア受け入れを開始してAdminを待つ。
    pub fn mark_awaiting_admin(&self) {
        self.set_state(LifecycleState::AwaitingAdmin);
    }

    /// ピアセッション確立の通知。
    pub fn peer_connected(&self, role: PeerRole) {
        if role != PeerRole::Admin {
            return;
        }
        let resume = {
            let mut inner = lock(&self.inner);
            inner.admin_connected = true;
            inner.ready_completed
                && inner.migrations_done
                && self.state() == LifecycleState::AwaitingAdmin
        };
        if resume {
            // Admin復帰: 供用を再開する
            self.set_state(LifecycleState::Serving);
        } else {
            self.try_enter_migrating();
        }
    }

    /// ピアセッション破棄の通知。
    /// Admin切断でも読み取り供用は継続し、状態は書き込み試行まで変えない。
    pub fn peer_disconnected(&self, role: PeerRole) {
        if role == PeerRole::Admin {
            lock(&self.inner).admin_connected = false;
        }
    }

    /// 封緘済みDB資格情報の受理。
    ///
    /// プロセスにつき一度だけ受理し、以後は明示的な再要求がない限り無視する
    /// （`Ok(false)` を返す）。復号はEd25519→X25519変換鍵で行う。
    pub fn accept_sealed_credentials(
        &self,
        identity: &Identity,
        sealed_b64: &str,
    ) -> Result<bool, SidecarError> {
        {
            let inner = lock(&self.inner);
            if inner.credentials_accepted && !inner.rerequest_pending {
                tracing::info!("資格情報は受理済みのため無視します");
                return Ok(false);
            }
        }

        let sealed = b64()
            .decode(sealed_b64)
            .map_err(|e| SidecarError::BadRequest(format!("sealedのBase64デコードに失敗: {e}")))?;
        let plaintext = sealed_open(&identity.credential_secret(), &sealed)
            .map_err(|_| SidecarError::BadRequest("資格情報の復号に失敗しました".to_string()))?;
        let plaintext = Zeroizing::new(plaintext);

        let decoded = std::str::from_utf8(&plaintext)
            .map_err(|_| SidecarError::BadRequest("資格情報がUTF-8ではありません".to_string()))?;
        // JSON形式 {"dsn": "..."} と素のDSN文字列の両方を受け付ける
        let dsn = if decoded.trim_start().starts_with('{') {
            let value: serde_json::Value = serde_json::from_str(decoded).map_err(|e| {
                SidecarError::BadRequest(format!("資格情報のJSONパースに失敗: {e}"))
            })?;
            value
                .get("dsn")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    SidecarError::BadRequest("資格情報にdsnがありません".to_string())
                })?
        } else {
            decoded.to_string()
        };
        if dsn.is_empty() {
            return Err(SidecarError::BadRequest("dsnが空です".to_string()));
        }

        {
            let mut inner = lock(&self.inner);
            inner.dsn = Some(Zeroizing::new(dsn));
            inner.credentials_accepted = true;
            inner.rerequest_pending = false;
        }
        tracing::info!("封緘済みDB資格情報を受理しました");
        self.try_enter_migrating();
        Ok(true)
    }

    /// 資格情報の再送を明示的に許可する。呼び出し後の次のsealのみ受理される。
    pub fn request_credentials_resend(&self) {
        lock(&self.inner).rerequest_pending = true;
    }

    /// 復号済みDSN。保持はメモリ内のみ。
    pub fn database_dsn(&self) -> Option<Zeroizing<String>> {
        lock(&self.inner).dsn.clone()
    }

    /// Adminからのマイグレーション適用完了通知。
    /// バージョンが設定と一致しない場合は無視する。
    pub fn migrations_applied(&self, version: u32, files: &[String]) {
        if version != self.settings.db_version {
            tracing::warn!(
                version,
                expected = self.settings.db_version,
                "設定と異なるバージョンのマイグレーション通知を無視します"
            );
            return;
        }
        tracing::info!(version, count = files.len(), "マイグレーション適用を確認しました");
        lock(&self.inner).migrations_done = true;
        self.try_enter_ready();
    }

    fn try_enter_migrating(&self) {
        let eligible = {
            let inner = lock(&self.inner);
            inner.admin_connected && inner.credentials_accepted
        };
        if eligible && self.state() == LifecycleState::AwaitingAdmin {
            self.set_state(LifecycleState::Migrating);
            self.try_enter_ready();
        }
    }

    fn try_enter_ready(&self) {
        let done = lock(&self.inner).migrations_done;
        if done && self.state() == LifecycleState::Migrating {
            self.set_state(LifecycleState::Ready);
        }
    }

    /// on_ready完了後の供用開始。
    ///
    /// 開発モードでAdminピアが接続中の場合、`allow_insecure_admin` がない限り
    /// 拒否する。
    pub fn mark_serving(&self) -> Result<(), SidecarError> {
        if self.settings.dev_mode && !self.settings.allow_insecure_admin {
            let admin_connected = lock(&self.inner).admin_connected;
            if admin_connected {
                return Err(SidecarError::Unavailable(
                    "開発モードではAdminピア接続中の供用開始を拒否します".to_string(),
                ));
            }
        }
        lock(&self.inner).ready_completed = true;
        self.set_state(LifecycleState::Serving);
        Ok(())
    }

    /// ハンドラからの書き込みがAdmin不在で失敗した際の通知。
    /// 供用中であればこのタイミングで初めてAwaitingAdminへ退行する。
    pub fn note_write_without_admin(&self) {
        let admin_connected = lock(&self.inner).admin_connected;
        if !admin_connected && self.state() == LifecycleState::Serving {
            self.set_state(LifecycleState::AwaitingAdmin);
        }
    }

    /// ドレイン開始。新規ジョブはNotReadyで拒否される。
    pub fn begin_drain(&self) {
        self.set_state(LifecycleState::Draining);
    }

    /// 終了。DSNをゼロ化して破棄する。
    pub fn mark_terminated(&self) {
        {
            let mut inner = lock(&self.inner);
            // Zeroizingのドロップで内容がゼロ化される
            inner.dsn = None;
        }
        self.set_state(LifecycleState::Terminated);
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, state: LifecycleState) {
        let _ = self.state_tx.send(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use challenge_crypto::sealed_seal;

    fn serving_flow(orchestrator: &Orchestrator, identity: &Identity, sealed: &str) {
        orchestrator.mark_startup();
        orchestrator.mark_awaiting_admin();
        orchestrator.peer_connected(PeerRole::Admin);
        orchestrator
            .accept_sealed_credentials(identity, sealed)
            .unwrap();
        orchestrator.migrations_applied(1, &["001_init.sql".to_string()]);
        orchestrator.mark_serving().unwrap();
    }

    fn sealed_dsn(identity: &Identity, dsn: &str) -> String {
        let sealed = sealed_seal(&identity.credential_public(), dsn.as_bytes()).unwrap();
        b64().encode(sealed)
    }

    /// 正常系の遷移列を確認
    #[test]
    fn test_happy_path_transitions() {
        let orchestrator = Orchestrator::new(Arc::new(Settings::for_tests()));
        let identity = Identity::generate();
        assert_eq!(orchestrator.state(), LifecycleState::Init);
        assert_eq!(orchestrator.health_status(), "starting");

        orchestrator.mark_startup();
        assert_eq!(orchestrator.state(), LifecycleState::Startup);

        orchestrator.mark_awaiting_admin();
        assert_eq!(orchestrator.state(), LifecycleState::AwaitingAdmin);

        // Admin接続だけでは進まない（資格情報が必要）
        orchestrator.peer_connected(PeerRole::Admin);
        assert_eq!(orchestrator.state(), LifecycleState::AwaitingAdmin);

        let sealed = sealed_dsn(&identity, "postgres://u:p@h/db");
        assert!(orchestrator
            .accept_sealed_credentials(&identity, &sealed)
            .unwrap());
        assert_eq!(orchestrator.state(), LifecycleState::Migrating);

        // バージョン不一致は無視される
        orchestrator.migrations_applied(2, &[]);
        assert_eq!(orchestrator.state(), LifecycleState::Migrating);

        orchestrator.migrations_applied(1, &[]);
        assert_eq!(orchestrator.state(), LifecycleState::Ready);
        assert_eq!(orchestrator.health_status(), "ready");

        orchestrator.mark_serving().unwrap();
        assert!(orchestrator.is_serving());

        orchestrator.begin_drain();
        orchestrator.mark_terminated();
        assert_eq!(orchestrator.state(), LifecycleState::Terminated);
        assert!(orchestrator.database_dsn().is_none());
    }

    /// 資格情報が一度だけ受理されることを確認（S6）
    #[test]
    fn test_credentials_accepted_once() {
        let orchestrator = Orchestrator::new(Arc::new(Settings::for_tests()));
        let identity = Identity::generate();
        orchestrator.mark_startup();
        orchestrator.mark_awaiting_admin();
        orchestrator.peer_connected(PeerRole::Admin);

        let first = sealed_dsn(&identity, "postgres://u:p@h/db");
        assert!(orchestrator
            .accept_sealed_credentials(&identity, &first)
            .unwrap());
        assert_eq!(
            orchestrator.database_dsn().as_deref().map(String::as_str),
            Some("postgres://u:p@h/db")
        );

        // 再要求なしの2通目は無視される
        let second = sealed_dsn(&identity, "postgres://other/db");
        assert!(!orchestrator
            .accept_sealed_credentials(&identity, &second)
            .unwrap());
        assert_eq!(
            orchestrator.database_dsn().as_deref().map(String::as_str),
            Some("postgres://u:p@h/db")
        );

        // 明示的な再要求後は受理される
        orchestrator.request_credentials_resend();
        assert!(orchestrator
            .accept_sealed_credentials(&identity, &second)
            .unwrap());
        assert_eq!(
            orchestrator.database_dsn().as_deref().map(String::as_str),
            Some("postgres://other/db")
        );
    }

    /// JSON形式の資格情報も受理されることを確認
    #[test]
    fn test_credentials_json_payload() {
        let orchestrator = Orchestrator::new(Arc::new(Settings::for_tests()));
        let identity = Identity::generate();
        let sealed = sealed_dsn(&identity, r#"{"dsn": "postgres://json/db"}"#);
        assert!(orchestrator
            .accept_sealed_credentials(&identity, &sealed)
            .unwrap());
        assert_eq!(
            orchestrator.database_dsn().as_deref().map(String::as_str),
            Some("postgres://json/db")
        );
    }

    /// 別鍵に封緘された資格情報が拒否されることを確認
    #[test]
    fn test_credentials_wrong_recipient() {
        let orchestrator = Orchestrator::new(Arc::new(Settings::for_tests()));
        let identity = Identity::generate();
        let other = Identity::generate();
        let sealed = sealed_dsn(&other, "postgres://u:p@h/db");
        assert!(orchestrator
            .accept_sealed_credentials(&identity, &sealed)
            .is_err());
    }

    /// Admin切断後、書き込み試行まで供用が継続することを確認（S5）
    #[test]
    fn test_admin_drop_transitions_on_write_only() {
        let orchestrator = Orchestrator::new(Arc::new(Settings::for_tests()));
        let identity = Identity::generate();
        let sealed = sealed_dsn(&identity, "postgres://u:p@h/db");
        serving_flow(&orchestrator, &identity, &sealed);

        orchestrator.peer_disconnected(PeerRole::Admin);
        // 切断だけでは状態は変わらない
        assert!(orchestrator.is_serving());

        // 書き込み試行で初めて退行する
        orchestrator.note_write_without_admin();
        assert_eq!(orchestrator.state(), LifecycleState::AwaitingAdmin);

        // Admin復帰で供用再開
        orchestrator.peer_connected(PeerRole::Admin);
        assert!(orchestrator.is_serving());
    }

    /// 開発モードでAdmin接続中のServing遷移が拒否されることを確認
    #[test]
    fn test_dev_mode_admin_guard() {
        let mut settings = Settings::for_tests();
        settings.dev_mode = true;
        let orchestrator = Orchestrator::new(Arc::new(settings));
        let identity = Identity::generate();
        orchestrator.mark_startup();
        orchestrator.mark_awaiting_admin();
        orchestrator.peer_connected(PeerRole::Admin);
        let sealed = sealed_dsn(&identity, "postgres://u:p@h/db");
        orchestrator
            .accept_sealed_credentials(&identity, &sealed)
            .unwrap();
        orchestrator.migrations_applied(1, &[]);

        assert!(orchestrator.mark_serving().is_err());

        // allow_insecure_adminがあれば許可される
        let mut settings = Settings::for_tests();
        settings.dev_mode = true;
        settings.allow_insecure_admin = true;
        let orchestrator = Orchestrator::new(Arc::new(settings));
        orchestrator.mark_startup();
        orchestrator.mark_awaiting_admin();
        orchestrator.peer_connected(PeerRole::Admin);
        orchestrator
            .accept_sealed_credentials(&identity, &sealed)
            .unwrap();
        orchestrator.migrations_applied(1, &[]);
        assert!(orchestrator.mark_serving().is_ok());
    }
}
