//! # ピアセッションマネージャ
//!
//! TCPリスナーでピア接続を受け入れ、ロールごとに最大1セッションを維持する。
//!
//! ## 規則
//! - 同一ロールの2本目の接続は、ハンドシェイク成功後に旧セッションを置き換える
//! - Attestation拒否が連続して再試行上限に達するとプロセス致命（終了コード3）
//! - 破棄されたセッション宛の送信待ち応答はドロップされる（再送しない）

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use challenge_crypto::Ed25519VerifyingKey;
use challenge_types::{JobRequest, PeerMessage, PeerRole};

use crate::config::Settings;
use crate::error::{AttestationError, RunError, TransportError};
use crate::identity::Identity;
use crate::runtime::QuoteProvider;
use crate::transport::session::{
    perform_handshake, spawn_session, HandshakeError, SessionHandle,
};
use crate::transport::RuntimeEvent;

/// ディスパッチチャネルの容量
const EVENT_QUEUE: usize = 64;
/// ジョブキューの容量（超過でConsumerセッションの読み取りが停止する）
const JOB_QUEUE_WATERMARK: usize = 8;

/// ポイズニングを無視してロックを取得する（保持区間は短く、await を跨がない）。
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// ピアセッションマネージャ。
pub struct PeerSessionManager {
    identity: Arc<Identity>,
    provider: Arc<dyn QuoteProvider>,
    settings: Arc<Settings>,
    sessions: Mutex<HashMap<PeerRole, SessionHandle>>,
    peer_keys: Mutex<HashMap<PeerRole, Ed25519VerifyingKey>>,
    seen_nonces: Mutex<HashSet<[u8; 32]>>,
    consecutive_rejects: AtomicU32,
    session_seq: AtomicU64,
    events_tx: mpsc::Sender<RuntimeEvent>,
    jobs_tx: mpsc::Sender<JobRequest>,
    fatal_tx: mpsc::Sender<RunError>,
}

/// マネージャ構築時に返される受信側チャネル一式。
pub struct ManagerChannels {
    /// トランスポートイベント（接続・切断・フレーム）
    pub events_rx: mpsc::Receiver<RuntimeEvent>,
    /// ジョブ実行要求（容量がバックプレッシャー境界）
    pub jobs_rx: mpsc::Receiver<JobRequest>,
    /// プロセス致命エラー
    pub fatal_rx: mpsc::Receiver<RunError>,
}

impl PeerSessionManager {
    /// マネージャを構築する。
    pub fn new(
        identity: Arc<Identity>,
        provider: Arc<dyn QuoteProvider>,
        settings: Arc<Settings>,
    ) -> (Arc<Self>, ManagerChannels) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (jobs_tx, jobs_rx) = mpsc::channel(JOB_QUEUE_WATERMARK);
        let (fatal_tx, fatal_rx) = mpsc::channel(1);
        let manager = Arc::new(Self {
            identity,
            provider,
            settings,
            sessions: Mutex::new(HashMap::new()),
            peer_keys: Mutex::new(HashMap::new()),
            seen_nonces: Mutex::new(HashSet::new()),
            consecutive_rejects: AtomicU32::new(0),
            session_seq: AtomicU64::new(0),
            events_tx,
            jobs_tx,
            fatal_tx,
        });
        (
            manager,
            ManagerChannels {
                events_rx,
                jobs_rx,
                fatal_rx,
            },
        )
    }

    /// 受け入れループ。接続ごとにハンドシェイクタスクを起動する。
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    tracing::debug!(%addr, "ピア接続を受け入れました");
                    let manager = Arc::clone(&self);
                    tokio::spawn(async move {
                        manager.handle_connection(stream).await;
                    });
                }
                Err(e) => {
                    tracing::error!("受け入れに失敗しました: {e}");
                    let _ = self
                        .fatal_tx
                        .send(RunError::Transport(TransportError::Io(e)))
                        .await;
                    return;
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, mut stream: TcpStream) {
        let outcome = perform_handshake(
            &mut stream,
            &self.identity,
            self.provider.as_ref(),
            &self.settings,
            |nonce| {
                lock(&self.seen_nonces).insert(*nonce)
            },
        )
        .await;

        let outcome = match outcome {
            Ok(outcome) => {
                self.consecutive_rejects.store(0, Ordering::Relaxed);
                outcome
            }
            Err(HandshakeError::Rejected(reason)) => {
                let rejects = self.consecutive_rejects.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    rejects,
                    "Attestationが拒否されました: {reason}"
                );
                if rejects >= self.settings.attestation_retries {
                    let _ = self
                        .fatal_tx
                        .send(RunError::Attestation(AttestationError::Rejected(reason)))
                        .await;
                }
                return;
            }
            Err(HandshakeError::Quote(e)) => {
                tracing::error!("Quote取得に失敗しました: {e}");
                let _ = self.fatal_tx.send(RunError::Attestation(e)).await;
                return;
            }
            Err(HandshakeError::Transport(e)) => {
                tracing::warn!("ハンドシェイクに失敗しました: {e}");
                return;
            }
        };

        let id = self.session_seq.fetch_add(1, Ordering::Relaxed);
        let handle = spawn_session(
            stream,
            outcome.role,
            id,
            outcome.crypto,
            &self.settings,
            self.events_tx.clone(),
            self.jobs_tx.clone(),
        );

        // ハンドシェイク成功後にのみ旧セッションを置き換える
        let displaced = lock(&self.sessions).insert(outcome.role, handle);
        if let Some(old) = displaced {
            tracing::info!(role = %outcome.role, "既存セッションを置き換えます");
            old.cancel.cancel();
        }

        lock(&self.peer_keys).insert(outcome.role, outcome.peer_ed25519);

        tracing::info!(role = %outcome.role, id, "ピアセッションを確立しました");
        let _ = self
            .events_tx
            .send(RuntimeEvent::PeerConnected {
                role: outcome.role,
                id,
            })
            .await;
    }

    /// 指定ロールのセッションへメッセージを送る。
    /// キューが満杯の間は呼び出し側がサスペンドする（バックプレッシャー）。
    pub async fn send_to(&self, role: PeerRole, message: PeerMessage) -> Result<(), TransportError> {
        let sender = lock(&self.sessions)
            .get(&role)
            .map(|handle| handle.outbound.clone())
            .ok_or(TransportError::Closed(role))?;
        sender
            .send(message)
            .await
            .map_err(|_| TransportError::Closed(role))
    }

    /// セッションの存在確認。
    pub fn is_connected(&self, role: PeerRole) -> bool {
        lock(&self.sessions).contains_key(&role)
    }

    /// 破棄されたセッションをスロットから取り除く。
    /// 既に新しいセッションに置き換わっている場合は何もしない。
    pub fn forget(&self, role: PeerRole, id: u64) {
        let mut sessions = lock(&self.sessions);
        if sessions.get(&role).map(|handle| handle.id) == Some(id) {
            sessions.remove(&role);
        }
    }

    /// ハンドシェイクで記録したピアの長期Ed25519公開鍵。
    pub fn peer_key(&self, role: PeerRole) -> Option<Ed25519VerifyingKey> {
        lock(&self.peer_keys).get(&role).copied()
    }

    /// 署名付きHTTPの検証に使う信頼鍵の一覧。
    pub fn trusted_keys(&self) -> Vec<Ed25519VerifyingKey> {
        lock(&self.peer_keys).values().copied().collect()
    }

    #[cfg(test)]
    pub(crate) fn record_peer_key(&self, role: PeerRole, key: Ed25519VerifyingKey) {
        lock(&self.peer_keys).insert(role, key);
    }
}
