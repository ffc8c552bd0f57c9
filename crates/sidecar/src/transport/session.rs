//! # ピアセッション
//!
//! 1本のTCP接続上でAttestationハンドシェイクを実行し、確立後は
//! 読み取りタスク・書き込みタスクの2タスクでフレームを処理する。
//!
//! ## ハンドシェイク手順（サイドカーはサーバー側）
//! 1. ピア → `hello`（ロール宣言・32Bノンス・X25519エフェメラル公開鍵・長期Ed25519公開鍵）
//! 2. サイドカー → 署名付き `attestation` エンベロープ
//! 3. ピア → `accept`（HKDFソルト） または `reject`
//! 4. 双方が `HKDF-SHA256(salt, X25519(self_eph, peer_eph), info)` でセッション鍵を導出
//!
//! セッション鍵はセッションと1:1に束縛され、切断で破棄される。
//! 破棄されたセッションに属する送信待ち応答はドロップされ、再送されない。

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use challenge_crypto::{dh, hkdf_derive_key, Ed25519VerifyingKey, X25519Public};
use challenge_types::{
    HandshakeAccept, HandshakeMessage, HandshakeReject, HelloMessage, JobRequest, PeerMessage,
    PeerRole,
};

use crate::config::Settings;
use crate::error::{AttestationError, TransportError};
use crate::identity::{b64, Identity};
use crate::runtime::QuoteProvider;
use crate::transport::frame::{
    open_frame, read_handshake, read_prefixed, seal_frame, write_handshake, write_prefixed,
    SessionCrypto,
};
use crate::transport::RuntimeEvent;

use base64::Engine;

/// セッション鍵導出のHKDF infoプレフィックス
const TRANSPORT_INFO_PREFIX: &[u8] = b"challenge-transport-v1:";

/// ハンドシェイクの失敗種別。
#[derive(Debug)]
pub enum HandshakeError {
    /// ピアがAttestationを拒否した（再試行上限を消費する）
    Rejected(String),
    /// Quoteを取得できなかった
    Quote(AttestationError),
    /// 手順違反・I/O断
    Transport(TransportError),
}

/// ハンドシェイク成功時の成果物。
pub struct HandshakeOutcome {
    /// ピアが宣言し、エンベロープ署名に束縛されたロール
    pub role: PeerRole,
    /// セッションの暗号モード
    pub crypto: SessionCrypto,
    /// ハンドシェイクで記録したピアの長期Ed25519公開鍵
    pub peer_ed25519: Ed25519VerifyingKey,
}

/// 確立済みセッションへのハンドル。
#[derive(Clone)]
pub struct SessionHandle {
    /// セッションのロール
    pub role: PeerRole,
    /// プロセス内で一意なセッションID
    pub id: u64,
    /// 送信キュー（満杯時はenqueueがサスペンドする）
    pub outbound: mpsc::Sender<PeerMessage>,
    /// セッション破棄用トークン
    pub cancel: CancellationToken,
}

fn decode_b64_array<const N: usize>(value: &str, what: &str) -> Result<[u8; N], HandshakeError> {
    let bytes = b64()
        .decode(value)
        .map_err(|e| HandshakeError::Transport(TransportError::Handshake(format!(
            "{what}のBase64デコードに失敗: {e}"
        ))))?;
    bytes.try_into().map_err(|_| {
        HandshakeError::Transport(TransportError::Handshake(format!(
            "{what}は{N}バイトである必要があります"
        )))
    })
}

/// サーバー側ハンドシェイクを実行する。
///
/// ノンスの再利用は過去セッションの記録と照合して拒否する
/// （`is_nonce_fresh` がfalseを返した場合）。
pub async fn perform_handshake(
    stream: &mut TcpStream,
    identity: &Identity,
    provider: &dyn QuoteProvider,
    settings: &Settings,
    is_nonce_fresh: impl FnOnce(&[u8; 32]) -> bool,
) -> Result<HandshakeOutcome, HandshakeError> {
    let hello = match read_handshake(stream)
        .await
        .map_err(HandshakeError::Transport)?
    {
        HandshakeMessage::Hello(hello) => hello,
        other => {
            return Err(HandshakeError::Transport(TransportError::Handshake(
                format!("helloを期待しましたが{:?}を受信しました", message_kind(&other)),
            )))
        }
    };

    let HelloMessage {
        role,
        nonce,
        peer_x25519_pub,
        peer_ed25519_pub,
    } = hello;

    let nonce: [u8; 32] = decode_b64_array(&nonce, "nonce")?;
    let peer_eph_bytes: [u8; 32] = decode_b64_array(&peer_x25519_pub, "peer_x25519_pub")?;
    let peer_ed_bytes: [u8; 32] = decode_b64_array(&peer_ed25519_pub, "peer_ed25519_pub")?;
    let peer_ed25519 = Ed25519VerifyingKey::from_bytes(&peer_ed_bytes).map_err(|e| {
        HandshakeError::Transport(TransportError::Handshake(format!(
            "ピアEd25519公開鍵が不正です: {e}"
        )))
    })?;

    // ノンス再利用の拒否。再生されたhelloに対してエンベロープを発行しない。
    if !is_nonce_fresh(&nonce) {
        let _ = write_handshake(
            stream,
            &HandshakeMessage::Reject(HandshakeReject {
                reason: "nonce already used".to_string(),
            }),
        )
        .await;
        return Err(HandshakeError::Rejected(
            "ノンスが再利用されました".to_string(),
        ));
    }

    // エフェメラル鍵はセッションごとに新規生成し、Quoteのreport_dataに束縛する
    let ephemeral = identity.mint_session_ephemeral();
    let envelope = identity
        .attestation_envelope(provider, role, &nonce, &ephemeral.public)
        .map_err(HandshakeError::Quote)?;

    write_handshake(stream, &HandshakeMessage::Attestation(envelope))
        .await
        .map_err(HandshakeError::Transport)?;

    let accept = match read_handshake(stream)
        .await
        .map_err(HandshakeError::Transport)?
    {
        HandshakeMessage::Accept(HandshakeAccept { hkdf_salt }) => hkdf_salt,
        HandshakeMessage::Reject(HandshakeReject { reason }) => {
            return Err(HandshakeError::Rejected(reason))
        }
        other => {
            return Err(HandshakeError::Transport(TransportError::Handshake(
                format!(
                    "accept/rejectを期待しましたが{:?}を受信しました",
                    message_kind(&other)
                ),
            )))
        }
    };

    let crypto = if settings.dev_mode {
        // 開発モード: AttestationスタブとともにAEADも無効
        SessionCrypto::Plain
    } else {
        let salt: [u8; 32] = decode_b64_array(&accept, "hkdf_salt")?;
        let peer_eph = X25519Public::from(peer_eph_bytes);
        let shared = dh(&ephemeral.secret, &peer_eph);
        let mut info = Vec::with_capacity(TRANSPORT_INFO_PREFIX.len() + 8);
        info.extend_from_slice(TRANSPORT_INFO_PREFIX);
        info.extend_from_slice(role.label().as_bytes());
        let key = hkdf_derive_key(&salt, &shared, &info).map_err(|_| {
            HandshakeError::Transport(TransportError::Handshake(
                "セッション鍵の導出に失敗しました".to_string(),
            ))
        })?;
        SessionCrypto::Sealed(key)
    };

    Ok(HandshakeOutcome {
        role,
        crypto,
        peer_ed25519,
    })
}

fn message_kind(message: &HandshakeMessage) -> &'static str {
    match message {
        HandshakeMessage::Hello(_) => "hello",
        HandshakeMessage::Attestation(_) => "attestation",
        HandshakeMessage::Accept(_) => "accept",
        HandshakeMessage::Reject(_) => "reject",
    }
}

/// 受信メッセージのロール別許可判定。
/// 許可されないメッセージは破棄され、セッションは継続する。
pub fn admission_allows(role: PeerRole, message: &PeerMessage) -> bool {
    match message {
        PeerMessage::JobExecute(_) => role == PeerRole::Consumer,
        PeerMessage::MigrationsApply { .. } | PeerMessage::CredentialsSeal { .. } => {
            role == PeerRole::Admin
        }
        PeerMessage::OrmResult { .. }
        | PeerMessage::OrmFailure { .. }
        | PeerMessage::Heartbeat => true,
        // サイドカー発のメッセージ種別が受信方向に現れることはない
        PeerMessage::JobResult(_)
        | PeerMessage::OrmRequest { .. }
        | PeerMessage::CredentialsRequest
        | PeerMessage::PolicyAnnounce { .. } => false,
    }
}

/// ハンドシェイク済みストリームから読み書きタスクを起動する。
pub fn spawn_session(
    stream: TcpStream,
    role: PeerRole,
    id: u64,
    crypto: SessionCrypto,
    settings: &Settings,
    events_tx: mpsc::Sender<RuntimeEvent>,
    jobs_tx: mpsc::Sender<JobRequest>,
) -> SessionHandle {
    let (read_half, write_half) = stream.into_split();
    let (outbound_tx, outbound_rx) = mpsc::channel::<PeerMessage>(settings.outbound_queue);
    let cancel = CancellationToken::new();

    let handle = SessionHandle {
        role,
        id,
        outbound: outbound_tx,
        cancel: cancel.clone(),
    };

    tokio::spawn(writer_task(
        write_half,
        outbound_rx,
        crypto.clone(),
        role,
        settings.heartbeat_interval,
        cancel.clone(),
    ));
    tokio::spawn(reader_task(
        read_half,
        crypto,
        role,
        id,
        settings.heartbeat_interval * 3,
        settings.max_frame_bytes,
        events_tx,
        jobs_tx,
        cancel,
    ));

    handle
}

/// 書き込みタスク。送信ストリームの唯一の書き手。
/// seqは0から方向ごとに単調増加し、ハートビートも同じ系列を使う。
async fn writer_task(
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut outbound_rx: mpsc::Receiver<PeerMessage>,
    crypto: SessionCrypto,
    role: PeerRole,
    heartbeat: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut seq: u64 = 0;
    let mut ticker = tokio::time::interval(heartbeat);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // 初回tickは即時発火するため読み飛ばす
    ticker.tick().await;

    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => PeerMessage::Heartbeat,
            msg = outbound_rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let frame = match seal_frame(&crypto, role, seq, &message) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(%role, "フレームの封緘に失敗: {e}");
                break;
            }
        };
        if let Err(e) = write_prefixed(&mut write_half, &frame).await {
            tracing::debug!(%role, "送信ストリームが閉じられました: {e}");
            break;
        }
        seq += 1;
    }
    cancel.cancel();
}

/// 読み取りタスク。seq規律・サイズ上限・アイドル検出・ロール別許可を適用し、
/// 受理したメッセージをディスパッチチャネルへ転送する。
#[allow(clippy::too_many_arguments)]
async fn reader_task(
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    crypto: SessionCrypto,
    role: PeerRole,
    id: u64,
    idle_after: std::time::Duration,
    max_frame_bytes: usize,
    events_tx: mpsc::Sender<RuntimeEvent>,
    jobs_tx: mpsc::Sender<JobRequest>,
    cancel: CancellationToken,
) {
    let mut expected_seq: u64 = 0;
    let reason = loop {
        let frame_bytes = tokio::select! {
            _ = cancel.cancelled() => break "セッション破棄".to_string(),
            read = tokio::time::timeout(idle_after, read_prefixed(&mut read_half, max_frame_bytes)) => {
                match read {
                    Err(_) => break TransportError::Idle.to_string(),
                    Ok(Err(e)) => break e.to_string(),
                    Ok(Ok(bytes)) => bytes,
                }
            }
        };

        let message = match open_frame(&crypto, role, expected_seq, &frame_bytes) {
            Ok(message) => message,
            Err(e) => break e.to_string(),
        };
        expected_seq += 1;

        if !admission_allows(role, &message) {
            tracing::warn!(%role, "ロールで許可されないメッセージを破棄しました");
            continue;
        }

        match message {
            PeerMessage::Heartbeat => {}
            PeerMessage::JobExecute(request) => {
                // ジョブキューが満杯の間このセッションの読み取りは停止し、
                // バックプレッシャーがピアへ伝播する
                if jobs_tx.send(request).await.is_err() {
                    break "ジョブキューが閉じられました".to_string();
                }
            }
            other => {
                if events_tx
                    .send(RuntimeEvent::Frame {
                        role,
                        message: other,
                    })
                    .await
                    .is_err()
                {
                    break "イベントチャネルが閉じられました".to_string();
                }
            }
        }
    };

    cancel.cancel();
    tracing::info!(%role, id, "ピアセッションを終了します: {reason}");
    let _ = events_tx
        .send(RuntimeEvent::PeerDisconnected { role, id, reason })
        .await;
}
