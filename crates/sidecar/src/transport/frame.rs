//! # 暗号化フレームコーデック
//!
//! ハンドシェイク後の全フレームをAEADで封緘・開封する。
//!
//! ## ワイヤフォーマット
//! ```text
//! [4B: frame_len (BE)] [8B: seq (BE)] [12B: nonce] [AEAD(ct||tag)]
//! ```
//! ハンドシェイクメッセージは `[4B: len (BE)] [JSON]`。
//!
//! ## 不変条件
//! - 方向ごとのseqは0から狭義単調増加。欠落・重複は `TransportError::Replay`
//! - AAD = `"role=" || role_byte || "," || seq_be8`（ロールとseqをタグに束縛）
//! - frame_lenが上限を超えるフレームは復号前に `TransportError::Oversize`
//! - ノンスはフレームごとにCSPRNGから新規生成

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use challenge_crypto::{aead_open, aead_seal, random_array, SymmetricKey, AEAD_NONCE_LEN};
use challenge_types::{HandshakeMessage, PeerMessage, PeerRole};

use crate::error::TransportError;

/// seqフィールド長（バイト）
const SEQ_LEN: usize = 8;
/// ハンドシェイクメッセージの最大長（64KiB）
pub const MAX_HANDSHAKE_BYTES: usize = 64 * 1024;

/// セッションの暗号モード。
/// 開発モードではAttestationと共にAEADも無効化され、平文JSONが流れる。
#[derive(Clone)]
pub enum SessionCrypto {
    /// AEAD封緘（通常運用）
    Sealed(SymmetricKey),
    /// 平文（開発モード限定）
    Plain,
}

impl std::fmt::Debug for SessionCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // 鍵素材はDebug出力にも含めない
        match self {
            SessionCrypto::Sealed(_) => f.write_str("SessionCrypto::Sealed"),
            SessionCrypto::Plain => f.write_str("SessionCrypto::Plain"),
        }
    }
}

/// AADを構築する。`"role=" || role_byte || "," || seq_be8`
pub fn frame_aad(role: PeerRole, seq: u64) -> Vec<u8> {
    let mut aad = Vec::with_capacity(5 + 1 + 1 + SEQ_LEN);
    aad.extend_from_slice(b"role=");
    aad.push(role.role_byte());
    aad.push(b',');
    aad.extend_from_slice(&seq.to_be_bytes());
    aad
}

/// メッセージを封緘してフレームバイト列（長さプレフィックスなし）を構築する。
pub fn seal_frame(
    crypto: &SessionCrypto,
    role: PeerRole,
    seq: u64,
    message: &PeerMessage,
) -> Result<Vec<u8>, TransportError> {
    let plaintext =
        serde_json::to_vec(message).map_err(|e| TransportError::Codec(e.to_string()))?;

    let nonce = random_array::<AEAD_NONCE_LEN>().map_err(|_| TransportError::Integrity)?;
    let payload = match crypto {
        SessionCrypto::Sealed(key) => aead_seal(key, &nonce, &frame_aad(role, seq), &plaintext)
            .map_err(|_| TransportError::Integrity)?,
        SessionCrypto::Plain => plaintext,
    };

    let mut frame = Vec::with_capacity(SEQ_LEN + AEAD_NONCE_LEN + payload.len());
    frame.extend_from_slice(&seq.to_be_bytes());
    frame.extend_from_slice(&nonce);
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// フレームを開封する。seqの厳密一致を要求し、失敗はセッション致命。
pub fn open_frame(
    crypto: &SessionCrypto,
    role: PeerRole,
    expected_seq: u64,
    frame: &[u8],
) -> Result<PeerMessage, TransportError> {
    if frame.len() < SEQ_LEN + AEAD_NONCE_LEN {
        return Err(TransportError::Codec("フレームが短すぎます".to_string()));
    }

    let mut seq_bytes = [0u8; SEQ_LEN];
    seq_bytes.copy_from_slice(&frame[..SEQ_LEN]);
    let seq = u64::from_be_bytes(seq_bytes);
    if seq != expected_seq {
        return Err(TransportError::Replay {
            expected: expected_seq,
            got: seq,
        });
    }

    let mut nonce = [0u8; AEAD_NONCE_LEN];
    nonce.copy_from_slice(&frame[SEQ_LEN..SEQ_LEN + AEAD_NONCE_LEN]);
    let payload = &frame[SEQ_LEN + AEAD_NONCE_LEN..];

    let plaintext = match crypto {
        SessionCrypto::Sealed(key) => aead_open(key, &nonce, &frame_aad(role, seq), payload)
            .map_err(|_| TransportError::Integrity)?,
        SessionCrypto::Plain => payload.to_vec(),
    };

    serde_json::from_slice(&plaintext).map_err(|e| TransportError::Codec(e.to_string()))
}

// ---------------------------------------------------------------------------
// ストリームI/O（length-prefixed）
// ---------------------------------------------------------------------------

/// 長さプレフィックス付きでバイト列を書き込む。
pub async fn write_prefixed<W: AsyncWriteExt + Unpin>(
    stream: &mut W,
    payload: &[u8],
) -> Result<(), TransportError> {
    stream.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

/// 長さプレフィックス付きのバイト列を読み込む。
/// 宣言長が上限を超える場合は本文を読む前に `Oversize` で拒否する。
pub async fn read_prefixed<R: AsyncReadExt + Unpin>(
    stream: &mut R,
    max_bytes: usize,
) -> Result<Vec<u8>, TransportError> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_bytes {
        return Err(TransportError::Oversize {
            len,
            max: max_bytes,
        });
    }
    let mut buf = vec![0u8; len];
    if len > 0 {
        stream.read_exact(&mut buf).await?;
    }
    Ok(buf)
}

/// ハンドシェイクメッセージを書き込む。
pub async fn write_handshake<W: AsyncWriteExt + Unpin>(
    stream: &mut W,
    message: &HandshakeMessage,
) -> Result<(), TransportError> {
    let json =
        serde_json::to_vec(message).map_err(|e| TransportError::Handshake(e.to_string()))?;
    write_prefixed(stream, &json).await
}

/// ハンドシェイクメッセージを読み込む。
pub async fn read_handshake<R: AsyncReadExt + Unpin>(
    stream: &mut R,
) -> Result<HandshakeMessage, TransportError> {
    let bytes = read_prefixed(stream, MAX_HANDSHAKE_BYTES).await?;
    serde_json::from_slice(&bytes).map_err(|e| TransportError::Handshake(e.to_string()))
}
