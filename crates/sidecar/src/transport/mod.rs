//! # 暗号化トランスポート
//!
//! ピア接続ごとのAttestationハンドシェイク・AEADフレーム・セッション管理。
//!
//! - [`frame`] — フレームコーデック（seq規律・AAD束縛・サイズ上限）
//! - [`session`] — ハンドシェイクと読み書きタスク
//! - [`manager`] — ロール別セッションスロットと受け入れループ

pub mod frame;
pub mod manager;
pub mod session;

use challenge_types::{PeerMessage, PeerRole};

/// トランスポート層からランタイムへ通知されるイベント。
#[derive(Debug)]
pub enum RuntimeEvent {
    /// ハンドシェイク完了によりセッションが確立された
    PeerConnected {
        /// 確立したセッションのロール
        role: PeerRole,
        /// セッションID
        id: u64,
    },
    /// セッションが破棄された
    PeerDisconnected {
        /// 破棄されたセッションのロール
        role: PeerRole,
        /// セッションID（入れ替わり検出用）
        id: u64,
        /// 破棄理由（ログ用）
        reason: String,
    },
    /// 受理済みフレーム（job.executeを除く。ジョブは専用キューに流れる）
    Frame {
        /// 受信元セッションのロール
        role: PeerRole,
        /// 復号済みメッセージ
        message: PeerMessage,
    },
}
