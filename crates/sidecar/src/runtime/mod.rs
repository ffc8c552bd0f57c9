//! # TEE Quoteプロバイダ抽象化
//!
//! TEE Quoteの取得を抽象化するトレイト。Quoteの検証はリモートピアの
//! 責務であり、サイドカーは生成のみを行う。
//!
//! 現在のプロバイダ実装:
//! - `tdx` — Intel TDX（configfs-tsmレポートインターフェース経由）
//! - `dev` — ローカル開発・テスト用の決定的スタブ

pub mod dev;
pub mod tdx;

use std::sync::Arc;

use crate::config::Settings;
use crate::error::AttestationError;

/// Quoteとイベントログの組。
#[derive(Debug, Clone)]
pub struct QuoteBundle {
    /// ハードウェア署名済みQuote（不透明バイト列）
    pub quote: Vec<u8>,
    /// 起動測定のイベントログ（取得できない場合は空）
    pub event_log: Vec<u8>,
}

/// TEE Quoteプロバイダのトレイト。
pub trait QuoteProvider: Send + Sync {
    /// プロバイダ名（ログ用）。
    fn provider_name(&self) -> &'static str;

    /// report_dataを束縛したQuoteを取得する。
    fn quote(&self, report_data: &[u8; 32]) -> Result<QuoteBundle, AttestationError>;
}

/// 設定に応じたQuoteプロバイダを構築する。
/// 開発モードでは決定的スタブ、それ以外はTDXプロバイダを返す。
pub fn provider_from_settings(settings: &Settings) -> Arc<dyn QuoteProvider> {
    if settings.dev_mode {
        tracing::info!("開発モード: スタブQuoteプロバイダを使用します");
        Arc::new(dev::DevQuoteProvider::new())
    } else {
        Arc::new(tdx::TdxQuoteProvider::default())
    }
}
