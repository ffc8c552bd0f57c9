//! # 開発用スタブQuoteプロバイダ
//!
//! TEEハードウェアが利用できない開発環境で使用する決定的スタブ。
//! report_dataをそのまま埋め込んだマーカー付きバイト列を返す。
//! 本番のピアはこのQuoteを必ず拒否する。

use super::{QuoteBundle, QuoteProvider};
use crate::error::AttestationError;

/// スタブQuoteの先頭マーカー
const DEV_QUOTE_PREFIX: &[u8] = b"DEV_QUOTE_NOT_ATTESTED:";

/// 開発用Quoteプロバイダ。
#[derive(Debug, Default)]
pub struct DevQuoteProvider;

impl DevQuoteProvider {
    /// スタブプロバイダを初期化する。
    pub fn new() -> Self {
        Self
    }
}

impl QuoteProvider for DevQuoteProvider {
    fn provider_name(&self) -> &'static str {
        "dev"
    }

    /// マーカーとreport_dataを連結した決定的スタブを返す。
    fn quote(&self, report_data: &[u8; 32]) -> Result<QuoteBundle, AttestationError> {
        let mut quote = Vec::with_capacity(DEV_QUOTE_PREFIX.len() + report_data.len());
        quote.extend_from_slice(DEV_QUOTE_PREFIX);
        quote.extend_from_slice(report_data);
        Ok(QuoteBundle {
            quote,
            event_log: Vec::new(),
        })
    }
}
