//! # Intel TDX Quoteプロバイダ
//!
//! Linuxのconfigfs-tsmレポートインターフェース経由でTDX Quoteを取得する。
//!
//! ## 取得手順
//! 1. `/sys/kernel/config/tsm/report/` 配下に一時レポートディレクトリを作成
//! 2. `inblob` にreport_data（64バイト、後半ゼロ詰め）を書き込む
//! 3. `outblob` からQuoteを読み出す
//! 4. レポートディレクトリを削除
//!
//! イベントログはACPI CCELテーブルから読み出す（存在しない場合は空）。

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use super::{QuoteBundle, QuoteProvider};
use crate::error::AttestationError;

/// configfs-tsmレポートのルートディレクトリ
const TSM_REPORT_ROOT: &str = "/sys/kernel/config/tsm/report";
/// TDXイベントログ（CCEL）のACPIテーブルパス
const CCEL_TABLE_PATH: &str = "/sys/firmware/acpi/tables/data/CCEL";
/// inblobの固定長（TDX REPORTDATAは64バイト）
const REPORT_DATA_LEN: usize = 64;

/// レポートディレクトリ名の衝突回避用カウンタ
static REPORT_SEQ: AtomicU64 = AtomicU64::new(0);

/// TDX Quoteプロバイダ。
#[derive(Debug)]
pub struct TdxQuoteProvider {
    /// configfs-tsmレポートのルート
    report_root: PathBuf,
    /// イベントログの読み出し元
    event_log_path: PathBuf,
}

impl Default for TdxQuoteProvider {
    fn default() -> Self {
        Self {
            report_root: PathBuf::from(TSM_REPORT_ROOT),
            event_log_path: PathBuf::from(CCEL_TABLE_PATH),
        }
    }
}

impl TdxQuoteProvider {
    /// レポートルートを指定して構築する（テスト用）。
    pub fn with_root(report_root: impl Into<PathBuf>, event_log_path: impl Into<PathBuf>) -> Self {
        Self {
            report_root: report_root.into(),
            event_log_path: event_log_path.into(),
        }
    }

    fn make_report_dir(&self) -> Result<PathBuf, AttestationError> {
        if !self.report_root.is_dir() {
            return Err(AttestationError::QuoteUnavailable(format!(
                "configfs-tsmが利用できません: {}",
                self.report_root.display()
            )));
        }
        let seq = REPORT_SEQ.fetch_add(1, Ordering::Relaxed);
        let dir = self
            .report_root
            .join(format!("challenge-{}-{seq}", std::process::id()));
        std::fs::create_dir(&dir).map_err(|e| {
            AttestationError::QuoteUnavailable(format!(
                "レポートディレクトリを作成できません: {e}"
            ))
        })?;
        Ok(dir)
    }

    fn write_inblob(dir: &Path, report_data: &[u8; 32]) -> Result<(), AttestationError> {
        // TDXのREPORTDATAは64バイト。SHA-256ダイジェストを前半に置き後半はゼロ詰め。
        let mut inblob = [0u8; REPORT_DATA_LEN];
        inblob[..report_data.len()].copy_from_slice(report_data);

        let mut file = std::fs::File::create(dir.join("inblob")).map_err(|e| {
            AttestationError::QuoteUnavailable(format!("inblobを開けません: {e}"))
        })?;
        file.write_all(&inblob).map_err(|e| {
            AttestationError::QuoteUnavailable(format!("inblobへの書き込みに失敗: {e}"))
        })
    }

    fn read_outblob(dir: &Path) -> Result<Vec<u8>, AttestationError> {
        let quote = std::fs::read(dir.join("outblob")).map_err(|e| {
            AttestationError::QuoteUnavailable(format!("outblobの読み出しに失敗: {e}"))
        })?;
        if quote.is_empty() {
            return Err(AttestationError::QuoteUnavailable(
                "outblobが空です".to_string(),
            ));
        }
        Ok(quote)
    }
}

impl QuoteProvider for TdxQuoteProvider {
    fn provider_name(&self) -> &'static str {
        "tdx"
    }

    fn quote(&self, report_data: &[u8; 32]) -> Result<QuoteBundle, AttestationError> {
        let dir = self.make_report_dir()?;

        let result = Self::write_inblob(&dir, report_data).and_then(|_| Self::read_outblob(&dir));

        // 成否に関わらずレポートディレクトリは片付ける
        if let Err(e) = std::fs::remove_dir(&dir) {
            tracing::warn!("レポートディレクトリの削除に失敗: {e}");
        }

        let quote = result?;
        let event_log = std::fs::read(&self.event_log_path).unwrap_or_default();
        Ok(QuoteBundle { quote, event_log })
    }
}
