//! # マイグレーションレイアウト
//!
//! マイグレーションの実行はAdminの責務であり、サイドカーはリモートDBに
//! 対してSQLを実行しない。このモジュールは開発モードでローカルDBを使う
//! 場合のディレクトリ規約の検証だけを提供する。
//!
//! ## レイアウト
//! ```text
//! db/migrations/v{N}/NNN_name.sql   （辞書順に適用される）
//! ```

use std::path::{Path, PathBuf};

/// マイグレーションレイアウトのエラー。
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    /// バージョンが[1, 16]の範囲外
    #[error("データベースバージョンが範囲外です（1..=16）: {0}")]
    VersionOutOfRange(i64),
    /// ディレクトリの読み取りに失敗
    #[error("マイグレーションディレクトリの読み取りに失敗: {0}")]
    Io(#[from] std::io::Error),
}

/// 対応する拡張子かどうか。
fn is_migration_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("sql") | Some("script")
    )
}

/// 指定バージョンのマイグレーションファイルを辞書順で列挙する。
/// ディレクトリが存在しない場合は空（適用対象なし）。
pub fn discover_migrations(root: &Path, version: u32) -> Result<Vec<PathBuf>, MigrateError> {
    if !(1..=16).contains(&version) {
        return Err(MigrateError::VersionOutOfRange(i64::from(version)));
    }

    let dir = root.join(format!("v{version}"));
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_migration_file(path))
        .collect();
    files.sort();
    Ok(files)
}
