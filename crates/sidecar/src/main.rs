//! # Challenge Sidecar エントリポイント
//!
//! 環境変数から設定を読み込み、ランタイムを起動する。
//! ハンドラはライブラリ利用側が [`challenge_sidecar::ChallengeRegistry`] へ
//! 登録する。このバイナリは素のランタイムシェルとして動作する。

use challenge_sidecar::{ChallengeRegistry, Settings};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            tracing::error!("設定の読み込みに失敗しました: {e}");
            std::process::exit(2);
        }
    };

    let registry = ChallengeRegistry::new();
    let code = challenge_sidecar::run(registry, settings).await;
    std::process::exit(code);
}
