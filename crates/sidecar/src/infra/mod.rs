//! # インバウンド認証基盤
//!
//! - [`request_auth`] — 署名ヘッダ付きリクエストの検証（タイムスタンプ鮮度・
//!   ノンスリプレイキャッシュ・ハンドシェイクで記録したピア鍵との照合）
//! - [`miner_token`] — 公開エンドポイント用プロキシ発行トークンの検証

pub mod miner_token;
pub mod request_auth;
