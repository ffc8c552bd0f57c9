//! # HTTPエンドポイント
//!
//! サイドカーが公開するHTTPサーフェス。
//!
//! | パス | メソッド | 認証 |
//! |------|---------|------|
//! | `/sdk/health` | GET | なし |
//! | `/sdk/weights` | POST | 署名ヘッダ |
//! | `/sdk/public/{name}` | POST | MinerToken |
//! | `/sdk/admin/db/credentials` | POST | 署名ヘッダ + Admin鍵 |

pub mod admin;
pub mod health;
pub mod public;
pub mod weights;

#[cfg(test)]
pub(crate) mod test_helpers;

use std::sync::Arc;

use axum::routing::{get, post};

use crate::state::SidecarState;

/// エンドポイント一式のルーターを構築する。
pub fn router(state: Arc<SidecarState>) -> axum::Router {
    axum::Router::new()
        .route("/sdk/health", get(health::handle_health))
        .route("/sdk/weights", post(weights::handle_weights))
        .route("/sdk/public/:name", post(public::handle_public))
        .route(
            "/sdk/admin/db/credentials",
            post(admin::handle_db_credentials),
        )
        .with_state(state)
}
