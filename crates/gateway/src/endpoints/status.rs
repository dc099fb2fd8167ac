//! # GET /test
//!
//! 認証情報の状態確認エンドポイント。

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use relay_types::StatusResponse;

use crate::config::GatewayState;

/// GET /test: 認証情報の状態を返す。
///
/// 準備済みの場合はアクセストークンの取得まで試し、失敗すれば未準備として報告する。
pub async fn handle_status(State(state): State<Arc<GatewayState>>) -> Json<StatusResponse> {
    let credentials = &state.credentials;
    if !credentials.is_ready() {
        return Json(StatusResponse {
            ready: false,
            detail: credentials.describe(),
        });
    }

    match credentials.authorize().await {
        Ok(_) => Json(StatusResponse {
            ready: true,
            detail: credentials.describe(),
        }),
        Err(e) => {
            tracing::warn!(error = %e, "アクセストークンを取得できません");
            Json(StatusResponse {
                ready: false,
                detail: e.to_string(),
            })
        }
    }
}
