//! # Upload Relay Gateway
//!
//! ブラウザから multipart/form-data で送られたファイルを、ディスクにも
//! メモリにも溜めずにリモートストレージ（Google Drive 互換API）へ中継する。
//!
//! ## 役割
//! - multipart本文の逐次解析
//! - パートごとのリモートストレージへのストリーミング転送
//! - 1リクエスト内のパート結果の集約と応答
//! - サービスアカウント認証情報によるアクセストークンの取得
//!
//! ## API エンドポイント
//! - `POST /upload`: ファイルのバッチアップロード
//! - `GET /test`: 認証情報の状態確認

mod auth;
mod batch;
mod config;
mod endpoints;
mod error;
mod multipart;
mod policy;
mod storage;
#[cfg(test)]
mod test_helpers;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::config::{GatewayConfig, GatewayState};
use crate::endpoints::{handle_status, handle_upload};
use crate::storage::DriveStorage;

/// ルーターを構築する。
fn app(state: Arc<GatewayState>, max_body_bytes: usize) -> axum::Router {
    axum::Router::new()
        .route("/upload", axum::routing::post(handle_upload))
        .route("/test", axum::routing::get(handle_status))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// エントリポイント
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = GatewayConfig::from_env()?;
    let http_client = reqwest::Client::builder().build()?;

    // 認証情報の問題では起動を止めない（/test と /upload で報告する）
    let credentials = auth::provider_from_env(http_client.clone());
    let storage = DriveStorage::new(http_client, config.api_base.clone(), config.folder_id.clone());
    let state = Arc::new(GatewayState::new(
        config.policy(),
        Arc::new(storage),
        credentials,
    ));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(
        %addr,
        folder_id = %config.folder_id,
        field_name = %config.field_name,
        allowed_types = %config.allowed_types,
        max_in_flight = config.max_in_flight,
        part_buffer_bytes = multipart::MAX_CHUNK_BYTES * multipart::PART_BUFFER_CHUNKS,
        "Upload Relay Gatewayを起動します"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app(state, config.max_body_bytes)).await?;

    Ok(())
}

// ---------------------------------------------------------------------------
// テスト
// ---------------------------------------------------------------------------
