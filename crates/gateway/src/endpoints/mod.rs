//! # Gatewayエンドポイント
//!
//! - `POST /upload`: multipartで受け取ったファイルをリモートストレージへ転送
//! - `GET /test`: 認証情報の状態確認

pub mod status;
pub mod upload;

pub use status::handle_status;
pub use upload::handle_upload;
