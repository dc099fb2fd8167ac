//! # Gateway エラー型
//!
//! バッチを中断させたエラーをHTTPステータスに対応付ける。
//! パート単位の失敗は `BatchResult` に集約されるため、ここには現れない。

use axum::http::StatusCode;

use crate::batch::BatchError;

/// Gatewayエラー型。
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// 認証情報が未設定・不正、またはトークン取得に失敗
    #[error("storage credentials are not available: {0}")]
    Configuration(String),
    /// multipart本文が不正（パートを1つも取り出せなかった）
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    /// ファイルパートが含まれていない
    #[error("no files provided")]
    NoFilesProvided,
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::MalformedRequest(_) | GatewayError::NoFilesProvided => {
                StatusCode::BAD_REQUEST
            }
        }
    }
}

impl From<BatchError> for GatewayError {
    fn from(err: BatchError) -> Self {
        match err {
            BatchError::Credentials(e) => GatewayError::Configuration(e.to_string()),
            BatchError::Malformed(e) => GatewayError::MalformedRequest(e.to_string()),
            BatchError::NoFilesProvided => GatewayError::NoFilesProvided,
        }
    }
}

impl axum::response::IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        (self.status_code(), self.to_string()).into_response()
    }
}
