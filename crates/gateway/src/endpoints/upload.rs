//! # POST /upload
//!
//! multipart/form-data で受け取ったファイルをリモートストレージへ転送する。
//! 全パートの結果が確定してから1度だけ応答する。
//!
//! 応答はプレーンテキスト。`Accept` に `application/json` を含む場合は
//! 同じステータスで `UploadResponse` を返す。

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use relay_types::{BatchResult, UploadResponse};

use crate::batch::BatchReport;
use crate::config::GatewayState;
use crate::error::GatewayError;
use crate::multipart::ParseError;

/// POST /upload: ファイルのバッチアップロード。
pub async fn handle_upload(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let json = wants_json(&headers);
    match state.uploader.run(&headers, body.into_data_stream()).await {
        Ok(report) => report_response(report, json),
        Err(err) => error_response(err.into(), json),
    }
}

fn wants_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("application/json"))
}

fn report_response(report: BatchReport, json: bool) -> Response {
    let BatchReport {
        result,
        parse_error,
    } = report;

    let status = if parse_error.is_some() {
        StatusCode::BAD_REQUEST
    } else if result.all_succeeded() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };

    let message = summary_message(&result, parse_error.as_ref());
    if !json {
        return (status, message).into_response();
    }
    let response = UploadResponse {
        message,
        result,
        parse_error: parse_error.map(|e| e.to_string()),
    };
    (status, Json(response)).into_response()
}

fn error_response(err: GatewayError, json: bool) -> Response {
    if !json {
        return err.into_response();
    }
    let parse_error = match &err {
        GatewayError::MalformedRequest(reason) => Some(reason.clone()),
        _ => None,
    };
    let response = UploadResponse {
        message: err.to_string(),
        result: BatchResult::new(),
        parse_error,
    };
    (err.status_code(), Json(response)).into_response()
}

fn files(n: usize) -> &'static str {
    if n == 1 {
        "file"
    } else {
        "files"
    }
}

/// 応答本文の要約文。
///
/// - 全件成功: `"3 files uploaded successfully"`
/// - それ以外: `"2 files uploaded, 1 failed: c.png (reason)"`
pub fn summary_message(result: &BatchResult, parse_error: Option<&ParseError>) -> String {
    let mut message = if result.all_succeeded() && parse_error.is_none() {
        let n = result.succeeded();
        format!("{n} {} uploaded successfully", files(n))
    } else {
        let mut message = format!(
            "{} {} uploaded, {} failed",
            result.succeeded(),
            files(result.succeeded()),
            result.failed()
        );
        let failures: Vec<String> = result
            .failures()
            .map(|o| {
                format!(
                    "{} ({})",
                    o.file_name,
                    o.error.as_deref().unwrap_or("unknown error")
                )
            })
            .collect();
        if !failures.is_empty() {
            message.push_str(": ");
            message.push_str(&failures.join(", "));
        }
        message
    };

    if let Some(err) = parse_error {
        message.push_str(&format!("; malformed request body: {err}"));
    }
    message
}
