//! # Google Drive 互換ストレージ
//!
//! `files.create` のマルチパートアップロード（`uploadType=multipart`）で
//! メタデータと本文を1リクエストで送る。本文はパートの読み取りと同時に
//! chunked転送で流すため、全長を事前に知る必要はない。
//!
//! 中断された本文はリモート側でコミットされないため、失敗時に
//! 途中までのオブジェクトは残らない。

use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::Deserialize;

use super::{ObjectMetadata, ObjectStore, UploadError};
use crate::auth::AuthorizationContext;
use crate::multipart::{PartBody, PartError};

/// エラー応答本文を保持する最大長。
const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Deserialize)]
struct DriveFile {
    #[serde(default)]
    id: Option<String>,
}

/// Google Drive 互換APIへのアップロード実装。
pub struct DriveStorage {
    http_client: reqwest::Client,
    api_base: String,
    folder_id: String,
}

impl DriveStorage {
    pub fn new(
        http_client: reqwest::Client,
        api_base: impl Into<String>,
        folder_id: impl Into<String>,
    ) -> Self {
        Self {
            http_client,
            api_base: api_base.into(),
            folder_id: folder_id.into(),
        }
    }

    fn upload_url(&self) -> String {
        format!(
            "{}/upload/drive/v3/files?uploadType=multipart&fields=id&supportsAllDrives=true",
            self.api_base.trim_end_matches('/')
        )
    }

    /// multipart/related の先頭（メタデータパートとメディアパートのヘッダ）。
    fn related_head(&self, boundary: &str, metadata: &ObjectMetadata) -> Bytes {
        let json = serde_json::json!({
            "name": metadata.name,
            "mimeType": metadata.content_type,
            "parents": [self.folder_id],
        });
        Bytes::from(format!(
            "--{boundary}\r\n\
             Content-Type: application/json; charset=UTF-8\r\n\r\n\
             {json}\r\n\
             --{boundary}\r\n\
             Content-Type: {}\r\n\r\n",
            metadata.content_type
        ))
    }
}

#[async_trait::async_trait]
impl ObjectStore for DriveStorage {
    async fn upload(
        &self,
        metadata: &ObjectMetadata,
        content: PartBody,
        auth: &AuthorizationContext,
    ) -> Result<String, UploadError> {
        let boundary = format!("relay-{}", uuid::Uuid::new_v4().simple());
        let head = self.related_head(&boundary, metadata);
        let tail = Bytes::from(format!("\r\n--{boundary}--\r\n"));

        // パート本文の読み取りエラーを接続エラーと区別するために記録する
        let source_failure = Arc::new(OnceLock::<String>::new());
        let seen = source_failure.clone();
        let media = content.map(move |chunk| {
            chunk.inspect_err(|e| {
                let _ = seen.set(e.to_string());
            })
        });
        let stream = futures::stream::iter([Ok::<_, PartError>(head)])
            .chain(media)
            .chain(futures::stream::iter([Ok(tail)]));

        let sent = self
            .http_client
            .post(self.upload_url())
            .bearer_auth(auth.token())
            .header(
                CONTENT_TYPE,
                format!("multipart/related; boundary={boundary}"),
            )
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await;

        if let Some(reason) = source_failure.get() {
            return Err(UploadError::Source(reason.clone()));
        }
        let response = sent.map_err(|e| UploadError::Network(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(UploadError::Unauthorized(status.as_u16()));
        }
        if !status.is_success() {
            let body: String = response
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(MAX_ERROR_BODY_CHARS)
                .collect();
            tracing::warn!(
                file_name = %metadata.name,
                status = status.as_u16(),
                "リモートストレージがアップロードを拒否"
            );
            return Err(UploadError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let file: DriveFile = response
            .json()
            .await
            .map_err(|e| UploadError::InvalidResponse(e.to_string()))?;
        match file.id {
            Some(id) if !id.is_empty() => Ok(id),
            _ => Err(UploadError::InvalidResponse(
                "response has no object id".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use axum::extract::Query;
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::Json;

    use super::*;
    use crate::test_helpers::start_server;

    /// モックDriveが受け取ったリクエスト。
    #[derive(Debug, Clone)]
    struct CapturedRequest {
        authorization: String,
        query: HashMap<String, String>,
        metadata: serde_json::Value,
        media_type: String,
        media: Vec<u8>,
    }

    fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|w| w == needle)
    }

    /// multipart/related の本文をメタデータとメディアに分ける。
    fn split_related(content_type: &str, body: &[u8]) -> (serde_json::Value, String, Vec<u8>) {
        let boundary = content_type
            .split("boundary=")
            .nth(1)
            .expect("boundary parameter");
        let delimiter = format!("--{boundary}\r\n");
        let closing = format!("\r\n--{boundary}--\r\n");

        assert!(body.starts_with(delimiter.as_bytes()));
        assert!(body.ends_with(closing.as_bytes()));
        let inner = &body[delimiter.len()..body.len() - closing.len()];

        let header_end = find(inner, b"\r\n\r\n").unwrap();
        let meta_start = header_end + 4;
        let meta_end = meta_start + find(&inner[meta_start..], b"\r\n").unwrap();
        let metadata = serde_json::from_slice(&inner[meta_start..meta_end]).unwrap();

        let media_section = &inner[meta_end + 2 + delimiter.len()..];
        let media_header_end = find(media_section, b"\r\n\r\n").unwrap();
        let media_type = String::from_utf8(media_section[..media_header_end].to_vec())
            .unwrap()
            .trim_start_matches("Content-Type: ")
            .to_string();
        let media = media_section[media_header_end + 4..].to_vec();
        (metadata, media_type, media)
    }

    /// 指定のステータスと本文を返すモックDriveを起動する。
    async fn start_mock_drive(
        status: AxumStatus,
        response: serde_json::Value,
    ) -> (u16, Arc<Mutex<Vec<CapturedRequest>>>) {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let sink = captured.clone();
        let app = axum::Router::new().route(
            "/upload/drive/v3/files",
            axum::routing::post(
                move |Query(query): Query<HashMap<String, String>>,
                      headers: HeaderMap,
                      body: Bytes| {
                    let sink = sink.clone();
                    let response = response.clone();
                    async move {
                        let content_type = headers["content-type"].to_str().unwrap().to_string();
                        assert!(content_type.starts_with("multipart/related; boundary="));
                        let (metadata, media_type, media) = split_related(&content_type, &body);
                        sink.lock().unwrap().push(CapturedRequest {
                            authorization: headers["authorization"].to_str().unwrap().to_string(),
                            query,
                            metadata,
                            media_type,
                            media,
                        });
                        (status, Json(response))
                    }
                },
            ),
        );
        (start_server(app).await, captured)
    }

    fn metadata(name: &str, content_type: &str) -> ObjectMetadata {
        ObjectMetadata {
            name: name.to_string(),
            content_type: content_type.to_string(),
        }
    }

    fn body_of(chunks: &[&'static [u8]]) -> PartBody {
        PartBody::from_chunks(
            chunks
                .iter()
                .map(|c| Ok(Bytes::from_static(c)))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_upload_streams_metadata_and_media() {
        let (port, captured) =
            start_mock_drive(AxumStatus::OK, serde_json::json!({"id": "drive-file-1"})).await;
        let storage = DriveStorage::new(
            reqwest::Client::new(),
            format!("http://127.0.0.1:{port}/"),
            "folder-123",
        );

        let id = storage
            .upload(
                &metadata("photo.jpg", "image/jpeg"),
                body_of(&[b"\xff\xd8jpeg ", b"bytes\r\n--x", b" end"]),
                &AuthorizationContext::bearer("ya29.test"),
            )
            .await
            .unwrap();
        assert_eq!(id, "drive-file-1");

        let requests = captured.lock().unwrap().clone();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.authorization, "Bearer ya29.test");
        assert_eq!(request.query["uploadType"], "multipart");
        assert_eq!(request.query["fields"], "id");
        assert_eq!(request.query["supportsAllDrives"], "true");
        assert_eq!(request.metadata["name"], "photo.jpg");
        assert_eq!(request.metadata["mimeType"], "image/jpeg");
        assert_eq!(request.metadata["parents"], serde_json::json!(["folder-123"]));
        assert_eq!(request.media_type, "image/jpeg");
        assert_eq!(request.media, b"\xff\xd8jpeg bytes\r\n--x end");
    }

    #[tokio::test]
    async fn test_unauthorized_status() {
        for status in [AxumStatus::UNAUTHORIZED, AxumStatus::FORBIDDEN] {
            let (port, _) =
                start_mock_drive(status, serde_json::json!({"error": "invalid_token"})).await;
            let storage =
                DriveStorage::new(reqwest::Client::new(), format!("http://127.0.0.1:{port}"), "f");
            let err = storage
                .upload(
                    &metadata("a.png", "image/png"),
                    body_of(&[b"png"]),
                    &AuthorizationContext::bearer("expired"),
                )
                .await
                .unwrap_err();
            assert!(matches!(err, UploadError::Unauthorized(code) if code == status.as_u16()));
        }
    }

    #[tokio::test]
    async fn test_backend_error_is_rejected() {
        let (port, _) = start_mock_drive(
            AxumStatus::INTERNAL_SERVER_ERROR,
            serde_json::json!({"error": {"message": "backend exploded"}}),
        )
        .await;
        let storage =
            DriveStorage::new(reqwest::Client::new(), format!("http://127.0.0.1:{port}"), "f");
        let err = storage
            .upload(
                &metadata("c.png", "image/png"),
                body_of(&[b"png"]),
                &AuthorizationContext::bearer("t"),
            )
            .await
            .unwrap_err();
        match err {
            UploadError::Rejected { status, body } => {
                assert_eq!(status, 500);
                assert!(body.contains("backend exploded"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_success_without_id_is_invalid_response() {
        let (port, _) = start_mock_drive(AxumStatus::OK, serde_json::json!({"kind": "drive#file"})).await;
        let storage =
            DriveStorage::new(reqwest::Client::new(), format!("http://127.0.0.1:{port}"), "f");
        let err = storage
            .upload(
                &metadata("a.mp4", "video/mp4"),
                body_of(&[b"mp4"]),
                &AuthorizationContext::bearer("t"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::InvalidResponse(_)));
    }

    /// パート本文の読み取りエラーはネットワークエラーではなく `Source` になる
    #[tokio::test]
    async fn test_source_error_is_propagated() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = axum::Router::new().route(
            "/upload/drive/v3/files",
            axum::routing::post(move |_body: Bytes| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Json(serde_json::json!({"id": "should-not-commit"}))
                }
            }),
        );
        let port = start_server(app).await;
        let storage =
            DriveStorage::new(reqwest::Client::new(), format!("http://127.0.0.1:{port}"), "f");

        let content = PartBody::from_chunks(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(PartError::Truncated("body ended before the closing boundary".to_string())),
        ]);
        let err = storage
            .upload(
                &metadata("cut.jpg", "image/jpeg"),
                content,
                &AuthorizationContext::bearer("t"),
            )
            .await
            .unwrap_err();
        match err {
            UploadError::Source(msg) => assert!(msg.contains("truncated")),
            other => panic!("unexpected: {other:?}"),
        }
        // 本文が完結しないため、ハンドラまで到達しない
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_network_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let storage =
            DriveStorage::new(reqwest::Client::new(), format!("http://127.0.0.1:{port}"), "f");
        let err = storage
            .upload(
                &metadata("a.jpg", "image/jpeg"),
                body_of(&[b"jpeg"]),
                &AuthorizationContext::bearer("t"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Network(_)));
    }
}
