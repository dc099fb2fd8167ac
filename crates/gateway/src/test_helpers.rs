//! # テスト用共通ヘルパー
//!
//! multipart本文の組み立て、メモリ上のストレージと認証情報プロバイダ、
//! モックHTTPサーバーの起動。

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};

use crate::auth::{AuthorizationContext, CredentialError, CredentialProvider};
use crate::multipart::PartBody;
use crate::storage::{ObjectMetadata, ObjectStore, UploadError};

pub const TEST_BOUNDARY: &str = "----relay-test-boundary-7MA4YWxkTrZu0gW";

/// テスト本文の1パート。
pub struct TestPart {
    pub field_name: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

/// `files` フィールドのファイルパート。
pub fn file_part(file_name: &str, content_type: &str, data: &[u8]) -> TestPart {
    TestPart {
        field_name: "files".to_string(),
        file_name: Some(file_name.to_string()),
        content_type: Some(content_type.to_string()),
        data: data.to_vec(),
    }
}

/// ファイルではない通常のフォームフィールド。
pub fn text_part(name: &str, value: &str) -> TestPart {
    TestPart {
        field_name: name.to_string(),
        file_name: None,
        content_type: None,
        data: value.as_bytes().to_vec(),
    }
}

pub fn multipart_body(boundary: &str, parts: &[TestPart]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        let mut disposition = format!("Content-Disposition: form-data; name=\"{}\"", part.field_name);
        if let Some(file_name) = &part.file_name {
            disposition.push_str(&format!("; filename=\"{file_name}\""));
        }
        body.extend_from_slice(disposition.as_bytes());
        body.extend_from_slice(b"\r\n");
        if let Some(content_type) = &part.content_type {
            body.extend_from_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
        }
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(&part.data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    body
}

/// 本文を `chunk_size` バイトずつ届くストリームにする。
pub fn chunked_body(
    body: Vec<u8>,
    chunk_size: usize,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    let body = Bytes::from(body);
    let chunks: Vec<_> = (0..body.len())
        .step_by(chunk_size)
        .map(|start| Ok(body.slice(start..(start + chunk_size).min(body.len()))))
        .collect();
    futures::stream::iter(chunks)
}

pub fn multipart_content_type(boundary: &str) -> String {
    format!("multipart/form-data; boundary={boundary}")
}

// ---------------------------------------------------------------------------
// メモリ上のストレージ
// ---------------------------------------------------------------------------

/// `MockStore` が受け取ったオブジェクト。
#[derive(Debug, Clone)]
pub struct ReceivedObject {
    pub name: String,
    pub content_type: String,
    /// `discarding_data` 指定時は空
    pub data: Vec<u8>,
    pub size: usize,
    /// 受け取った最大チャンク長
    pub max_chunk: usize,
    pub token: String,
}

/// 本文を読み切ってメモリに保存するストレージ。
/// ファイル名ごとに失敗や遅延を設定できる。
#[derive(Default)]
pub struct MockStore {
    next_id: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    rejected: HashSet<String>,
    unauthorized: HashSet<String>,
    delays: HashMap<String, Duration>,
    received: Mutex<Vec<ReceivedObject>>,
    keep_data: bool,
}

impl MockStore {
    pub fn new() -> Self {
        Self {
            keep_data: true,
            ..Self::default()
        }
    }

    /// このファイル名の配送を HTTP 500 で拒否する。
    pub fn rejecting(mut self, file_name: &str) -> Self {
        self.rejected.insert(file_name.to_string());
        self
    }

    /// このファイル名の配送を認可エラーにする。
    pub fn unauthorized_for(mut self, file_name: &str) -> Self {
        self.unauthorized.insert(file_name.to_string());
        self
    }

    /// 本文を読み終えてから確認応答までに待つ時間。
    pub fn delayed(mut self, file_name: &str, delay: Duration) -> Self {
        self.delays.insert(file_name.to_string(), delay);
        self
    }

    /// 受け取ったバイト列を保持しない（大きな本文のテスト用）。
    pub fn discarding_data(mut self) -> Self {
        self.keep_data = false;
        self
    }

    pub fn received(&self) -> Vec<ReceivedObject> {
        self.received.lock().unwrap().clone()
    }

    pub fn upload_count(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ObjectStore for MockStore {
    async fn upload(
        &self,
        metadata: &ObjectMetadata,
        mut content: PartBody,
        auth: &AuthorizationContext,
    ) -> Result<String, UploadError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let result = async {
            let mut data = Vec::new();
            let mut max_chunk = 0;
            let mut size = 0;
            while let Some(chunk) = content.next().await {
                let chunk = chunk.map_err(|e| UploadError::Source(e.to_string()))?;
                max_chunk = max_chunk.max(chunk.len());
                size += chunk.len();
                if self.keep_data {
                    data.extend_from_slice(&chunk);
                }
            }

            if let Some(delay) = self.delays.get(&metadata.name) {
                tokio::time::sleep(*delay).await;
            }
            if self.rejected.contains(&metadata.name) {
                return Err(UploadError::Rejected {
                    status: 500,
                    body: "backend error".to_string(),
                });
            }
            if self.unauthorized.contains(&metadata.name) {
                return Err(UploadError::Unauthorized(401));
            }

            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            self.received.lock().unwrap().push(ReceivedObject {
                name: metadata.name.clone(),
                content_type: metadata.content_type.clone(),
                data,
                size,
                max_chunk,
                token: auth.token().to_string(),
            });
            Ok(format!("obj-{id}"))
        }
        .await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

// ---------------------------------------------------------------------------
// 認証情報プロバイダ
// ---------------------------------------------------------------------------

/// 呼び出し回数を記録するプロバイダ。
pub struct MockProvider {
    ready: bool,
    token_error: Option<String>,
    authorize_calls: AtomicUsize,
    invalidations: AtomicUsize,
}

impl MockProvider {
    pub fn ready() -> Self {
        Self {
            ready: true,
            token_error: None,
            authorize_calls: AtomicUsize::new(0),
            invalidations: AtomicUsize::new(0),
        }
    }

    pub fn not_ready() -> Self {
        Self {
            ready: false,
            ..Self::ready()
        }
    }

    /// 準備済みと報告するが、トークン取得は `TokenRequest` で失敗する。
    pub fn failing_token_exchange(reason: &str) -> Self {
        Self {
            token_error: Some(reason.to_string()),
            ..Self::ready()
        }
    }

    pub fn authorize_calls(&self) -> usize {
        self.authorize_calls.load(Ordering::SeqCst)
    }

    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl CredentialProvider for MockProvider {
    fn is_ready(&self) -> bool {
        self.ready
    }

    fn describe(&self) -> String {
        if self.ready {
            "mock credentials".to_string()
        } else {
            "mock credentials missing".to_string()
        }
    }

    async fn authorize(&self) -> Result<AuthorizationContext, CredentialError> {
        self.authorize_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = &self.token_error {
            Err(CredentialError::TokenRequest(reason.clone()))
        } else if self.ready {
            Ok(AuthorizationContext::bearer("mock-token"))
        } else {
            Err(CredentialError::NotConfigured(self.describe()))
        }
    }

    async fn invalidate(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// モックHTTPサーバー
// ---------------------------------------------------------------------------

/// ルーターを `127.0.0.1` の空きポートで起動し、ポート番号を返す。
pub async fn start_server(app: axum::Router) -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}
