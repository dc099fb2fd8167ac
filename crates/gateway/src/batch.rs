//! # バッチアップロード
//!
//! 1リクエスト分のmultipart本文を解析し、ファイルパートごとに
//! リモートストレージへの転送タスクを起動する。全タスクの完了を待ってから
//! 発見順の `BatchResult` を確定する。
//!
//! ## 状態遷移
//! `Idle → Parsing → (パートごと: Dispatched → Resolved)* → Finalizing → Done`
//!
//! 認証情報が未準備の場合と、パートを1つも発見する前に構文エラーになった
//! 場合は転送を始めずに中断する（`BatchError`）。
//!
//! ## 並行性
//! 本文は逐次にしか読めないため、転送の並行化はパート k の確認応答待ちと
//! パート k+1 の解析・転送を重ねる効果のみを持つ。同時転送数は
//! `UploadPolicy::max_in_flight` で制限する。

use std::fmt::Display;
use std::sync::Arc;

use axum::http::HeaderMap;
use bytes::Bytes;
use futures::Stream;
use relay_types::{BatchResult, UploadOutcome};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::auth::{CredentialError, CredentialProvider};
use crate::multipart::{self, MultipartStream, ParseError, UploadPart};
use crate::policy::UploadPolicy;
use crate::storage::{ObjectMetadata, ObjectStore, UploadError};

/// 許可リスト外のパートの失敗理由。
pub const UNSUPPORTED_CONTENT_TYPE: &str = "unsupported content type";

/// 転送を始める前にバッチを中断させるエラー。
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error(transparent)]
    Credentials(#[from] CredentialError),
    #[error("malformed multipart request: {0}")]
    Malformed(ParseError),
    #[error("no files provided")]
    NoFilesProvided,
}

/// 確定したバッチの結果。
#[derive(Debug)]
pub struct BatchReport {
    pub result: BatchResult,
    /// パート発見後に発生した構文エラー。発見済みのパートの結果は `result` にある
    pub parse_error: Option<ParseError>,
}

/// 発見順に並べた、各パートの確定済みまたは転送中の結果。
enum Pending {
    Resolved(UploadOutcome),
    InFlight {
        file_name: String,
        handle: JoinHandle<Result<String, UploadError>>,
    },
}

/// バッチアップロードの実行器。リクエスト間で共有される。
pub struct BatchUploader {
    store: Arc<dyn ObjectStore>,
    credentials: Arc<dyn CredentialProvider>,
    policy: UploadPolicy,
}

impl BatchUploader {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        credentials: Arc<dyn CredentialProvider>,
        policy: UploadPolicy,
    ) -> Self {
        Self {
            store,
            credentials,
            policy,
        }
    }

    /// リクエストのヘッダと本文からバッチを実行する。
    ///
    /// 全パートの結果が確定するまで戻らない。
    pub async fn run<S, E>(&self, headers: &HeaderMap, body: S) -> Result<BatchReport, BatchError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let request_id = uuid::Uuid::new_v4();
        self.run_batch(headers, body)
            .instrument(tracing::info_span!("upload", %request_id))
            .await
    }

    async fn run_batch<S, E>(&self, headers: &HeaderMap, body: S) -> Result<BatchReport, BatchError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        // 未準備なら本文は読まない
        if !self.credentials.is_ready() {
            let reason = self.credentials.describe();
            tracing::error!(%reason, "認証情報が未準備のためアップロードを拒否");
            return Err(CredentialError::NotConfigured(reason).into());
        }

        let boundary = multipart::boundary_from_headers(headers).map_err(BatchError::Malformed)?;
        let auth = self.credentials.authorize().await?;

        let mut parts = MultipartStream::new(&boundary, body);
        let slots = Arc::new(Semaphore::new(self.policy.max_in_flight));
        let mut pending = Vec::new();
        let mut parse_error = None;

        loop {
            let part = match parts.next_part().await {
                Some(Ok(part)) => part,
                Some(Err(err)) if pending.is_empty() => return Err(BatchError::Malformed(err)),
                Some(Err(err)) => {
                    parse_error = Some(err);
                    break;
                }
                None => break,
            };

            // 対象外のパートは破棄すると残りが読み捨てられる
            if !part.is_file() || part.field_name != self.policy.field_name {
                tracing::debug!(field = %part.field_name, "アップロード対象外のパートをスキップ");
                continue;
            }
            let UploadPart {
                file_name,
                content_type,
                body,
                ..
            } = part;
            let file_name = file_name.unwrap_or_default();

            if !self.policy.allowed_types.allows(&content_type) {
                tracing::warn!(%file_name, %content_type, "許可されていないContent-Type");
                pending.push(Pending::Resolved(UploadOutcome::failed(
                    file_name,
                    UNSUPPORTED_CONTENT_TYPE,
                )));
                continue;
            }

            // slots はこの関数内だけで使い、close しない
            let permit = match slots.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => unreachable!("upload slots are never closed"),
            };

            tracing::info!(%file_name, %content_type, "転送を開始");
            let store = self.store.clone();
            let auth = auth.clone();
            let metadata = ObjectMetadata {
                name: file_name.clone(),
                content_type,
            };
            let handle = tokio::spawn(
                async move {
                    let _permit = permit;
                    store.upload(&metadata, body, &auth).await
                }
                .instrument(tracing::info_span!("part", file_name = %file_name)),
            );
            pending.push(Pending::InFlight { file_name, handle });
        }

        if pending.is_empty() {
            tracing::info!("ファイルパートがありません");
            return Err(BatchError::NoFilesProvided);
        }

        let result = self.join_in_order(pending).await;
        tracing::info!(
            succeeded = result.succeeded(),
            failed = result.failed(),
            parse_error = ?parse_error,
            "バッチ完了"
        );
        Ok(BatchReport {
            result,
            parse_error,
        })
    }

    /// 全タスクの完了を発見順に待つ。
    async fn join_in_order(&self, pending: Vec<Pending>) -> BatchResult {
        let mut result = BatchResult::new();
        let mut invalidated = false;

        for entry in pending {
            let outcome = match entry {
                Pending::Resolved(outcome) => outcome,
                Pending::InFlight { file_name, handle } => match handle.await {
                    Ok(Ok(object_id)) => {
                        tracing::info!(%file_name, %object_id, "転送完了");
                        UploadOutcome::succeeded(file_name, object_id)
                    }
                    Ok(Err(err)) => {
                        if let UploadError::Rejected { body, .. } = &err {
                            tracing::debug!(%file_name, %body, "リモートの応答本文");
                        }
                        if matches!(err, UploadError::Unauthorized(_)) && !invalidated {
                            self.credentials.invalidate().await;
                            invalidated = true;
                        }
                        tracing::warn!(%file_name, error = %err, "転送失敗");
                        UploadOutcome::failed(file_name, err.to_string())
                    }
                    Err(join_err) => {
                        tracing::error!(%file_name, error = %join_err, "転送タスクが異常終了");
                        let reason = if join_err.is_panic() {
                            "upload task panicked"
                        } else {
                            "upload task cancelled"
                        };
                        UploadOutcome::failed(file_name, reason)
                    }
                },
            };
            result.push(outcome);
        }
        result
    }
}
