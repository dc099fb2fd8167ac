//! # multipart/form-data ストリーミング解析
//!
//! リクエスト本文を逐次読みながらパートを1つずつ払い出す。
//! 本文の読み取りは専用タスクで行い、呼び出し側とは有界チャネルで接続する。
//!
//! - パート列: 容量1のチャネル。パートは区切り線の出現順に届く。
//! - パート本文: 容量 `PART_BUFFER_CHUNKS` のチャネル。各要素は最大
//!   `MAX_CHUNK_BYTES`。読み手が遅ければ本文の受信も止まる（背圧）。
//!
//! パート本文の受け手が途中で破棄した場合、残りのバイトは読み捨てて
//! 次のパートへ進む。本文が途中で終わった場合、そのパートの本文には
//! `PartError::Truncated` が、パート列には `ParseError` が届く。

mod parser;

use std::fmt::Display;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::http::{header, HeaderMap};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

pub use parser::MAX_CHUNK_BYTES;
use parser::{Event, Parser};

/// パート本文チャネルに溜められるチャンク数。
pub const PART_BUFFER_CHUNKS: usize = 4;

/// RFC 2046 の boundary 長さ上限。
const MAX_BOUNDARY_LEN: usize = 70;

/// multipart本文の構文エラー。パート列を終了させる。
#[derive(Debug, Clone, thiserror::Error)]
pub enum ParseError {
    #[error("invalid Content-Type: {0}")]
    InvalidContentType(String),
    #[error("multipart boundary not found in body")]
    MissingBoundary,
    #[error("malformed multipart delimiter line")]
    InvalidDelimiter,
    #[error("part header block too large")]
    HeaderTooLarge,
    #[error("malformed part header: {0}")]
    MalformedHeader(String),
    #[error("body ended before the closing boundary")]
    UnexpectedEof,
    #[error("failed to read request body: {0}")]
    Transport(String),
}

/// パート本文の読み取りエラー（短い読み取り）。
#[derive(Debug, Clone, thiserror::Error)]
pub enum PartError {
    #[error("part data truncated: {0}")]
    Truncated(String),
}

/// リクエストから発見された1パート。
///
/// `body` は一度だけ読める逐次ストリームで、読み終えるか破棄した時点で
/// 解放される。
#[derive(Debug)]
pub struct UploadPart {
    pub field_name: String,
    pub file_name: Option<String>,
    pub content_type: String,
    pub body: PartBody,
}

impl UploadPart {
    /// 空でないファイル名を持つか（空の `filename=""` は未選択のファイル入力）
    pub fn is_file(&self) -> bool {
        self.file_name.as_deref().is_some_and(|name| !name.is_empty())
    }
}

/// パート本文のバイトストリーム。
#[derive(Debug)]
pub struct PartBody {
    rx: mpsc::Receiver<Result<Bytes, PartError>>,
}

impl PartBody {
    /// テスト用: 任意のチャンク列から本文を作る。
    #[cfg(test)]
    pub(crate) fn from_chunks(chunks: Vec<Result<Bytes, PartError>>) -> Self {
        let (tx, rx) = mpsc::channel(chunks.len().max(1));
        for chunk in chunks {
            let _ = tx.try_send(chunk);
        }
        Self { rx }
    }
}

impl Stream for PartBody {
    type Item = Result<Bytes, PartError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Content-Type ヘッダから boundary を取り出す。
pub fn boundary_from_headers(headers: &HeaderMap) -> Result<String, ParseError> {
    let value = headers
        .get(header::CONTENT_TYPE)
        .ok_or_else(|| ParseError::InvalidContentType("missing Content-Type".to_string()))?
        .to_str()
        .map_err(|_| ParseError::InvalidContentType("non-ASCII Content-Type".to_string()))?;
    boundary_from_content_type(value)
}

/// `multipart/form-data; boundary=...` から boundary を取り出す。
pub fn boundary_from_content_type(value: &str) -> Result<String, ParseError> {
    let mut segments = value.split(';');
    let essence = segments.next().unwrap_or_default().trim();
    if !essence.eq_ignore_ascii_case("multipart/form-data") {
        return Err(ParseError::InvalidContentType(format!(
            "expected multipart/form-data, got {essence:?}"
        )));
    }

    for segment in segments {
        let Some((key, raw)) = segment.split_once('=') else {
            continue;
        };
        if !key.trim().eq_ignore_ascii_case("boundary") {
            continue;
        }
        let boundary = raw.trim().trim_matches('"');
        if boundary.is_empty() || boundary.len() > MAX_BOUNDARY_LEN {
            return Err(ParseError::InvalidContentType(format!(
                "invalid boundary length: {}",
                boundary.len()
            )));
        }
        return Ok(boundary.to_string());
    }

    Err(ParseError::InvalidContentType(
        "missing boundary parameter".to_string(),
    ))
}

/// 本文から逐次パートを取り出すストリーム。
pub struct MultipartStream {
    parts: mpsc::Receiver<Result<UploadPart, ParseError>>,
}

impl MultipartStream {
    /// 本文の読み取りタスクを起動する。
    pub fn new<S, E>(boundary: &str, body: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let (parts_tx, parts) = mpsc::channel(1);
        tokio::spawn(drive(Parser::new(boundary), body, parts_tx));
        Self { parts }
    }

    /// 次のパート。`None` は本文の終端、`Some(Err)` の後は `None` のみ返る。
    pub async fn next_part(&mut self) -> Option<Result<UploadPart, ParseError>> {
        self.parts.recv().await
    }
}

type PartSender = mpsc::Sender<Result<Bytes, PartError>>;

async fn drive<S, E>(
    mut parser: Parser,
    body: S,
    parts_tx: mpsc::Sender<Result<UploadPart, ParseError>>,
) where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let mut body = std::pin::pin!(body);
    let mut current: Option<PartSender> = None;

    loop {
        let event = match parser.next_event() {
            Ok(Some(event)) => event,
            Ok(None) => {
                match body.next().await {
                    Some(Ok(chunk)) => parser.feed(&chunk),
                    Some(Err(e)) => {
                        fail(current.take(), &parts_tx, ParseError::Transport(e.to_string())).await;
                        return;
                    }
                    None => {
                        if let Err(err) = parser.finish() {
                            fail(current.take(), &parts_tx, err).await;
                        }
                        return;
                    }
                }
                continue;
            }
            Err(err) => {
                fail(current.take(), &parts_tx, err).await;
                return;
            }
        };

        match event {
            Event::PartStart(head) => {
                let (tx, rx) = mpsc::channel(PART_BUFFER_CHUNKS);
                let part = UploadPart {
                    field_name: head.field_name,
                    file_name: head.file_name,
                    content_type: head.content_type,
                    body: PartBody { rx },
                };
                if parts_tx.send(Ok(part)).await.is_err() {
                    tracing::debug!("パート受信側が終了したため本文の読み取りを中止");
                    return;
                }
                current = Some(tx);
            }
            Event::Data(chunk) => {
                if let Some(tx) = &current {
                    if tx.send(Ok(chunk)).await.is_err() {
                        // 受け手が本文を破棄した。残りは読み捨てる
                        current = None;
                    }
                }
            }
            Event::PartEnd => current = None,
            Event::End => return,
        }
    }
}

async fn fail(
    current: Option<PartSender>,
    parts_tx: &mpsc::Sender<Result<UploadPart, ParseError>>,
    err: ParseError,
) {
    tracing::warn!(error = %err, "multipart本文の解析に失敗");
    if let Some(tx) = current {
        let _ = tx.send(Err(PartError::Truncated(err.to_string()))).await;
    }
    let _ = parts_tx.send(Err(err)).await;
}
