//! # multipart/form-data 構文解析（状態機械）
//!
//! I/Oを持たない逐次パーサ。`feed` で受信したバイト列を追加し、
//! `next_event` でイベントを取り出す。イベントが作れない場合は
//! `Ok(None)` を返し、呼び出し側に追加入力を要求する。
//!
//! パート本文は区切り線が確定した部分だけを `MAX_CHUNK_BYTES` 以下の
//! チャンクとして払い出すため、バッファに残るのは受信済みの1チャンクと
//! 区切り線の長さ分の末尾のみ。

use bytes::{Buf, Bytes, BytesMut};
use memchr::memmem;

use super::ParseError;

/// パート本文として一度に払い出す最大バイト数。
pub const MAX_CHUNK_BYTES: usize = 64 * 1024;

/// パートヘッダブロックの上限。
const MAX_HEADER_BYTES: usize = 16 * 1024;

/// 区切り線の後ろ（改行まで）に許容する長さ。
const MAX_DELIMITER_TAIL: usize = 1024;

/// パートヘッダから取り出した情報。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartHead {
    /// Content-Disposition の `name`
    pub field_name: String,
    /// Content-Disposition の `filename`（`filename*` を優先）
    pub file_name: Option<String>,
    /// Content-Type（未指定時は application/octet-stream）
    pub content_type: String,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Event {
    PartStart(PartHead),
    Data(Bytes),
    PartEnd,
    /// 終端区切り線（`--boundary--`）を検出した
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Preamble,
    AfterDelimiter,
    Headers,
    Body,
    Epilogue,
}

pub struct Parser {
    /// `\r\n--{boundary}`。先頭2バイトを除くと本文先頭の区切り線になる。
    delimiter: Box<[u8]>,
    buf: BytesMut,
    state: State,
    /// プリアンブルのバイトを一度でも読み捨てたか
    preamble_skipped: bool,
}

impl Parser {
    pub fn new(boundary: &str) -> Self {
        let mut delimiter = Vec::with_capacity(boundary.len() + 4);
        delimiter.extend_from_slice(b"\r\n--");
        delimiter.extend_from_slice(boundary.as_bytes());

        Self {
            delimiter: delimiter.into_boxed_slice(),
            buf: BytesMut::new(),
            state: State::Preamble,
            preamble_skipped: false,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        if self.state != State::Epilogue {
            self.buf.extend_from_slice(chunk);
        }
    }

    /// 次のイベントを取り出す。`Ok(None)` は入力不足。
    pub fn next_event(&mut self) -> Result<Option<Event>, ParseError> {
        loop {
            match self.state {
                State::Preamble => {
                    if !self.preamble_skipped {
                        let dash_boundary = &self.delimiter[2..];
                        if self.buf.starts_with(dash_boundary) {
                            self.buf.advance(dash_boundary.len());
                            self.state = State::AfterDelimiter;
                            continue;
                        }
                        if self.buf.len() < dash_boundary.len()
                            && dash_boundary.starts_with(&self.buf)
                        {
                            return Ok(None);
                        }
                    }

                    if let Some(pos) = memmem::find(&self.buf, &self.delimiter) {
                        self.buf.advance(pos + self.delimiter.len());
                        self.state = State::AfterDelimiter;
                        continue;
                    }

                    let keep = self.delimiter.len() - 1;
                    if self.buf.len() > keep {
                        let discard = self.buf.len() - keep;
                        self.buf.advance(discard);
                        self.preamble_skipped = true;
                    }
                    return Ok(None);
                }

                State::AfterDelimiter => {
                    if self.buf.len() < 2 {
                        return Ok(None);
                    }
                    if self.buf.starts_with(b"--") {
                        self.buf.clear();
                        self.state = State::Epilogue;
                        return Ok(Some(Event::End));
                    }

                    // RFC 2046: 区切り線と改行の間の空白は読み飛ばす
                    match memmem::find(&self.buf, b"\r\n") {
                        Some(pos) => {
                            if !is_linear_whitespace(&self.buf[..pos]) {
                                return Err(ParseError::InvalidDelimiter);
                            }
                            self.buf.advance(pos + 2);
                            self.state = State::Headers;
                        }
                        None => {
                            let tail = self.buf.strip_suffix(b"\r").unwrap_or(&self.buf[..]);
                            if !is_linear_whitespace(tail) || self.buf.len() > MAX_DELIMITER_TAIL {
                                return Err(ParseError::InvalidDelimiter);
                            }
                            return Ok(None);
                        }
                    }
                }

                State::Headers => {
                    let (block_len, terminator_len) = if self.buf.starts_with(b"\r\n") {
                        (0, 2)
                    } else {
                        match memmem::find(&self.buf, b"\r\n\r\n") {
                            Some(pos) => (pos, 4),
                            None => {
                                if self.buf.len() > MAX_HEADER_BYTES {
                                    return Err(ParseError::HeaderTooLarge);
                                }
                                return Ok(None);
                            }
                        }
                    };
                    if block_len > MAX_HEADER_BYTES {
                        return Err(ParseError::HeaderTooLarge);
                    }

                    let head = parse_part_head(&self.buf[..block_len])?;
                    self.buf.advance(block_len + terminator_len);
                    self.state = State::Body;
                    return Ok(Some(Event::PartStart(head)));
                }

                State::Body => {
                    let ready = match memmem::find(&self.buf, &self.delimiter) {
                        Some(0) => {
                            self.buf.advance(self.delimiter.len());
                            self.state = State::AfterDelimiter;
                            return Ok(Some(Event::PartEnd));
                        }
                        Some(pos) => pos,
                        // 末尾は区切り線の先頭と一致する可能性があるため保持する
                        None => self.buf.len().saturating_sub(self.delimiter.len() - 1),
                    };
                    if ready == 0 {
                        return Ok(None);
                    }
                    let chunk = self.buf.split_to(ready.min(MAX_CHUNK_BYTES)).freeze();
                    return Ok(Some(Event::Data(chunk)));
                }

                State::Epilogue => {
                    self.buf.clear();
                    return Ok(None);
                }
            }
        }
    }

    /// 入力終端で呼ぶ。終端区切り線に到達していなければエラー。
    pub fn finish(&self) -> Result<(), ParseError> {
        match self.state {
            State::Preamble => Err(ParseError::MissingBoundary),
            State::AfterDelimiter | State::Headers | State::Body => {
                Err(ParseError::UnexpectedEof)
            }
            State::Epilogue => Ok(()),
        }
    }
}

fn is_linear_whitespace(bytes: &[u8]) -> bool {
    bytes.iter().all(|b| *b == b' ' || *b == b'\t')
}

// ---------------------------------------------------------------------------
// ヘッダ解析
// ---------------------------------------------------------------------------

fn parse_part_head(block: &[u8]) -> Result<PartHead, ParseError> {
    let text = String::from_utf8_lossy(block);

    let mut disposition = None;
    let mut content_type = None;

    for line in text.split("\r\n") {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ParseError::MalformedHeader(format!("header line without colon: {line}")))?;
        let name = name.trim();
        if name.eq_ignore_ascii_case("content-disposition") {
            disposition = Some(value.trim().to_string());
        } else if name.eq_ignore_ascii_case("content-type") {
            content_type = Some(value.trim().to_string());
        }
    }

    let disposition = disposition
        .ok_or_else(|| ParseError::MalformedHeader("missing Content-Disposition".to_string()))?;

    let mut params = split_params(&disposition).into_iter();
    let kind = params.next().map(|(k, _)| k).unwrap_or_default();
    if !kind.eq_ignore_ascii_case("form-data") {
        return Err(ParseError::MalformedHeader(format!(
            "unsupported Content-Disposition type: {kind}"
        )));
    }

    let mut field_name = None;
    let mut file_name = None;
    let mut file_name_ext = None;
    for (key, value) in params {
        match key.to_ascii_lowercase().as_str() {
            "name" => field_name = Some(value),
            "filename" => file_name = Some(value),
            "filename*" => file_name_ext = decode_ext_value(&value),
            _ => {}
        }
    }

    let field_name = field_name.ok_or_else(|| {
        ParseError::MalformedHeader("Content-Disposition without name".to_string())
    })?;

    Ok(PartHead {
        field_name,
        file_name: file_name_ext.or(file_name),
        content_type: content_type
            .filter(|ct| !ct.is_empty())
            .unwrap_or_else(|| "application/octet-stream".to_string()),
    })
}

/// `form-data; name="a"; filename="b;c.jpg"` を (キー, 値) の列に分割する。
/// 先頭要素はディスポジション種別で、値は空文字列。
fn split_params(value: &str) -> Vec<(String, String)> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;

    for c in value.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => {
                current.push(c);
                escaped = true;
            }
            '"' => {
                current.push(c);
                in_quotes = !in_quotes;
            }
            ';' if !in_quotes => segments.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    segments.push(current);

    segments
        .into_iter()
        .map(|segment| match segment.split_once('=') {
            Some((k, v)) => (k.trim().to_string(), unquote(v.trim())),
            None => (segment.trim().to_string(), String::new()),
        })
        .collect()
}

fn unquote(value: &str) -> String {
    let Some(inner) = value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) else {
        return value.to_string();
    };
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars().peekable();
    while let Some(c) = chars.next() {
        // `\"` と `\\` だけがエスケープ。それ以外のバックスラッシュはファイル名の一部
        if c == '\\' {
            if let Some(next) = chars.next_if(|&n| n == '"' || n == '\\') {
                out.push(next);
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// RFC 5987 の拡張値（`UTF-8''%E2%82%AC.txt`）を復号する。
fn decode_ext_value(value: &str) -> Option<String> {
    let mut pieces = value.splitn(3, '\'');
    let charset = pieces.next()?;
    let _language = pieces.next()?;
    let encoded = pieces.next()?;
    if !charset.eq_ignore_ascii_case("utf-8") {
        return None;
    }

    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
