//! # アップロードポリシー
//!
//! どのパートをアップロード対象とするか、1リクエスト内で同時に何件まで
//! 転送するかを決める。

use std::fmt;

/// 受け付けるファイルのフォームフィールド名の既定値。
pub const DEFAULT_FIELD_NAME: &str = "files";

/// 許可するMIMEタイプの既定値。
pub const DEFAULT_ALLOWED_MIME_TYPES: &str = "image/*,video/*";

/// 1リクエスト内の同時転送数の既定値。
pub const DEFAULT_MAX_IN_FLIGHT: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
enum MimePattern {
    Any,
    /// `image/*` の `image/` 部分
    TypePrefix(String),
    Exact(String),
}

/// MIMEタイプの許可リスト（`image/*,video/mp4` 形式）。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimeAllowList {
    patterns: Vec<MimePattern>,
}

impl MimeAllowList {
    /// カンマ区切りの許可リストを解釈する。空のリストは全て許可する。
    pub fn parse(list: &str) -> Self {
        let patterns: Vec<_> = list
            .split(',')
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .map(|s| match s.as_str() {
                "*" | "*/*" => MimePattern::Any,
                _ => match s.strip_suffix("/*") {
                    Some(prefix) => MimePattern::TypePrefix(format!("{prefix}/")),
                    None => MimePattern::Exact(s),
                },
            })
            .collect();

        if patterns.is_empty() {
            return Self::allow_all();
        }
        Self { patterns }
    }

    pub fn allow_all() -> Self {
        Self {
            patterns: vec![MimePattern::Any],
        }
    }

    /// Content-Type（パラメータ付きも可）が許可されているか。
    pub fn allows(&self, content_type: &str) -> bool {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        self.patterns.iter().any(|pattern| match pattern {
            MimePattern::Any => true,
            MimePattern::TypePrefix(prefix) => {
                essence.len() > prefix.len() && essence.starts_with(prefix.as_str())
            }
            MimePattern::Exact(exact) => essence == *exact,
        })
    }
}

impl Default for MimeAllowList {
    fn default() -> Self {
        Self::parse(DEFAULT_ALLOWED_MIME_TYPES)
    }
}

impl fmt::Display for MimeAllowList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .patterns
            .iter()
            .map(|p| match p {
                MimePattern::Any => "*".to_string(),
                MimePattern::TypePrefix(prefix) => format!("{prefix}*"),
                MimePattern::Exact(exact) => exact.clone(),
            })
            .collect();
        write!(f, "{}", rendered.join(","))
    }
}

/// 1リクエストに適用するポリシー。
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    /// ファイルを運ぶフォームフィールド名
    pub field_name: String,
    pub allowed_types: MimeAllowList,
    /// 同時に実行するアップロード数（1以上）
    pub max_in_flight: usize,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            field_name: DEFAULT_FIELD_NAME.to_string(),
            allowed_types: MimeAllowList::default(),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }
}
