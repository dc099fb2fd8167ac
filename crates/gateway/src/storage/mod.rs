//! # リモートストレージ
//!
//! アップロードパートの本文をリモートストレージへ逐次転送する抽象インターフェース。
//! Google Drive 互換の実装は `drive` サブモジュールを参照。

pub mod drive;

pub use drive::DriveStorage;

use crate::auth::AuthorizationContext;
use crate::multipart::PartBody;

/// 作成するオブジェクトの属性。
#[derive(Debug, Clone)]
pub struct ObjectMetadata {
    /// オブジェクト名（クライアントが送信したファイル名）
    pub name: String,
    /// パートで宣言されたContent-Type
    pub content_type: String,
}

/// 1パートの配送エラー。他のパートには影響しない。
#[derive(Debug, Clone, thiserror::Error)]
pub enum UploadError {
    /// リモートが成功以外のステータスを返した
    #[error("remote storage rejected the upload (HTTP {status})")]
    Rejected { status: u16, body: String },
    /// 認可情報が無効または期限切れ
    #[error("remote storage refused the credentials (HTTP {0})")]
    Unauthorized(u16),
    /// 転送中に接続が失われた
    #[error("network error: {0}")]
    Network(String),
    /// パート本文の読み取りに失敗した
    #[error("{0}")]
    Source(String),
    /// 成功応答にオブジェクトIDが含まれない
    #[error("invalid response from remote storage: {0}")]
    InvalidResponse(String),
}

/// リモートストレージの抽象インターフェース。
///
/// `content` は最後まで読み切ってから作成の確認を待つ。全長は事前に
/// 分からない。リトライはしない。
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// オブジェクトを作成し、リモートのオブジェクトIDを返す。
    async fn upload(
        &self,
        metadata: &ObjectMetadata,
        content: PartBody,
        auth: &AuthorizationContext,
    ) -> Result<String, UploadError>;
}
