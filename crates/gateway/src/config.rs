//! # Gateway設定・共有状態
//!
//! 環境変数からの設定読み込みとGatewayの共有状態の定義。
//! 認証情報は `auth::provider_from_env` が別途解決する。

use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;

use crate::auth::CredentialProvider;
use crate::batch::BatchUploader;
use crate::policy::{
    MimeAllowList, UploadPolicy, DEFAULT_ALLOWED_MIME_TYPES, DEFAULT_FIELD_NAME,
    DEFAULT_MAX_IN_FLIGHT,
};
use crate::storage::ObjectStore;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_DRIVE_API_BASE: &str = "https://www.googleapis.com";
/// 1 GiB
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024 * 1024;

/// 起動時に読み込む設定。
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    /// アップロード先フォルダ
    pub folder_id: String,
    pub api_base: String,
    pub field_name: String,
    pub allowed_types: MimeAllowList,
    /// リクエスト本文の上限（バイト）
    pub max_body_bytes: usize,
    pub max_in_flight: usize,
}

impl GatewayConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// `lookup` で環境変数を参照して設定を組み立てる。
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let folder_id = lookup("DRIVE_FOLDER_ID").context("DRIVE_FOLDER_ID is not set")?;
        let max_in_flight = parse_var(&lookup, "MAX_IN_FLIGHT_UPLOADS", DEFAULT_MAX_IN_FLIGHT)?;
        anyhow::ensure!(max_in_flight >= 1, "MAX_IN_FLIGHT_UPLOADS must be at least 1");

        Ok(Self {
            port: parse_var(&lookup, "PORT", DEFAULT_PORT)?,
            folder_id,
            api_base: lookup("DRIVE_API_BASE").unwrap_or_else(|| DEFAULT_DRIVE_API_BASE.to_string()),
            field_name: lookup("UPLOAD_FIELD_NAME").unwrap_or_else(|| DEFAULT_FIELD_NAME.to_string()),
            allowed_types: MimeAllowList::parse(
                &lookup("ALLOWED_MIME_TYPES").unwrap_or_else(|| DEFAULT_ALLOWED_MIME_TYPES.to_string()),
            ),
            max_body_bytes: parse_var(&lookup, "MAX_BODY_BYTES", DEFAULT_MAX_BODY_BYTES)?,
            max_in_flight,
        })
    }

    pub fn policy(&self) -> UploadPolicy {
        UploadPolicy {
            field_name: self.field_name.clone(),
            allowed_types: self.allowed_types.clone(),
            max_in_flight: self.max_in_flight,
        }
    }
}

fn parse_var<T, F>(lookup: &F, name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {name}={raw:?}: {e}")),
        None => Ok(default),
    }
}

/// Gatewayの共有状態。起動後は読み取り専用。
pub struct GatewayState {
    pub uploader: BatchUploader,
    pub credentials: Arc<dyn CredentialProvider>,
}

impl GatewayState {
    pub fn new(
        policy: UploadPolicy,
        store: Arc<dyn ObjectStore>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            uploader: BatchUploader::new(store, credentials.clone(), policy),
            credentials,
        }
    }
}
