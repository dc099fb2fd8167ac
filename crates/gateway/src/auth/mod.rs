//! # 認証情報プロバイダ
//!
//! リモートストレージ呼び出しに使う `AuthorizationContext` を供給する。
//! プロバイダは起動時に1度だけ構築され、`GatewayState` 経由で
//! 全リクエストに共有される（読み取り専用）。
//!
//! ## 解決順序
//! 1. `GOOGLE_CREDENTIALS_JSON`（サービスアカウントJSON）
//! 2. `GOOGLE_CLIENT_EMAIL` + `GOOGLE_PRIVATE_KEY`
//! 3. `GOOGLE_APPLICATION_CREDENTIALS` のファイル、なければ `./credentials.json`
//! 4. `GOOGLE_ACCESS_TOKEN`（発行済みトークン、開発環境用）
//!
//! いずれも無い、または読み込めない場合は「未準備」のプロバイダになり、
//! アップロードは設定エラーとして扱われる。

pub mod service_account;
pub mod token;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

pub use service_account::{ServiceAccountKey, ServiceAccountProvider, DRIVE_SCOPE};

/// リモートストレージ呼び出し用の認可情報（Bearerトークン）。
/// 複製は参照カウントの増加のみ。
#[derive(Clone)]
pub struct AuthorizationContext {
    bearer: Arc<str>,
}

impl AuthorizationContext {
    pub fn bearer(token: impl Into<Arc<str>>) -> Self {
        Self {
            bearer: token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.bearer
    }
}

impl fmt::Debug for AuthorizationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationContext")
            .field("bearer", &"<redacted>")
            .finish()
    }
}

/// 認証情報エラー。プロセス全体のアップロード能力に影響する。
#[derive(Debug, Clone, thiserror::Error)]
pub enum CredentialError {
    #[error("credentials are not configured: {0}")]
    NotConfigured(String),
    #[error("invalid credentials: {0}")]
    Invalid(String),
    #[error("access token request failed: {0}")]
    TokenRequest(String),
}

/// 認証情報プロバイダの抽象インターフェース。
#[async_trait::async_trait]
pub trait CredentialProvider: Send + Sync {
    /// 認可情報を発行できる状態か
    fn is_ready(&self) -> bool;

    /// 状態の説明（GET /test 用、秘密情報を含めない）
    fn describe(&self) -> String;

    /// 有効な認可情報を返す。
    async fn authorize(&self) -> Result<AuthorizationContext, CredentialError>;

    /// 保持している認可情報を破棄する（リモートが認可を拒否したとき）。
    async fn invalidate(&self) {}
}

/// 発行済みのアクセストークンをそのまま使うプロバイダ。
pub struct StaticTokenProvider {
    context: AuthorizationContext,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<Arc<str>>) -> Self {
        Self {
            context: AuthorizationContext::bearer(token),
        }
    }
}

#[async_trait::async_trait]
impl CredentialProvider for StaticTokenProvider {
    fn is_ready(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        "static access token".to_string()
    }

    async fn authorize(&self) -> Result<AuthorizationContext, CredentialError> {
        Ok(self.context.clone())
    }
}

/// 認証情報が得られなかったことを表すプロバイダ。
pub struct UnconfiguredProvider {
    reason: String,
}

impl UnconfiguredProvider {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait::async_trait]
impl CredentialProvider for UnconfiguredProvider {
    fn is_ready(&self) -> bool {
        false
    }

    fn describe(&self) -> String {
        self.reason.clone()
    }

    async fn authorize(&self) -> Result<AuthorizationContext, CredentialError> {
        Err(CredentialError::NotConfigured(self.reason.clone()))
    }
}

// ---------------------------------------------------------------------------
// 環境変数からの解決
// ---------------------------------------------------------------------------

/// 解決された認証情報の種類。
#[derive(Debug)]
pub enum CredentialSource {
    ServiceAccount {
        key: ServiceAccountKey,
        origin: String,
    },
    AccessToken(String),
    Missing,
}

/// 認証情報を解決する。`lookup` は環境変数の参照関数。
pub fn resolve_credentials<F>(lookup: F, default_file: &Path) -> Result<CredentialSource, CredentialError>
where
    F: Fn(&str) -> Option<String>,
{
    let lookup = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

    if let Some(json) = lookup("GOOGLE_CREDENTIALS_JSON") {
        return Ok(CredentialSource::ServiceAccount {
            key: ServiceAccountKey::from_json(&json)?,
            origin: "GOOGLE_CREDENTIALS_JSON".to_string(),
        });
    }

    if let Some(client_email) = lookup("GOOGLE_CLIENT_EMAIL") {
        let private_key = lookup("GOOGLE_PRIVATE_KEY").ok_or_else(|| {
            CredentialError::Invalid("GOOGLE_CLIENT_EMAIL is set but GOOGLE_PRIVATE_KEY is not".to_string())
        })?;
        return Ok(CredentialSource::ServiceAccount {
            key: ServiceAccountKey {
                client_email,
                // ホスティング環境では改行が "\n" の2文字で渡されることが多い
                private_key: private_key.replace("\\n", "\n"),
                private_key_id: lookup("GOOGLE_PRIVATE_KEY_ID"),
                token_uri: lookup("GOOGLE_TOKEN_URI")
                    .unwrap_or_else(|| service_account::DEFAULT_TOKEN_URI.to_string()),
            },
            origin: "GOOGLE_CLIENT_EMAIL/GOOGLE_PRIVATE_KEY".to_string(),
        });
    }

    let explicit_file = lookup("GOOGLE_APPLICATION_CREDENTIALS");
    let file = explicit_file.as_deref().map(Path::new).unwrap_or(default_file);
    if explicit_file.is_some() || file.exists() {
        let json = std::fs::read_to_string(file).map_err(|e| {
            CredentialError::Invalid(format!("cannot read {}: {e}", file.display()))
        })?;
        return Ok(CredentialSource::ServiceAccount {
            key: ServiceAccountKey::from_json(&json)?,
            origin: file.display().to_string(),
        });
    }

    if let Some(token) = lookup("GOOGLE_ACCESS_TOKEN") {
        return Ok(CredentialSource::AccessToken(token));
    }

    Ok(CredentialSource::Missing)
}

/// 環境変数からプロバイダを構築する。失敗しても起動は継続し、未準備として扱う。
pub fn provider_from_env(http_client: reqwest::Client) -> Arc<dyn CredentialProvider> {
    let source = resolve_credentials(|name| std::env::var(name).ok(), Path::new("credentials.json"));
    build_provider(source, http_client)
}

fn build_provider(
    source: Result<CredentialSource, CredentialError>,
    http_client: reqwest::Client,
) -> Arc<dyn CredentialProvider> {
    match source {
        Ok(CredentialSource::ServiceAccount { key, origin }) => {
            let client_email = key.client_email.clone();
            match ServiceAccountProvider::new(key, DRIVE_SCOPE, http_client) {
                Ok(provider) => {
                    tracing::info!(%origin, %client_email, "サービスアカウント認証情報を読み込みました");
                    Arc::new(provider)
                }
                Err(e) => {
                    tracing::error!(%origin, error = %e, "サービスアカウント鍵が不正です");
                    Arc::new(UnconfiguredProvider::new(e.to_string()))
                }
            }
        }
        Ok(CredentialSource::AccessToken(token)) => {
            tracing::warn!("GOOGLE_ACCESS_TOKEN を使用します（開発環境用、更新されません）");
            Arc::new(StaticTokenProvider::new(token))
        }
        Ok(CredentialSource::Missing) => {
            tracing::error!("認証情報が見つかりません。アップロードは失敗します");
            Arc::new(UnconfiguredProvider::new("no credentials found"))
        }
        Err(e) => {
            tracing::error!(error = %e, "認証情報の読み込みに失敗");
            Arc::new(UnconfiguredProvider::new(e.to_string()))
        }
    }
}
