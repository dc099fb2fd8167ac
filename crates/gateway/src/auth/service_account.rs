//! # サービスアカウント認証
//!
//! サービスアカウント鍵でRS256署名したJWTアサーションをトークンエンドポイントに
//! 送り、アクセストークンと交換する（OAuth 2.0 JWT Bearer Grant）。
//! 取得したトークンは `TokenCache` で有効期限まで使い回す。

use std::fmt;
use std::time::{Duration, Instant};

use jwt_simple::prelude::{Claims, Duration as JwtDuration, RS256KeyPair, RSAKeyPairLike};
use serde::{Deserialize, Serialize};

use super::token::{TemporaryToken, TokenCache};
use super::{AuthorizationContext, CredentialError, CredentialProvider};

/// トークンエンドポイントの既定値。
pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// ファイルの作成に必要なスコープ。
pub const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// アサーションの有効期間（トークンエンドポイントの上限は1時間）。
const ASSERTION_LIFETIME_SECS: u64 = 3600;

/// トークンエンドポイントが返す `expires_in` の上限。
const MAX_TOKEN_LIFETIME_SECS: u64 = 24 * 3600;

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

/// サービスアカウント鍵（JSONバンドルの必要な項目のみ）。
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

impl ServiceAccountKey {
    pub fn from_json(json: &str) -> Result<Self, CredentialError> {
        serde_json::from_str(json)
            .map_err(|e| CredentialError::Invalid(format!("service account JSON: {e}")))
    }
}

// 秘密鍵をログに出さない
impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("private_key_id", &self.private_key_id)
            .field("token_uri", &self.token_uri)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize, Deserialize)]
struct ScopeClaim {
    scope: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

/// サービスアカウントによる認証情報プロバイダ。
pub struct ServiceAccountProvider {
    client_email: String,
    token_uri: String,
    scope: String,
    key_pair: RS256KeyPair,
    http_client: reqwest::Client,
    cache: TokenCache<AuthorizationContext>,
}

impl ServiceAccountProvider {
    /// 鍵を検証してプロバイダを構築する。秘密鍵が読めなければエラー。
    pub fn new(
        key: ServiceAccountKey,
        scope: impl Into<String>,
        http_client: reqwest::Client,
    ) -> Result<Self, CredentialError> {
        let mut key_pair = RS256KeyPair::from_pem(&key.private_key)
            .map_err(|e| CredentialError::Invalid(format!("private key: {e}")))?;
        if let Some(key_id) = &key.private_key_id {
            key_pair = key_pair.with_key_id(key_id);
        }

        Ok(Self {
            client_email: key.client_email,
            token_uri: key.token_uri,
            scope: scope.into(),
            key_pair,
            http_client,
            cache: TokenCache::default(),
        })
    }

    /// トークンエンドポイントに送る署名済みアサーションを作る。
    fn assertion(&self) -> Result<String, CredentialError> {
        let claims = Claims::with_custom_claims(
            ScopeClaim {
                scope: self.scope.clone(),
            },
            JwtDuration::from_secs(ASSERTION_LIFETIME_SECS),
        )
        .with_issuer(&self.client_email)
        .with_audience(&self.token_uri);

        self.key_pair
            .sign(claims)
            .map_err(|e| CredentialError::Invalid(format!("failed to sign assertion: {e}")))
    }

    async fn fetch_token(&self) -> Result<TemporaryToken<AuthorizationContext>, CredentialError> {
        let assertion = self.assertion()?;

        let response = self
            .http_client
            .post(&self.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|e| CredentialError::TokenRequest(format!("HTTP request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CredentialError::TokenRequest(format!(
                "token endpoint returned HTTP {status}: {body}"
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| CredentialError::TokenRequest(format!("invalid token response: {e}")))?;

        tracing::info!(
            client_email = %self.client_email,
            expires_in = token.expires_in,
            "アクセストークンを取得"
        );

        Ok(TemporaryToken {
            token: AuthorizationContext::bearer(token.access_token),
            expiry: token_expiry(Instant::now(), token.expires_in),
        })
    }
}

/// `expires_in` から失効時刻を求める。値はリモートが決めるため上限で切り詰める。
fn token_expiry(now: Instant, expires_in: u64) -> Instant {
    let lifetime = Duration::from_secs(expires_in.min(MAX_TOKEN_LIFETIME_SECS));
    now.checked_add(lifetime).unwrap_or(now)
}

#[async_trait::async_trait]
impl CredentialProvider for ServiceAccountProvider {
    fn is_ready(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        format!("service account {}", self.client_email)
    }

    async fn authorize(&self) -> Result<AuthorizationContext, CredentialError> {
        self.cache.get_or_insert_with(|| self.fetch_token()).await
    }

    async fn invalidate(&self) {
        self.cache.invalidate().await;
    }
}
