//! # アクセストークンのキャッシュ
//!
//! 有効期限付きトークンを保持し、期限切れが近づいたときだけ再取得する。
//! 同時に複数のリクエストが来ても、再取得はロックを持つ1件のみが行う。

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// 期限切れとみなすまでの余裕。
const REFRESH_MARGIN: Duration = Duration::from_secs(300);

/// 有効期限付きの認証情報。
#[derive(Debug, Clone)]
pub struct TemporaryToken<T> {
    pub token: T,
    /// この時刻以降は無効
    pub expiry: Instant,
}

/// `TemporaryToken` を有効期限に基づいてキャッシュする。
#[derive(Debug)]
pub struct TokenCache<T> {
    cache: Mutex<Option<TemporaryToken<T>>>,
}

impl<T> Default for TokenCache<T> {
    fn default() -> Self {
        Self {
            cache: Mutex::new(None),
        }
    }
}

impl<T: Clone + Send> TokenCache<T> {
    /// 有効なキャッシュがあれば返し、なければ `fetch` で取得して保存する。
    pub async fn get_or_insert_with<F, Fut, E>(&self, fetch: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<TemporaryToken<T>, E>> + Send,
    {
        let now = Instant::now();
        let mut locked = self.cache.lock().await;

        if let Some(cached) = locked.as_ref() {
            let remaining = cached.expiry.checked_duration_since(now).unwrap_or_default();
            if remaining > REFRESH_MARGIN {
                return Ok(cached.token.clone());
            }
        }

        let fresh = fetch().await?;
        let token = fresh.token.clone();
        *locked = Some(fresh);
        Ok(token)
    }

    /// キャッシュを破棄する。次回の取得で必ず再発行される。
    pub async fn invalidate(&self) {
        *self.cache.lock().await = None;
    }
}
