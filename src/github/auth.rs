//! Installation-token minting and caching for the GitHub App auth scheme (§4.B).
//!
//! A signed JWT (private key loaded once from disk) is exchanged for an installation
//! token; tokens are cached in-process keyed by `installationId` and refreshed a
//! couple of minutes before expiry. Concurrent callers for the same installation
//! coalesce on a single in-flight refresh by locking a per-key `tokio::sync::Mutex`
//! — the second caller simply observes the first caller's freshly cached token once
//! the lock is released, rather than firing its own request.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;

use crate::errors::{GitHubApiError, GitHubErrorCode};

/// Margin below which a cached token is treated as expired and refreshed eagerly.
const REFRESH_MARGIN_SECS: i64 = 120;

#[derive(Debug, Serialize)]
struct AppClaims {
    iss: String,
    iat: i64,
    exp: i64,
}

/// Signs the JWT ralph presents to GitHub's `/app/installations/{id}/access_tokens`
/// endpoint. A trait (rather than a bare function) so tests can substitute a fake
/// signer without touching disk or RSA machinery.
pub trait TokenSigner: Send + Sync {
    fn sign_app_jwt(&self, app_id: &str, now_unix: i64) -> Result<String, GitHubApiError>;
}

/// Signs with an RSA private key loaded once from disk at construction.
pub struct RsaAppJwtSigner {
    encoding_key: EncodingKey,
}

impl RsaAppJwtSigner {
    pub fn from_pem_bytes(pem: &[u8]) -> Result<Self, GitHubApiError> {
        let encoding_key = EncodingKey::from_rsa_pem(pem).map_err(|e| {
            GitHubApiError::new(
                format!("failed to parse GitHub App private key: {e}"),
                GitHubErrorCode::Auth,
            )
        })?;
        Ok(Self { encoding_key })
    }

    pub fn from_pem_file(path: &std::path::Path) -> Result<Self, GitHubApiError> {
        let pem = std::fs::read(path).map_err(|e| {
            GitHubApiError::new(
                format!("failed to read GitHub App private key at {}: {e}", path.display()),
                GitHubErrorCode::Auth,
            )
        })?;
        Self::from_pem_bytes(&pem)
    }
}

impl TokenSigner for RsaAppJwtSigner {
    fn sign_app_jwt(&self, app_id: &str, now_unix: i64) -> Result<String, GitHubApiError> {
        let claims = AppClaims {
            iss: app_id.to_string(),
            iat: now_unix - 60,
            exp: now_unix + 9 * 60,
        };
        encode(&Header::new(Algorithm::RS256), &claims, &self.encoding_key).map_err(|e| {
            GitHubApiError::new(format!("failed to sign app jwt: {e}"), GitHubErrorCode::Auth)
        })
    }
}

#[derive(Debug, Clone)]
pub struct CachedToken {
    pub token: String,
    pub expires_at_unix: i64,
}

/// Per-installation token cache with refresh coalescing.
pub struct InstallationTokenCache {
    locks: DashMap<i64, Arc<AsyncMutex<Option<CachedToken>>>>,
}

impl InstallationTokenCache {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, installation_id: i64) -> Arc<AsyncMutex<Option<CachedToken>>> {
        self.locks
            .entry(installation_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(None)))
            .clone()
    }

    /// Return a valid token for `installation_id`, refreshing via `refresh` if the
    /// cached token is missing or within [`REFRESH_MARGIN_SECS`] of expiry.
    pub async fn get_or_refresh<F, Fut>(
        &self,
        installation_id: i64,
        now_unix: i64,
        refresh: F,
    ) -> Result<String, GitHubApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CachedToken, GitHubApiError>>,
    {
        let lock = self.lock_for(installation_id);
        let mut guard = lock.lock().await;
        if let Some(cached) = guard.as_ref() {
            if cached.expires_at_unix - now_unix > REFRESH_MARGIN_SECS {
                return Ok(cached.token.clone());
            }
        }
        let fresh = refresh().await?;
        let token = fresh.token.clone();
        *guard = Some(fresh);
        Ok(token)
    }
}

impl Default for InstallationTokenCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedSigner;
    impl TokenSigner for FixedSigner {
        fn sign_app_jwt(&self, app_id: &str, now_unix: i64) -> Result<String, GitHubApiError> {
            Ok(format!("jwt-for-{app_id}-at-{now_unix}"))
        }
    }

    #[test]
    fn fixed_signer_embeds_app_id_and_time() {
        let signer = FixedSigner;
        let jwt = signer.sign_app_jwt("12345", 1_700_000_000).unwrap();
        assert_eq!(jwt, "jwt-for-12345-at-1700000000");
    }

    #[tokio::test]
    async fn cache_miss_triggers_refresh() {
        let cache = InstallationTokenCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let token = cache
            .get_or_refresh(1, 1_000, move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(CachedToken {
                        token: "tok-1".into(),
                        expires_at_unix: 1_000 + 3600,
                    })
                }
            })
            .await
            .unwrap();
        assert_eq!(token, "tok-1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fresh_cached_token_is_reused_without_refresh() {
        let cache = InstallationTokenCache::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls_clone = calls.clone();
            cache
                .get_or_refresh(1, 1_000, move || {
                    let calls = calls_clone.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(CachedToken {
                            token: "tok-1".into(),
                            expires_at_unix: 1_000 + 3600,
                        })
                    }
                })
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn token_within_refresh_margin_of_expiry_is_refreshed() {
        let cache = InstallationTokenCache::new();
        cache
            .get_or_refresh(1, 1_000, move || async move {
                Ok(CachedToken {
                    token: "tok-old".into(),
                    expires_at_unix: 1_000 + 60, // inside the 120s margin
                })
            })
            .await
            .unwrap();

        let token = cache
            .get_or_refresh(1, 1_010, move || async move {
                Ok(CachedToken {
                    token: "tok-new".into(),
                    expires_at_unix: 1_010 + 3600,
                })
            })
            .await
            .unwrap();
        assert_eq!(token, "tok-new");
    }

    #[tokio::test]
    async fn installations_are_cached_independently() {
        let cache = InstallationTokenCache::new();
        let t1 = cache
            .get_or_refresh(1, 1_000, move || async move {
                Ok(CachedToken {
                    token: "tok-inst-1".into(),
                    expires_at_unix: 1_000 + 3600,
                })
            })
            .await
            .unwrap();
        let t2 = cache
            .get_or_refresh(2, 1_000, move || async move {
                Ok(CachedToken {
                    token: "tok-inst-2".into(),
                    expires_at_unix: 1_000 + 3600,
                })
            })
            .await
            .unwrap();
        assert_eq!(t1, "tok-inst-1");
        assert_eq!(t2, "tok-inst-2");
    }
}
