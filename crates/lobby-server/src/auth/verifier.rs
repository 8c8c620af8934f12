//! Token verification against a single trusted issuer.
//!
//! Order of checks:
//! 1. Decode the token without verifying it (issuer, key id).
//! 2. Reject untrusted issuers before any key lookup.
//! 3. Resolve the signing key by key id from the cached key set, fetching
//!    (or refetching once, on a key-id miss) from the [`KeySource`]. A miss
//!    against a set younger than `min_refetch` fails without fetching, and
//!    concurrent refreshes collapse into one fetch.
//! 4. Verify signature, issuer, `exp` and `nbf`; return the `sub` claim.

use super::error::AdmissionError;
use super::keys::KeySource;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};
use lobby_core::Identity;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct Claims {
    sub: Option<String>,
}

/// Default floor between two key fetches triggered by unknown key ids.
pub const DEFAULT_MIN_REFETCH: Duration = Duration::from_secs(30);

/// A key set fetched from an issuer, with its fetch time.
#[derive(Clone)]
struct CachedKeys {
    keys: Arc<JwkSet>,
    fetched_at: Instant,
}

/// Validates bearer tokens and yields the verified [`Identity`].
///
/// Signing keys are cached per issuer for `ttl`, populated lazily on first
/// use. Every key fetch is bounded by `fetch_timeout`.
pub struct TokenVerifier {
    issuer: String,
    source: Arc<dyn KeySource>,
    cache: RwLock<HashMap<String, CachedKeys>>,
    refresh_lock: Mutex<()>,
    ttl: Duration,
    min_refetch: Duration,
    fetch_timeout: Duration,
    leeway: u64,
}

impl TokenVerifier {
    pub fn new(
        issuer: impl Into<String>,
        source: Arc<dyn KeySource>,
        ttl: Duration,
        fetch_timeout: Duration,
        leeway: u64,
    ) -> Self {
        Self {
            issuer: issuer.into(),
            source,
            cache: RwLock::new(HashMap::new()),
            refresh_lock: Mutex::new(()),
            ttl,
            min_refetch: DEFAULT_MIN_REFETCH,
            fetch_timeout,
            leeway,
        }
    }

    /// Set how old the cached key set must be before an unknown key id may
    /// trigger another fetch.
    pub fn with_min_refetch(mut self, min_refetch: Duration) -> Self {
        self.min_refetch = min_refetch;
        self
    }

    /// The single trusted issuer.
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Verify `token` and return its subject.
    pub async fn verify(&self, token: &str) -> Result<Identity, AdmissionError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AdmissionError::MissingOrMalformedToken("empty token".into()));
        }

        let peeked = lobby_core::token::peek(token)
            .map_err(|e| AdmissionError::MissingOrMalformedToken(e.to_string()))?;

        match peeked.issuer.as_deref() {
            Some(issuer) if issuer == self.issuer => {}
            other => {
                let issuer = other.unwrap_or("<none>").to_string();
                warn!(issuer = %issuer, "rejecting token from untrusted issuer");
                return Err(AdmissionError::UntrustedIssuer(issuer));
            }
        }

        let header = decode_header(token)
            .map_err(|e| AdmissionError::MissingOrMalformedToken(e.to_string()))?;
        let kid = header.kid.ok_or_else(|| {
            AdmissionError::KeyResolutionFailure("token header carries no key id".into())
        })?;

        let jwk = self.resolve_key(&kid).await?;
        let key = DecodingKey::from_jwk(&jwk).map_err(|e| {
            AdmissionError::KeyResolutionFailure(format!("unusable key {kid}: {e}"))
        })?;

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.leeway = self.leeway;
        validation.validate_nbf = true;
        validation.validate_aud = false;

        let data = decode::<Claims>(token, &key, &validation)
            .map_err(|e| AdmissionError::SignatureOrClaimInvalid(e.to_string()))?;

        let subject = data
            .claims
            .sub
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AdmissionError::SignatureOrClaimInvalid("missing subject".into()))?;

        debug!(identity = %subject, "token verified");
        Ok(Identity::new(subject))
    }

    /// Drop the cached key set for `issuer`; the next verification refetches.
    pub async fn invalidate(&self, issuer: &str) -> bool {
        self.cache.write().await.remove(issuer).is_some()
    }

    async fn resolve_key(&self, kid: &str) -> Result<Jwk, AdmissionError> {
        if let Some(jwk) = self.lookup(kid).await? {
            return Ok(jwk);
        }

        // One fetch at a time; whoever waited rechecks what it brought.
        let _refreshing = self.refresh_lock.lock().await;
        if let Some(jwk) = self.lookup(kid).await? {
            return Ok(jwk);
        }

        let keys = self.refresh().await?;
        keys.find(kid).cloned().ok_or_else(|| unknown_kid(kid))
    }

    /// Resolve `kid` from the cache alone.
    ///
    /// `Ok(None)` means a fetch is warranted: nothing is cached, the set
    /// expired, or it lacks `kid` and is old enough to refetch.
    async fn lookup(&self, kid: &str) -> Result<Option<Jwk>, AdmissionError> {
        let Some(entry) = self.cached().await else {
            return Ok(None);
        };
        if let Some(jwk) = entry.keys.find(kid) {
            return Ok(Some(jwk.clone()));
        }
        if entry.fetched_at.elapsed() < self.min_refetch {
            debug!(kid, "key id not in recently fetched set");
            return Err(unknown_kid(kid));
        }
        debug!(kid, "key id not in cached set, refetching");
        Ok(None)
    }

    async fn cached(&self) -> Option<CachedKeys> {
        let cache = self.cache.read().await;
        cache
            .get(&self.issuer)
            .filter(|entry| entry.fetched_at.elapsed() < self.ttl)
            .cloned()
    }

    async fn refresh(&self) -> Result<Arc<JwkSet>, AdmissionError> {
        let keys = tokio::time::timeout(self.fetch_timeout, self.source.fetch(&self.issuer))
            .await
            .map_err(|_| {
                AdmissionError::KeyResolutionFailure(format!(
                    "key fetch timed out after {}s",
                    self.fetch_timeout.as_secs()
                ))
            })??;

        let keys = Arc::new(keys);
        self.cache.write().await.insert(
            self.issuer.clone(),
            CachedKeys {
                keys: keys.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(keys)
    }
}

fn unknown_kid(kid: &str) -> AdmissionError {
    AdmissionError::KeyResolutionFailure(format!("no signing key with id {kid}"))
}
