//! Signing-key sources for token verification.
//!
//! The HTTP source follows OpenID discovery: fetch
//! `<issuer>.well-known/openid-configuration`, read its `jwks_uri`, then fetch
//! the key set from there. The static source serves a fixed key set.

use super::error::AdmissionError;
use jsonwebtoken::jwk::JwkSet;
use lobby_core::{LobbyError, LobbyResult};
use serde::Deserialize;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info};

/// Boxed future returned by [`KeySource::fetch`].
pub type KeySetFuture<'a> =
    Pin<Box<dyn Future<Output = Result<JwkSet, AdmissionError>> + Send + 'a>>;

/// Where the verifier obtains an issuer's published signing keys.
pub trait KeySource: Send + Sync {
    /// Fetch the current key set published by `issuer`.
    fn fetch<'a>(&'a self, issuer: &'a str) -> KeySetFuture<'a>;
}

/// Subset of the OpenID provider metadata we need.
#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    jwks_uri: String,
}

/// Discovery document location for an issuer.
pub fn discovery_url(issuer: &str) -> String {
    if issuer.ends_with('/') {
        format!("{issuer}.well-known/openid-configuration")
    } else {
        format!("{issuer}/.well-known/openid-configuration")
    }
}

/// Resolves keys over HTTP via the issuer's discovery document.
pub struct HttpKeySource {
    client: reqwest::Client,
}

impl HttpKeySource {
    /// Create a source whose requests are each bounded by `timeout`.
    pub fn new(timeout: Duration) -> LobbyResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| LobbyError::Other(format!("http client: {e}")))?;
        Ok(Self { client })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, AdmissionError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| AdmissionError::KeyResolutionFailure(format!("GET {url}: {e}")))?;
        response
            .json::<T>()
            .await
            .map_err(|e| AdmissionError::KeyResolutionFailure(format!("bad body from {url}: {e}")))
    }
}

impl KeySource for HttpKeySource {
    fn fetch<'a>(&'a self, issuer: &'a str) -> KeySetFuture<'a> {
        Box::pin(async move {
            let discovery = discovery_url(issuer);
            let document: DiscoveryDocument = self.get_json(&discovery).await?;
            debug!(issuer, jwks_uri = %document.jwks_uri, "resolved key set endpoint");

            let keys: JwkSet = self.get_json(&document.jwks_uri).await?;
            if keys.keys.is_empty() {
                return Err(AdmissionError::KeyResolutionFailure(format!(
                    "key set at {} is empty",
                    document.jwks_uri
                )));
            }
            info!(issuer, count = keys.keys.len(), "fetched signing keys");
            Ok(keys)
        })
    }
}

/// Serves a fixed key set regardless of issuer.
///
/// Counts fetches, which lets callers observe how often resolution ran.
pub struct StaticKeySource {
    keys: JwkSet,
    fetches: AtomicUsize,
}

impl StaticKeySource {
    pub fn new(keys: JwkSet) -> Self {
        Self {
            keys,
            fetches: AtomicUsize::new(0),
        }
    }

    /// Parse a JWKS JSON document.
    pub fn from_json(json: &str) -> LobbyResult<Self> {
        let keys: JwkSet = serde_json::from_str(json)?;
        Ok(Self::new(keys))
    }

    /// Load a JWKS JSON document from disk.
    pub fn from_file(path: &Path) -> LobbyResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let source = Self::from_json(&content)?;
        info!(path = %path.display(), count = source.keys.keys.len(), "loaded static signing keys");
        Ok(source)
    }

    /// Number of times [`KeySource::fetch`] has been called.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }
}

impl KeySource for StaticKeySource {
    fn fetch<'a>(&'a self, _issuer: &'a str) -> KeySetFuture<'a> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let keys = self.keys.clone();
        Box::pin(async move { Ok(keys) })
    }
}
