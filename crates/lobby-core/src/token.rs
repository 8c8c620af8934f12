//! Unverified inspection of bearer tokens.
//!
//! Tokens are JWTs in compact serialization: `header.payload.signature`,
//! each segment base64url-encoded. Nothing here checks the signature; the
//! result is only good for deciding *how* to verify (issuer, key id).

use crate::error::{LobbyError, LobbyResult};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Deserialize;

/// Fields read from a token without verifying it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenPeek {
    /// Key id from the header (`kid`).
    pub key_id: Option<String>,
    /// Signing algorithm from the header (`alg`).
    pub algorithm: Option<String>,
    /// Issuer claim (`iss`).
    pub issuer: Option<String>,
    /// Subject claim (`sub`).
    pub subject: Option<String>,
}

#[derive(Deserialize)]
struct RawHeader {
    kid: Option<String>,
    alg: Option<String>,
}

#[derive(Deserialize)]
struct RawClaims {
    iss: Option<String>,
    sub: Option<String>,
}

/// Decode the header and claims of a token without verifying its signature.
pub fn peek(token: &str) -> LobbyResult<TokenPeek> {
    let mut segments = token.split('.');
    let (Some(header), Some(payload), Some(_signature), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(LobbyError::Token(
            "expected three dot-separated segments".into(),
        ));
    };

    let header: RawHeader = decode_segment(header, "header")?;
    let claims: RawClaims = decode_segment(payload, "payload")?;

    Ok(TokenPeek {
        key_id: header.kid,
        algorithm: header.alg,
        issuer: claims.iss,
        subject: claims.sub,
    })
}

fn decode_segment<T: DeserializeOwned>(segment: &str, name: &str) -> LobbyResult<T> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|e| LobbyError::Token(format!("{name} is not base64url: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| LobbyError::Token(format!("{name} is not a JSON object: {e}")))
}

/// Extract the token from an `Authorization` header value.
///
/// Accepts `Bearer <token>` with a case-insensitive scheme. Returns `None`
/// for any other scheme or an empty token.
pub fn bearer_token(header_value: &str) -> Option<&str> {
    let (scheme, token) = header_value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}
