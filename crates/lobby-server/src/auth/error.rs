use lobby_core::LobbyError;
use thiserror::Error;

/// Reasons a token is refused admission.
///
/// Always fatal to the connection or request attempt; never retried.
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// Token absent or not decodable.
    #[error("missing or malformed token: {0}")]
    MissingOrMalformedToken(String),

    /// Issuer claim differs from the configured trusted issuer.
    #[error("the issuer {0} is not trusted here")]
    UntrustedIssuer(String),

    /// Discovery document or key set unreachable, or no key for the key id.
    #[error("signing key resolution failed: {0}")]
    KeyResolutionFailure(String),

    /// Bad signature, expired or not-yet-valid token, or unusable claims.
    #[error("signature or claim invalid: {0}")]
    SignatureOrClaimInvalid(String),
}

impl AdmissionError {
    /// Stable machine-readable reason, sent to rejected callers.
    pub fn reason(&self) -> &'static str {
        match self {
            AdmissionError::MissingOrMalformedToken(_) => "token_missing",
            AdmissionError::UntrustedIssuer(_) => "untrusted_issuer",
            AdmissionError::KeyResolutionFailure(_) => "key_resolution_failed",
            AdmissionError::SignatureOrClaimInvalid(_) => "token_invalid",
        }
    }
}

impl From<AdmissionError> for LobbyError {
    fn from(e: AdmissionError) -> Self {
        LobbyError::AuthFailed(e.to_string())
    }
}
