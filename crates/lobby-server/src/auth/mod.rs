//! Bearer-token admission: issuer check, signing-key resolution, verification.

pub mod error;
pub mod keys;
pub mod verifier;

pub use error::AdmissionError;
pub use keys::{HttpKeySource, KeySource, StaticKeySource};
pub use verifier::TokenVerifier;
