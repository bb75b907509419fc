//! System authentication.
//!
//! Devices authenticate every request with `Authorization: Basic` carrying
//! their system key and a secret shaped `<prefix><public>.<secret>`. The
//! [`CredentialValidator`] checks the pair against the durable
//! [`CredentialStore`](crate::storage::CredentialStore), caching verdicts in
//! the shared store so repeated requests skip the argon2 verification.

pub mod basic;
pub mod credentials;
pub mod password;

use thiserror::Error;

pub use basic::{parse_basic_header, BasicCredentials};
pub use credentials::{
    AuthConfig, AuthOutcome, AuthenticatedSystem, CacheFailurePolicy, CredentialValidator,
};
pub use password::{hash_secret, verify_secret};

/// Why an authentication attempt was refused.
///
/// Callers only learn that the request is unauthorized; the reason exists
/// for logs and metrics.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthFailure {
    #[error("malformed authorization header: {0}")]
    MalformedHeader(String),

    /// Secret is not `<prefix><public>.<secret>`.
    #[error("malformed system secret")]
    BadFormat,

    #[error("secret part shorter than required")]
    SecretTooShort,

    /// A recent failure for the same credentials is still cached.
    #[error("credentials recently rejected")]
    CachedInvalid,

    #[error("unknown system key")]
    NotFound,

    #[error("system is inactive")]
    Inactive,

    #[error("public part does not match")]
    PublicMismatch,

    #[error("secret does not match")]
    SecretMismatch,

    /// Credentials could not be checked at all.
    #[error("authentication unavailable: {0}")]
    Unavailable(String),
}

impl AuthFailure {
    /// Label used for the `result` dimension of the auth metric.
    pub fn reason(&self) -> &'static str {
        match self {
            AuthFailure::MalformedHeader(_) => "malformed_header",
            AuthFailure::BadFormat => "bad_format",
            AuthFailure::SecretTooShort => "secret_too_short",
            AuthFailure::CachedInvalid => "cached_invalid",
            AuthFailure::NotFound => "not_found",
            AuthFailure::Inactive => "inactive",
            AuthFailure::PublicMismatch => "public_mismatch",
            AuthFailure::SecretMismatch => "secret_mismatch",
            AuthFailure::Unavailable(_) => "unavailable",
        }
    }

    /// Whether the failure says nothing about the credentials themselves.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, AuthFailure::Unavailable(_))
    }
}

/// Errors from the argon2 helpers.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("secret hashing failed: {0}")]
    Hash(String),

    #[error("stored secret hash is invalid: {0}")]
    InvalidHash(String),
}
