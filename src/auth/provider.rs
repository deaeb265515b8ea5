// Credential provider boundary

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

use super::types::{Session, SignInCredentials, UserInfo};

/// Kind of a provider failure, parsed from the provider's error code
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProviderErrorKind {
    UserNotFound,
    NotAuthorized,
    UserNotConfirmed,
    PasswordResetRequired,
    /// Sign-in needs an extra step (e.g. NEW_PASSWORD_REQUIRED)
    ChallengeRequired(String),
    /// Transport-level failure, the provider was never reached
    Network,
    /// The provider answered with something we could not decode
    InvalidResponse,
    /// Any other provider error code
    Other(String),
}

impl ProviderErrorKind {
    /// Parse a provider error code.
    ///
    /// Accepts bare codes (`NotAuthorizedException`), namespaced codes
    /// (`com.amazonaws...#NotAuthorizedException`) and header-style codes
    /// (`NotAuthorizedException:http://...`).
    pub fn from_code(code: &str) -> Self {
        let name = code.rsplit('#').next().unwrap_or(code);
        let name = name.split(':').next().unwrap_or(name).trim();

        match name {
            "UserNotFoundException" => ProviderErrorKind::UserNotFound,
            "NotAuthorizedException" => ProviderErrorKind::NotAuthorized,
            "UserNotConfirmedException" => ProviderErrorKind::UserNotConfirmed,
            "PasswordResetRequiredException" => ProviderErrorKind::PasswordResetRequired,
            other => ProviderErrorKind::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderErrorKind::UserNotFound => write!(f, "UserNotFoundException"),
            ProviderErrorKind::NotAuthorized => write!(f, "NotAuthorizedException"),
            ProviderErrorKind::UserNotConfirmed => write!(f, "UserNotConfirmedException"),
            ProviderErrorKind::PasswordResetRequired => {
                write!(f, "PasswordResetRequiredException")
            }
            ProviderErrorKind::ChallengeRequired(name) => write!(f, "ChallengeRequired({})", name),
            ProviderErrorKind::Network => write!(f, "NetworkError"),
            ProviderErrorKind::InvalidResponse => write!(f, "InvalidResponse"),
            ProviderErrorKind::Other(code) => write!(f, "{}", code),
        }
    }
}

/// Raw failure reported by a credential provider
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_decode() {
            ProviderErrorKind::InvalidResponse
        } else {
            ProviderErrorKind::Network
        };
        ProviderError::new(kind, err.to_string())
    }
}

/// Identity provider capability consumed by the session manager.
///
/// Implementations own token persistence (including refresh tokens); the
/// session manager treats the provider as the source of truth.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Current session. With `force_refresh` the provider must renew the
    /// tokens instead of returning cached ones. A signed-out provider returns
    /// a session without tokens rather than an error.
    async fn fetch_session(&self, force_refresh: bool) -> Result<Session, ProviderError>;

    async fn sign_in(&self, credentials: &SignInCredentials) -> Result<(), ProviderError>;

    async fn sign_out(&self) -> Result<(), ProviderError>;

    async fn current_user(&self) -> Result<UserInfo, ProviderError>;
}
