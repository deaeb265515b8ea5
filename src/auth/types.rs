// Authentication types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::AuthError;

/// Immutable snapshot of the provider's tokens.
///
/// A session is only ever produced by a successful provider fetch and is
/// replaced wholesale, never patched. A session without an access token is
/// valid and means "signed out".
#[derive(Clone, PartialEq)]
pub struct Session {
    pub access_token: Option<String>,
    pub id_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Provider-specific metadata, passed through untouched
    pub raw: serde_json::Value,
}

impl Session {
    /// Session carrying no tokens
    pub fn empty() -> Self {
        Self {
            access_token: None,
            id_token: None,
            expires_at: None,
            raw: serde_json::Value::Null,
        }
    }

    pub fn has_access_token(&self) -> bool {
        self.access_token.is_some()
    }

    /// Expiry of the access token, if there is one
    pub fn access_expiry(&self) -> Option<DateTime<Utc>> {
        self.access_token.as_ref().and(self.expires_at)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &redact(self.access_token.as_deref()))
            .field("id_token", &redact(self.id_token.as_deref()))
            .field("expires_at", &self.expires_at)
            .field("raw", &self.raw)
            .finish()
    }
}

/// Short, log-safe preview of a secret
pub fn redact(token: Option<&str>) -> String {
    match token {
        None => "<none>".to_string(),
        Some(t) => format!("{}...", &t[..t.char_indices().nth(8).map_or(t.len(), |(i, _)| i)]),
    }
}

/// Display information about the signed-in user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub username: String,
}

/// Username/password pair handed to the provider's sign-in
#[derive(Clone)]
pub struct SignInCredentials {
    pub username: String,
    pub password: String,
}

impl SignInCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for SignInCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignInCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Coarse lifecycle state gating routing decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    Loading,
    Ready,
}

/// Read signal published to consumers.
///
/// Every field is replaced together on each publication, so a subscriber
/// never sees an authentication flag that disagrees with the token.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthSnapshot {
    pub session: Option<Arc<Session>>,
    pub user_info: Option<UserInfo>,
    pub phase: LifecyclePhase,
    pub last_error: Option<AuthError>,
}

impl AuthSnapshot {
    /// State before the first session load settles
    pub fn initial() -> Self {
        Self {
            session: None,
            user_info: None,
            phase: LifecyclePhase::Loading,
            last_error: None,
        }
    }

    /// Derived from the session, never stored
    pub fn is_authenticated(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.has_access_token())
    }

    pub fn is_loading(&self) -> bool {
        self.phase == LifecyclePhase::Loading
    }

    pub fn username(&self) -> Option<&str> {
        self.user_info.as_ref().map(|u| u.username.as_str())
    }

    pub fn access_token(&self) -> Option<&str> {
        self.session.as_ref().and_then(|s| s.access_token.as_deref())
    }

    pub fn id_token(&self) -> Option<&str> {
        self.session.as_ref().and_then(|s| s.id_token.as_deref())
    }
}

// === Cognito Identity Provider wire types ===

/// InitiateAuth request (USER_PASSWORD_AUTH / REFRESH_TOKEN_AUTH)
#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InitiateAuthRequest<'a> {
    pub auth_flow: &'a str,
    pub client_id: &'a str,
    pub auth_parameters: std::collections::HashMap<&'a str, &'a str>,
}

/// InitiateAuth response
#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InitiateAuthResponse {
    pub authentication_result: Option<AuthenticationResult>,
    pub challenge_name: Option<String>,
}

/// Tokens issued by InitiateAuth
#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthenticationResult {
    pub access_token: String,
    pub id_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
    pub token_type: Option<String>,
}

/// Requests keyed only by the access token (GetUser)
#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AccessTokenRequest<'a> {
    pub access_token: &'a str,
}

/// GetUser response
#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetUserResponse {
    pub username: String,
}

/// RevokeToken request
#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RevokeTokenRequest<'a> {
    pub token: &'a str,
    pub client_id: &'a str,
}

/// Error body returned by the identity provider
#[derive(Deserialize, Default)]
pub struct CognitoErrorBody {
    #[serde(rename = "__type")]
    pub error_type: Option<String>,
    #[serde(alias = "Message")]
    pub message: Option<String>,
}
