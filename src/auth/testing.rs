// Scripted credential provider for tests

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

use super::provider::{CredentialProvider, ProviderError, ProviderErrorKind};
use super::types::{Session, SignInCredentials, UserInfo};

/// Call recorded by [`ScriptedProvider`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    FetchSession { force_refresh: bool },
    SignIn { username: String },
    SignOut,
    CurrentUser,
}

struct Scripted<T> {
    result: Result<T, ProviderError>,
    delay: Option<Duration>,
}

/// In-memory provider answering from queued responses.
///
/// Each method pops its queue; when a queue is empty the method succeeds
/// (sessions fall back to the configurable default session).
pub struct ScriptedProvider {
    sessions: Mutex<VecDeque<Scripted<Session>>>,
    default_session: Mutex<Result<Session, ProviderError>>,
    sign_ins: Mutex<VecDeque<Result<(), ProviderError>>>,
    sign_outs: Mutex<VecDeque<Result<(), ProviderError>>>,
    users: Mutex<VecDeque<Result<UserInfo, ProviderError>>>,
    calls: Mutex<Vec<ProviderCall>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(VecDeque::new()),
            default_session: Mutex::new(Ok(Session::empty())),
            sign_ins: Mutex::new(VecDeque::new()),
            sign_outs: Mutex::new(VecDeque::new()),
            users: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push_session(&self, result: Result<Session, ProviderError>) -> &Self {
        self.sessions.lock().push_back(Scripted { result, delay: None });
        self
    }

    /// Queue a session fetch that resolves only after `delay`
    pub fn push_session_delayed(
        &self,
        result: Result<Session, ProviderError>,
        delay: Duration,
    ) -> &Self {
        self.sessions.lock().push_back(Scripted {
            result,
            delay: Some(delay),
        });
        self
    }

    pub fn set_default_session(&self, result: Result<Session, ProviderError>) -> &Self {
        *self.default_session.lock() = result;
        self
    }

    pub fn push_sign_in(&self, result: Result<(), ProviderError>) -> &Self {
        self.sign_ins.lock().push_back(result);
        self
    }

    pub fn push_sign_out(&self, result: Result<(), ProviderError>) -> &Self {
        self.sign_outs.lock().push_back(result);
        self
    }

    pub fn push_user(&self, result: Result<UserInfo, ProviderError>) -> &Self {
        self.users.lock().push_back(result);
        self
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.calls.lock().clone()
    }

    /// Number of `fetch_session(true)` calls so far
    pub fn forced_fetches(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| **c == ProviderCall::FetchSession { force_refresh: true })
            .count()
    }
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// Session whose access token expires `seconds` from now
pub fn session_expiring_in(token: &str, seconds: i64) -> Session {
    Session {
        access_token: Some(token.to_string()),
        id_token: Some(format!("id-{}", token)),
        expires_at: Some(Utc::now() + ChronoDuration::seconds(seconds)),
        raw: serde_json::json!({ "provider": "scripted" }),
    }
}

/// Provider error carrying the given provider code
pub fn provider_error(code: &str) -> ProviderError {
    ProviderError::new(ProviderErrorKind::from_code(code), format!("scripted {}", code))
}

/// Transport failure
pub fn network_error() -> ProviderError {
    ProviderError::new(ProviderErrorKind::Network, "connection reset")
}

#[async_trait]
impl CredentialProvider for ScriptedProvider {
    async fn fetch_session(&self, force_refresh: bool) -> Result<Session, ProviderError> {
        self.calls
            .lock()
            .push(ProviderCall::FetchSession { force_refresh });

        let next = self.sessions.lock().pop_front();
        match next {
            Some(Scripted { result, delay }) => {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                result
            }
            None => self.default_session.lock().clone(),
        }
    }

    async fn sign_in(&self, credentials: &SignInCredentials) -> Result<(), ProviderError> {
        self.calls.lock().push(ProviderCall::SignIn {
            username: credentials.username.clone(),
        });
        let next = self.sign_ins.lock().pop_front();
        next.unwrap_or(Ok(()))
    }

    async fn sign_out(&self) -> Result<(), ProviderError> {
        self.calls.lock().push(ProviderCall::SignOut);
        let next = self.sign_outs.lock().pop_front();
        next.unwrap_or(Ok(()))
    }

    async fn current_user(&self) -> Result<UserInfo, ProviderError> {
        self.calls.lock().push(ProviderCall::CurrentUser);
        let next = self.users.lock().pop_front();
        next.unwrap_or_else(|| {
            Ok(UserInfo {
                username: "usuario".to_string(),
            })
        })
    }
}
