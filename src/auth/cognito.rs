// Cognito Identity Provider client
// Implements the credential provider over the InitiateAuth/GetUser/RevokeToken JSON API

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::provider::{CredentialProvider, ProviderError, ProviderErrorKind};
use super::types::{
    redact, AccessTokenRequest, AuthenticationResult, CognitoErrorBody, GetUserResponse,
    InitiateAuthRequest, InitiateAuthResponse, RevokeTokenRequest, Session, SignInCredentials,
    UserInfo,
};

const TARGET_PREFIX: &str = "AWSCognitoIdentityProviderService";
const AMZ_JSON: &str = "application/x-amz-json-1.1";

/// Used when the provider omits `ExpiresIn`
const DEFAULT_EXPIRES_IN: i64 = 3600;

/// Get the Cognito Identity Provider endpoint for a region
fn get_cognito_url(region: &str) -> String {
    format!("https://cognito-idp.{}.amazonaws.com/", region)
}

/// Tokens held between calls
#[derive(Clone)]
struct CachedTokens {
    access_token: String,
    id_token: Option<String>,
    refresh_token: Option<String>,
    token_type: Option<String>,
    expires_at: DateTime<Utc>,
}

impl CachedTokens {
    fn from_result(result: AuthenticationResult, previous_refresh: Option<String>) -> Self {
        let expires_in = result.expires_in.unwrap_or(DEFAULT_EXPIRES_IN);
        Self {
            access_token: result.access_token,
            id_token: result.id_token,
            // REFRESH_TOKEN_AUTH does not rotate the refresh token
            refresh_token: result.refresh_token.or(previous_refresh),
            token_type: result.token_type,
            expires_at: Utc::now() + Duration::seconds(expires_in),
        }
    }

    fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    fn to_session(&self) -> Session {
        Session {
            access_token: Some(self.access_token.clone()),
            id_token: self.id_token.clone(),
            expires_at: Some(self.expires_at),
            raw: serde_json::json!({
                "provider": "cognito",
                "token_type": self.token_type,
                "has_refresh_token": self.refresh_token.is_some(),
            }),
        }
    }
}

/// Cached tokens plus a counter bumped by every sign-in and sign-out.
/// A refresh only lands if the counter is unchanged since it started.
#[derive(Default)]
struct TokenCache {
    tokens: Option<CachedTokens>,
    generation: u64,
}

impl TokenCache {
    fn replace(&mut self, tokens: Option<CachedTokens>) -> Option<CachedTokens> {
        self.generation += 1;
        std::mem::replace(&mut self.tokens, tokens)
    }

    fn session(&self) -> Session {
        self.tokens
            .as_ref()
            .map(CachedTokens::to_session)
            .unwrap_or_else(Session::empty)
    }
}

/// Credential provider backed by an Amazon Cognito user pool app client.
///
/// Tokens live in memory only; a new process starts signed out.
pub struct CognitoProvider {
    client: Client,
    endpoint: String,
    client_id: String,
    cache: RwLock<TokenCache>,
}

impl CognitoProvider {
    /// Create a provider for the app client in the given region
    pub fn new(
        region: &str,
        client_id: impl Into<String>,
        connect_timeout: u64,
        request_timeout: u64,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(connect_timeout))
            .timeout(std::time::Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create Cognito HTTP client")?;

        Ok(Self {
            client,
            endpoint: get_cognito_url(region),
            client_id: client_id.into(),
            cache: RwLock::new(TokenCache::default()),
        })
    }

    /// Send requests to another endpoint (local emulators, tests)
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Invoke one Cognito action
    async fn call<B, R>(&self, action: &str, body: &B) -> Result<R, ProviderError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let payload = serde_json::to_vec(body).map_err(|e| {
            ProviderError::new(
                ProviderErrorKind::Other("SerializationError".to_string()),
                e.to_string(),
            )
        })?;

        tracing::debug!(action, endpoint = %self.endpoint, "Calling Cognito");

        let response = self
            .client
            .post(&self.endpoint)
            .header("X-Amz-Target", format!("{}.{}", TARGET_PREFIX, action))
            .header(CONTENT_TYPE, AMZ_JSON)
            .body(payload)
            .send()
            .await?;

        let status = response.status();
        let header_type = response
            .headers()
            .get("x-amzn-ErrorType")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let text = response.text().await?;

        if !status.is_success() {
            let error = parse_error(status.as_u16(), header_type.as_deref(), &text);
            tracing::debug!(
                action,
                status = status.as_u16(),
                kind = %error.kind,
                "Cognito returned an error"
            );
            return Err(error);
        }

        serde_json::from_str(&text).map_err(|e| {
            ProviderError::new(
                ProviderErrorKind::InvalidResponse,
                format!("Failed to parse {} response: {}", action, e),
            )
        })
    }

    async fn initiate_auth(
        &self,
        flow: &str,
        parameters: HashMap<&str, &str>,
    ) -> Result<AuthenticationResult, ProviderError> {
        let request = InitiateAuthRequest {
            auth_flow: flow,
            client_id: &self.client_id,
            auth_parameters: parameters,
        };

        let response: InitiateAuthResponse = self.call("InitiateAuth", &request).await?;
        match (response.authentication_result, response.challenge_name) {
            (Some(result), _) => Ok(result),
            (None, Some(challenge)) => Err(ProviderError::new(
                ProviderErrorKind::ChallengeRequired(challenge.clone()),
                format!("Sign-in requires the {} challenge", challenge),
            )),
            (None, None) => Err(ProviderError::new(
                ProviderErrorKind::InvalidResponse,
                "InitiateAuth response carries neither tokens nor a challenge",
            )),
        }
    }

    /// Cached tokens and the cache generation they belong to
    async fn cached(&self) -> (Option<CachedTokens>, u64) {
        let cache = self.cache.read().await;
        (cache.tokens.clone(), cache.generation)
    }

    /// Exchange the cached refresh token for new tokens.
    ///
    /// `generation` is the cache generation `cached` was read under. If a
    /// sign-in or sign-out replaced the tokens meanwhile, the outcome is
    /// discarded and the current session is returned instead.
    async fn refresh(&self, cached: CachedTokens, generation: u64) -> Result<Session, ProviderError> {
        let Some(refresh_token) = cached.refresh_token.clone() else {
            let mut cache = self.cache.write().await;
            if cache.generation != generation {
                return Ok(cache.session());
            }
            cache.replace(None);
            return Err(ProviderError::new(
                ProviderErrorKind::NotAuthorized,
                "Refresh token not available",
            ));
        };

        tracing::info!("Refreshing Cognito tokens...");

        let mut parameters = HashMap::new();
        parameters.insert("REFRESH_TOKEN", refresh_token.as_str());

        match self.initiate_auth("REFRESH_TOKEN_AUTH", parameters).await {
            Ok(result) => {
                let tokens = CachedTokens::from_result(result, Some(refresh_token));
                tracing::info!(
                    "Tokens refreshed, access token {} expires: {}",
                    redact(Some(&tokens.access_token)),
                    tokens.expires_at.to_rfc3339()
                );

                let mut cache = self.cache.write().await;
                if cache.generation != generation {
                    tracing::debug!("Tokens replaced during refresh, discarding refreshed tokens");
                    return Ok(cache.session());
                }
                let session = tokens.to_session();
                cache.tokens = Some(tokens);
                Ok(session)
            }
            Err(err) if err.kind == ProviderErrorKind::NotAuthorized => {
                let mut cache = self.cache.write().await;
                if cache.generation != generation {
                    tracing::debug!("Tokens replaced during refresh, ignoring rejected refresh token");
                    return Ok(cache.session());
                }
                // Revoked or expired refresh token: nothing left to reuse
                tracing::warn!("Refresh token rejected, dropping cached tokens");
                cache.replace(None);
                Err(err)
            }
            Err(err) => Err(err),
        }
    }
}

/// Map a Cognito error response onto a provider error
fn parse_error(status: u16, header_type: Option<&str>, body: &str) -> ProviderError {
    let parsed: CognitoErrorBody = serde_json::from_str(body).unwrap_or_default();
    let code = parsed.error_type.as_deref().or(header_type);

    let kind = match code {
        Some(code) => ProviderErrorKind::from_code(code),
        None => ProviderErrorKind::Other(format!("HTTP {}", status)),
    };
    let message = parsed
        .message
        .unwrap_or_else(|| body.chars().take(200).collect());

    ProviderError::new(kind, message)
}

#[async_trait]
impl CredentialProvider for CognitoProvider {
    async fn fetch_session(&self, force_refresh: bool) -> Result<Session, ProviderError> {
        let (cached, generation) = self.cached().await;
        let Some(cached) = cached else {
            return Ok(Session::empty());
        };

        if !force_refresh && !cached.is_expired() {
            return Ok(cached.to_session());
        }

        self.refresh(cached, generation).await
    }

    async fn sign_in(&self, credentials: &SignInCredentials) -> Result<(), ProviderError> {
        let mut parameters = HashMap::new();
        parameters.insert("USERNAME", credentials.username.as_str());
        parameters.insert("PASSWORD", credentials.password.as_str());

        let result = self.initiate_auth("USER_PASSWORD_AUTH", parameters).await?;
        let tokens = CachedTokens::from_result(result, None);
        tracing::info!(
            "Signed in, access token {} expires: {}",
            redact(Some(&tokens.access_token)),
            tokens.expires_at.to_rfc3339()
        );

        self.cache.write().await.replace(Some(tokens));
        Ok(())
    }

    async fn sign_out(&self) -> Result<(), ProviderError> {
        // Local sign-out always happens, revocation is best effort
        let cached = self.cache.write().await.replace(None);
        let Some(refresh_token) = cached.and_then(|t| t.refresh_token) else {
            return Ok(());
        };

        let request = RevokeTokenRequest {
            token: &refresh_token,
            client_id: &self.client_id,
        };
        self.call::<_, serde::de::IgnoredAny>("RevokeToken", &request)
            .await?;
        Ok(())
    }

    async fn current_user(&self) -> Result<UserInfo, ProviderError> {
        let access_token = self
            .cache
            .read()
            .await
            .tokens
            .as_ref()
            .map(|t| t.access_token.clone());
        let Some(access_token) = access_token else {
            return Err(ProviderError::new(
                ProviderErrorKind::Other("UserUnAuthenticatedException".to_string()),
                "User needs to be authenticated to call this API",
            ));
        };

        let request = AccessTokenRequest {
            access_token: &access_token,
        };
        let response: GetUserResponse = self.call("GetUser", &request).await?;
        Ok(UserInfo {
            username: response.username,
        })
    }
}
