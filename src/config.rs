use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::str::FromStr;
use std::time::Duration;

use crate::http_client::BearerToken;

/// Gestor session client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// AWS region of the Cognito user pool
    #[arg(short = 'r', long, env = "COGNITO_REGION", default_value = "us-east-1")]
    pub region: String,

    /// Cognito user pool id (informational)
    #[arg(long, env = "COGNITO_USER_POOL_ID")]
    pub user_pool_id: Option<String>,

    /// Cognito app client id
    #[arg(short = 'c', long, env = "COGNITO_APP_CLIENT_ID")]
    pub client_id: Option<String>,

    /// Override the Cognito endpoint (local emulators, tests)
    #[arg(long, env = "COGNITO_ENDPOINT")]
    pub cognito_endpoint: Option<String>,

    /// Base URL of the Gestor REST API
    #[arg(short = 'a', long, env = "API_BASE_URL", default_value = "http://localhost:8000")]
    pub api_base_url: String,

    /// Username to sign in with (prompted when missing)
    #[arg(short = 'u', long, env = "GESTOR_USERNAME")]
    pub username: Option<String>,

    /// Password to sign in with (prompted when missing)
    #[arg(long, env = "GESTOR_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Token sent as bearer (access, id)
    #[arg(long, env = "BEARER_TOKEN", default_value = "access")]
    pub bearer_token: String,

    /// Seconds before expiry at which the session is renewed
    #[arg(long, env = "RENEWAL_MARGIN_SECS", default_value = "60")]
    pub renewal_margin: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,

    /// HTTP max retries
    #[arg(long, env = "HTTP_MAX_RETRIES", default_value = "3")]
    pub http_retries: u32,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Sign in and print the current user
    Whoami,
    /// Sign in and GET a path of the API
    Get {
        /// Path relative to the API base URL, e.g. /products/api/v1
        path: String,
    },
    /// Sign in and print every session change until Ctrl+C
    Watch,
}

/// Settings consumed by the session manager
#[derive(Clone, Debug, PartialEq)]
pub struct SessionConfig {
    /// Lead time before access token expiry
    pub renewal_margin: Duration,
    /// Retries of a failed background renewal
    pub renewal_max_retries: u32,
    /// Base delay of the renewal retry backoff
    pub renewal_retry_base: Duration,
    /// Floor between renewals when tokens arrive already inside the margin
    pub renewal_min_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            renewal_margin: Duration::from_secs(60),
            renewal_max_retries: 3,
            renewal_retry_base: Duration::from_millis(1000),
            renewal_min_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    // Identity provider
    pub region: String,
    pub user_pool_id: Option<String>,
    pub client_id: String,
    pub cognito_endpoint: Option<String>,

    // Credentials
    pub username: Option<String>,
    pub password: Option<String>,

    // API
    pub api_base_url: String,
    pub bearer_token: BearerToken,

    // Session lifecycle
    pub session: SessionConfig,

    // HTTP client
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,
    pub http_max_retries: u32,

    pub log_level: String,
    pub command: Command,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        Self::from_args(CliArgs::parse())
    }

    /// Build the configuration from parsed arguments plus env-only settings
    pub fn from_args(args: CliArgs) -> Result<Self> {
        let client_id = args
            .client_id
            .context("COGNITO_APP_CLIENT_ID is required (use -c or set COGNITO_APP_CLIENT_ID env var)")?;

        let session = SessionConfig {
            renewal_margin: Duration::from_secs(args.renewal_margin),
            renewal_max_retries: env_or("RENEWAL_MAX_RETRIES", 3),
            renewal_retry_base: Duration::from_millis(env_or("RENEWAL_RETRY_BASE_MS", 1000)),
            renewal_min_interval: Duration::from_secs(env_or("RENEWAL_MIN_INTERVAL_SECS", 5)),
        };

        Ok(Config {
            region: args.region,
            user_pool_id: args.user_pool_id,
            client_id,
            cognito_endpoint: args.cognito_endpoint,
            username: args.username,
            password: args.password,
            api_base_url: args.api_base_url.trim_end_matches('/').to_string(),
            bearer_token: parse_bearer_token(&args.bearer_token),
            session,
            http_connect_timeout: env_or("HTTP_CONNECT_TIMEOUT", 10),
            http_request_timeout: args.http_timeout,
            http_max_retries: args.http_retries,
            log_level: args.log_level,
            command: args.command,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            anyhow::bail!("COGNITO_APP_CLIENT_ID cannot be empty");
        }

        if !self.api_base_url.starts_with("http://") && !self.api_base_url.starts_with("https://") {
            anyhow::bail!(
                "API_BASE_URL must be an http(s) URL: {}",
                self.api_base_url
            );
        }

        if let Some(endpoint) = &self.cognito_endpoint {
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                anyhow::bail!("COGNITO_ENDPOINT must be an http(s) URL: {}", endpoint);
            }
        }

        Ok(())
    }
}

/// Read an env-only setting, falling back to a default when unset or invalid
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Parse bearer token kind from string
fn parse_bearer_token(s: &str) -> BearerToken {
    match s.to_lowercase().as_str() {
        "id" | "id_token" => BearerToken::Id,
        _ => BearerToken::Access,
    }
}
