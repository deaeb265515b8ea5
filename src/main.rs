use anyhow::{Context, Result};
use dialoguer::{Input, Password};
use std::sync::Arc;

use gestor_session::auth::{redact, AuthSnapshot, CognitoProvider, SessionManager, SignInCredentials};
use gestor_session::config::{Command, Config};
use gestor_session::guard::{route_decision, RouteKind, HOME_ROUTE};
use gestor_session::http_client::ApiClient;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let config = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("🚀 Gestor session starting...");
    tracing::info!(
        region = %config.region,
        user_pool_id = config.user_pool_id.as_deref().unwrap_or("-"),
        api = %config.api_base_url,
        "Configuration loaded"
    );

    let mut provider = CognitoProvider::new(
        &config.region,
        config.client_id.clone(),
        config.http_connect_timeout,
        config.http_request_timeout,
    )?;
    if let Some(endpoint) = &config.cognito_endpoint {
        provider = provider.with_endpoint(endpoint.clone());
    }
    tracing::debug!("Cognito endpoint: {}", provider.endpoint());

    let session = SessionManager::new(Arc::new(provider), config.session.clone());
    session.initialize().await;

    let credentials = prompt_credentials(&config)?;
    if let Err(e) = session.login(credentials).await {
        tracing::error!("❌ Sign-in failed: {}", e);
        return Err(e).context("Sign-in failed");
    }
    tracing::info!("✅ Signed in");

    let result = run_command(&config, &session).await;

    if let Err(e) = session.logout().await {
        tracing::warn!("Sign-out failed: {}", e);
    }
    tracing::info!("👋 Signed out");

    result
}

/// Take credentials from the configuration, prompting for what is missing
fn prompt_credentials(config: &Config) -> Result<SignInCredentials> {
    let username = match &config.username {
        Some(username) => username.clone(),
        None => Input::<String>::new()
            .with_prompt("Usuario")
            .interact_text()
            .context("Failed to read username")?,
    };

    let password = match &config.password {
        Some(password) => password.clone(),
        None => Password::new()
            .with_prompt("Contraseña")
            .interact()
            .context("Failed to read password")?,
    };

    Ok(SignInCredentials::new(username, password))
}

async fn run_command(config: &Config, session: &SessionManager) -> Result<()> {
    match &config.command {
        Command::Whoami => {
            print_snapshot(&session.snapshot());
            if let Some(due_in) = session.renewal_due_in() {
                println!("  Renewal in:  {}s", due_in.as_secs());
            }
            Ok(())
        }

        Command::Get { path } => {
            let client = ApiClient::new(
                session.clone(),
                &config.api_base_url,
                config.bearer_token,
                config.http_connect_timeout,
                config.http_request_timeout,
                config.http_max_retries,
            )?;

            match client.get::<serde_json::Value>(path).await {
                Ok(body) => {
                    println!("{}", serde_json::to_string_pretty(&body)?);
                    Ok(())
                }
                Err(e) => {
                    tracing::error!("❌ {}", e);
                    anyhow::bail!("{}", e.user_message())
                }
            }
        }

        Command::Watch => {
            let mut rx = session.subscribe();
            print_snapshot(&rx.borrow_and_update().clone());

            let shutdown = shutdown_signal();
            tokio::pin!(shutdown);

            loop {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let snapshot = rx.borrow_and_update().clone();
                        print_snapshot(&snapshot);
                    }
                    _ = &mut shutdown => break,
                }
            }
            Ok(())
        }
    }
}

fn print_snapshot(snapshot: &AuthSnapshot) {
    let expires_at = snapshot
        .session
        .as_ref()
        .and_then(|s| s.expires_at)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());

    println!(
        "[{}] phase={:?} authenticated={} user={} token={} expires={} route={:?}",
        chrono::Local::now().format("%H:%M:%S"),
        snapshot.phase,
        snapshot.is_authenticated(),
        snapshot.username().unwrap_or("-"),
        redact(snapshot.access_token()),
        expires_at,
        route_decision(snapshot, RouteKind::Protected, Some(HOME_ROUTE)),
    );
    if let Some(error) = snapshot.last_error {
        println!("  Error: {}", error);
    }
}

/// Handle graceful shutdown signal
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, stopping...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, stopping...");
        },
    }
}
