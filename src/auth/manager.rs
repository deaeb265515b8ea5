use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;

use super::classify::classify;
use super::provider::{CredentialProvider, ProviderError};
use super::scheduler::{RenewalPlan, RenewalScheduler};
use super::store::SessionStore;
use super::types::{redact, AuthSnapshot, LifecyclePhase, Session, SignInCredentials, UserInfo};
use crate::config::SessionConfig;
use crate::error::AuthError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadMode {
    /// Passive load on first activation
    Initial,
    /// Reload following an explicit login or logout
    Explicit,
    /// Background renewal, never shows a loading state
    Renewal,
}

impl LoadMode {
    fn force_refresh(self) -> bool {
        self != LoadMode::Initial
    }
}

/// State guarded by one lock: store, timer and the load epoch move together
struct Core {
    store: SessionStore,
    scheduler: RenewalScheduler,
    /// Bumped by every login/logout. A load started under an older epoch is
    /// discarded when it completes.
    epoch: u64,
    /// Epoch of the renewal currently fetching, if any
    renewing: Option<u64>,
}

struct Inner {
    provider: Arc<dyn CredentialProvider>,
    config: SessionConfig,
    core: Mutex<Core>,
    /// Woken whenever a renewal ends
    renewal_done: Notify,
}

/// How a renewal request is handled
enum RenewalStart {
    Run,
    /// Wait for the renewal already in flight for this epoch
    Join,
    Skip,
}

/// Session lifecycle manager
/// Single writer of the session store and single owner of the renewal timer
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Create a manager in the `Loading` phase. Call [`SessionManager::initialize`]
    /// to perform the first session load.
    pub fn new(provider: Arc<dyn CredentialProvider>, config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                provider,
                config,
                core: Mutex::new(Core {
                    store: SessionStore::new(),
                    scheduler: RenewalScheduler::new(),
                    epoch: 0,
                    renewing: None,
                }),
                renewal_done: Notify::new(),
            }),
        }
    }

    /// Subscribe to every published change of the auth signal
    pub fn subscribe(&self) -> watch::Receiver<AuthSnapshot> {
        self.inner.core.lock().store.subscribe()
    }

    /// Current auth signal
    pub fn snapshot(&self) -> AuthSnapshot {
        self.inner.core.lock().store.snapshot()
    }

    pub fn is_authenticated(&self) -> bool {
        self.snapshot().is_authenticated()
    }

    /// Time left before the pending renewal fires, if one is armed
    pub fn renewal_due_in(&self) -> Option<Duration> {
        self.inner.core.lock().scheduler.due_in()
    }

    pub fn is_renewal_armed(&self) -> bool {
        self.inner.core.lock().scheduler.is_armed()
    }

    /// Unforced first load. Failures are stored in the signal, never returned.
    pub async fn initialize(&self) {
        let epoch = self.inner.core.lock().epoch;
        let _guard = LoadingGuard::new(&self.inner, epoch);

        tracing::debug!("Loading initial session");
        if let Err(error) = self.inner.load(epoch, LoadMode::Initial, None).await {
            tracing::warn!("Initial session load failed: {}", error);
        }
    }

    /// Sign in, then force a session reload.
    ///
    /// The classified failure is both stored as `last_error` and returned.
    pub async fn login(&self, credentials: SignInCredentials) -> Result<(), AuthError> {
        let epoch = self.inner.begin_explicit();
        let _guard = LoadingGuard::new(&self.inner, epoch);

        tracing::info!(username = %credentials.username, "Signing in");
        if let Err(err) = self.inner.provider.sign_in(&credentials).await {
            let error = classify(&err);
            tracing::warn!(kind = %err.kind, "Sign-in failed: {}", err.message);
            self.inner.abort_explicit(epoch, error);
            return Err(error);
        }

        self.inner.load(epoch, LoadMode::Explicit, None).await
    }

    /// Sign out, then force a session reload whatever the sign-out outcome.
    pub async fn logout(&self) -> Result<(), AuthError> {
        let epoch = self.inner.begin_explicit();
        let _guard = LoadingGuard::new(&self.inner, epoch);

        tracing::info!("Signing out");
        let sign_out_error = match self.inner.provider.sign_out().await {
            Ok(()) => None,
            Err(err) => {
                let error = classify(&err);
                tracing::warn!(
                    kind = %err.kind,
                    "Sign-out failed, reloading session anyway: {}",
                    err.message
                );
                self.inner.record_error(epoch, error);
                Some(error)
            }
        };

        self.inner
            .load(epoch, LoadMode::Explicit, sign_out_error)
            .await?;

        match sign_out_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Silent forced reload on demand, e.g. after the API rejected a token.
    ///
    /// Takes the place of the armed renewal timer. Skipped while a visible
    /// load is in flight; joins a renewal that is already fetching.
    pub async fn refresh(&self) -> Result<(), AuthError> {
        let (epoch, expires_at) = {
            let mut core = self.inner.core.lock();
            core.scheduler.cancel();
            (core.epoch, core.store.session().and_then(|s| s.access_expiry()))
        };
        self.inner.renew(epoch, expires_at).await
    }
}

impl Inner {
    /// Start a login/logout: new epoch, no timer, visible loading, no error
    fn begin_explicit(&self) -> u64 {
        let mut core = self.core.lock();
        core.epoch += 1;
        core.scheduler.cancel();
        core.store.set_phase(LifecyclePhase::Loading);
        core.store.set_last_error(None);
        core.store.publish();
        core.epoch
    }

    /// Returns `false` when the load must not run
    fn begin_load(&self, epoch: u64, mode: LoadMode) -> bool {
        let mut core = self.core.lock();
        if core.epoch != epoch {
            tracing::debug!(?mode, "Session load superseded before start");
            return false;
        }

        // The explicit operation already reset the error
        if mode != LoadMode::Explicit {
            core.store.set_last_error(None);
        }
        core.store.set_phase(LifecyclePhase::Loading);
        core.store.publish();
        true
    }

    fn begin_renewal(&self, epoch: u64) -> RenewalStart {
        let mut core = self.core.lock();
        if core.epoch != epoch {
            tracing::debug!("Session renewal superseded before start");
            return RenewalStart::Skip;
        }
        if core.store.phase() == LifecyclePhase::Loading {
            tracing::debug!("Session load already in progress, skipping renewal");
            return RenewalStart::Skip;
        }
        if core.renewing == Some(epoch) {
            tracing::debug!("Session renewal already in flight, waiting for it");
            return RenewalStart::Join;
        }

        core.renewing = Some(epoch);
        core.store.set_last_error(None);
        core.store.publish();
        RenewalStart::Run
    }

    /// Wait for the in-flight renewal of `epoch` and report its outcome
    async fn join_renewal(&self, epoch: u64) -> Result<(), AuthError> {
        loop {
            let done = self.renewal_done.notified();
            tokio::pin!(done);
            done.as_mut().enable();

            {
                let core = self.core.lock();
                if core.renewing != Some(epoch) {
                    if core.epoch != epoch {
                        return Ok(());
                    }
                    return match core.store.snapshot().last_error {
                        Some(error) => Err(error),
                        None => Ok(()),
                    };
                }
            }

            done.await;
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.core.lock().epoch == epoch
    }

    async fn load(
        self: &Arc<Self>,
        epoch: u64,
        mode: LoadMode,
        carried_error: Option<AuthError>,
    ) -> Result<(), AuthError> {
        if !self.begin_load(epoch, mode) {
            return Ok(());
        }

        match self.fetch_snapshot(mode.force_refresh()).await {
            Ok((session, user_info)) => {
                self.apply_success(epoch, mode, session, user_info, carried_error);
                Ok(())
            }
            Err(err) => {
                let error = classify(&err);
                tracing::warn!(kind = %err.kind, ?mode, "Session load failed: {}", err.message);
                self.apply_failure(epoch, error);
                Err(error)
            }
        }
    }

    /// Forced reload with retries on transient failures.
    ///
    /// The current session stays in place while retrying; retries stop once
    /// they would land after the access token's expiry or a newer load took over.
    async fn renew(
        self: &Arc<Self>,
        epoch: u64,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), AuthError> {
        match self.begin_renewal(epoch) {
            RenewalStart::Run => {}
            RenewalStart::Join => return self.join_renewal(epoch).await,
            RenewalStart::Skip => return Ok(()),
        }
        let _guard = RenewalGuard::new(self, epoch);

        let mut attempt = 0;
        loop {
            match self.fetch_snapshot(true).await {
                Ok((session, user_info)) => {
                    self.apply_success(epoch, LoadMode::Renewal, session, user_info, None);
                    return Ok(());
                }
                Err(err) => {
                    let error = classify(&err);
                    let delay = self.retry_delay(attempt);

                    if !error.is_known()
                        && attempt < self.config.renewal_max_retries
                        && fits_before(expires_at, delay)
                        && self.is_current(epoch)
                    {
                        tracing::warn!(
                            kind = %err.kind,
                            attempt = attempt + 1,
                            max_retries = self.config.renewal_max_retries,
                            delay_ms = delay.as_millis() as u64,
                            "Session renewal failed, retrying: {}",
                            err.message
                        );
                        tokio::time::sleep(delay).await;
                        if !self.is_current(epoch) {
                            tracing::debug!("Session renewal superseded during backoff");
                            return Ok(());
                        }
                        attempt += 1;
                        continue;
                    }

                    tracing::error!(
                        kind = %err.kind,
                        attempts = attempt + 1,
                        "Session renewal failed: {}",
                        err.message
                    );
                    self.apply_failure(epoch, error);
                    return Err(error);
                }
            }
        }
    }

    /// Exponential backoff: base * 2^attempt
    fn retry_delay(&self, attempt: u32) -> Duration {
        self.config
            .renewal_retry_base
            .saturating_mul(2u32.saturating_pow(attempt))
    }

    /// Fetch the session and, when it carries an access token, the user.
    /// A failed user lookup keeps the session without user info.
    async fn fetch_snapshot(
        &self,
        force_refresh: bool,
    ) -> Result<(Session, Option<UserInfo>), ProviderError> {
        let session = self.provider.fetch_session(force_refresh).await?;
        if !session.has_access_token() {
            return Ok((session, None));
        }

        let user_info = match self.provider.current_user().await {
            Ok(user) => Some(user),
            Err(err) => {
                tracing::warn!(
                    kind = %err.kind,
                    "User lookup failed, keeping session without user info: {}",
                    err.message
                );
                None
            }
        };

        Ok((session, user_info))
    }

    fn apply_success(
        self: &Arc<Self>,
        epoch: u64,
        mode: LoadMode,
        session: Session,
        user_info: Option<UserInfo>,
        carried_error: Option<AuthError>,
    ) -> bool {
        let mut core = self.core.lock();
        if core.epoch != epoch {
            tracing::debug!(?mode, "Discarding superseded session load");
            return false;
        }

        tracing::info!(
            authenticated = session.has_access_token(),
            token = %redact(session.access_token.as_deref()),
            expires_at = ?session.expires_at,
            ?mode,
            "Session updated"
        );

        core.store.replace(Arc::new(session), user_info);
        core.store.set_last_error(carried_error);
        core.store.set_phase(LifecyclePhase::Ready);
        self.reschedule(&mut core, mode == LoadMode::Renewal);
        core.store.publish();
        true
    }

    /// Fail closed: nothing of the previous session survives
    fn apply_failure(&self, epoch: u64, error: AuthError) -> bool {
        let mut core = self.core.lock();
        if core.epoch != epoch {
            tracing::debug!("Discarding failure of superseded session load");
            return false;
        }

        core.store.clear();
        core.scheduler.cancel();
        core.store.set_last_error(Some(error));
        core.store.set_phase(LifecyclePhase::Ready);
        core.store.publish();
        true
    }

    /// Sign-in failed: the previous session (if any) stays, and so does its renewal
    fn abort_explicit(self: &Arc<Self>, epoch: u64, error: AuthError) {
        let mut core = self.core.lock();
        if core.epoch != epoch {
            return;
        }

        core.store.set_last_error(Some(error));
        core.store.set_phase(LifecyclePhase::Ready);
        self.reschedule(&mut core, false);
        core.store.publish();
    }

    fn record_error(&self, epoch: u64, error: AuthError) {
        let mut core = self.core.lock();
        if core.epoch == epoch {
            core.store.set_last_error(Some(error));
            core.store.publish();
        }
    }

    /// Cancel, then arm for the current session's expiry (or leave disarmed)
    fn reschedule(self: &Arc<Self>, core: &mut Core, after_renewal: bool) {
        core.scheduler.cancel();

        let expires_at = core.store.session().and_then(|s| s.access_expiry());
        let plan = RenewalPlan::compute(expires_at, Utc::now(), self.config.renewal_margin);
        let Some(delay) = plan.delay(after_renewal, self.config.renewal_min_interval) else {
            tracing::debug!("No access token expiry, renewal timer not armed");
            return;
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No async runtime available, renewal timer not armed");
            return;
        };

        let weak = Arc::downgrade(self);
        let generation = core.scheduler.arm(delay, move |generation, due| {
            runtime.spawn(renewal_timer(weak, generation, due))
        });

        tracing::info!(
            generation,
            due_in_secs = delay.as_secs(),
            ?plan,
            "Session renewal scheduled"
        );
    }

    async fn on_renewal_due(self: &Arc<Self>, generation: u64) {
        let (epoch, expires_at) = {
            let mut core = self.core.lock();
            if !core.scheduler.begin_firing(generation) {
                tracing::debug!(generation, "Stale renewal timer ignored");
                return;
            }
            (core.epoch, core.store.session().and_then(|s| s.access_expiry()))
        };

        tracing::info!(generation, "Renewing session before access token expiry");
        // Background failures are only stored in the signal
        let _ = self.renew(epoch, expires_at).await;

        // Superseded or skipped renewals leave the timer in `Firing`
        self.core.lock().scheduler.finish_firing(generation);
    }
}

/// Timer task: holds only a weak handle so a dropped manager is never revived
async fn renewal_timer(inner: Weak<Inner>, generation: u64, due: Instant) {
    tokio::time::sleep_until(due).await;
    let Some(inner) = inner.upgrade() else {
        return;
    };
    inner.on_renewal_due(generation).await;
}

fn fits_before(expires_at: Option<DateTime<Utc>>, delay: Duration) -> bool {
    let Some(expires_at) = expires_at else {
        return false;
    };
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| Utc::now().checked_add_signed(delay))
        .is_some_and(|retry_at| retry_at < expires_at)
}

/// Settles the phase if a login/logout/initial load future is dropped
/// before completing.
struct LoadingGuard {
    inner: Arc<Inner>,
    epoch: u64,
}

impl LoadingGuard {
    fn new(inner: &Arc<Inner>, epoch: u64) -> Self {
        Self {
            inner: inner.clone(),
            epoch,
        }
    }
}

/// Clears the in-flight renewal marker and wakes joiners, also when the
/// renewal future is dropped.
struct RenewalGuard {
    inner: Arc<Inner>,
    epoch: u64,
}

impl RenewalGuard {
    fn new(inner: &Arc<Inner>, epoch: u64) -> Self {
        Self {
            inner: inner.clone(),
            epoch,
        }
    }
}

impl Drop for RenewalGuard {
    fn drop(&mut self) {
        {
            let mut core = self.inner.core.lock();
            if core.renewing == Some(self.epoch) {
                core.renewing = None;
            }
        }
        self.inner.renewal_done.notify_waiters();
    }
}

impl Drop for LoadingGuard {
    fn drop(&mut self) {
        let mut core = self.inner.core.lock();
        if core.epoch != self.epoch || core.store.phase() != LifecyclePhase::Loading {
            return;
        }

        tracing::warn!("Session operation dropped before completion, settling phase");
        core.store.set_phase(LifecyclePhase::Ready);
        self.inner.reschedule(&mut core, false);
        core.store.publish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::testing::{
        network_error, provider_error, session_expiring_in, ProviderCall, ScriptedProvider,
    };

    fn manager_with(provider: &Arc<ScriptedProvider>) -> SessionManager {
        SessionManager::new(provider.clone(), SessionConfig::default())
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    fn credentials() -> SignInCredentials {
        SignInCredentials::new("u", "p")
    }

    // === Initial load ===

    #[tokio::test]
    async fn test_initial_load_arms_renewal_before_expiry() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_session(Ok(session_expiring_in("t1", 300)));
        let manager = manager_with(&provider);
        assert!(manager.snapshot().is_loading());

        manager.initialize().await;

        let snapshot = manager.snapshot();
        assert!(snapshot.is_authenticated());
        assert_eq!(snapshot.phase, LifecyclePhase::Ready);
        assert_eq!(snapshot.username(), Some("usuario"));

        let due_in = manager.renewal_due_in().unwrap();
        assert!(due_in <= Duration::from_secs(240));
        assert!(due_in > Duration::from_secs(235));

        assert_eq!(
            provider.calls(),
            vec![
                ProviderCall::FetchSession {
                    force_refresh: false
                },
                ProviderCall::CurrentUser,
            ]
        );
    }

    #[tokio::test]
    async fn test_initial_load_without_tokens() {
        let provider = Arc::new(ScriptedProvider::new());
        let manager = manager_with(&provider);

        manager.initialize().await;

        let snapshot = manager.snapshot();
        assert!(!snapshot.is_authenticated());
        assert!(snapshot.session.is_some());
        assert_eq!(snapshot.phase, LifecyclePhase::Ready);
        assert!(!manager.is_renewal_armed());
        // No user lookup without an access token
        assert_eq!(provider.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_initial_load_failure_fails_closed() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_session(Err(network_error()));
        let manager = manager_with(&provider);

        manager.initialize().await;

        let snapshot = manager.snapshot();
        assert!(!snapshot.is_authenticated());
        assert!(snapshot.session.is_none());
        assert!(snapshot.user_info.is_none());
        assert_eq!(snapshot.last_error, Some(AuthError::Unknown));
        assert_eq!(snapshot.phase, LifecyclePhase::Ready);
    }

    #[tokio::test]
    async fn test_user_lookup_failure_keeps_session() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_session(Ok(session_expiring_in("t1", 300)));
        provider.push_user(Err(network_error()));
        let manager = manager_with(&provider);

        manager.initialize().await;

        let snapshot = manager.snapshot();
        assert!(snapshot.is_authenticated());
        assert!(snapshot.session.is_some());
        assert_eq!(snapshot.username(), None);
        assert_eq!(snapshot.last_error, None);
    }

    // === Login / logout ===

    #[tokio::test]
    async fn test_login_success_forces_reload() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_session(Ok(Session::empty()));
        provider.push_session(Ok(session_expiring_in("t1", 3600)));
        let manager = manager_with(&provider);
        manager.initialize().await;
        assert!(!manager.is_authenticated());

        manager.login(credentials()).await.unwrap();

        let snapshot = manager.snapshot();
        assert!(snapshot.is_authenticated());
        assert_eq!(snapshot.access_token(), Some("t1"));
        assert_eq!(snapshot.phase, LifecyclePhase::Ready);
        assert_eq!(snapshot.last_error, None);
        assert!(provider.calls().contains(&ProviderCall::SignIn {
            username: "u".to_string()
        }));
        assert_eq!(provider.forced_fetches(), 1);
    }

    #[tokio::test]
    async fn test_login_with_wrong_credentials() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_sign_in(Err(provider_error("NotAuthorizedException")));
        let manager = manager_with(&provider);
        manager.initialize().await;

        let err = manager.login(credentials()).await.unwrap_err();
        assert_eq!(err, AuthError::NotAuthorized);
        assert_eq!(err.to_string(), "Credenciales incorrectas");

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.last_error, Some(AuthError::NotAuthorized));
        assert!(!snapshot.is_authenticated());
        assert_eq!(snapshot.phase, LifecyclePhase::Ready);
        assert_eq!(provider.forced_fetches(), 0);
    }

    #[tokio::test]
    async fn test_failed_login_keeps_existing_session_renewal() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_session(Ok(session_expiring_in("t1", 3600)));
        provider.push_sign_in(Err(provider_error("UserNotFoundException")));
        let manager = manager_with(&provider);
        manager.initialize().await;
        assert!(manager.is_renewal_armed());

        let err = manager.login(credentials()).await.unwrap_err();
        assert_eq!(err, AuthError::UserNotFound);
        assert!(manager.is_authenticated());
        assert!(manager.is_renewal_armed());
    }

    #[tokio::test]
    async fn test_login_reload_failure_is_returned_and_fails_closed() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_session(Ok(Session::empty()));
        provider.push_session(Err(provider_error("NotAuthorizedException")));
        let manager = manager_with(&provider);
        manager.initialize().await;

        let err = manager.login(credentials()).await.unwrap_err();
        assert_eq!(err, AuthError::NotAuthorized);

        let snapshot = manager.snapshot();
        assert!(snapshot.session.is_none());
        assert_eq!(snapshot.phase, LifecyclePhase::Ready);
    }

    #[tokio::test]
    async fn test_logout_clears_authentication_and_timer() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_session(Ok(session_expiring_in("t1", 3600)));
        let manager = manager_with(&provider);
        manager.initialize().await;
        assert!(manager.is_authenticated());
        assert!(manager.is_renewal_armed());

        manager.logout().await.unwrap();

        let snapshot = manager.snapshot();
        assert!(!snapshot.is_authenticated());
        assert_eq!(snapshot.username(), None);
        assert_eq!(snapshot.phase, LifecyclePhase::Ready);
        assert!(!manager.is_renewal_armed());

        let calls = provider.calls();
        let sign_out = calls.iter().position(|c| *c == ProviderCall::SignOut).unwrap();
        assert_eq!(
            calls[sign_out + 1],
            ProviderCall::FetchSession {
                force_refresh: true
            }
        );
    }

    #[tokio::test]
    async fn test_logout_reloads_even_when_sign_out_fails() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_session(Ok(session_expiring_in("t1", 3600)));
        provider.push_sign_out(Err(network_error()));
        let manager = manager_with(&provider);
        manager.initialize().await;

        let err = manager.logout().await.unwrap_err();
        assert_eq!(err, AuthError::Unknown);

        let snapshot = manager.snapshot();
        assert!(!snapshot.is_authenticated());
        assert_eq!(snapshot.last_error, Some(AuthError::Unknown));
        assert_eq!(snapshot.phase, LifecyclePhase::Ready);
        assert_eq!(provider.forced_fetches(), 1);
    }

    // === Renewal ===

    #[tokio::test(start_paused = true)]
    async fn test_timer_renews_session() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_session(Ok(session_expiring_in("t1", 120)));
        provider.push_session(Ok(session_expiring_in("t2", 3600)));
        let manager = manager_with(&provider);
        manager.initialize().await;

        tokio::time::advance(Duration::from_secs(61)).await;
        settle().await;

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.access_token(), Some("t2"));
        assert_eq!(snapshot.phase, LifecyclePhase::Ready);
        assert_eq!(provider.forced_fetches(), 1);

        let due_in = manager.renewal_due_in().unwrap();
        assert!(due_in > Duration::from_secs(3500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_is_silent() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_session(Ok(session_expiring_in("t1", 120)));
        provider.push_session_delayed(
            Ok(session_expiring_in("t2", 3600)),
            Duration::from_secs(5),
        );
        let manager = manager_with(&provider);
        manager.initialize().await;

        tokio::time::advance(Duration::from_secs(61)).await;
        settle().await;

        // Renewal in flight: still authenticated, never Loading
        let snapshot = manager.snapshot();
        assert_eq!(provider.forced_fetches(), 1);
        assert_eq!(snapshot.access_token(), Some("t1"));
        assert_eq!(snapshot.phase, LifecyclePhase::Ready);

        let mut rx = manager.subscribe();
        let snapshot = rx
            .wait_for(|s| s.access_token() == Some("t2"))
            .await
            .unwrap()
            .clone();
        assert_eq!(snapshot.phase, LifecyclePhase::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_session_renews_immediately() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_session(Ok(session_expiring_in("t1", 30)));
        provider.push_session(Ok(session_expiring_in("t2", 3600)));
        let manager = manager_with(&provider);
        manager.initialize().await;

        assert_eq!(manager.renewal_due_in(), Some(Duration::ZERO));
        settle().await;

        assert_eq!(manager.snapshot().access_token(), Some("t2"));
        assert_eq!(provider.forced_fetches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_lived_renewal_is_throttled() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_session(Ok(session_expiring_in("t1", 30)));
        provider.push_session(Ok(session_expiring_in("t2", 30)));
        let manager = manager_with(&provider);
        manager.initialize().await;
        settle().await;

        assert_eq!(manager.snapshot().access_token(), Some("t2"));
        let due_in = manager.renewal_due_in().unwrap();
        assert!(due_in <= Duration::from_secs(5));
        assert!(due_in > Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_timer_after_many_replacements() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.set_default_session(Ok(session_expiring_in("t", 120)));
        let manager = manager_with(&provider);
        manager.initialize().await;

        for _ in 0..3 {
            manager.refresh().await.unwrap();
            assert!(manager.is_renewal_armed());
        }
        assert_eq!(provider.forced_fetches(), 3);

        tokio::time::advance(Duration::from_secs(61)).await;
        settle().await;

        // Only the last armed timer fired
        assert_eq!(provider.forced_fetches(), 4);
        assert!(manager.is_renewal_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_wins_over_in_flight_renewal() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_session(Ok(session_expiring_in("t1", 120)));
        provider.push_session_delayed(
            Ok(session_expiring_in("t2", 3600)),
            Duration::from_secs(10),
        );
        let manager = manager_with(&provider);
        manager.initialize().await;

        tokio::time::advance(Duration::from_secs(61)).await;
        settle().await;
        assert_eq!(provider.forced_fetches(), 1);

        manager.logout().await.unwrap();
        assert!(!manager.is_authenticated());

        // Let the stale renewal complete
        tokio::time::advance(Duration::from_secs(11)).await;
        settle().await;

        let snapshot = manager.snapshot();
        assert!(!snapshot.is_authenticated());
        assert_eq!(snapshot.phase, LifecyclePhase::Ready);
        assert!(!manager.is_renewal_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_renewal_failure_is_retried() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_session(Ok(session_expiring_in("t1", 3600)));
        provider.push_session(Err(network_error()));
        provider.push_session(Err(network_error()));
        provider.push_session(Ok(session_expiring_in("t2", 3600)));
        let manager = manager_with(&provider);
        manager.initialize().await;

        tokio::time::advance(Duration::from_secs(3541)).await;
        settle().await;

        // First attempt failed, session still usable while retrying
        let snapshot = manager.snapshot();
        assert_eq!(snapshot.access_token(), Some("t1"));
        assert_eq!(snapshot.last_error, None);

        let mut rx = manager.subscribe();
        rx.wait_for(|s| s.access_token() == Some("t2")).await.unwrap();
        assert_eq!(provider.forced_fetches(), 3);
        assert_eq!(manager.snapshot().last_error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_known_renewal_failure_fails_closed_without_retry() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_session(Ok(session_expiring_in("t1", 120)));
        provider.push_session(Err(provider_error("NotAuthorizedException")));
        let manager = manager_with(&provider);
        manager.initialize().await;

        tokio::time::advance(Duration::from_secs(61)).await;
        settle().await;

        let snapshot = manager.snapshot();
        assert!(!snapshot.is_authenticated());
        assert!(snapshot.session.is_none());
        assert_eq!(snapshot.last_error, Some(AuthError::NotAuthorized));
        assert!(!manager.is_renewal_armed());
        assert_eq!(provider.forced_fetches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_renewal_retries_fail_closed() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_session(Ok(session_expiring_in("t1", 3600)));
        provider.set_default_session(Err(network_error()));
        let manager = manager_with(&provider);
        manager.initialize().await;

        let mut rx = manager.subscribe();
        let snapshot = rx
            .wait_for(|s| s.last_error.is_some())
            .await
            .unwrap()
            .clone();

        assert!(!snapshot.is_authenticated());
        assert_eq!(snapshot.last_error, Some(AuthError::Unknown));
        // One attempt plus three retries
        assert_eq!(provider.forced_fetches(), 4);
    }

    #[tokio::test]
    async fn test_refresh_skipped_while_loading() {
        let provider = Arc::new(ScriptedProvider::new());
        let manager = manager_with(&provider);

        // Never initialized: still Loading
        manager.refresh().await.unwrap();
        assert!(provider.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_refreshes_share_one_renewal() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_session(Ok(session_expiring_in("t1", 3600)));
        provider.push_session_delayed(Ok(session_expiring_in("t2", 3600)), Duration::from_secs(1));
        let manager = manager_with(&provider);
        manager.initialize().await;

        let (first, second) = tokio::join!(manager.refresh(), manager.refresh());
        assert_eq!(first, Ok(()));
        assert_eq!(second, Ok(()));

        assert_eq!(provider.forced_fetches(), 1);
        assert_eq!(manager.snapshot().access_token(), Some("t2"));
        assert!(manager.is_renewal_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_joined_refresh_reports_renewal_failure() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_session(Ok(session_expiring_in("t1", 3600)));
        provider.push_session_delayed(
            Err(provider_error("NotAuthorizedException")),
            Duration::from_secs(1),
        );
        let manager = manager_with(&provider);
        manager.initialize().await;

        let (first, second) = tokio::join!(manager.refresh(), manager.refresh());
        assert_eq!(first, Err(AuthError::NotAuthorized));
        assert_eq!(second, Err(AuthError::NotAuthorized));
        assert_eq!(provider.forced_fetches(), 1);
        assert!(!manager.is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_during_retry_backoff_stops_renewal() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_session(Ok(session_expiring_in("t1", 3600)));
        provider.push_session(Err(network_error()));
        let manager = manager_with(&provider);
        manager.initialize().await;

        // Renewal fails once and backs off
        tokio::time::advance(Duration::from_secs(3541)).await;
        settle().await;
        assert_eq!(provider.forced_fetches(), 1);

        manager.logout().await.unwrap();
        assert_eq!(provider.forced_fetches(), 2);
        assert!(!manager.is_authenticated());

        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;

        assert_eq!(provider.forced_fetches(), 2);
        let snapshot = manager.snapshot();
        assert!(!snapshot.is_authenticated());
        assert_eq!(snapshot.last_error, None);
        assert!(!manager.is_renewal_armed());
    }

    // === Races and teardown ===

    #[tokio::test(start_paused = true)]
    async fn test_login_supersedes_slow_initial_load() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_session_delayed(
            Ok(session_expiring_in("stale", 3600)),
            Duration::from_secs(10),
        );
        provider.push_session(Ok(session_expiring_in("fresh", 3600)));
        let manager = manager_with(&provider);

        let initializing = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.initialize().await })
        };
        settle().await;

        manager.login(credentials()).await.unwrap();
        assert_eq!(manager.snapshot().access_token(), Some("fresh"));

        initializing.await.unwrap();
        let snapshot = manager.snapshot();
        assert_eq!(snapshot.access_token(), Some("fresh"));
        assert_eq!(snapshot.phase, LifecyclePhase::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_login_does_not_stick_in_loading() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_session(Ok(Session::empty()));
        provider.push_session_delayed(
            Ok(session_expiring_in("t1", 3600)),
            Duration::from_secs(30),
        );
        let manager = manager_with(&provider);
        manager.initialize().await;

        let result =
            tokio::time::timeout(Duration::from_secs(1), manager.login(credentials())).await;
        assert!(result.is_err());

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.phase, LifecyclePhase::Ready);
        assert!(!snapshot.is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_manager_cancels_timer() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_session(Ok(session_expiring_in("t1", 120)));
        let manager = manager_with(&provider);
        manager.initialize().await;
        assert!(manager.is_renewal_armed());

        drop(manager);
        tokio::time::advance(Duration::from_secs(120)).await;
        settle().await;

        assert_eq!(provider.forced_fetches(), 0);
    }

    #[tokio::test]
    async fn test_every_emission_is_consistent() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_session(Ok(Session::empty()));
        provider.push_session(Ok(session_expiring_in("t1", 3600)));
        provider.push_session(Ok(session_expiring_in("t2", 3600)));
        let manager = manager_with(&provider);

        let mut rx = manager.subscribe();
        let collector = tokio::spawn(async move {
            let mut seen = Vec::new();
            while rx.changed().await.is_ok() {
                seen.push(rx.borrow_and_update().clone());
            }
            seen
        });

        manager.initialize().await;
        settle().await;
        manager.login(credentials()).await.unwrap();
        settle().await;
        manager.refresh().await.unwrap();
        settle().await;
        manager.logout().await.unwrap();
        settle().await;
        drop(manager);

        let seen = collector.await.unwrap();
        assert!(!seen.is_empty());
        for snapshot in &seen {
            // User info never outlives its session
            assert!(snapshot.user_info.is_none() || snapshot.is_authenticated());
            if snapshot.is_authenticated() {
                assert!(snapshot.session.is_some());
            }
        }
        assert!(seen.iter().any(|s| s.access_token() == Some("t2")));
        assert!(!seen.last().unwrap().is_authenticated());
    }
}
