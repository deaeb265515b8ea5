// Session store
// Single-writer holder of the current session, published on a watch channel

use std::sync::Arc;
use tokio::sync::watch;

use super::types::{AuthSnapshot, LifecyclePhase, Session, UserInfo};
use crate::error::AuthError;

/// Sole mutable state of the session layer.
///
/// Mutators only change the in-memory fields; [`SessionStore::publish`]
/// pushes one consolidated snapshot so a transition is observed as a whole.
pub(crate) struct SessionStore {
    session: Option<Arc<Session>>,
    user_info: Option<UserInfo>,
    phase: LifecyclePhase,
    last_error: Option<AuthError>,
    tx: watch::Sender<AuthSnapshot>,
}

impl SessionStore {
    pub fn new() -> Self {
        let initial = AuthSnapshot::initial();
        let (tx, _rx) = watch::channel(initial.clone());
        Self {
            session: initial.session,
            user_info: initial.user_info,
            phase: initial.phase,
            last_error: initial.last_error,
            tx,
        }
    }

    /// Atomic swap of session and user info
    pub fn replace(&mut self, session: Arc<Session>, user_info: Option<UserInfo>) {
        self.session = Some(session);
        self.user_info = user_info;
    }

    pub fn clear(&mut self) {
        self.session = None;
        self.user_info = None;
    }

    pub fn set_phase(&mut self, phase: LifecyclePhase) {
        self.phase = phase;
    }

    pub fn set_last_error(&mut self, error: Option<AuthError>) {
        self.last_error = error;
    }

    pub fn session(&self) -> Option<&Arc<Session>> {
        self.session.as_ref()
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.phase
    }

    pub fn snapshot(&self) -> AuthSnapshot {
        AuthSnapshot {
            session: self.session.clone(),
            user_info: self.user_info.clone(),
            phase: self.phase,
            last_error: self.last_error,
        }
    }

    /// Publish the current state; subscribers are only woken on change
    pub fn publish(&self) {
        let snapshot = self.snapshot();
        self.tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthSnapshot> {
        self.tx.subscribe()
    }
}
