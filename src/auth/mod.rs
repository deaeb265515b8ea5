// Authentication module
// Session lifecycle: provider boundary, classification, store and renewal

mod classify;
mod cognito;
mod manager;
mod provider;
mod scheduler;
mod store;
mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use classify::classify;
pub use cognito::CognitoProvider;
pub use manager::SessionManager;
pub use provider::{CredentialProvider, ProviderError, ProviderErrorKind};
pub use scheduler::RenewalPlan;
pub use types::{redact, AuthSnapshot, LifecyclePhase, Session, SignInCredentials, UserInfo};
