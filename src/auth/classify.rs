// Provider error classification

use super::provider::{ProviderError, ProviderErrorKind};
use crate::error::AuthError;

/// Map a raw provider failure onto its user-facing category.
///
/// Total and pure: every kind has exactly one category, and anything not in
/// the recognized set falls back to [`AuthError::Unknown`].
pub fn classify(error: &ProviderError) -> AuthError {
    match &error.kind {
        ProviderErrorKind::UserNotFound => AuthError::UserNotFound,
        ProviderErrorKind::NotAuthorized => AuthError::NotAuthorized,
        ProviderErrorKind::UserNotConfirmed => AuthError::UserNotConfirmed,
        ProviderErrorKind::PasswordResetRequired => AuthError::PasswordResetRequired,
        ProviderErrorKind::ChallengeRequired(_)
        | ProviderErrorKind::Network
        | ProviderErrorKind::InvalidResponse
        | ProviderErrorKind::Other(_) => AuthError::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn error(kind: ProviderErrorKind) -> ProviderError {
        ProviderError::new(kind, "test")
    }

    #[test]
    fn test_known_kinds() {
        assert_eq!(
            classify(&error(ProviderErrorKind::NotAuthorized)),
            AuthError::NotAuthorized
        );
        assert_eq!(
            classify(&error(ProviderErrorKind::UserNotFound)),
            AuthError::UserNotFound
        );
        assert_eq!(
            classify(&error(ProviderErrorKind::UserNotConfirmed)),
            AuthError::UserNotConfirmed
        );
        assert_eq!(
            classify(&error(ProviderErrorKind::PasswordResetRequired)),
            AuthError::PasswordResetRequired
        );
    }

    #[test]
    fn test_not_authorized_message() {
        let category = classify(&error(ProviderErrorKind::from_code("NotAuthorizedException")));
        assert_eq!(category.to_string(), "Credenciales incorrectas");
    }

    #[test]
    fn test_unrecognized_kinds_are_unknown() {
        assert_eq!(classify(&error(ProviderErrorKind::Network)), AuthError::Unknown);
        assert_eq!(
            classify(&error(ProviderErrorKind::InvalidResponse)),
            AuthError::Unknown
        );
        assert_eq!(
            classify(&error(ProviderErrorKind::ChallengeRequired(
                "NEW_PASSWORD_REQUIRED".to_string()
            ))),
            AuthError::Unknown
        );
        assert_eq!(
            classify(&error(ProviderErrorKind::Other("LimitExceededException".to_string()))),
            AuthError::Unknown
        );
    }

    proptest! {
        #[test]
        fn classification_is_stable(code in ".*") {
            let err = error(ProviderErrorKind::from_code(&code));
            prop_assert_eq!(classify(&err), classify(&err));
        }

        #[test]
        fn unrecognized_codes_are_unknown(code in "[A-Za-z]{1,24}") {
            let recognized = [
                "UserNotFoundException",
                "NotAuthorizedException",
                "UserNotConfirmedException",
                "PasswordResetRequiredException",
            ];
            prop_assume!(!recognized.contains(&code.as_str()));
            let err = error(ProviderErrorKind::from_code(&code));
            prop_assert_eq!(classify(&err), AuthError::Unknown);
        }
    }
}
