// Error handling module
// Classified authentication categories and REST consumer errors

use serde::Serialize;
use thiserror::Error;

/// Classified authentication failure.
///
/// This is the only error shape that leaves the session layer: raw provider
/// errors are mapped onto these categories once, and the `Display` output is
/// the fixed message shown to the user.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthError {
    /// The identity provider has no such user
    #[error("Usuario no registrado")]
    UserNotFound,

    /// Wrong password, revoked refresh token or disabled user
    #[error("Credenciales incorrectas")]
    NotAuthorized,

    /// The account exists but was never confirmed
    #[error("Usuario no confirmado")]
    UserNotConfirmed,

    /// The provider requires a password reset before signing in
    #[error("Debes restablecer tu contraseña")]
    PasswordResetRequired,

    /// Anything else, including network failures
    #[error("Error desconocido, intenta más tarde")]
    Unknown,
}

impl AuthError {
    /// Whether this category maps a recognized provider failure
    pub fn is_known(&self) -> bool {
        !matches!(self, AuthError::Unknown)
    }
}

/// Maximum length for error response bodies kept in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

const DEFAULT_MESSAGE: &str = "Ocurrió un error inesperado. Por favor intenta de nuevo.";

/// Errors returned by the REST API client
#[derive(Error, Debug)]
pub enum ApiError {
    /// No access token is available, the request was not sent
    #[error("Not authenticated: no bearer token available")]
    Unauthenticated,

    /// Non-success response from the API
    #[error("API error: {status} - {message}")]
    Status {
        status: u16,
        message: String,
        /// `detail`/`message` field extracted from a JSON error body
        detail: Option<String>,
    },

    /// Transport failure after all retries
    #[error("Network error: {0}")]
    Network(String),

    /// Response body could not be decoded
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// Build a status error from a raw response body
    pub fn from_status(status: u16, body: &str) -> Self {
        let detail = serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|json| {
                json.get("detail")
                    .or_else(|| json.get("message"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            });

        ApiError::Status {
            status,
            message: truncate_body(body),
            detail,
        }
    }

    /// HTTP status, if the server answered
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Message suitable for showing to the user
    pub fn user_message(&self) -> String {
        match self {
            ApiError::Unauthenticated => "No tienes permisos para realizar esta acción.".to_string(),
            ApiError::Status {
                detail: Some(detail),
                ..
            } if !detail.is_empty() => detail.clone(),
            ApiError::Status { status, .. } => status_message(*status),
            ApiError::Network(_) => {
                "Error de conexión. Verifica tu conexión a internet e intenta de nuevo.".to_string()
            }
            ApiError::InvalidResponse(_) | ApiError::Internal(_) => DEFAULT_MESSAGE.to_string(),
        }
    }
}

fn status_message(status: u16) -> String {
    match status {
        400 => "Los datos enviados son inválidos. Revisa la información e intenta de nuevo.".to_string(),
        401 => "No tienes permisos para realizar esta acción.".to_string(),
        403 => "Acceso prohibido para realizar esta operación.".to_string(),
        404 => "El recurso solicitado no fue encontrado.".to_string(),
        409 => "Ya existe un registro con esa información.".to_string(),
        422 => "Los datos enviados no son válidos. Verifica la información.".to_string(),
        500 => "Error interno del servidor. Por favor intenta más tarde.".to_string(),
        503 => "El servicio no está disponible temporalmente.".to_string(),
        other => format!("Error del servidor ({}). Intenta de nuevo más tarde.", other),
    }
}

/// Truncate a response body to avoid carrying excessive data around
fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
        return body.to_string();
    }

    let mut end = MAX_ERROR_BODY_LENGTH;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
}
