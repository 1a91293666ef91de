//! The closed set of errors that can cross the protocol boundary.
//!
//! Everything upstream of the router (config loading, relay reconnect, CLI)
//! uses `anyhow::Result` instead — see `retry.rs` and `main.rs`. `GatewayError`
//! exists only for values the router turns into a wire-facing `{code, message}`
//! pair, so a backend failure never leaks implementation detail to a client.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("restricted")]
    Restricted,
    #[error("rate limited")]
    RateLimited,
    #[error("payload too large")]
    PayloadTooLarge,
    #[error("invalid key")]
    InvalidKey,
    #[error("invalid value")]
    InvalidValue,
    #[error("not implemented")]
    NotImplemented,
    #[error("internal error")]
    Internal,
}

impl GatewayError {
    /// Wire error code — one of the closed set in §6.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Unauthorized => "UNAUTHORIZED",
            GatewayError::Restricted => "RESTRICTED",
            GatewayError::RateLimited => "RATE_LIMITED",
            GatewayError::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            GatewayError::InvalidKey => "INVALID_KEY",
            GatewayError::InvalidValue => "INVALID_VALUE",
            GatewayError::NotImplemented => "NOT_IMPLEMENTED",
            GatewayError::Internal => "INTERNAL",
        }
    }

    /// Short, non-revealing message sent to the client alongside `code()`.
    pub fn message(&self) -> &'static str {
        match self {
            GatewayError::Unauthorized => "unauthorized",
            GatewayError::Restricted => "request does not satisfy connection policy",
            GatewayError::RateLimited => "rate or byte budget exceeded",
            GatewayError::PayloadTooLarge => "payload exceeds configured limit",
            GatewayError::InvalidKey => "key is malformed or out of bounds",
            GatewayError::InvalidValue => "value is malformed or out of bounds",
            GatewayError::NotImplemented => "method is not implemented",
            GatewayError::Internal => "internal error",
        }
    }
}

/// Maps a backend/adapter failure to the `INTERNAL` band, logging the real
/// cause internally. The router must never forward `anyhow::Error` text to
/// a client — see §7 band 4.
pub fn classify_backend_error(err: &anyhow::Error) -> GatewayError {
    tracing::error!(err = %err, "backend operation failed");
    GatewayError::Internal
}
