use thiserror::Error;

/// Error taxonomy shared by the REST surface and the gateway.
///
/// A single offending event never terminates a connection: everything here
/// except `AuthenticationFailure` maps to a scoped `error` event (gateway)
/// or an `{error}` JSON envelope (REST) while the connection stays open.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("authentication failed")]
    AuthenticationFailure,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl ChatError {
    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::Forbidden(reason.into())
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidInput(reason.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }
}
