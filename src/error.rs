//! Error types for the identity broker

use std::io;

use thiserror::Error;

use crate::store::StoreError;

/// Result type alias for the identity broker
pub type Result<T> = std::result::Result<T, Error>;

/// Identity broker errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Entity absent
    #[error("{0} could not be found")]
    NotFound(String),

    /// Optimistic write condition failed
    #[error("Conflicting write: {0}")]
    Conflict(String),

    /// Request input rejected before any work was done
    #[error("Invalid request: {0}")]
    InvalidInput(String),

    /// Correlation state returned by the identity provider is malformed
    #[error("State given by sgID is malformed")]
    InvalidState,

    /// Authorization redirect could not be built
    #[error("Error while creating redirect URL")]
    CreateRedirectUrl(String),

    /// Code-for-token exchange failed
    #[error("Error while fetching access token")]
    FetchAccessToken(String),

    /// Userinfo retrieval failed
    #[error("Error while fetching user info")]
    FetchUserInfo(String),

    /// No session assertion presented
    #[error("No JWT present in cookies")]
    MissingAssertion,

    /// Session assertion decoded but lacks required claims
    #[error("Decoded JWT did not contain the correct attributes")]
    InvalidAssertion,

    /// Session assertion signature or expiry check failed
    #[error("Attempts to verify JWT failed. JWT is likely to be invalid")]
    VerificationFailed(String),

    /// Some revocation batches could not be deleted
    #[error("Failed to delete {failed} of {batches} batches for grant {grant_id}")]
    PartialRevocation {
        /// Grant being revoked
        grant_id: String,
        /// Number of failed batches
        failed: usize,
        /// Total number of batches
        batches: usize,
    },

    /// Storage backend failure
    #[error("Storage error: {0}")]
    Store(StoreError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ConditionFailed(detail) => Self::Conflict(detail),
            other => Self::Store(other),
        }
    }
}

impl Error {
    /// Stable machine-readable code, surfaced as the `error` field of HTTP responses
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::InvalidInput(_) => "invalid_request",
            Self::InvalidState => "invalid_state_error",
            Self::CreateRedirectUrl(_) => "create_redirect_url_error",
            Self::FetchAccessToken(_) => "fetch_access_token_error",
            Self::FetchUserInfo(_) => "fetch_user_info_error",
            Self::MissingAssertion => "missing_jwt",
            Self::InvalidAssertion => "invalid_jwt",
            Self::VerificationFailed(_) => "verify_jwt_error",
            _ => "server_error",
        }
    }

    /// HTTP status code for this error
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::InvalidInput(_)
            | Self::InvalidState
            | Self::MissingAssertion
            | Self::InvalidAssertion
            | Self::VerificationFailed(_) => 400,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            _ => 500,
        }
    }

    /// Whether the error asks the end user to start the sign-in again
    #[must_use]
    pub fn requires_reauthentication(&self) -> bool {
        matches!(
            self,
            Self::MissingAssertion | Self::InvalidAssertion | Self::VerificationFailed(_)
        )
    }
}
