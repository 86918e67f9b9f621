//! Error taxonomy shared by every sealkeep crate
//!
//! Each [`Error`] maps onto a stable [`ErrorKind`]. The kind is what crosses
//! the control channel and what users see; internal causes (registry
//! failures, io errors) stay in the daemon's logs.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{GenerationOutcome, KeypairId, Organization};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("registry unavailable: {0}")]
    Transient(String),

    #[error("a session is already logged in")]
    AlreadyAuthenticated,

    #[error("no session is logged in")]
    NotAuthenticated,

    #[error("credentials rejected")]
    InvalidCredentials,

    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("envelope signature is invalid")]
    SignatureInvalid,

    #[error("keypair {0} is revoked")]
    RevokedKey(KeypairId),

    #[error("caller is not a recipient of this envelope")]
    NotAuthorized,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("daemon already running on {0}")]
    AlreadyRunning(String),

    #[error("{} organization(s) failed", .0.failed.len())]
    PartialFailure(PartialFailure),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Transient(_) => ErrorKind::Transient,
            Self::AlreadyAuthenticated => ErrorKind::AlreadyAuthenticated,
            Self::NotAuthenticated => ErrorKind::NotAuthenticated,
            Self::InvalidCredentials => ErrorKind::InvalidCredentials,
            Self::InvalidRecipient(_) => ErrorKind::InvalidRecipient,
            Self::SignatureInvalid => ErrorKind::SignatureInvalid,
            Self::RevokedKey(_) => ErrorKind::RevokedKey,
            Self::NotAuthorized => ErrorKind::NotAuthorized,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::AlreadyRunning(_) => ErrorKind::AlreadyRunning,
            Self::PartialFailure(_) => ErrorKind::PartialFailure,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::Io(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Message safe to show outside the daemon.
    ///
    /// Kinds whose detail is user-supplied (a name that was not found, a bad
    /// flag) keep it; everything else collapses to the stable kind message.
    pub fn public_message(&self) -> String {
        match self {
            Self::NotFound(what) => format!("{} not found.", what),
            Self::InvalidRequest(why) => format!("Invalid request: {}.", why),
            Self::InvalidRecipient(why) => format!("Invalid recipient: {}.", why),
            Self::PermissionDenied(why) => format!("Permission denied: {}.", why),
            Self::PartialFailure(partial) => format!(
                "Keypair generation failed for {} of {} organizations.",
                partial.failed.len(),
                partial.failed.len() + partial.succeeded.len()
            ),
            other => other.kind().user_message().to_string(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Stable error discriminant carried over the control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Transient,
    AlreadyAuthenticated,
    NotAuthenticated,
    InvalidCredentials,
    InvalidRecipient,
    SignatureInvalid,
    RevokedKey,
    NotAuthorized,
    PermissionDenied,
    AlreadyRunning,
    PartialFailure,
    InvalidRequest,
    Internal,
}

impl ErrorKind {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::NotFound => "Not found.",
            Self::Transient => "Could not reach the registry, please try again.",
            Self::AlreadyAuthenticated => "Already logged in. Run 'sealkeep logout' first.",
            Self::NotAuthenticated => "You must be logged in. Run 'sealkeep login'.",
            Self::InvalidCredentials => "Login failed, please check your credentials.",
            Self::InvalidRecipient => "Invalid recipient key.",
            Self::SignatureInvalid => "Secret failed integrity verification.",
            Self::RevokedKey => "Secret was signed by a revoked keypair.",
            Self::NotAuthorized => "You are not authorized to read this secret.",
            Self::PermissionDenied => "Permission denied.",
            Self::AlreadyRunning => "The daemon is already running.",
            Self::PartialFailure => "Operation failed for some organizations.",
            Self::InvalidRequest => "Invalid request.",
            Self::Internal => "Internal error, please try again.",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Transient => "transient",
            Self::AlreadyAuthenticated => "already_authenticated",
            Self::NotAuthenticated => "not_authenticated",
            Self::InvalidCredentials => "invalid_credentials",
            Self::InvalidRecipient => "invalid_recipient",
            Self::SignatureInvalid => "signature_invalid",
            Self::RevokedKey => "revoked_key",
            Self::NotAuthorized => "not_authorized",
            Self::PermissionDenied => "permission_denied",
            Self::AlreadyRunning => "already_running",
            Self::PartialFailure => "partial_failure",
            Self::InvalidRequest => "invalid_request",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Aggregate result of a bulk keypair generation where some organizations
/// failed. Both sides are always kept.
#[derive(Debug, Default)]
pub struct PartialFailure {
    pub succeeded: Vec<(Organization, GenerationOutcome)>,
    pub failed: Vec<(Organization, Error)>,
}
