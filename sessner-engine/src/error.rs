use std::io;

/// Error union for every public engine operation.
///
/// User-initiated operations return these kinds verbatim to the message
/// router; the UI maps them to readable strings. `Internal` is logged and
/// swallowed at the nearest user-visible boundary, degrading to a safe
/// state (e.g. pass-through on interception).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("session limit reached for tier {tier}: {limit}")]
    LimitExceeded { tier: crate::license::Tier, limit: usize },

    #[error("feature {feature} requires a higher tier than {tier}")]
    TierRestricted { tier: crate::license::Tier, feature: String },

    #[error("storage quota exceeded: {0}")]
    StorageQuotaExceeded(String),

    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("decryption failure")]
    DecryptionFailure,

    #[error("validation failure: {0}")]
    ValidationFailure(String),

    #[error("network timeout: {0}")]
    NetworkTimeout(String),

    #[error("rejected by remote: {message}")]
    RemoteRejection { message: String, code: Option<i64> },

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// Numeric code carried on the wire, when one exists.
    ///
    /// Server-side rejection codes (60-65) pass through untouched; the UI
    /// owns the mapping to user-facing strings.
    pub fn code(&self) -> Option<i64> {
        match self {
            Error::RemoteRejection { code, .. } => *code,
            _ => None,
        }
    }

    /// Whether the error should render an upgrade prompt in the UI.
    pub fn requires_upgrade(&self) -> bool {
        matches!(
            self,
            Error::LimitExceeded { .. } | Error::TierRestricted { .. }
        )
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::PersistenceFailure(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidInput(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            Error::NetworkTimeout(e.to_string())
        } else {
            Error::RemoteRejection {
                message: e.to_string(),
                code: None,
            }
        }
    }
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
