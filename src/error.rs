use thiserror::Error;

/// Why a connection link could not be turned into a descriptor.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("malformed link: {0}")]
    Malformed(String),

    #[error("unsupported scheme {0:?} (expected vless)")]
    Scheme(String),

    #[error("link has no user id")]
    MissingIdentity,

    #[error("link has no host")]
    MissingHost,

    #[error("reality link has no public key (pbk)")]
    MissingPublicKey,
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid connection link: {0}")]
    InvalidLink(#[from] LinkError),

    #[error("Already running")]
    AlreadyRunning,

    #[error("Core installation failed: {0}")]
    Install(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Start failed: {0}")]
    Spawn(std::io::Error),

    #[error("Core crashed immediately (check logs)")]
    PrematureExit,

    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl AppError {
    /// Short status string suitable for a status bar or toast.
    #[must_use]
    pub fn status_message(&self) -> String {
        match self {
            Self::InvalidLink(_) => "Config error: bad link".to_string(),
            Self::AlreadyRunning => "Already running".to_string(),
            Self::PermissionDenied(_) => "Permission denied".to_string(),
            Self::PrematureExit => "Core crashed immediately (check logs)".to_string(),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_message_is_short_for_start_failures() {
        assert_eq!(AppError::AlreadyRunning.status_message(), "Already running");
        assert_eq!(
            AppError::PermissionDenied("pkexec dismissed".into()).status_message(),
            "Permission denied"
        );
        assert_eq!(
            AppError::InvalidLink(LinkError::MissingIdentity).status_message(),
            "Config error: bad link"
        );
        assert_eq!(
            AppError::Install("core_missing".into()).status_message(),
            "Core installation failed: core_missing"
        );
    }
}
