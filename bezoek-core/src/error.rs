//! Error taxonomy shared by the core and all provider adapters.

use reqwest::Error as ReqwestError;

#[derive(thiserror::Error, Debug)]
/// Errors surfaced by providers and the client facade.
pub enum BezoekError {
    /// Caller-supplied input violates a contract. Never retried.
    #[error("{0}")]
    Validation(String),
    /// Authentication is missing, invalid, or the single reauthentication
    /// cycle was exhausted.
    #[error("{0}")]
    Auth(String),
    /// Transport-level failure after exhausting the retry budget.
    #[error("Network request failed: {0}")]
    Network(#[from] ReqwestError),
    /// The backend rejected the request or returned malformed data.
    #[error("{0}")]
    Provider(String),
    /// The backend rate limit could not be satisfied within the retry budget.
    #[error("{0}")]
    RateLimited(String),
    /// The requested object does not exist.
    #[error("{0}")]
    NotFound(String),
}

impl BezoekError {
    /// Stable machine-readable kind string, used in diagnostic output.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            BezoekError::Validation(_) => "validation_error",
            BezoekError::Auth(_) => "auth_error",
            BezoekError::Network(_) => "network_error",
            BezoekError::Provider(_) => "provider_error",
            BezoekError::RateLimited(_) => "rate_limit",
            BezoekError::NotFound(_) => "not_found",
        }
    }

    /// Whether the error originated from the backend, including the
    /// rate-limit and not-found kinds.
    #[must_use]
    pub fn is_provider_error(&self) -> bool {
        matches!(
            self,
            BezoekError::Provider(_) | BezoekError::RateLimited(_) | BezoekError::NotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(BezoekError::Validation(String::new()).code(), "validation_error");
        assert_eq!(BezoekError::Auth(String::new()).code(), "auth_error");
        assert_eq!(BezoekError::Provider(String::new()).code(), "provider_error");
        assert_eq!(BezoekError::RateLimited(String::new()).code(), "rate_limit");
        assert_eq!(BezoekError::NotFound(String::new()).code(), "not_found");
    }

    #[test]
    fn rate_limit_counts_as_provider_error() {
        let err = BezoekError::RateLimited(String::from("Provider rate limit exceeded."));
        assert!(err.is_provider_error(), "rate limit is a provider failure");
        assert!(!BezoekError::Auth(String::new()).is_provider_error(), "auth is not");
    }

    #[test]
    fn display_uses_message() {
        let err = BezoekError::Validation(String::from("start_time and end_time are required."));
        assert_eq!(err.to_string(), "start_time and end_time are required.");
    }
}
