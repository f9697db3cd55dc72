use crate::providers::{ProviderError, ProviderKind};

/// Errors surfaced by the grouping engine.
///
/// Only `InputValidation` and `ProviderAuth` are ever returned from
/// `submit`; every other condition is folded into the batch result.
#[derive(thiserror::Error, Debug)]
pub enum GroupingError {
    #[error("invalid input: {0}")]
    InputValidation(String),

    #[error("{provider} is not usable: {message}")]
    ProviderAuth {
        provider: ProviderKind,
        message: String,
    },

    #[error("{provider} rate limit: {message}")]
    ProviderRateLimit {
        provider: ProviderKind,
        message: String,
    },

    #[error("{provider} timeout: {message}")]
    ProviderTimeout {
        provider: ProviderKind,
        message: String,
    },

    #[error("{provider} returned a malformed response: {reason}")]
    MalformedResponse {
        provider: ProviderKind,
        reason: String,
    },

    #[error("persistence failed: {0}")]
    Persistence(String),

    #[error("unexpected error: {0:?}")]
    Other(#[from] anyhow::Error),
}

impl GroupingError {
    pub fn input(message: impl Into<String>) -> Self {
        Self::InputValidation(message.into())
    }

    pub fn persistence(message: impl std::fmt::Display) -> Self {
        Self::Persistence(message.to_string())
    }

    /// Attach the provider to a backend failure.
    pub fn from_provider(provider: ProviderKind, err: ProviderError) -> Self {
        match err {
            ProviderError::Auth(message) => Self::ProviderAuth { provider, message },
            ProviderError::RateLimit(message) => Self::ProviderRateLimit { provider, message },
            ProviderError::Timeout(message) => Self::ProviderTimeout { provider, message },
            ProviderError::Malformed(reason) => Self::MalformedResponse { provider, reason },
            other => Self::Other(anyhow::anyhow!("{provider}: {other}")),
        }
    }

    /// Raised synchronously, before anything is persisted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InputValidation(_) | Self::ProviderAuth { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_errors_keep_their_kind() {
        let err = GroupingError::from_provider(
            ProviderKind::Claude,
            ProviderError::Auth("ANTHROPIC_API_KEY is not set".into()),
        );
        assert!(err.is_fatal());
        assert!(err.to_string().contains("claude"));

        let err = GroupingError::from_provider(
            ProviderKind::OpenAi,
            ProviderError::RateLimit("429".into()),
        );
        assert!(matches!(err, GroupingError::ProviderRateLimit { .. }));
        assert!(!err.is_fatal());
    }
}
