use thiserror::Error;

/// Errors surfaced to analytics callers.
///
/// Cache failures never show up here: the cache layer swallows them and the
/// engine recomputes. Batch jobs catch per-link errors themselves.
#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("{0}")]
    Validation(String),
    #[error("link '{0}' not found")]
    NotFound(String),
    #[error("access to link '{0}' is forbidden")]
    Forbidden(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl AnalyticsError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

pub type AnalyticsResult<T> = Result<T, AnalyticsError>;
