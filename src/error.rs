use thiserror::Error;

/// Errors raised by the DigitaltMuseum and Commons clients.
///
/// Application code wraps these in `anyhow::Error`; callers that need to
/// branch on the failure (retry, duplicate detection) can downcast.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Transport-level failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The remote answered with a non-success status.
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    /// HTTP 429 from the remote.
    #[error("rate limited by remote endpoint")]
    RateLimited,

    /// The response body was not what we expected.
    #[error("invalid response: {0}")]
    Decode(String),

    /// MediaWiki reported an API error.
    #[error("MediaWiki error {code}: {info}")]
    MediaWiki { code: String, info: String },

    /// Missing or rejected OAuth credentials.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// The input could not be resolved to a DigitaltMuseum identifier.
    #[error("invalid artifact reference: {0}")]
    InvalidReference(String),
}

impl ApiError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Http(e) => e.is_timeout() || e.is_connect(),
            ApiError::Status { status, .. } => (500..600).contains(status),
            ApiError::RateLimited => true,
            ApiError::MediaWiki { code, .. } => matches!(code.as_str(), "ratelimited" | "maxlag" | "readonly"),
            ApiError::Decode(_) | ApiError::NotAuthorized(_) | ApiError::InvalidReference(_) => false,
        }
    }

    /// Map a non-success status and body to an error.
    pub(crate) fn from_status(status: u16, body: String) -> Self {
        if status == 429 {
            ApiError::RateLimited
        } else {
            ApiError::Status { status, body }
        }
    }
}
