use thiserror::Error;

/// Error taxonomy for the legacy API boundary.
///
/// 404 on a by-id lookup never reaches this type; it is mapped to `None` at
/// the client so "not found" is a normal value, not an exception path.
#[derive(Error, Debug)]
pub enum ApiError {
    /// 401 from the legacy API. Not retried by backoff; triggers a forced
    /// token refresh and a single re-attempt at the call-site.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// 429 from the legacy API. Retried with backoff.
    #[error("Rate limited by legacy API")]
    RateLimited,

    /// Connection/timeout failure. Retried with backoff.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Other 4xx. Surfaced immediately, never retried.
    #[error("Validation error (HTTP {status}): {body}")]
    Validation { status: u16, body: String },

    /// 5xx from the legacy API.
    #[error("Legacy server error (HTTP {status}): {body}")]
    Server { status: u16, body: String },

    /// The process-wide safety valve is set; no outbound call was made.
    #[error("Legacy API calls are disabled by the safety flag")]
    Disabled,

    /// 2xx with a body the client could not interpret.
    #[error("Invalid response from legacy API: {0}")]
    InvalidResponse(String),

    /// No credentials on record for the office.
    #[error("Credentials error for office {0}")]
    Credentials(String),
}

impl ApiError {
    /// Only rate-limit and transport failures are retried by the backoff
    /// policy; 401 and validation errors are surfaced for re-authentication
    /// or user correction.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::RateLimited | ApiError::Transport(_))
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        ApiError::Transport(e.to_string())
    }
}
