use std::sync::Arc;

/// Result type used throughout the SDK, with [`Error`] as the error variant.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the SDK's network and configuration components.
///
/// Flag evaluation never returns these: evaluation failures are reported as
/// data, inside [`crate::Detail`], so that callers always receive a value.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// A configured base URI could not be parsed.
    #[error("invalid base URI configuration")]
    InvalidBaseUri(#[source] url::ParseError),

    /// A request was rejected with 401 or 403; the SDK key is likely invalid.
    /// This error is permanent and shuts the requesting component down.
    #[error("unauthorized, the SDK key is likely invalid")]
    Unauthorized,

    /// The server responded with a status the SDK will not retry.
    #[error("request failed permanently with HTTP status {0}")]
    PermanentFailure(u16),

    /// The server responded with a status the SDK retries with backoff.
    #[error("request failed with HTTP status {0}, will retry")]
    TransientFailure(u16),

    /// The initialization wait elapsed before the first dataset arrived.
    #[error("timed out waiting for initialization")]
    InitializationTimeout,

    /// The update processor shut down before signalling initialization.
    #[error("update processor closed before initialization completed")]
    InitializationClosed,

    /// A response body could not be parsed. The offending message is dropped
    /// and the component keeps running; the error is reported for visibility.
    #[error("failed to parse server payload: {0}")]
    ParseError(String),

    /// Network-level failure from the HTTP client.
    #[error(transparent)]
    // reqwest::Error is not clonable, so it is wrapped in an Arc.
    Network(Arc<reqwest::Error>),
}

impl Error {
    /// Maps a non-success HTTP status to the matching error.
    pub(crate) fn from_http_status(status: u16) -> Error {
        match status {
            401 | 403 => Error::Unauthorized,
            status if is_http_error_recoverable(status) => Error::TransientFailure(status),
            status => Error::PermanentFailure(status),
        }
    }

    /// Whether the failed operation may be retried. Network and parse
    /// failures are transient; authorization and other unlisted 4xx
    /// responses are not.
    pub(crate) fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::TransientFailure(_) | Error::Network(_) | Error::ParseError(_)
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

/// Classifies an HTTP status code as retriable or not.
///
/// Recoverable: 400, 408, 429 and all 5xx. Every other 4xx (401, 403 and 404
/// included) is permanent: the requesting component stops and logs.
pub(crate) fn is_http_error_recoverable(status: u16) -> bool {
    match status {
        400 | 408 | 429 => true,
        status if status >= 500 => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::{is_http_error_recoverable, Error};

    #[test]
    fn classifies_statuses() {
        for status in [400, 408, 429, 500, 503, 599] {
            assert!(is_http_error_recoverable(status), "{status} should be recoverable");
        }
        for status in [401, 403, 404, 405, 418, 499] {
            assert!(!is_http_error_recoverable(status), "{status} should be permanent");
        }
    }

    #[test]
    fn status_maps_to_matching_error() {
        assert!(matches!(Error::from_http_status(401), Error::Unauthorized));
        assert!(matches!(Error::from_http_status(403), Error::Unauthorized));
        assert!(matches!(Error::from_http_status(404), Error::PermanentFailure(404)));
        assert!(matches!(Error::from_http_status(429), Error::TransientFailure(429)));
        assert!(matches!(Error::from_http_status(503), Error::TransientFailure(503)));

        assert!(Error::from_http_status(503).is_recoverable());
        assert!(!Error::from_http_status(404).is_recoverable());
        assert!(Error::ParseError("bad json".into()).is_recoverable());
    }
}
