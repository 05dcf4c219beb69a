use std::sync::Arc;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while configuring the client or synchronizing toggle definitions.
///
/// Flag evaluation never returns an error: evaluation problems degrade to "not matching" and are
/// reported as [`Diagnostic`](crate::Diagnostic)s instead.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Required configuration is missing or invalid. Only returned at construction time.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Invalid server url configuration.
    #[error("invalid url configuration")]
    InvalidUrl(#[source] url::ParseError),

    /// The server rejected our credentials.
    #[error("unauthorized, check the Authorization header")]
    Unauthorized,

    /// The server responded with a status we don't know how to handle.
    #[error("unexpected response status {0} while fetching toggles")]
    UnexpectedStatus(u16),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// Toggle payload could not be parsed.
    #[error("failed to parse toggle definitions")]
    Parse(#[source] Arc<serde_json::Error>),

    /// An I/O error (backup file, bootstrap file).
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Indicates that the poller thread panicked. This should normally never happen.
    #[error("poller thread panicked")]
    PollerThreadPanicked,

    /// The repository has been stopped and cannot be started again.
    #[error("repository is stopped")]
    Stopped,
}

impl Error {
    /// Returns `true` if retrying the same request later cannot succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Configuration(_) | Error::InvalidUrl(_) | Error::Stopped
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Parse(Arc::new(value))
    }
}

impl From<url::ParseError> for Error {
    fn from(value: url::ParseError) -> Self {
        Error::InvalidUrl(value)
    }
}
