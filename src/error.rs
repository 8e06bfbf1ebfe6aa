use std::io;

use thiserror::Error;

/// Unified error type for the fetch pipeline
#[derive(Error, Debug)]
pub enum FetchError {
    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown proxy mode: {0}")]
    UnknownProxyMode(String),

    #[error("Invalid proxy address: {0}")]
    InvalidProxyAddress(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Proxy errors
    #[error(transparent)]
    Proxy(#[from] ProxyError),

    // Response outcomes
    #[error("Retryable status {status} from {url}")]
    RetryableStatus { status: u16, url: String },

    // Cancellation
    #[error("Request cancelled")]
    Cancelled,

    #[error("Request deadline exceeded")]
    DeadlineExceeded,

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for fetch operations
pub type Result<T> = std::result::Result<T, FetchError>;

/// Failure of a call routed through a specific proxy endpoint.
///
/// The endpoint identity is the redacted form (no credentials). The underlying
/// cause stays reachable through [`ProxyError::cause`] and
/// [`std::error::Error::source`].
#[derive(Error, Debug)]
#[error("proxy={proxy} err={source}")]
pub struct ProxyError {
    proxy: String,
    #[source]
    source: Box<FetchError>,
}

impl ProxyError {
    pub fn new(proxy: impl Into<String>, cause: FetchError) -> Self {
        Self {
            proxy: proxy.into(),
            source: Box::new(cause),
        }
    }

    /// Identity of the endpoint the call went through
    pub fn proxy(&self) -> &str {
        &self.proxy
    }

    /// The wrapped failure
    pub fn cause(&self) -> &FetchError {
        &self.source
    }

    pub fn into_cause(self) -> FetchError {
        *self.source
    }
}

impl FetchError {
    /// Configuration problems are raised at build time and never retried
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            FetchError::InvalidConfig(_)
                | FetchError::UnknownProxyMode(_)
                | FetchError::InvalidProxyAddress(_)
        )
    }

    /// True for cancellation or deadline expiry, looking through proxy wrappers
    pub fn is_cancellation(&self) -> bool {
        match self {
            FetchError::Cancelled | FetchError::DeadlineExceeded => true,
            FetchError::Proxy(e) => e.cause().is_cancellation(),
            _ => false,
        }
    }

    /// True for failures below HTTP: DNS, connect, TLS, resets, timeouts
    pub fn is_network(&self) -> bool {
        match self {
            FetchError::Network(e) => {
                e.is_timeout() || e.is_connect() || e.is_request() || e.is_body()
            }
            FetchError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::AddrNotAvailable
            ),
            FetchError::Proxy(e) => e.cause().is_network(),
            _ => false,
        }
    }

    /// Whether the retry stage may try the call again after this error
    pub fn is_retryable(&self) -> bool {
        if self.is_cancellation() {
            return false;
        }
        matches!(self, FetchError::Proxy(_)) || self.is_network()
    }

    pub fn as_proxy(&self) -> Option<&ProxyError> {
        match self {
            FetchError::Proxy(e) => Some(e),
            _ => None,
        }
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for FetchError {
    fn from(err: url::ParseError) -> Self {
        FetchError::InvalidRequest(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_error_classification() {
        assert!(FetchError::Cancelled.is_cancellation());
        assert!(FetchError::DeadlineExceeded.is_cancellation());
        assert!(!FetchError::Cancelled.is_retryable());
        assert!(!FetchError::DeadlineExceeded.is_retryable());

        let reset = FetchError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(reset.is_network());
        assert!(reset.is_retryable());

        let denied = FetchError::Io(io::Error::new(io::ErrorKind::PermissionDenied, "nope"));
        assert!(!denied.is_network());
        assert!(!denied.is_retryable());

        assert!(!FetchError::InvalidRequest("bad".to_string()).is_retryable());
        assert!(!FetchError::Internal("boom".to_string()).is_retryable());
    }

    #[test]
    fn test_proxy_errors_are_retryable_for_any_cause() {
        let err = FetchError::from(ProxyError::new(
            "http://10.0.0.1:3128",
            FetchError::Internal("weird".to_string()),
        ));
        assert!(err.is_retryable());
        assert_eq!(err.as_proxy().unwrap().proxy(), "http://10.0.0.1:3128");
    }

    #[test]
    fn test_proxy_error_keeps_cancellation_visible() {
        let err = FetchError::from(ProxyError::new("http://10.0.0.1:3128", FetchError::Cancelled));
        assert!(err.is_cancellation());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_proxy_error_cause_is_recoverable() {
        let proxy_err = ProxyError::new(
            "socks5://10.0.0.2:1080",
            FetchError::Io(io::Error::new(io::ErrorKind::TimedOut, "slow")),
        );
        assert!(matches!(proxy_err.cause(), FetchError::Io(_)));

        let source = proxy_err.source().unwrap();
        assert!(source.to_string().contains("slow"));
        assert_eq!(
            proxy_err.to_string(),
            "proxy=socks5://10.0.0.2:1080 err=IO error: slow"
        );

        assert!(matches!(proxy_err.into_cause(), FetchError::Io(_)));
    }

    #[test]
    fn test_config_error_helpers() {
        assert!(FetchError::UnknownProxyMode("mesh".to_string()).is_config_error());
        assert!(FetchError::InvalidProxyAddress("::".to_string()).is_config_error());
        assert!(!FetchError::Cancelled.is_config_error());
    }
}
