//! Error types shared by the proxy model, storage and validation engine

use crate::proxy::models::Protocol;
use std::error::Error as StdError;
use std::io;
use thiserror::Error;

/// Errors raised by the record model, the store and the storage backends
#[derive(Debug, Error)]
pub enum ProxyError {
    /// A caller handed in a value outside the accepted domain
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The caller's own public IP could not be determined
    #[error("Could not resolve own public IP: {0}")]
    BaselineResolution(#[source] ProbeError),

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure of a single round-trip through a candidate proxy
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("request timed out")]
    Timeout,

    #[error("connection refused")]
    ConnectionRefused,

    #[error("connection reset")]
    ConnectionReset,

    #[error("TLS failure: {0}")]
    TlsFailure(String),

    #[error("proxy rejected request: {0}")]
    ProxyRejected(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("protocol {0} is not supported by this prober")]
    UnsupportedProtocol(Protocol),

    #[error("{0}")]
    Other(String),
}

impl ProbeError {
    /// Whether this failure belongs to the known transient class.
    ///
    /// Only [`ProbeError::Other`] is considered unexpected.
    pub fn is_expected(&self) -> bool {
        !matches!(self, ProbeError::Other(_))
    }
}

/// Messages hyper reports when a peer answers with something other than HTTP
const HTTP_PARSE_FAILURES: [&str; 8] = [
    "invalid http version parsed",
    "invalid http status-code parsed",
    "invalid http header parsed",
    "invalid http method parsed",
    "invalid content-length parsed",
    "unexpected transfer-encoding parsed",
    "message head is too large",
    "invalid chunk",
];

impl From<reqwest::Error> for ProbeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return ProbeError::Timeout;
        }
        if err.is_decode() || err.is_body() {
            return ProbeError::MalformedResponse(err.to_string());
        }
        if let Some(status) = err.status() {
            return ProbeError::ProxyRejected(format!("HTTP status: {}", status));
        }

        let mut chain = err.to_string().to_lowercase();
        let mut source = err.source();
        while let Some(cause) = source {
            if let Some(io_err) = cause.downcast_ref::<io::Error>() {
                match io_err.kind() {
                    io::ErrorKind::ConnectionRefused => return ProbeError::ConnectionRefused,
                    io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof => return ProbeError::ConnectionReset,
                    io::ErrorKind::TimedOut => return ProbeError::Timeout,
                    _ => {}
                }
            }
            chain.push_str(": ");
            chain.push_str(&cause.to_string().to_lowercase());
            source = cause.source();
        }

        // hyper parse errors carry no io source
        if HTTP_PARSE_FAILURES.iter().any(|needle| chain.contains(needle)) {
            return ProbeError::MalformedResponse(err.to_string());
        }
        if chain.contains("connection closed before message completed") {
            return ProbeError::ConnectionReset;
        }
        if ["certificate", "tls", "ssl", "handshake"]
            .iter()
            .any(|needle| chain.contains(needle))
        {
            return ProbeError::TlsFailure(err.to_string());
        }
        if err.is_connect() {
            return ProbeError::ProxyRejected(err.to_string());
        }

        ProbeError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_other_is_unexpected() {
        assert!(ProbeError::Timeout.is_expected());
        assert!(ProbeError::ConnectionRefused.is_expected());
        assert!(ProbeError::MalformedResponse("eof".to_string()).is_expected());
        assert!(ProbeError::UnsupportedProtocol(Protocol::Socks4).is_expected());
        assert!(!ProbeError::Other("boom".to_string()).is_expected());
    }

    #[test]
    fn test_baseline_error_display() {
        let err = ProxyError::BaselineResolution(ProbeError::Timeout);
        assert_eq!(
            err.to_string(),
            "Could not resolve own public IP: request timed out"
        );
    }
}
