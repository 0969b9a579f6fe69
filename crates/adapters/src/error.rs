use reqwest::StatusCode;
use thiserror::Error;

use writer_core::{ConfigError, ErrorKind, GenerationError};

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("request timed out: {0}")]
    Timeout(#[source] reqwest::Error),
    #[error("could not connect to the generation service: {0}")]
    Connection(#[source] reqwest::Error),
    #[error("http status {status}: {message}")]
    HttpStatus {
        status: StatusCode,
        message: String,
        error_type: String,
    },
    #[error("unexpected response shape: {0}")]
    MalformedResponse(String),
    #[error("invalid adapter configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("request was cancelled")]
    Cancelled,
    #[error("exhausted retries after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: usize,
        #[source]
        source: Box<AdapterError>,
    },
    #[error("non-retryable error: {source}")]
    NonRetryable {
        attempts: usize,
        #[source]
        source: Box<AdapterError>,
    },
}

impl AdapterError {
    pub fn retry_exhausted(attempts: usize, source: AdapterError) -> Self {
        AdapterError::RetryExhausted {
            attempts,
            source: Box::new(source),
        }
    }

    pub fn non_retryable(attempts: usize, source: AdapterError) -> Self {
        AdapterError::NonRetryable {
            attempts,
            source: Box::new(source),
        }
    }

    /// Sorts a `reqwest` failure into the buckets the retry loop distinguishes.
    /// Send failures other than timeouts (refused, reset, DNS) count as
    /// connection failures.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AdapterError::Timeout(err)
        } else if err.is_builder() {
            AdapterError::InvalidConfig(err.to_string())
        } else if err.is_decode() || err.is_body() {
            AdapterError::MalformedResponse(err.to_string())
        } else {
            AdapterError::Connection(err)
        }
    }

    /// Transient failures the retry loop may repeat. Wrapped results are final.
    pub fn is_retryable(&self) -> bool {
        match self {
            AdapterError::RetryExhausted { .. } | AdapterError::NonRetryable { .. } => false,
            other => other.kind().is_retryable(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AdapterError::Timeout(_) => ErrorKind::Timeout,
            AdapterError::Connection(_) => ErrorKind::ConnectionFailure,
            AdapterError::HttpStatus { status, .. } => ErrorKind::Http {
                status: status.as_u16(),
            },
            AdapterError::MalformedResponse(_) => ErrorKind::MalformedResponse,
            AdapterError::InvalidConfig(_) | AdapterError::Config(_) => ErrorKind::InvalidConfig,
            AdapterError::Cancelled => ErrorKind::Cancelled,
            AdapterError::RetryExhausted { source, .. }
            | AdapterError::NonRetryable { source, .. } => source.kind(),
        }
    }

    /// Number of requests sent before giving up, when known.
    pub fn attempts(&self) -> Option<usize> {
        match self {
            AdapterError::RetryExhausted { attempts, .. }
            | AdapterError::NonRetryable { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}

impl From<AdapterError> for GenerationError {
    fn from(err: AdapterError) -> Self {
        GenerationError::new(err.kind(), err.to_string())
    }
}
