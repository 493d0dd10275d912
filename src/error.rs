use std::time::Duration;

use thiserror::Error;

/// Configuration-related errors with structured variants.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("failed to read config file: {0}")]
    ReadFile(#[source] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),
}

/// The kind of transient network failure, used for retry classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    /// The remote call did not complete within the configured timeout.
    Timeout,
    /// The connection was dropped mid-call.
    ConnectionReset,
    /// Name resolution for the endpoint failed.
    DnsFailure,
}

impl std::fmt::Display for TransientKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransientKind::Timeout => write!(f, "timeout"),
            TransientKind::ConnectionReset => write!(f, "connection reset"),
            TransientKind::DnsFailure => write!(f, "dns failure"),
        }
    }
}

/// How the scheduler treats a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Explicit over-limit signal from the remote side; always retried
    /// while budget remains.
    Throttled,
    /// Timeout / reset / DNS failure; retried on the fixed backoff ladder.
    Transient,
    /// Everything else; propagates on first occurrence.
    Fatal,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The remote side explicitly rejected the call due to rate limiting.
    #[error("throttled by remote endpoint{}", retry_after.map(|d| format!(" (retry after {}ms)", d.as_millis())).unwrap_or_default())]
    Throttled {
        /// Server-suggested cool-down, if the remote call surfaced one.
        retry_after: Option<Duration>,
    },

    /// A transient network failure (timeout, reset, DNS).
    #[error("transient network failure ({kind}): {detail}")]
    Transient { kind: TransientKind, detail: String },

    /// No eligible connection handle at selection time.
    #[error("no healthy endpoint available")]
    EndpointUnavailable,

    /// The retry budget was exhausted; carries the final underlying error.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    ExhaustedRetries { attempts: u32, last: Box<Error> },

    /// Unclassified failure; never retried.
    #[error("fatal error: {0}")]
    Fatal(String),

    /// The scheduler shut down before this request was started.
    #[error("scheduler shut down before the request started")]
    Shutdown,
}

impl Error {
    /// Shorthand for a timeout failure.
    pub fn timeout(detail: impl Into<String>) -> Self {
        Error::Transient {
            kind: TransientKind::Timeout,
            detail: detail.into(),
        }
    }

    /// Shorthand for a connection-reset failure.
    pub fn connection_reset(detail: impl Into<String>) -> Self {
        Error::Transient {
            kind: TransientKind::ConnectionReset,
            detail: detail.into(),
        }
    }

    /// Shorthand for a throttled failure without a server-suggested delay.
    pub fn throttled() -> Self {
        Error::Throttled { retry_after: None }
    }

    /// Classify this error for the scheduler's retry decision.
    ///
    /// Throttled and transient failures are recoverable. Everything else
    /// propagates without retries, including `EndpointUnavailable`, which
    /// surfaces immediately while recovery runs in the background.
    pub fn classify(&self) -> FailureClass {
        match self {
            Error::Throttled { .. } => FailureClass::Throttled,
            Error::Transient { .. } => FailureClass::Transient,
            _ => FailureClass::Fatal,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttled_and_transient_are_retryable_classes() {
        assert_eq!(Error::throttled().classify(), FailureClass::Throttled);
        assert_eq!(Error::timeout("probe").classify(), FailureClass::Transient);
        assert_eq!(
            Error::connection_reset("peer closed").classify(),
            FailureClass::Transient
        );
    }

    #[test]
    fn everything_else_is_fatal() {
        assert_eq!(Error::EndpointUnavailable.classify(), FailureClass::Fatal);
        assert_eq!(Error::Fatal("boom".into()).classify(), FailureClass::Fatal);
        assert_eq!(Error::Shutdown.classify(), FailureClass::Fatal);
        let exhausted = Error::ExhaustedRetries {
            attempts: 3,
            last: Box::new(Error::throttled()),
        };
        assert_eq!(exhausted.classify(), FailureClass::Fatal);
    }

    #[test]
    fn display_mentions_retry_after_when_present() {
        let err = Error::Throttled {
            retry_after: Some(Duration::from_millis(1500)),
        };
        assert!(err.to_string().contains("1500ms"));
        assert!(!Error::throttled().to_string().contains("retry after"));
    }
}
