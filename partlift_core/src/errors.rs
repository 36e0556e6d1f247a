//! Error types returned by the transfer engine
use std::fmt;

use thiserror::Error;

/// The kind of a [TransferError]
///
/// The kind decides how the worker pool reacts to a failure:
///
/// * [Transient](TransferErrorKind::Transient) and [Io](TransferErrorKind::Io)
///   failures are retried with backoff and never surface individually
/// * [ReauthRequired](TransferErrorKind::ReauthRequired) triggers a single
///   auth refresh followed by a single retry of the failed call
/// * everything else aborts the whole transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferErrorKind {
    /// The transfer could not even be planned (e.g. zero length content)
    InvalidPlan,
    /// A failure which is expected to go away when retried
    Transient,
    /// The access token was rejected and must be refreshed
    ReauthRequired,
    /// Permission or quota class failure. Aborts the transfer immediately.
    Fatal,
    /// The remote object does not exist
    NotFound,
    /// The whole content hash did not match after a completed transfer
    Integrity,
    /// Too many whole transfers failed in a row
    ConsecutiveFailuresExceeded,
    /// A local IO failure. Treated like a transient failure.
    Io,
    /// Anything else. Not retried.
    Other,
}

impl fmt::Display for TransferErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransferErrorKind::InvalidPlan => write!(f, "invalid plan"),
            TransferErrorKind::Transient => write!(f, "transient"),
            TransferErrorKind::ReauthRequired => write!(f, "reauth required"),
            TransferErrorKind::Fatal => write!(f, "fatal"),
            TransferErrorKind::NotFound => write!(f, "not found"),
            TransferErrorKind::Integrity => write!(f, "integrity"),
            TransferErrorKind::ConsecutiveFailuresExceeded => {
                write!(f, "consecutive failures exceeded")
            }
            TransferErrorKind::Io => write!(f, "io"),
            TransferErrorKind::Other => write!(f, "other"),
        }
    }
}

/// An error returned from the transfer engine or an [ObjectClient]
///
/// [ObjectClient]: crate::object_client::ObjectClient
#[derive(Error, Debug)]
#[error("{kind}: {message}")]
pub struct TransferError {
    message: String,
    kind: TransferErrorKind,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl TransferError {
    pub fn new<T: Into<String>>(kind: TransferErrorKind, message: T) -> Self {
        Self {
            message: message.into(),
            kind,
            source: None,
        }
    }

    pub fn new_invalid_plan<T: Into<String>>(message: T) -> Self {
        Self::new(TransferErrorKind::InvalidPlan, message)
    }

    pub fn new_transient<T: Into<String>>(message: T) -> Self {
        Self::new(TransferErrorKind::Transient, message)
    }

    pub fn new_reauth_required<T: Into<String>>(message: T) -> Self {
        Self::new(TransferErrorKind::ReauthRequired, message)
    }

    pub fn new_fatal<T: Into<String>>(message: T) -> Self {
        Self::new(TransferErrorKind::Fatal, message)
    }

    pub fn new_not_found<T: Into<String>>(message: T) -> Self {
        Self::new(TransferErrorKind::NotFound, message)
    }

    pub fn new_integrity<T: Into<String>>(message: T) -> Self {
        Self::new(TransferErrorKind::Integrity, message)
    }

    pub fn new_consecutive_failures_exceeded<T: Into<String>>(message: T) -> Self {
        Self::new(TransferErrorKind::ConsecutiveFailuresExceeded, message)
    }

    pub fn new_io<T: Into<String>>(message: T) -> Self {
        Self::new(TransferErrorKind::Io, message)
    }

    pub fn new_other<T: Into<String>>(message: T) -> Self {
        Self::new(TransferErrorKind::Other, message)
    }

    pub fn kind(&self) -> TransferErrorKind {
        self.kind
    }

    /// `true` if a retry with backoff is worth a try
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            TransferErrorKind::Transient | TransferErrorKind::Io
        )
    }

    /// `true` if the access token must be refreshed before another attempt
    pub fn is_reauth_required(&self) -> bool {
        self.kind == TransferErrorKind::ReauthRequired
    }

    /// `true` if the whole transfer must be aborted
    pub fn is_abort(&self) -> bool {
        !self.is_retryable() && !self.is_reauth_required()
    }

    pub fn with_source<E: std::error::Error + Send + Sync + 'static>(mut self, err: E) -> Self {
        self.source = Some(Box::new(err));
        self
    }
}

impl From<std::io::Error> for TransferError {
    fn from(err: std::io::Error) -> Self {
        TransferError::new_io(err.to_string()).with_source(err)
    }
}

/// Maps an HTTP status code to a [TransferError]
///
/// Client implementations classify at the transport boundary so that the
/// worker loop never inspects error message texts.
pub fn http_status_to_error(status: u16, message: &str) -> TransferError {
    match status {
        401 => TransferError::new_reauth_required(format!("{status}: {message}")),
        403 => TransferError::new_fatal(format!("{status}: {message}")),
        404 => TransferError::new_not_found(format!("{status}: {message}")),
        408 | 429 => TransferError::new_transient(format!("{status}: {message}")),
        s if s >= 500 => TransferError::new_transient(format!("{status}: {message}")),
        _ => TransferError::new_other(format!("{status}: {message}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            http_status_to_error(401, "expired").kind(),
            TransferErrorKind::ReauthRequired
        );
        assert_eq!(
            http_status_to_error(403, "cap exceeded").kind(),
            TransferErrorKind::Fatal
        );
        assert_eq!(
            http_status_to_error(404, "no such file").kind(),
            TransferErrorKind::NotFound
        );
        assert_eq!(
            http_status_to_error(429, "slow down").kind(),
            TransferErrorKind::Transient
        );
        assert_eq!(
            http_status_to_error(503, "busy").kind(),
            TransferErrorKind::Transient
        );
        assert_eq!(
            http_status_to_error(400, "bad request").kind(),
            TransferErrorKind::Other
        );
    }

    #[test]
    fn retry_classes() {
        assert!(TransferError::new_transient("x").is_retryable());
        assert!(TransferError::new_io("x").is_retryable());
        assert!(!TransferError::new_fatal("x").is_retryable());
        assert!(TransferError::new_reauth_required("x").is_reauth_required());
        assert!(TransferError::new_fatal("x").is_abort());
        assert!(!TransferError::new_transient("x").is_abort());
    }
}
