//! Error model for the `qmp_block` crate.

use std::time::Duration;

use thiserror::Error;

/// Convenience result type.
pub type Result<T> = std::result::Result<T, Error>;

/// High-level error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An I/O level failure (socket, EOF, etc.).
    Io,
    /// JSON encoding/decoding failure.
    Json,
    /// QMP protocol violation or unexpected message.
    Protocol,
    /// The server refused a command synchronously.
    CommandRejected,
    /// The connection was closed.
    Disconnected,
    /// A single command call timed out waiting for its acknowledgment.
    Timeout,
    /// The call was cancelled.
    Cancelled,
    /// The event stream receiver fell behind and dropped messages.
    EventLagged,
    /// A precondition failed before anything was sent.
    Validation,
    /// The block job reported an error or was cancelled.
    JobFailed,
    /// The event feed ended before the job reported an outcome.
    StreamEnded,
    /// No job outcome arrived before the deadline.
    JobTimeout,
}

/// Structured error type.
///
/// `Display` never includes command arguments; file paths passed to block
/// operations stay out of error messages.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Socket / file I/O error.
    #[error("I/O error: {source}")]
    Io {
        /// Lower-level error.
        #[from]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error.
    #[error("JSON error: {source}")]
    Json {
        /// Lower-level error.
        #[from]
        source: serde_json::Error,
    },

    /// The QMP peer sent an unexpected or invalid message.
    #[error("QMP protocol error: {message}")]
    Protocol {
        /// Human readable message.
        message: String,
    },

    /// QMP returned an error object for an `execute` request.
    #[error("QMP command {command} rejected: {class}: {desc}")]
    CommandRejected {
        /// Command name.
        command: String,
        /// QMP error class.
        class: String,
        /// QMP error description.
        desc: String,
    },

    /// The connection closed while a request was in-flight.
    #[error("QMP connection closed")]
    Disconnected,

    /// A command call exceeded the configured timeout.
    #[error("QMP command timed out after {timeout:?}")]
    Timeout {
        /// Timeout value.
        timeout: Duration,
    },

    /// A command call was cancelled.
    #[error("QMP command cancelled")]
    Cancelled,

    /// The event receiver lagged behind and dropped events.
    #[error("event stream lagged behind and dropped {missed} events")]
    EventLagged {
        /// How many events were dropped.
        missed: usize,
    },

    /// A block operation was refused locally; nothing was sent.
    #[error("invalid {operation} request: {reason}")]
    Validation {
        /// Operation name (`commit`, `mirror`, ...).
        operation: &'static str,
        /// Which precondition failed.
        reason: String,
    },

    /// A matching job error or cancellation event arrived.
    #[error("block job on {device} failed: {reason}")]
    JobFailed {
        /// Identifier the job was correlated by.
        device: String,
        /// Reason taken from the event payload.
        reason: String,
    },

    /// The event feed closed before the job reported an outcome.
    ///
    /// The job may still be running.
    #[error("block job on {device}: outcome unknown, event stream ended")]
    JobStreamEnded {
        /// Identifier the job was correlated by.
        device: String,
    },

    /// No matching job event arrived before the deadline.
    ///
    /// The job may still be running.
    #[error("block job on {device} did not finish within {timeout:?}")]
    JobTimeout {
        /// Identifier the job was correlated by.
        device: String,
        /// Timeout value.
        timeout: Duration,
    },
}

impl Error {
    /// Returns a coarse error classification.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } => ErrorKind::Io,
            Self::Json { .. } => ErrorKind::Json,
            Self::Protocol { .. } => ErrorKind::Protocol,
            Self::CommandRejected { .. } => ErrorKind::CommandRejected,
            Self::Disconnected => ErrorKind::Disconnected,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::EventLagged { .. } => ErrorKind::EventLagged,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::JobFailed { .. } => ErrorKind::JobFailed,
            Self::JobStreamEnded { .. } => ErrorKind::StreamEnded,
            Self::JobTimeout { .. } => ErrorKind::JobTimeout,
        }
    }

    /// Whether the remote job may still be running after this error.
    ///
    /// Callers should reconcile (e.g. with [`crate::block::block_jobs`]) when
    /// this returns `true`. A rejected or failed job needs no status poll.
    #[must_use]
    pub fn is_job_state_unknown(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::JobTimeout
                | ErrorKind::StreamEnded
                | ErrorKind::Timeout
                | ErrorKind::Disconnected
                | ErrorKind::Cancelled
        )
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub(crate) fn rejected(
        command: impl Into<String>,
        class: impl Into<String>,
        desc: impl Into<String>,
    ) -> Self {
        Self::CommandRejected {
            command: command.into(),
            class: class.into(),
            desc: desc.into(),
        }
    }

    pub(crate) fn validation(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            operation,
            reason: reason.into(),
        }
    }

    /// Create a safe, owned copy of this error suitable for broadcasting across tasks.
    ///
    /// `Error` is not `Clone`: the reader loop needs to notify every pending
    /// caller, so I/O and JSON sources collapse into `Disconnected`.
    pub(crate) fn clone_for_task(&self) -> Self {
        match self {
            Self::Io { .. } | Self::Json { .. } | Self::Disconnected => Self::Disconnected,
            Self::Protocol { message } => Self::Protocol {
                message: message.clone(),
            },
            Self::CommandRejected {
                command,
                class,
                desc,
            } => Self::CommandRejected {
                command: command.clone(),
                class: class.clone(),
                desc: desc.clone(),
            },
            Self::Timeout { timeout } => Self::Timeout { timeout: *timeout },
            Self::Cancelled => Self::Cancelled,
            Self::EventLagged { missed } => Self::EventLagged { missed: *missed },
            Self::Validation { operation, reason } => Self::Validation {
                operation: *operation,
                reason: reason.clone(),
            },
            Self::JobFailed { device, reason } => Self::JobFailed {
                device: device.clone(),
                reason: reason.clone(),
            },
            Self::JobStreamEnded { device } => Self::JobStreamEnded {
                device: device.clone(),
            },
            Self::JobTimeout { device, timeout } => Self::JobTimeout {
                device: device.clone(),
                timeout: *timeout,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_outcome_kinds_are_distinct() {
        let failed = Error::JobFailed {
            device: "drive0".into(),
            reason: "Input/output error".into(),
        };
        let ended = Error::JobStreamEnded {
            device: "drive0".into(),
        };
        let timed_out = Error::JobTimeout {
            device: "drive0".into(),
            timeout: Duration::from_secs(1),
        };

        assert_eq!(failed.kind(), ErrorKind::JobFailed);
        assert_eq!(ended.kind(), ErrorKind::StreamEnded);
        assert_eq!(timed_out.kind(), ErrorKind::JobTimeout);
        assert_ne!(ended.kind(), ErrorKind::Disconnected);

        assert!(!failed.is_job_state_unknown());
        assert!(ended.is_job_state_unknown());
        assert!(timed_out.is_job_state_unknown());
    }

    #[test]
    fn rejected_command_keeps_class_and_desc() {
        let err = Error::rejected("block-commit", "GenericError", "job already active");
        assert_eq!(err.kind(), ErrorKind::CommandRejected);
        assert!(!err.is_job_state_unknown());
        assert_eq!(
            err.to_string(),
            "QMP command block-commit rejected: GenericError: job already active"
        );
    }

    #[test]
    fn io_errors_collapse_to_disconnected_when_cloned() {
        let err = Error::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert_eq!(err.clone_for_task().kind(), ErrorKind::Disconnected);

        let err = Error::validation("mirror", "destination must be absolute");
        assert_eq!(err.clone_for_task().kind(), ErrorKind::Validation);
    }
}
