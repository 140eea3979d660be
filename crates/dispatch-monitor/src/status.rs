//! Outcome taxonomy for asynchronous debugger-service operations.

use std::{error::Error, fmt, sync::Arc};

/// Outcome of one asynchronous operation.
///
/// Statuses are values that flow through completion tokens; they are not
/// Rust error returns. `Cancelled` is deliberately distinct from `Error`:
/// a cancelled operation stopped because someone asked it to, and nothing
/// downstream should treat that as unexpected.
#[derive(Debug, Clone, Default)]
pub enum Status {
    /// The operation finished successfully.
    #[default]
    Ok,
    /// The operation observed a cancellation request and stopped early.
    Cancelled,
    /// The operation failed.
    Error(ErrorStatus),
}

impl Status {
    #[must_use]
    pub fn error<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        Self::Error(ErrorStatus::new(kind, message))
    }

    /// Shorthand for the most common caller-supplied failure.
    #[must_use]
    pub fn request_failed<S: Into<String>>(message: S) -> Self {
        Self::error(ErrorKind::RequestFailed, message)
    }

    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

impl PartialEq for Status {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Ok, Self::Ok) | (Self::Cancelled, Self::Cancelled) => true,
            (Self::Error(a), Self::Error(b)) => a == b,
            _ => false,
        }
    }
}

/// Classification of a failure status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The callee reported a failure executing the request.
    RequestFailed,
    /// The callee does not implement the requested operation.
    NotSupported,
    /// The target is not in a state where the request can be honored.
    InvalidState,
    /// A fault inside the dispatch core itself.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::RequestFailed => "request failed",
            Self::NotSupported => "not supported",
            Self::InvalidState => "invalid state",
            Self::Internal => "internal fault",
        })
    }
}

/// A failure outcome: kind, human-readable message, optional underlying
/// cause, and (for combinator-merged statuses) the individual child
/// statuses that produced it.
#[derive(Debug, Clone)]
pub struct ErrorStatus {
    kind: ErrorKind,
    message: String,
    cause: Option<Arc<dyn Error + Send + Sync + 'static>>,
    children: Vec<Status>,
}

impl ErrorStatus {
    #[must_use]
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
            children: Vec::new(),
        }
    }

    /// Attach the underlying error that produced this status.
    #[must_use]
    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// Composite status merging several child outcomes. Every child status
    /// is preserved verbatim for diagnostics.
    #[must_use]
    pub fn merged<S: Into<String>>(message: S, children: Vec<Status>) -> Self {
        Self {
            kind: ErrorKind::RequestFailed,
            message: message.into(),
            cause: None,
            children,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn cause(&self) -> Option<&(dyn Error + 'static)> {
        self.cause.as_ref().map(|cause| {
            let cause: &(dyn Error + 'static) = &**cause;
            cause
        })
    }

    /// Child statuses of a merged composite; empty for plain failures.
    #[must_use]
    pub fn children(&self) -> &[Status] {
        &self.children
    }
}

// The cause is a trait object with no useful equality; two statuses with the
// same kind, message, and children compare equal.
impl PartialEq for ErrorStatus {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.message == other.message
            && self.children == other.children
    }
}

impl fmt::Display for ErrorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if !self.children.is_empty() {
            write!(f, " ({} nested statuses)", self.children.len())?;
        }
        Ok(())
    }
}

impl Error for ErrorStatus {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause()
    }
}
