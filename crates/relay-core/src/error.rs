//! The error taxonomy shared by every crate in the workspace.
//!
//! `RelayError` is a single currency: pipelines, retry controllers and
//! middleware all fail with the same tagged union (ported from the shape of
//! `spark-core`'s `CoreError` — a stable `code` plus an attachable
//! `ErrorContext` rather than a fresh `anyhow`-style blob per call site).

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Extra, optional diagnostic context attached to an error after the fact.
///
/// Mirrors `spark-core::error`'s builder style: constructors never require
/// this up front, callers attach it with [`RelayError::with_context`] once
/// they know which command/middleware was involved.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub command_type: Option<&'static str>,
    pub middleware_name: Option<Arc<str>>,
    pub timestamp: SystemTime,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            command_type: None,
            middleware_name: None,
            timestamp: SystemTime::now(),
        }
    }

    pub fn with_command_type(mut self, command_type: &'static str) -> Self {
        self.command_type = Some(command_type);
        self
    }

    pub fn with_middleware_name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.middleware_name = Some(name.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// The tagged error variants from the design's error model (§4.8).
#[derive(Debug, Clone, thiserror::Error)]
pub enum RelayErrorKind {
    #[error("middleware depth {len} exceeds max_depth {max}")]
    MaxDepthExceeded { len: usize, max: usize },

    #[error("invalid command type")]
    InvalidCommandType,

    #[error("invalid result type")]
    InvalidResultType,

    #[error("no handler registered for command type `{0}`")]
    HandlerNotFound(Arc<str>),

    #[error("pipeline not configured: {0}")]
    PipelineNotConfigured(Arc<str>),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("retry exhausted after {0} attempts")]
    RetryExhausted(usize),

    #[error("operation cancelled: {0}")]
    Cancelled(Arc<str>),

    #[error("middleware `{name}` invoked next() twice")]
    NextCalledTwice { name: Arc<str> },

    #[error("middleware `{name}` failed: {message}")]
    MiddlewareError {
        name: Arc<str>,
        message: Arc<str>,
        /// Whether this particular failure should be considered for retry.
        /// The retry policy's `should_retry` still has the final say (§7).
        retriable: bool,
    },

    #[error("execution failed: {message}")]
    ExecutionFailed { message: Arc<str> },

    #[error("validation failed: {reason}")]
    Validation {
        field: Option<Arc<str>>,
        reason: Arc<str>,
    },

    #[error("authorization denied: {0}")]
    Authorization(Arc<str>),

    #[error("rate limit exceeded (limit={limit})")]
    RateLimitExceeded {
        limit: u64,
        reset_time: Option<SystemTime>,
        retry_after: Option<Duration>,
    },

    /// Admission was refused by a back-pressure [`crate::semaphore::Semaphore`]
    /// under the `Reject` / `DropNewest` / `DropOldest` strategies (§4.2).
    #[error("admission rejected")]
    Rejected,
}

impl RelayErrorKind {
    /// Classification used by the retry controller (§7).
    ///
    /// `Cancelled`, `Validation`, `Authorization` and a caller-imposed
    /// `Timeout` are definitively non-retriable; everything else defers to
    /// the policy's `should_retry` predicate.
    pub fn is_definitively_non_retriable(&self) -> bool {
        matches!(
            self,
            RelayErrorKind::Cancelled(_)
                | RelayErrorKind::Validation { .. }
                | RelayErrorKind::Authorization(_)
                | RelayErrorKind::Timeout(_)
        )
    }

    /// Fatal-at-configuration errors are surfaced immediately and never
    /// retried, regardless of what a policy says.
    pub fn is_fatal_at_configuration(&self) -> bool {
        matches!(
            self,
            RelayErrorKind::MaxDepthExceeded { .. }
                | RelayErrorKind::PipelineNotConfigured(_)
                | RelayErrorKind::InvalidCommandType
                | RelayErrorKind::InvalidResultType
        )
    }
}

/// The workspace-wide error type: a [`RelayErrorKind`] plus an optional,
/// lazily-attached [`ErrorContext`].
#[derive(Debug, Clone)]
pub struct RelayError {
    kind: RelayErrorKind,
    context: Option<Arc<ErrorContext>>,
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

impl RelayError {
    pub fn new(kind: RelayErrorKind) -> Self {
        Self {
            kind,
            context: None,
        }
    }

    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = Some(Arc::new(context));
        self
    }

    pub fn kind(&self) -> &RelayErrorKind {
        &self.kind
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        self.context.as_deref()
    }

    pub fn cancelled(reason: impl Into<Arc<str>>) -> Self {
        Self::new(RelayErrorKind::Cancelled(reason.into()))
    }

    pub fn next_called_twice(middleware_name: impl Into<Arc<str>>) -> Self {
        Self::new(RelayErrorKind::NextCalledTwice {
            name: middleware_name.into(),
        })
    }

    pub fn execution_failed(message: impl Into<Arc<str>>) -> Self {
        Self::new(RelayErrorKind::ExecutionFailed {
            message: message.into(),
        })
    }

    pub fn rejected() -> Self {
        Self::new(RelayErrorKind::Rejected)
    }

    pub fn timeout(duration: Duration) -> Self {
        Self::new(RelayErrorKind::Timeout(duration))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, RelayErrorKind::Cancelled(_))
    }
}

impl From<RelayErrorKind> for RelayError {
    fn from(kind: RelayErrorKind) -> Self {
        Self::new(kind)
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
