use thiserror::Error;

/// Convenience alias for `Result<T, SluiceError>`.
pub type SluiceResult<T> = Result<T, SluiceError>;

/// Error classification for retry/escalation decisions.
///
/// - `UserError`:   bad input, unroutable value, row limit (4xx equivalent)
/// - `Retryable`:   transaction conflict on a shard; client SHOULD retry
/// - `Transient`:   transport failure, timeout, cancellation; client MAY retry
/// - `InternalBug`: should never happen; triggers alert + diagnostic dump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Retryable,
    Transient,
    InternalBug,
}

/// Top-level error for the router execution core.
///
/// `Clone` so a single captured failure can be handed to every waiter of a
/// consolidated query unchanged.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SluiceError {
    /// A sharding value could not be mapped to a partition or shard.
    #[error("Routing error: {0}")]
    Routing(String),

    /// Opcode/primitive combination that is not implemented.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// In-memory result exceeded the configured row budget.
    #[error("Resource limit: {0}")]
    ResourceLimit(String),

    /// Failure reported by the shard transport, passed through unchanged.
    #[error("Transport error on {target}: {message}")]
    Transport { target: String, message: String },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Planner rejected the statement.
    #[error("Plan error: {0}")]
    Plan(String),

    /// Row-level evaluation failure (bad column index, type mismatch).
    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    /// Internal bug: should never occur in production.
    /// Always carries a unique `error_code` and `debug_context` for post-mortem.
    #[error("InternalBug [{error_code}]: {message} | context: {debug_context}")]
    InternalBug {
        error_code: &'static str,
        message: String,
        debug_context: String,
    },
}

impl SluiceError {
    /// Classify this error for retry/escalation decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SluiceError::Routing(_)
            | SluiceError::Unsupported(_)
            | SluiceError::ResourceLimit(_)
            | SluiceError::Plan(_)
            | SluiceError::Execution(_)
            | SluiceError::Config(_) => ErrorKind::UserError,
            SluiceError::Transaction(_) => ErrorKind::Retryable,
            SluiceError::Transport { .. }
            | SluiceError::Cancelled(_)
            | SluiceError::DeadlineExceeded(_) => ErrorKind::Transient,
            SluiceError::Internal(_) | SluiceError::InternalBug { .. } => ErrorKind::InternalBug,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retryable)
    }

    pub fn is_user_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::UserError)
    }

    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    pub fn is_internal_bug(&self) -> bool {
        matches!(self.kind(), ErrorKind::InternalBug)
    }

    /// MySQL-compatible SQLSTATE for client-facing surfaces.
    pub fn sql_state(&self) -> &'static str {
        match self {
            SluiceError::Routing(_) => "HY000",
            SluiceError::Unsupported(_) => "42000",
            SluiceError::ResourceLimit(_) => "HY001",
            SluiceError::Transport { .. } => "08S01",
            SluiceError::Cancelled(_) => "70100",
            SluiceError::DeadlineExceeded(_) => "HY000",
            SluiceError::Transaction(_) => "40001",
            SluiceError::Plan(_) => "42000",
            SluiceError::Execution(_) => "22000",
            SluiceError::Config(_) => "HY000",
            SluiceError::Internal(_) | SluiceError::InternalBug { .. } => "HY000",
        }
    }

    pub fn transport(target: impl ToString, message: impl Into<String>) -> Self {
        SluiceError::Transport {
            target: target.to_string(),
            message: message.into(),
        }
    }

    /// Construct an internal bug error with error code and context.
    pub fn internal_bug(
        error_code: &'static str,
        message: impl Into<String>,
        debug_context: impl Into<String>,
    ) -> Self {
        SluiceError::InternalBug {
            error_code,
            message: message.into(),
            debug_context: debug_context.into(),
        }
    }

    /// Add context to an error, **preserving error classification**.
    pub fn with_context(self, ctx: impl Into<String>) -> Self {
        let ctx = ctx.into();
        match self {
            SluiceError::Routing(m) => SluiceError::Routing(format!("{ctx}: {m}")),
            SluiceError::Unsupported(m) => SluiceError::Unsupported(format!("{ctx}: {m}")),
            SluiceError::ResourceLimit(m) => SluiceError::ResourceLimit(format!("{ctx}: {m}")),
            SluiceError::Transport { target, message } => SluiceError::Transport {
                target,
                message: format!("{ctx}: {message}"),
            },
            SluiceError::Cancelled(m) => SluiceError::Cancelled(format!("{ctx}: {m}")),
            SluiceError::DeadlineExceeded(m) => {
                SluiceError::DeadlineExceeded(format!("{ctx}: {m}"))
            }
            SluiceError::Transaction(m) => SluiceError::Transaction(format!("{ctx}: {m}")),
            SluiceError::Plan(m) => SluiceError::Plan(format!("{ctx}: {m}")),
            SluiceError::Execution(m) => SluiceError::Execution(format!("{ctx}: {m}")),
            SluiceError::Config(m) => SluiceError::Config(format!("{ctx}: {m}")),
            SluiceError::Internal(m) => SluiceError::Internal(format!("{ctx}: {m}")),
            SluiceError::InternalBug {
                error_code,
                message,
                debug_context,
            } => SluiceError::InternalBug {
                error_code,
                message: format!("{ctx}: {message}"),
                debug_context,
            },
        }
    }

    /// Append `RequestContext` ids so the error can be correlated with logs.
    pub fn with_request_context(self, rctx: &crate::request_context::RequestContext) -> Self {
        let tag = format!(
            "req={} sess={} qry={}",
            rctx.request_id, rctx.session_id, rctx.query_id
        );
        match self {
            SluiceError::InternalBug {
                error_code,
                message,
                debug_context,
            } => {
                let dc = if debug_context.is_empty() {
                    tag
                } else {
                    format!("{debug_context} | {tag}")
                };
                SluiceError::InternalBug {
                    error_code,
                    message,
                    debug_context: dc,
                }
            }
            other => other.with_context(tag),
        }
    }

    /// Emit a structured log entry for InternalBug errors.
    pub fn log_if_fatal(&self) {
        if let SluiceError::InternalBug {
            error_code,
            message,
            debug_context,
        } = self
        {
            tracing::error!(
                error_code = error_code,
                error_category = "Fatal",
                sql_state = self.sql_state(),
                debug_context = debug_context.as_str(),
                "FATAL [{}]: {} | context: {}",
                error_code,
                message,
                debug_context
            );
        }
    }
}

/// Bail with a routing error.
/// Usage: `bail_routing!("cannot resolve routing value for logic table {}", name)`
#[macro_export]
macro_rules! bail_routing {
    ($msg:expr) => {
        return Err($crate::error::SluiceError::Routing(format!("{}", $msg)))
    };
    ($fmt:expr, $($arg:tt)*) => {
        return Err($crate::error::SluiceError::Routing(format!($fmt, $($arg)*)))
    };
}

/// Bail with an unsupported-operation error.
#[macro_export]
macro_rules! bail_unsupported {
    ($msg:expr) => {
        return Err($crate::error::SluiceError::Unsupported(format!("{}", $msg)))
    };
    ($fmt:expr, $($arg:tt)*) => {
        return Err($crate::error::SluiceError::Unsupported(format!($fmt, $($arg)*)))
    };
}

/// Add context to a Result, preserving error classification.
/// Usage: `some_result.ctx("stage=commit, shard=-80")?`
pub trait ErrorContext<T> {
    fn ctx(self, context: &str) -> Result<T, SluiceError>;
    fn ctx_with(self, f: impl FnOnce() -> String) -> Result<T, SluiceError>;
}

impl<T, E: Into<SluiceError>> ErrorContext<T> for Result<T, E> {
    fn ctx(self, context: &str) -> Result<T, SluiceError> {
        self.map_err(|e| e.into().with_context(context))
    }
    fn ctx_with(self, f: impl FnOnce() -> String) -> Result<T, SluiceError> {
        self.map_err(|e| e.into().with_context(f()))
    }
}
