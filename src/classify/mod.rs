//! Error classification
//!
//! Maps raw failures plus the operation that produced them to a
//! [`ClassifiedError`]: category, severity, recoverability and an optional
//! retry hint. The session manager consults the verdict to decide between
//! automatic reconnection and giving up.
//!
//! Classification is keyword based and deliberately sensitive to the
//! operation tag: startup vocabulary only counts as a server startup
//! failure while the session is connecting. The same text seen during a
//! tool call falls through to [`ErrorCategory::Unknown`].

pub mod handler;

pub use handler::{ErrorHandler, ErrorStatistics};

use crate::error::{ServerStartupError, TransportError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Operation tag for the initial connect and handshake
pub const OP_SESSION_CONNECT: &str = "session_connect";
/// Operation tag for automatic reconnection attempts
pub const OP_SESSION_RECONNECT: &str = "session_reconnect";
/// Operation tag for periodic liveness checks
pub const OP_HEALTH_CHECK: &str = "health_check";
/// Operation tag for closing a session
pub const OP_SESSION_DISCONNECT: &str = "session_disconnect";
/// Operation tag for transport construction
pub const OP_TRANSPORT_CREATE: &str = "transport_create";
/// Operation tag for tool invocations on an established session
pub const OP_TOOL_CALL: &str = "tool_call";

/// Retry hint attached to transient connection failures
pub const CONNECTION_RETRY_AFTER: Duration = Duration::from_secs(5);
/// Retry hint attached to server-side internal failures
pub const SERVER_INTERNAL_RETRY_AFTER: Duration = Duration::from_secs(10);

/// Text that points at a server that cannot launch as configured
const STARTUP_KEYWORDS: &[&str] = &[
    "environment variable",
    "usage:",
    "npm error 404",
    "npm err! 404",
    "404 not found",
    "module not found",
    "cannot find module",
    "missing required argument",
    "missing argument",
    "required argument",
];

const CLIENT_CONFIG_KEYWORDS: &[&str] = &[
    "command not found",
    "executable file not found",
];

const CONNECTION_KEYWORDS: &[&str] = &[
    "timeout",
    "timed out",
    "deadline exceeded",
    "connection refused",
    "connection reset",
    "connection lost",
    "connection closed",
    "broken pipe",
    "unexpected eof",
    "network is unreachable",
    "no route to host",
];

const SERVER_INTERNAL_KEYWORDS: &[&str] = &[
    "internal server error",
    "internal error",
    "-32603",
];

const PROTOCOL_KEYWORDS: &[&str] = &[
    "parse error",
    "invalid json",
    "invalid request",
    "method not found",
    "-32700",
    "-32600",
    "-32601",
];

const AUTHENTICATION_KEYWORDS: &[&str] = &["unauthorized", "forbidden", "401", "403"];

/// Broad failure classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The server process could not launch as configured
    ServerStartup,
    /// The server failed while handling an established session
    ServerInternal,
    /// Transient network or stream failure
    Connection,
    /// Bad client-side invocation, e.g. a missing executable
    ClientConfig,
    /// Malformed or unexpected protocol traffic
    Protocol,
    /// Credentials rejected by the server
    Authentication,
    /// Anything the rules above do not recognise
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServerStartup => "server_startup",
            Self::ServerInternal => "server_internal",
            Self::Connection => "connection",
            Self::ClientConfig => "client_config",
            Self::Protocol => "protocol",
            Self::Authentication => "authentication",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How loudly a failure should be reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where and while doing what an error happened
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub operation: String,
    pub fields: HashMap<String, Value>,
}

impl ErrorContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            fields: HashMap::new(),
        }
    }

    /// Attach a free-form field
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// Structured verdict on a raw failure
#[derive(Debug, Clone, Serialize)]
pub struct ClassifiedError {
    pub category: ErrorCategory,
    pub severity: Severity,
    pub message: String,
    /// Rendered source chain of the original error
    pub cause: Option<String>,
    pub operation: String,
    pub context: HashMap<String, Value>,
    pub recoverable: bool,
    #[serde(with = "humantime_serde")]
    pub retry_after: Option<Duration>,
    pub timestamp: DateTime<Utc>,
}

impl ClassifiedError {
    fn new(category: ErrorCategory, severity: Severity, message: String, ctx: &ErrorContext) -> Self {
        Self {
            category,
            severity,
            message,
            cause: None,
            operation: ctx.operation.clone(),
            context: ctx.fields.clone(),
            recoverable: false,
            retry_after: None,
            timestamp: Utc::now(),
        }
    }

    fn recoverable_after(mut self, retry_after: Duration) -> Self {
        self.recoverable = true;
        self.retry_after = Some(retry_after);
        self
    }

    /// Startup suggestion carried in the context, if any
    pub fn suggestion(&self) -> Option<&str> {
        self.context.get("suggestion").and_then(Value::as_str)
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)
    }
}

impl std::error::Error for ClassifiedError {}

/// Classify `err` raised while performing `ctx.operation`
///
/// Rules, first match wins:
/// 1. a [`ServerStartupError`] anywhere in the chain is a startup failure;
/// 2. startup vocabulary during `session_connect` is a startup failure;
/// 3. "command not found" is a client configuration problem;
/// 4. timeouts, refused and lost connections are recoverable;
/// 5. server internal, protocol and authentication vocabulary;
/// 6. everything else is unknown and not recoverable.
pub fn classify(err: &(dyn std::error::Error + 'static), ctx: &ErrorContext) -> ClassifiedError {
    let message = err.to_string();
    let cause = render_chain(err);

    if let Some(startup) = find_startup_error(err) {
        let mut classified =
            ClassifiedError::new(ErrorCategory::ServerStartup, Severity::Error, message, ctx);
        classified.context.extend(startup_context(startup));
        classified.cause = cause;
        return classified;
    }

    let text = cause.as_deref().unwrap_or(&message).to_lowercase();

    let classified = if ctx.operation == OP_SESSION_CONNECT && contains_any(&text, STARTUP_KEYWORDS)
    {
        ClassifiedError::new(ErrorCategory::ServerStartup, Severity::Error, message, ctx)
    } else if contains_any(&text, CLIENT_CONFIG_KEYWORDS) {
        ClassifiedError::new(ErrorCategory::ClientConfig, Severity::Error, message, ctx)
    } else if contains_any(&text, CONNECTION_KEYWORDS) {
        ClassifiedError::new(ErrorCategory::Connection, Severity::Warning, message, ctx)
            .recoverable_after(CONNECTION_RETRY_AFTER)
    } else if contains_any(&text, STARTUP_KEYWORDS) {
        // Startup vocabulary outside of the initial connect says nothing
        // about the server process itself.
        ClassifiedError::new(ErrorCategory::Unknown, Severity::Error, message, ctx)
    } else if contains_any(&text, SERVER_INTERNAL_KEYWORDS) {
        ClassifiedError::new(ErrorCategory::ServerInternal, Severity::Error, message, ctx)
            .recoverable_after(SERVER_INTERNAL_RETRY_AFTER)
    } else if contains_any(&text, PROTOCOL_KEYWORDS) {
        ClassifiedError::new(ErrorCategory::Protocol, Severity::Error, message, ctx)
    } else if contains_any(&text, AUTHENTICATION_KEYWORDS) {
        ClassifiedError::new(ErrorCategory::Authentication, Severity::Error, message, ctx)
    } else {
        ClassifiedError::new(ErrorCategory::Unknown, Severity::Error, message, ctx)
    };

    ClassifiedError { cause, ..classified }
}

/// Locate a startup failure in the error or its source chain
fn find_startup_error<'a>(
    err: &'a (dyn std::error::Error + 'static),
) -> Option<&'a ServerStartupError> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(startup) = e.downcast_ref::<ServerStartupError>() {
            return Some(startup);
        }
        if let Some(TransportError::StartupFailed(startup)) = e.downcast_ref::<TransportError>() {
            return Some(startup);
        }
        current = e.source();
    }
    None
}

fn startup_context(err: &ServerStartupError) -> HashMap<String, Value> {
    HashMap::from([
        ("command".to_string(), Value::from(err.command.clone())),
        ("args".to_string(), Value::from(err.args.clone())),
        ("exit_code".to_string(), Value::from(err.exit_code)),
        ("output".to_string(), Value::from(err.output.clone())),
        ("suggestion".to_string(), Value::from(err.suggestion.clone())),
    ])
}

/// "outer: inner: innermost" when the error has sources
fn render_chain(err: &(dyn std::error::Error + 'static)) -> Option<String> {
    let mut parts = vec![err.to_string()];
    let mut current = err.source();
    while let Some(e) = current {
        let text = e.to_string();
        if !parts.iter().any(|p| p.contains(&text)) {
            parts.push(text);
        }
        current = e.source();
    }
    (parts.len() > 1).then(|| parts.join(": "))
}

fn contains_any(text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|k| text.contains(k))
}
