//! Error Types
//!
//! Centralized error handling using thiserror for type-safe errors.

use crate::classify::ClassifiedError;
use crate::context::ContextError;
use crate::session::SessionState;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Startup failure detected by the subprocess pre-flight probe
///
/// Always classified as non-recoverable: the server needs user
/// intervention (missing variable, bad arguments, absent package) before
/// another launch can succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStartupError {
    pub command: String,
    pub args: Vec<String>,
    /// Combined stdout and stderr captured during the probe
    pub output: String,
    /// Process exit code, -1 when the process was killed or did not exit
    pub exit_code: i32,
    pub suggestion: String,
}

impl fmt::Display for ServerStartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let invocation = if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        };
        write!(
            f,
            "MCP server failed to start: {} (exit code {})",
            invocation, self.exit_code
        )?;

        let output = self.output.trim();
        if !output.is_empty() {
            write!(f, "\nServer output:\n{}", output)?;
        }
        write!(f, "\nSuggestion: {}", self.suggestion)
    }
}

impl std::error::Error for ServerStartupError {}

/// Transport construction and connection errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Invalid transport configuration: {0}")]
    InvalidConfig(String),

    #[error("Unsupported transport type: {0}")]
    UnsupportedType(String),

    #[error("Unsafe command rejected: {location} contains {description} ('{pattern}')")]
    UnsafeCommand {
        location: String,
        description: String,
        pattern: String,
    },

    #[error("{0}")]
    StartupFailed(#[source] ServerStartupError),

    #[error("command not found: {command}")]
    CommandNotFound { command: String },

    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("MCP handshake failed: {0}")]
    Handshake(String),

    #[error(
        "MCP server '{command}' closed the connection before the handshake completed; \
         it probably crashed during startup (run it manually to see its output): {detail}"
    )]
    PrematureExit { command: String, detail: String },

    #[error("Connection attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection attempt aborted: {0}")]
    Context(#[from] ContextError),

    #[error("Failed to close MCP connection: {0}")]
    Close(String),
}

/// Session lifecycle errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session is already {state}; disconnect before connecting again")]
    AlreadyActive { state: SessionState },

    #[error("Failed to connect to MCP server: {message}")]
    ConnectFailed {
        message: String,
        #[source]
        classified: Box<ClassifiedError>,
    },

    #[error("Connection attempt was cancelled by a concurrent disconnect")]
    Cancelled,

    #[error("{0}")]
    Transport(#[from] TransportError),

    #[error("Failed to close MCP session: {0}")]
    Close(#[source] TransportError),

    #[error("Health check failed: {0}")]
    HealthCheck(String),
}

impl SessionError {
    /// The classification attached to a failed connect, if any
    pub fn classified(&self) -> Option<&ClassifiedError> {
        match self {
            Self::ConnectFailed { classified, .. } => Some(classified),
            _ => None,
        }
    }
}

/// Result type alias for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Result type alias for session operations
pub type SessionResult<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    fn startup_error() -> ServerStartupError {
        ServerStartupError {
            command: "npx".to_string(),
            args: vec!["-y".to_string(), "@example/server".to_string()],
            output: "Error: BRAVE_API_KEY environment variable is required\n".to_string(),
            exit_code: 1,
            suggestion: "Set the BRAVE_API_KEY environment variable before starting the server"
                .to_string(),
        }
    }

    #[test]
    fn test_startup_error_display() {
        let text = startup_error().to_string();
        assert!(text.starts_with("MCP server failed to start: npx -y @example/server (exit code 1)"));
        assert!(text.contains("BRAVE_API_KEY environment variable is required"));
        assert!(text.ends_with(
            "Suggestion: Set the BRAVE_API_KEY environment variable before starting the server"
        ));
    }

    #[test]
    fn test_startup_error_is_source() {
        let err = TransportError::StartupFailed(startup_error());
        let source = err.source().unwrap();
        assert!(source.downcast_ref::<ServerStartupError>().is_some());
    }

    #[test]
    fn test_error_display() {
        let err = TransportError::UnsafeCommand {
            location: "command".to_string(),
            description: "a command separator".to_string(),
            pattern: ";".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Unsafe command rejected: command contains a command separator (';')"
        );

        let err = SessionError::AlreadyActive {
            state: SessionState::Connected,
        };
        assert_eq!(
            err.to_string(),
            "Session is already Connected; disconnect before connecting again"
        );
    }

    #[test]
    fn test_error_conversion() {
        let err: SessionError = TransportError::Handshake("boom".to_string()).into();
        assert!(matches!(err, SessionError::Transport(_)));
        assert!(err.classified().is_none());
    }
}
