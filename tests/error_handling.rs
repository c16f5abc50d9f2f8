//! Integration tests for error classification and reporting
//!
//! Run with: cargo test --test error_handling

use mcp_session::classify::handler::{create_user_friendly_error, format_error_for_json};
use mcp_session::classify::{
    OP_HEALTH_CHECK, OP_SESSION_CONNECT, OP_TOOL_CALL, OP_TRANSPORT_CREATE,
};
use mcp_session::{
    ErrorCategory, ErrorHandler, ServerStartupError, SessionError, Severity, TransportError,
};
use pretty_assertions::assert_eq;
use serde_json::Value;
use std::collections::HashMap;
use std::io;

fn startup_failure() -> SessionError {
    SessionError::Transport(TransportError::StartupFailed(ServerStartupError {
        command: "npx".to_string(),
        args: vec!["-y".to_string(), "@example/brave-search".to_string()],
        output: "Error: BRAVE_API_KEY environment variable is required".to_string(),
        exit_code: 1,
        suggestion: "Set the BRAVE_API_KEY environment variable before starting the server"
            .to_string(),
    }))
}

fn io_error(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Other, message.to_string())
}

#[test]
fn test_startup_failure_never_retried() {
    let handler = ErrorHandler::with_max_retries(5);
    let err = startup_failure();

    for attempt in 0..5 {
        let (classified, retry) =
            handler.handle_error_with_retry(Some(&err), OP_TOOL_CALL, HashMap::new(), attempt);
        let classified = classified.unwrap();
        assert_eq!(classified.category, ErrorCategory::ServerStartup);
        assert!(!classified.recoverable);
        assert!(classified.retry_after.is_none());
        assert!(!retry);
    }
}

#[test]
fn test_recoverable_retry_bounded_by_max() {
    let handler = ErrorHandler::with_max_retries(2);
    let err = io_error("connection reset by peer");

    let decisions: Vec<bool> = (0..4)
        .map(|attempt| {
            handler
                .handle_error_with_retry(Some(&err), OP_HEALTH_CHECK, HashMap::new(), attempt)
                .1
        })
        .collect();
    assert_eq!(decisions, vec![true, true, false, false]);
}

#[test]
fn test_absent_error() {
    let handler = ErrorHandler::new();
    let (classified, retry) =
        handler.handle_error_with_retry(None, OP_SESSION_CONNECT, HashMap::new(), 0);
    assert!(classified.is_none());
    assert!(!retry);
    assert_eq!(handler.statistics().total_errors, 0);
}

#[test]
fn test_reset_clears_everything() {
    let handler = ErrorHandler::new();
    let err = io_error("timed out waiting for response");
    handler.handle_error(Some(&err), OP_HEALTH_CHECK, HashMap::new());
    assert_eq!(handler.statistics().total_errors, 1);

    handler.reset_statistics();
    let stats = handler.statistics();
    assert_eq!(stats.total_errors, 0);
    assert_eq!(stats.recoverable_errors, 0);
    assert!(stats.by_category.is_empty());
    assert!(stats.by_severity.is_empty());
    assert!(stats.last_error.is_none());

    let report = handler.error_report();
    assert_eq!(report["summary"]["total_errors"], Value::from(0));
    assert_eq!(report["last_error"], Value::Null);
}

#[test]
fn test_report_counts() {
    let handler = ErrorHandler::new();
    let refused = io_error("connection refused");
    handler.handle_error(Some(&refused), OP_HEALTH_CHECK, HashMap::new());
    handler.handle_error(Some(&startup_failure()), OP_SESSION_CONNECT, HashMap::new());

    let report = handler.error_report();
    assert_eq!(report["summary"]["total_errors"], Value::from(2));
    assert_eq!(report["summary"]["recoverable_errors"], Value::from(1));
    assert_eq!(report["summary"]["non_recoverable_errors"], Value::from(1));
    assert_eq!(report["summary"]["recovery_rate"], Value::from(0.5));
    assert_eq!(report["by_category"]["connection"], Value::from(1));
    assert_eq!(report["by_category"]["server_startup"], Value::from(1));
    assert_eq!(report["by_severity"]["warning"], Value::from(1));
    assert_eq!(report["last_error"]["category"], Value::from("server_startup"));
}

#[test]
fn test_user_friendly_startup_text() {
    let handler = ErrorHandler::new();
    let classified = handler.handle(&startup_failure(), OP_SESSION_CONNECT, HashMap::new());

    let text = create_user_friendly_error(Some(&classified)).unwrap();
    assert!(text.starts_with("MCP server failed to start: npx -y @example/brave-search"));
    assert!(text.contains(
        "\n\nSuggested actions:\n  - Set the BRAVE_API_KEY environment variable before starting the server"
    ));
    assert!(!text.contains("Retry recommended"));
}

#[test]
fn test_user_friendly_connection_text() {
    let handler = ErrorHandler::new();
    let err = io_error("connection refused");
    let classified = handler.handle(&err, OP_HEALTH_CHECK, HashMap::new());
    assert_eq!(classified.severity, Severity::Warning);

    let text = create_user_friendly_error(Some(&classified)).unwrap();
    assert!(text.ends_with("  - Retry recommended in 5s"));
}

#[test]
fn test_json_shape() {
    let handler = ErrorHandler::new();
    let mut fields = HashMap::new();
    fields.insert("server".to_string(), Value::from("brave"));
    let classified = handler.handle(&startup_failure(), OP_SESSION_CONNECT, fields);

    let json = format_error_for_json(Some(&classified)).unwrap();
    let mut keys: Vec<&str> = json.as_object().unwrap().keys().map(String::as_str).collect();
    keys.sort_unstable();
    assert_eq!(
        keys,
        vec![
            "category",
            "cause",
            "context",
            "message",
            "recoverable",
            "recovery_actions",
            "severity"
        ]
    );
    assert_eq!(json["category"], Value::from("server_startup"));
    assert_eq!(json["severity"], Value::from("error"));
    assert_eq!(json["recoverable"], Value::from(false));
    assert_eq!(json["context"]["server"], Value::from("brave"));
    assert_eq!(json["context"]["exit_code"], Value::from(1));
    assert!(json["recovery_actions"].as_array().unwrap().len() >= 2);
}

#[test]
fn test_factory_errors_under_transport_create() {
    let handler = ErrorHandler::new();

    let missing = TransportError::CommandNotFound {
        command: "mcp-server-git".to_string(),
    };
    let classified = handler.handle(&missing, OP_TRANSPORT_CREATE, HashMap::new());
    assert_eq!(classified.category, ErrorCategory::ClientConfig);
    assert_eq!(classified.operation, OP_TRANSPORT_CREATE);
    assert!(!classified.recoverable);

    let startup = startup_failure();
    let classified = handler.handle(&startup, OP_TRANSPORT_CREATE, HashMap::new());
    assert_eq!(classified.category, ErrorCategory::ServerStartup);
    assert_eq!(
        classified.suggestion(),
        Some("Set the BRAVE_API_KEY environment variable before starting the server")
    );
    assert_eq!(handler.statistics().total_errors, 2);
}
