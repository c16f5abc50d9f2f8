//! Error handler
//!
//! Stateful wrapper around [`classify`]: keeps running statistics, decides
//! retry eligibility and renders errors for people and for machines.
//! One instance is owned by each session manager and shared with its
//! background tasks; statistics are guarded by a mutex so concurrent
//! classifications never lose counts.

use super::{classify, ClassifiedError, ErrorCategory, ErrorContext, Severity};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;

/// Default number of attempts `handle_error_with_retry` allows
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Running error counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorStatistics {
    pub total_errors: u64,
    pub by_category: HashMap<ErrorCategory, u64>,
    pub by_severity: HashMap<Severity, u64>,
    pub recoverable_errors: u64,
    pub last_error: Option<ClassifiedError>,
}

impl ErrorStatistics {
    fn record(&mut self, error: &ClassifiedError) {
        self.total_errors += 1;
        *self.by_category.entry(error.category).or_insert(0) += 1;
        *self.by_severity.entry(error.severity).or_insert(0) += 1;
        if error.recoverable {
            self.recoverable_errors += 1;
        }
        self.last_error = Some(error.clone());
    }
}

/// Classifies errors and keeps statistics about them
#[derive(Debug)]
pub struct ErrorHandler {
    stats: Mutex<ErrorStatistics>,
    max_retries: u32,
}

impl ErrorHandler {
    pub fn new() -> Self {
        Self::with_max_retries(DEFAULT_MAX_RETRIES)
    }

    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            stats: Mutex::new(ErrorStatistics::default()),
            max_retries,
        }
    }

    /// Classify and record an error; `None` in means `None` out
    pub fn handle_error(
        &self,
        err: Option<&(dyn std::error::Error + 'static)>,
        operation: &str,
        fields: HashMap<String, Value>,
    ) -> Option<ClassifiedError> {
        err.map(|err| self.handle(err, operation, fields))
    }

    /// Classify and record an error that is known to be present
    pub fn handle(
        &self,
        err: &(dyn std::error::Error + 'static),
        operation: &str,
        fields: HashMap<String, Value>,
    ) -> ClassifiedError {
        let ctx = ErrorContext {
            operation: operation.to_string(),
            fields,
        };
        let classified = classify(err, &ctx);

        tracing::debug!(
            operation,
            category = %classified.category,
            severity = %classified.severity,
            recoverable = classified.recoverable,
            "Classified error: {}",
            classified.message
        );

        self.record(&classified);
        classified
    }

    /// Like [`handle_error`](Self::handle_error), also deciding whether to retry
    ///
    /// Non-recoverable errors are never retried, whatever the attempt number.
    pub fn handle_error_with_retry(
        &self,
        err: Option<&(dyn std::error::Error + 'static)>,
        operation: &str,
        fields: HashMap<String, Value>,
        attempt: u32,
    ) -> (Option<ClassifiedError>, bool) {
        let classified = self.handle_error(err, operation, fields);
        let should_retry = classified
            .as_ref()
            .is_some_and(|c| c.recoverable && attempt < self.max_retries);
        (classified, should_retry)
    }

    /// Record an error that was classified elsewhere
    pub fn record(&self, error: &ClassifiedError) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.record(error);
        }
    }

    /// Snapshot of the current counters
    pub fn statistics(&self) -> ErrorStatistics {
        self.stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_default()
    }

    pub fn reset_statistics(&self) {
        if let Ok(mut stats) = self.stats.lock() {
            *stats = ErrorStatistics::default();
        }
    }

    /// Nested summary / per-category / last-error report
    pub fn error_report(&self) -> Value {
        let stats = self.statistics();
        let non_recoverable = stats.total_errors - stats.recoverable_errors;
        let recovery_rate = if stats.total_errors == 0 {
            0.0
        } else {
            stats.recoverable_errors as f64 / stats.total_errors as f64
        };

        let by_category: serde_json::Map<String, Value> = stats
            .by_category
            .iter()
            .map(|(category, count)| (category.to_string(), Value::from(*count)))
            .collect();
        let by_severity: serde_json::Map<String, Value> = stats
            .by_severity
            .iter()
            .map(|(severity, count)| (severity.to_string(), Value::from(*count)))
            .collect();

        let last_error = stats.last_error.as_ref().map(|e| {
            json!({
                "category": e.category.as_str(),
                "severity": e.severity.as_str(),
                "message": e.message,
                "operation": e.operation,
                "recoverable": e.recoverable,
                "timestamp": e.timestamp.to_rfc3339(),
            })
        });

        json!({
            "summary": {
                "total_errors": stats.total_errors,
                "recoverable_errors": stats.recoverable_errors,
                "non_recoverable_errors": non_recoverable,
                "recovery_rate": recovery_rate,
            },
            "by_category": by_category,
            "by_severity": by_severity,
            "last_error": last_error,
        })
    }
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Category specific remediation steps
pub fn recovery_actions(error: &ClassifiedError) -> Vec<String> {
    let mut actions: Vec<String> = Vec::new();

    match error.category {
        ErrorCategory::ServerStartup => {
            if let Some(suggestion) = error.suggestion() {
                actions.push(suggestion.to_string());
            }
            actions.push("Run the server command manually to see its full output".to_string());
            actions.push(
                "Check the server's required environment variables and arguments".to_string(),
            );
        }
        ErrorCategory::Connection => {
            actions.push("Check that the MCP server is running and reachable".to_string());
            actions.push("Verify the server URL and your network connectivity".to_string());
        }
        ErrorCategory::ClientConfig => {
            actions.push("Verify the server command is installed and on your PATH".to_string());
            actions.push("Review the transport configuration".to_string());
        }
        ErrorCategory::ServerInternal => {
            actions.push("Check the MCP server logs for the failing request".to_string());
            actions.push("Restart the server if the problem persists".to_string());
        }
        ErrorCategory::Protocol => {
            actions.push(
                "Make sure the client and server speak compatible MCP versions".to_string(),
            );
            actions.push("Enable debug logging to inspect the exchanged messages".to_string());
        }
        ErrorCategory::Authentication => {
            actions.push("Check the credentials or tokens configured for this server".to_string());
        }
        ErrorCategory::Unknown => {
            actions.push("Enable debug logging to capture more detail".to_string());
            actions.push("Check the MCP server logs".to_string());
        }
    }

    if error.recoverable {
        match error.retry_after {
            Some(after) => actions.push(format!(
                "Retry recommended in {}s",
                after.as_secs().max(1)
            )),
            None => actions.push("Retry recommended".to_string()),
        }
    }

    actions
}

/// Original message followed by a "Suggested actions:" block
pub fn create_user_friendly_error(error: Option<&ClassifiedError>) -> Option<String> {
    let error = error?;
    let mut text = error.message.clone();
    text.push_str("\n\nSuggested actions:");
    for action in recovery_actions(error) {
        text.push_str("\n  - ");
        text.push_str(&action);
    }
    Some(text)
}

/// Machine readable rendering with a fixed set of keys
pub fn format_error_for_json(error: Option<&ClassifiedError>) -> Option<Value> {
    let error = error?;
    Some(json!({
        "category": error.category.as_str(),
        "severity": error.severity.as_str(),
        "message": error.message,
        "recoverable": error.recoverable,
        "context": error.context,
        "cause": error.cause,
        "recovery_actions": recovery_actions(error),
    }))
}
