//! Subprocess pre-flight probe
//!
//! Before committing to the MCP handshake, a stdio server is launched once
//! under a short deadline with stdin closed. Whatever it prints decides
//! whether it can start at all: a server that dies complaining about a
//! missing environment variable is reported with its output and a targeted
//! suggestion instead of a bare "connection closed".

use crate::error::{ServerStartupError, TransportError, TransportResult};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

/// How long output readers may keep draining after the process is gone
const READER_GRACE: Duration = Duration::from_millis(200);

/// Output that, together with a non-zero exit, marks a failed startup
const FAILURE_KEYWORDS: &[&str] = &[
    "error:",
    "usage:",
    "required",
    "missing",
    "not found",
    "npm error",
    "module not found",
    "cannot find module",
    "environment variable",
    "invalid argument",
    "command not found",
    "permission denied",
];

/// Output printed by servers that came up fine
const READY_KEYWORDS: &[&str] = &[
    "mcp server running",
    "server started",
    "listening on stdio",
    "ready for connections",
    "initialized successfully",
];

/// Extra stderr vocabulary that reads as a failure even without an exit code
const STDERR_ERROR_KEYWORDS: &[&str] = &[
    "error",
    "warning:",
    "failed",
    "exception",
    "traceback",
    "fatal",
    "panic",
];

static ENV_VAR_BEFORE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b([A-Z][A-Z0-9_]{1,})\s+(?i:environment\s+variable)").expect("invalid regex")
});

static ENV_VAR_AFTER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i:environment\s+variable)s?\s*[:'"`]?\s*([A-Z][A-Z0-9_]{1,})\b"#)
        .expect("invalid regex")
});

/// A command line to probe
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl ProbeCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            ..Default::default()
        }
    }
}

/// What a probe run captured
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed or terminated by a signal
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl ProbeOutput {
    /// stdout followed by stderr
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) if self.stdout.ends_with('\n') => {
                format!("{}{}", self.stdout, self.stderr)
            }
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }

    fn exited_non_zero(&self) -> bool {
        matches!(self.exit_code, Some(code) if code != 0)
    }
}

/// Outcome of evaluating a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeVerdict {
    /// The server announced it is ready
    Ready,
    /// Nothing conclusive; go ahead with the real transport
    Proceed,
    /// The server cannot start as configured
    StartupFailure,
}

/// Spawns a command with a deadline and captures what it prints
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, command: &ProbeCommand, deadline: Duration) -> io::Result<ProbeOutput>;
}

/// [`ProcessRunner`] on top of `tokio::process`
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioProcessRunner;

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, command: &ProbeCommand, deadline: Duration) -> io::Result<ProbeOutput> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn()?;

        let stdout = Arc::new(Mutex::new(Vec::new()));
        let stderr = Arc::new(Mutex::new(Vec::new()));
        let readers = [
            spawn_reader(child.stdout.take(), Arc::clone(&stdout)),
            spawn_reader(child.stderr.take(), Arc::clone(&stderr)),
        ];

        let (exit_code, timed_out) = match tokio::time::timeout(deadline, child.wait()).await {
            Ok(status) => (status?.code(), false),
            Err(_) => {
                if let Err(e) = child.kill().await {
                    tracing::debug!("Failed to kill probed process: {}", e);
                }
                (None, true)
            }
        };

        for mut reader in readers {
            if tokio::time::timeout(READER_GRACE, &mut reader).await.is_err() {
                reader.abort();
            }
        }

        Ok(ProbeOutput {
            stdout: snapshot(&stdout),
            stderr: snapshot(&stderr),
            exit_code,
            timed_out,
        })
    }
}

fn spawn_reader<R>(pipe: Option<R>, buffer: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut pipe) = pipe else {
            return;
        };
        let mut chunk = [0u8; 4096];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Ok(mut buffer) = buffer.lock() {
                        buffer.extend_from_slice(&chunk[..n]);
                    }
                }
            }
        }
    })
}

fn snapshot(buffer: &Mutex<Vec<u8>>) -> String {
    buffer
        .lock()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

/// Judge a probe run
///
/// Order matters: a non-zero exit with failure vocabulary beats readiness
/// text, and readiness text beats suspicious stderr.
pub fn evaluate(output: &ProbeOutput) -> ProbeVerdict {
    let combined = output.combined().to_lowercase();

    if output.exited_non_zero() && contains_any(&combined, FAILURE_KEYWORDS) {
        return ProbeVerdict::StartupFailure;
    }
    if contains_any(&combined, READY_KEYWORDS) {
        return ProbeVerdict::Ready;
    }
    if !output.stderr.trim().is_empty() && looks_like_error(&output.stderr) {
        return ProbeVerdict::StartupFailure;
    }
    ProbeVerdict::Proceed
}

/// Broad check used on stderr alone
pub fn looks_like_error(text: &str) -> bool {
    let text = text.to_lowercase();
    contains_any(&text, FAILURE_KEYWORDS) || contains_any(&text, STDERR_ERROR_KEYWORDS)
}

/// Remediation hint derived from captured server output
pub fn generate_suggestion(output: &str) -> String {
    let lower = output.to_lowercase();

    if lower.contains("environment variable") {
        return match extract_env_var(output) {
            Some(name) => format!("Set the {} environment variable before starting the server", name),
            None => "Set the required environment variables before starting the server".to_string(),
        };
    }
    if lower.contains("usage:")
        || lower.contains("missing required argument")
        || lower.contains("missing argument")
        || lower.contains("required argument")
    {
        return "Check the command arguments; the server rejected its invocation or is missing a required argument".to_string();
    }
    if lower.contains("npm error 404") || lower.contains("npm err! 404") || lower.contains("404 not found") {
        return "The package was not found in the npm registry; check the package name and version".to_string();
    }
    if lower.contains("module not found") || lower.contains("cannot find module") {
        return "A required module is missing; install the server's dependencies (for example with npm install) and try again".to_string();
    }
    if lower.contains("command not found") {
        return "Make sure the command is installed and available on your PATH".to_string();
    }
    if lower.contains("permission denied") {
        return "Check file permissions and make sure the current user may run the command".to_string();
    }
    "Review the server output above to diagnose the startup failure".to_string()
}

fn extract_env_var(output: &str) -> Option<String> {
    ENV_VAR_BEFORE
        .captures(output)
        .or_else(|| ENV_VAR_AFTER.captures(output))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Build the startup error for a failed probe
pub fn startup_error(command: &ProbeCommand, output: &ProbeOutput) -> ServerStartupError {
    let combined = output.combined();
    ServerStartupError {
        command: command.program.clone(),
        args: command.args.clone(),
        suggestion: generate_suggestion(&combined),
        output: combined,
        exit_code: output.exit_code.unwrap_or(-1),
    }
}

/// Run the probe and turn a failed startup into an error
///
/// A missing executable surfaces as [`TransportError::CommandNotFound`];
/// any other spawn failure as [`TransportError::Spawn`].
pub async fn probe(
    runner: &dyn ProcessRunner,
    command: &ProbeCommand,
    deadline: Duration,
) -> TransportResult<ProbeVerdict> {
    tracing::debug!(
        program = %command.program,
        args = ?command.args,
        deadline_ms = deadline.as_millis() as u64,
        "Probing MCP server startup"
    );

    let output = runner.run(command, deadline).await.map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            TransportError::CommandNotFound {
                command: command.program.clone(),
            }
        } else {
            TransportError::Spawn {
                command: command.program.clone(),
                source: e,
            }
        }
    })?;

    let verdict = evaluate(&output);
    tracing::debug!(
        program = %command.program,
        exit_code = ?output.exit_code,
        timed_out = output.timed_out,
        verdict = ?verdict,
        "Pre-flight probe finished"
    );

    if verdict == ProbeVerdict::StartupFailure {
        let err = startup_error(command, &output);
        tracing::warn!(
            program = %command.program,
            exit_code = err.exit_code,
            "MCP server failed pre-flight: {}",
            err.suggestion
        );
        return Err(TransportError::StartupFailed(err));
    }

    Ok(verdict)
}

fn contains_any(text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|k| text.contains(k))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn output(stdout: &str, stderr: &str, exit_code: Option<i32>) -> ProbeOutput {
        ProbeOutput {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code,
            timed_out: exit_code.is_none(),
        }
    }

    #[test]
    fn test_env_var_failure() {
        let out = output("", "Error: BRAVE_API_KEY environment variable is required\n", Some(1));
        assert_eq!(evaluate(&out), ProbeVerdict::StartupFailure);
        assert_eq!(
            generate_suggestion(&out.combined()),
            "Set the BRAVE_API_KEY environment variable before starting the server"
        );
    }

    #[test]
    fn test_env_var_name_after_phrase() {
        assert_eq!(
            generate_suggestion("missing environment variable: GITHUB_TOKEN"),
            "Set the GITHUB_TOKEN environment variable before starting the server"
        );
        assert_eq!(
            generate_suggestion("some environment variable is not set"),
            "Set the required environment variables before starting the server"
        );
    }

    #[test]
    fn test_ready_wins_over_stderr() {
        let out = output("", "Warning: deprecated flag\nMCP Server running on stdio\n", None);
        assert_eq!(evaluate(&out), ProbeVerdict::Ready);
    }

    #[test]
    fn test_failure_vocabulary_needs_non_zero_exit() {
        // Clean exit with a scary word on stdout is not fatal
        let out = output("config value required by nobody", "", Some(0));
        assert_eq!(evaluate(&out), ProbeVerdict::Proceed);

        let out = output("config value required", "", Some(2));
        assert_eq!(evaluate(&out), ProbeVerdict::StartupFailure);
    }

    #[test]
    fn test_stderr_error_without_exit() {
        let out = output("", "Traceback (most recent call last):\n  ...", None);
        assert_eq!(evaluate(&out), ProbeVerdict::StartupFailure);
        let err = startup_error(&ProbeCommand::new("python", vec!["server.py".to_string()]), &out);
        assert_eq!(err.exit_code, -1);
    }

    #[test]
    fn test_clean_output_proceeds() {
        assert_eq!(evaluate(&output("", "", Some(0))), ProbeVerdict::Proceed);
        assert_eq!(evaluate(&output("", "", None)), ProbeVerdict::Proceed);
    }

    #[test]
    fn test_suggestions() {
        assert!(generate_suggestion("Usage: server [options]").starts_with("Check the command arguments"));
        assert!(generate_suggestion("npm error 404 Not Found - GET https://registry.npmjs.org/x")
            .contains("npm registry"));
        assert!(generate_suggestion("Error: Cannot find module 'zod'").contains("install the server's dependencies"));
        assert!(generate_suggestion("bash: foo: command not found").contains("PATH"));
        assert!(generate_suggestion("EACCES: permission denied").contains("permissions"));
        assert_eq!(
            generate_suggestion("segfault"),
            "Review the server output above to diagnose the startup failure"
        );
    }

    #[test]
    fn test_combined_output_order() {
        let out = output("out", "err", Some(0));
        assert_eq!(out.combined(), "out\nerr");
        let out = output("out\n", "err", Some(0));
        assert_eq!(out.combined(), "out\nerr");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tokio_runner_captures_output() {
        let command = ProbeCommand::new(
            "sh",
            vec!["-c".to_string(), "echo hello; echo oops >&2; exit 3".to_string()],
        );
        let out = TokioProcessRunner.run(&command, Duration::from_secs(5)).await.unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.timed_out);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tokio_runner_deadline() {
        let command = ProbeCommand::new("sleep", vec!["10".to_string()]);
        let out = TokioProcessRunner
            .run(&command, Duration::from_millis(100))
            .await
            .unwrap();
        assert!(out.timed_out);
        assert_eq!(out.exit_code, None);
    }

    #[tokio::test]
    async fn test_missing_command() {
        let command = ProbeCommand::new("definitely-not-a-real-mcp-server-binary", vec![]);
        let err = probe(&TokioProcessRunner, &command, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::CommandNotFound { .. }));
    }
}
