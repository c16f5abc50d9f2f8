//! MCP transports
//!
//! A transport knows how to reach one MCP server and run the protocol
//! handshake over its binding (subprocess stdio, HTTP, SSE). Transports are
//! built by the [`factory::TransportFactory`] from a [`TransportConfig`] and
//! paired with the [`strategy::ContextStrategy`] for their kind.

pub mod binding;
pub mod factory;
pub mod preflight;
pub mod security;
pub mod strategy;

pub use factory::TransportFactory;
pub use strategy::ContextStrategy;

use crate::error::{TransportError, TransportResult};
use async_trait::async_trait;
use rmcp::model::ClientInfo;
use rmcp::service::Peer;
use rmcp::RoleClient;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default bound on the protocol handshake
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default per-request timeout for request/response HTTP
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Default deadline of the subprocess pre-flight probe
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportType {
    /// Spawn the server and talk over its stdin/stdout
    Stdio,
    /// Request/response HTTP
    Http,
    /// Streamable HTTP
    StreamableHttp,
    /// Long-lived server-sent event stream
    Sse,
}

impl TransportType {
    /// Every supported kind, in a stable order
    pub const ALL: [TransportType; 4] = [
        TransportType::Stdio,
        TransportType::Http,
        TransportType::StreamableHttp,
        TransportType::Sse,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Http => "http",
            Self::StreamableHttp => "streamable-http",
            Self::Sse => "sse",
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportType {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stdio" => Ok(Self::Stdio),
            "http" => Ok(Self::Http),
            "streamable-http" | "streamable_http" => Ok(Self::StreamableHttp),
            "sse" => Ok(Self::Sse),
            other => Err(TransportError::UnsupportedType(other.to_string())),
        }
    }
}

/// Everything needed to build one transport
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub transport_type: TransportType,
    /// Executable for stdio servers
    pub command: String,
    pub args: Vec<String>,
    /// Extra environment for stdio servers
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    /// Endpoint for network transports
    pub url: String,
    /// Default headers sent with every HTTP request
    pub headers: HashMap<String, String>,
    /// Caller supplied client; replaces the tuned default when set
    pub http_client: Option<reqwest::Client>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub probe_timeout: Duration,
    pub debug: bool,
}

impl TransportConfig {
    fn new(transport_type: TransportType) -> Self {
        Self {
            transport_type,
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            url: String::new(),
            headers: HashMap::new(),
            http_client: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            debug: false,
        }
    }

    /// Subprocess server launched with `command args...`
    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            ..Self::new(TransportType::Stdio)
        }
    }

    pub fn http(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::new(TransportType::Http)
        }
    }

    pub fn streamable_http(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::new(TransportType::StreamableHttp)
        }
    }

    pub fn sse(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::new(TransportType::Sse)
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Short human readable description, e.g. for log lines
    pub fn description(&self) -> String {
        match self.transport_type {
            TransportType::Stdio if self.args.is_empty() => format!("stdio: {}", self.command),
            TransportType::Stdio => format!("stdio: {} {}", self.command, self.args.join(" ")),
            other => format!("{}: {}", other, self.url),
        }
    }
}

/// A way of reaching one MCP server
#[async_trait]
pub trait McpTransport: Send + Sync {
    fn transport_type(&self) -> TransportType;

    /// Open the binding and complete the MCP initialize handshake
    async fn connect(&self, client: &ClientInfo) -> TransportResult<Box<dyn McpConnection>>;
}

/// An established MCP connection
#[async_trait]
pub trait McpConnection: Send + Sync {
    /// Session identifier; empty once the connection is gone
    fn id(&self) -> String;

    /// Protocol peer for issuing requests, when backed by rmcp
    fn peer(&self) -> Option<Peer<RoleClient>> {
        None
    }

    async fn close(self: Box<Self>) -> TransportResult<()>;
}
