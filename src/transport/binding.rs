//! rmcp-backed transports
//!
//! Stdio servers run under `TokioChildProcess`; HTTP, streamable HTTP and
//! SSE endpoints go through rmcp's streamable HTTP client with the reqwest
//! client the factory tuned for them.

use super::preflight::ProbeCommand;
use super::{McpConnection, McpTransport, TransportConfig, TransportType};
use crate::error::{TransportError, TransportResult};
use async_trait::async_trait;
use rmcp::{
    model::ClientInfo,
    service::{Peer, RunningService},
    transport::{
        streamable_http_client::StreamableHttpClientTransportConfig,
        StreamableHttpClientTransport, TokioChildProcess,
    },
    RoleClient, ServiceExt,
};
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use uuid::Uuid;

/// Handshake failures that mean the server hung up on us
const PREMATURE_CLOSE_MARKERS: &[&str] = &[
    "connection closed",
    "transport closed",
    "unexpected eof",
    "broken pipe",
    "early eof",
];

/// Spawns the server and speaks MCP over its stdin/stdout
#[derive(Debug, Clone)]
pub struct StdioTransport {
    command: ProbeCommand,
    debug: bool,
    connect_timeout: Duration,
}

impl StdioTransport {
    pub fn new(command: ProbeCommand, debug: bool, connect_timeout: Duration) -> Self {
        Self {
            command,
            debug,
            connect_timeout,
        }
    }

    pub fn command(&self) -> &ProbeCommand {
        &self.command
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args).envs(&self.command.env);
        if let Some(dir) = &self.command.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stderr(if self.debug {
            Stdio::inherit()
        } else {
            Stdio::null()
        });
        cmd
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Stdio
    }

    async fn connect(&self, client: &ClientInfo) -> TransportResult<Box<dyn McpConnection>> {
        tracing::debug!(
            program = %self.command.program,
            args = ?self.command.args,
            "Spawning stdio MCP server"
        );

        let transport = TokioChildProcess::new(self.build_command()).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TransportError::CommandNotFound {
                    command: self.command.program.clone(),
                }
            } else {
                TransportError::Spawn {
                    command: self.command.program.clone(),
                    source: e,
                }
            }
        })?;

        let service = tokio::time::timeout(self.connect_timeout, client.clone().serve(transport))
            .await
            .map_err(|_| TransportError::Timeout(self.connect_timeout))?
            .map_err(|e| {
                let detail = e.to_string();
                if is_premature_close(&detail) {
                    TransportError::PrematureExit {
                        command: self.command.program.clone(),
                        detail,
                    }
                } else {
                    TransportError::Handshake(detail)
                }
            })?;

        Ok(Box::new(RmcpConnection::new(service, TransportType::Stdio)))
    }
}

fn is_premature_close(detail: &str) -> bool {
    let detail = detail.to_lowercase();
    PREMATURE_CLOSE_MARKERS.iter().any(|m| detail.contains(m))
}

/// HTTP, streamable HTTP and SSE endpoints
#[derive(Debug, Clone)]
pub struct HttpTransport {
    url: String,
    client: reqwest::Client,
    transport_type: TransportType,
    connect_timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: &TransportConfig, client: reqwest::Client) -> Self {
        Self {
            url: config.url.clone(),
            client,
            transport_type: config.transport_type,
            connect_timeout: config.connect_timeout,
        }
    }
}

#[async_trait]
impl McpTransport for HttpTransport {
    fn transport_type(&self) -> TransportType {
        self.transport_type
    }

    async fn connect(&self, client: &ClientInfo) -> TransportResult<Box<dyn McpConnection>> {
        tracing::debug!(url = %self.url, transport = %self.transport_type, "Connecting to MCP endpoint");

        let transport = StreamableHttpClientTransport::with_client(
            self.client.clone(),
            StreamableHttpClientTransportConfig::with_uri(self.url.clone()),
        );

        let service = tokio::time::timeout(self.connect_timeout, client.clone().serve(transport))
            .await
            .map_err(|_| TransportError::Timeout(self.connect_timeout))?
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        Ok(Box::new(RmcpConnection::new(service, self.transport_type)))
    }
}

/// A running rmcp client service
pub struct RmcpConnection {
    id: String,
    transport_type: TransportType,
    service: RunningService<RoleClient, ClientInfo>,
}

impl RmcpConnection {
    fn new(service: RunningService<RoleClient, ClientInfo>, transport_type: TransportType) -> Self {
        let id = Uuid::new_v4().to_string();
        if let Some(info) = service.peer().peer_info() {
            tracing::info!(
                session_id = %id,
                server = %info.server_info.name,
                version = %info.server_info.version,
                "MCP handshake completed"
            );
        }
        Self {
            id,
            transport_type,
            service,
        }
    }
}

impl fmt::Debug for RmcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RmcpConnection")
            .field("id", &self.id)
            .field("transport_type", &self.transport_type)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl McpConnection for RmcpConnection {
    fn id(&self) -> String {
        if self.service.peer().is_transport_closed() {
            String::new()
        } else {
            self.id.clone()
        }
    }

    fn peer(&self) -> Option<Peer<RoleClient>> {
        Some(self.service.peer().clone())
    }

    async fn close(self: Box<Self>) -> TransportResult<()> {
        let id = self.id.clone();
        let reason = self
            .service
            .cancel()
            .await
            .map_err(|e| TransportError::Close(e.to_string()))?;
        tracing::debug!(session_id = %id, reason = ?reason, "MCP service stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_premature_close_detection() {
        assert!(is_premature_close("Connection closed: initialize response"));
        assert!(is_premature_close("io error: Broken pipe (os error 32)"));
        assert!(!is_premature_close("invalid params: protocolVersion"));
    }

    #[test]
    fn test_stdio_command_carries_config() {
        let mut command = ProbeCommand::new("server", vec!["--stdio".to_string()]);
        command.env.insert("TOKEN".to_string(), "x".to_string());
        let transport = StdioTransport::new(command, false, Duration::from_secs(1));
        assert_eq!(transport.transport_type(), TransportType::Stdio);
        assert_eq!(transport.command().args, vec!["--stdio".to_string()]);
    }
}
