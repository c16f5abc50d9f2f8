//! Transport factory
//!
//! Validates a [`TransportConfig`] and builds the matching transport and
//! context strategy. Stdio servers are screened for shell injection and
//! probed before the real transport is constructed.

use super::binding::{HttpTransport, StdioTransport};
use super::preflight::{self, ProbeCommand, ProcessRunner, TokioProcessRunner};
use super::security;
use super::strategy::{strategy_for, ContextStrategy};
use super::{McpTransport, TransportConfig, TransportType};
use crate::error::{TransportError, TransportResult};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Idle connections kept per host by request/response clients
const POOL_MAX_IDLE_PER_HOST: usize = 10;
/// Idle lifetime of pooled request/response connections
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
/// Idle lifetime of pooled streaming connections
const STREAM_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
/// TCP keepalive for long-lived event streams
const STREAM_TCP_KEEPALIVE: Duration = Duration::from_secs(60);

/// Builds transports from configuration
#[derive(Clone)]
pub struct TransportFactory {
    runner: Arc<dyn ProcessRunner>,
}

impl TransportFactory {
    pub fn new() -> Self {
        Self::with_runner(Arc::new(TokioProcessRunner))
    }

    /// Factory probing stdio servers through `runner`
    pub fn with_runner(runner: Arc<dyn ProcessRunner>) -> Self {
        Self { runner }
    }

    /// Transport kinds this factory can build
    pub fn supported_types() -> Vec<TransportType> {
        TransportType::ALL.to_vec()
    }

    /// Check that `config` carries what its transport kind needs
    pub fn validate_config(&self, config: &TransportConfig) -> TransportResult<()> {
        match config.transport_type {
            TransportType::Stdio => {
                if config.command.trim().is_empty() {
                    return Err(TransportError::InvalidConfig(
                        "command is required for stdio transport".to_string(),
                    ));
                }
            }
            TransportType::Http | TransportType::StreamableHttp | TransportType::Sse => {
                if config.url.trim().is_empty() {
                    return Err(TransportError::InvalidConfig(format!(
                        "url is required for {} transport",
                        config.transport_type
                    )));
                }
                let url = reqwest::Url::parse(&config.url).map_err(|e| {
                    TransportError::InvalidConfig(format!("invalid url '{}': {}", config.url, e))
                })?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(TransportError::InvalidConfig(format!(
                        "unsupported url scheme '{}'",
                        url.scheme()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Build the transport for `config` together with its context strategy
    pub async fn create_transport(
        &self,
        config: &TransportConfig,
    ) -> TransportResult<(Arc<dyn McpTransport>, Arc<dyn ContextStrategy>)> {
        self.validate_config(config)?;

        let transport: Arc<dyn McpTransport> = match config.transport_type {
            TransportType::Stdio => Arc::new(self.create_stdio(config).await?),
            TransportType::Http | TransportType::StreamableHttp => {
                let client = match &config.http_client {
                    Some(client) => client.clone(),
                    None => request_client(config)?,
                };
                Arc::new(HttpTransport::new(config, client))
            }
            TransportType::Sse => {
                let client = match &config.http_client {
                    Some(client) => client.clone(),
                    None => streaming_client(config)?,
                };
                Arc::new(HttpTransport::new(config, client))
            }
        };

        tracing::info!(
            transport = %config.transport_type,
            target = %config.description(),
            "Created MCP transport"
        );

        Ok((transport, strategy_for(config.transport_type)))
    }

    async fn create_stdio(&self, config: &TransportConfig) -> TransportResult<StdioTransport> {
        security::validate_command(&config.command, &config.args)?;

        let command = probe_command(config);
        preflight::probe(self.runner.as_ref(), &command, config.probe_timeout).await?;

        Ok(StdioTransport::new(command, config.debug, config.connect_timeout))
    }
}

impl Default for TransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

/// The command line a stdio config launches, with `~` expanded
pub fn probe_command(config: &TransportConfig) -> ProbeCommand {
    ProbeCommand {
        program: expand_tilde(&config.command),
        args: config.args.clone(),
        env: config.env.clone(),
        working_dir: config
            .working_dir
            .as_ref()
            .map(|dir| PathBuf::from(expand_tilde(&dir.to_string_lossy()))),
    }
}

fn expand_tilde(path: &str) -> String {
    shellexpand::tilde(path).into_owned()
}

/// HTTP client for request/response traffic: bounded, pooled, compressed
pub fn request_client(config: &TransportConfig) -> TransportResult<reqwest::Client> {
    let client = reqwest::Client::builder()
        .timeout(config.request_timeout)
        .connect_timeout(config.connect_timeout)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .gzip(true)
        .default_headers(header_map(config)?)
        .build()?;
    Ok(client)
}

/// HTTP client for event streams
///
/// No overall timeout and no compression, so live events are neither cut
/// off nor buffered by the decoder.
pub fn streaming_client(config: &TransportConfig) -> TransportResult<reqwest::Client> {
    let client = reqwest::Client::builder()
        .connect_timeout(config.connect_timeout)
        .pool_idle_timeout(STREAM_POOL_IDLE_TIMEOUT)
        .tcp_keepalive(STREAM_TCP_KEEPALIVE)
        .no_gzip()
        .default_headers(header_map(config)?)
        .build()?;
    Ok(client)
}

fn header_map(config: &TransportConfig) -> TransportResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (name, value) in &config.headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
            TransportError::InvalidConfig(format!("invalid header name '{}': {}", name, e))
        })?;
        let value = HeaderValue::from_str(value).map_err(|e| {
            TransportError::InvalidConfig(format!("invalid value for header '{}': {}", name, e))
        })?;
        headers.insert(name, value);
    }
    Ok(headers)
}
