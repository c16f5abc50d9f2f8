//! mcp-session command line
//!
//! Connects to an MCP server described by configuration and keeps the
//! session alive, or probes a stdio server command without connecting.

use clap::{Parser, Subcommand};
use mcp_session::classify::handler::create_user_friendly_error;
use mcp_session::classify::OP_TRANSPORT_CREATE;
use mcp_session::config::SessionConfig;
use mcp_session::logging;
use mcp_session::transport::factory::probe_command;
use mcp_session::transport::preflight::{self, TokioProcessRunner};
use mcp_session::transport::security;
use mcp_session::{
    ErrorHandler, OperationContext, SessionManager, TransportConfig, TransportError,
    TransportFactory,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Set the log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the configured server and hold the session until Ctrl-C
    Connect {
        /// Path to configuration file
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Run the stdio pre-flight check for a server command
    Probe {
        /// Probe deadline in seconds
        #[arg(long, value_name = "SECS", default_value_t = 5)]
        timeout: u64,

        /// Server executable
        command: String,

        /// Server arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// List supported transport types
    Types,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match &cli.command {
        Commands::Connect {
            config: Some(path),
        } => SessionConfig::load_from_file(path),
        _ => SessionConfig::load(),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut logging_config = config.logging.to_logging_config();
    if let Some(level) = &cli.log_level {
        logging_config.level = logging::parse_level(level);
    }
    if let Err(e) = logging::init_logging(&logging_config) {
        eprintln!("Warning: failed to initialize logging: {}", e);
    }

    match cli.command {
        Commands::Connect { .. } => run_connect(&config).await,
        Commands::Probe {
            timeout,
            command,
            args,
        } => run_probe(command, args, Duration::from_secs(timeout)).await,
        Commands::Types => {
            for transport_type in TransportFactory::supported_types() {
                println!("{}", transport_type);
            }
            ExitCode::SUCCESS
        }
    }
}

async fn run_connect(config: &SessionConfig) -> ExitCode {
    let transport_config = match config.transport.to_transport_config() {
        Ok(transport_config) => transport_config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let manager = SessionManager::from_config(&config.session);
    let factory = TransportFactory::new();
    let ctx = OperationContext::with_timeout(transport_config.connect_timeout);

    if let Err(e) = manager
        .connect_with_config(&ctx, &factory, &transport_config)
        .await
    {
        eprintln!("Error: {}", e);
        if let Some(text) = create_user_friendly_error(e.classified()) {
            eprintln!("\n{}", text);
        }
        return ExitCode::FAILURE;
    }

    print_json(&manager.info().await);
    tracing::info!("Session established; press Ctrl-C to disconnect");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for Ctrl-C: {}", e);
    }

    let info = manager.info().await;
    let result = manager.disconnect().await;
    print_json(&info);
    print_json(&manager.error_report());

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_probe(command: String, args: Vec<String>, timeout: Duration) -> ExitCode {
    let config = TransportConfig::stdio(command, args).with_probe_timeout(timeout);

    let result = match security::validate_command(&config.command, &config.args) {
        Ok(()) => {
            let probe = probe_command(&config);
            preflight::probe(&TokioProcessRunner, &probe, config.probe_timeout).await
        }
        Err(e) => Err(e),
    };

    match result {
        Ok(verdict) => {
            println!("{:?}", verdict);
            ExitCode::SUCCESS
        }
        Err(e) => {
            report_transport_error(&e);
            ExitCode::FAILURE
        }
    }
}

fn report_transport_error(err: &TransportError) {
    let classified = ErrorHandler::new().handle(err, OP_TRANSPORT_CREATE, HashMap::new());
    if let Some(text) = create_user_friendly_error(Some(&classified)) {
        eprintln!("Error: {}", text);
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error: failed to render output: {}", e),
    }
}
