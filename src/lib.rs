//! mcp-session library
//!
//! Client-side runtime that turns an MCP connection over stdio, HTTP or
//! SSE into a single session with:
//! - A lifecycle state machine with health monitoring and reconnection
//! - A transport factory with command screening and startup probing
//! - Error classification and recovery advice

pub mod classify;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod session;
pub mod transport;

pub use classify::{ClassifiedError, ErrorCategory, ErrorHandler, Severity};
pub use context::OperationContext;
pub use error::{ServerStartupError, SessionError, TransportError};
pub use session::{SessionInfo, SessionManager, SessionState};
pub use transport::{TransportConfig, TransportFactory, TransportType};
