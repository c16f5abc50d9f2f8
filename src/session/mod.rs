//! MCP session manager
//!
//! Owns the lifecycle of one logical MCP session:
//!
//! ```text
//! Disconnected -> Connecting -> Connected <-> Reconnecting -> Failed
//!                                   any state -> Closed (disconnect)
//! ```
//!
//! All session state sits behind a single `RwLock`. The lock is never held
//! across I/O: handshakes and closes run with the lock released and their
//! results are applied under a fresh acquisition. Persistent transports get
//! a health monitor (see [`health`]) bound to the connection scope, so
//! cancelling the scope is the only way a monitor stops.

mod health;

use crate::classify::{
    ClassifiedError, ErrorHandler, ErrorStatistics, Severity, OP_SESSION_CONNECT,
    OP_SESSION_DISCONNECT,
};
use crate::config::SessionSection;
use crate::context::OperationContext;
use crate::error::{SessionError, SessionResult, TransportError};
use crate::transport::{
    ContextStrategy, McpConnection, McpTransport, TransportConfig, TransportFactory, TransportType,
};
use chrono::{DateTime, Utc};
use rmcp::model::ClientInfo;
use rmcp::service::Peer;
use rmcp::RoleClient;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Default interval between liveness checks
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
/// Default number of automatic reconnection attempts
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 3;
/// Default wait before a reconnection attempt
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Never connected
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Connected and ready
    Connected,
    /// Automatic reconnection in progress
    Reconnecting,
    /// Gave up; only a new connect recovers
    Failed,
    /// Closed by an explicit disconnect
    Closed,
}

impl SessionState {
    /// States in which a new connect is refused
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Reconnecting => "Reconnecting",
            Self::Failed => "Failed",
            Self::Closed => "Closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only snapshot of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub state: SessionState,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<ClassifiedError>,
    pub reconnect_count: u32,
    pub transport_type: Option<TransportType>,
    pub session_id: String,
}

/// How waits between reconnection attempts grow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffMode {
    /// Every attempt waits the base delay
    Fixed,
    /// Attempt n waits `delay * 2^(n-1)`, capped at `max_delay`
    Exponential { max_delay: Duration },
}

/// Automatic reconnection settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff: BackoffMode,
}

impl ReconnectPolicy {
    /// Wait before the `attempt`-th reconnection (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            BackoffMode::Fixed => self.delay,
            BackoffMode::Exponential { max_delay } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                self.delay.saturating_mul(factor).min(max_delay)
            }
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            delay: DEFAULT_RECONNECT_DELAY,
            backoff: BackoffMode::Fixed,
        }
    }
}

/// Mutable session record, only touched under the manager's lock
struct Session {
    state: SessionState,
    connected_at: Option<DateTime<Utc>>,
    last_error: Option<ClassifiedError>,
    reconnect_count: u32,
    transport_type: Option<TransportType>,
    session_id: String,
    /// Bumped by every connect; a handshake result only applies to its own attempt
    attempt: u64,
    connection: Option<Box<dyn McpConnection>>,
    /// Connection scope; cancelling it stops the health monitor
    scope: Option<OperationContext>,
    client: Option<ClientInfo>,
    transport: Option<Arc<dyn McpTransport>>,
    strategy: Option<Arc<dyn ContextStrategy>>,
    policy: ReconnectPolicy,
    health_interval: Duration,
}

impl Session {
    fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
            connected_at: None,
            last_error: None,
            reconnect_count: 0,
            transport_type: None,
            session_id: String::new(),
            attempt: 0,
            connection: None,
            scope: None,
            client: None,
            transport: None,
            strategy: None,
            policy: ReconnectPolicy::default(),
            health_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
        }
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            state: self.state,
            connected_at: self.connected_at,
            last_error: self.last_error.clone(),
            reconnect_count: self.reconnect_count,
            transport_type: self.transport_type,
            session_id: self.session_id.clone(),
        }
    }

    /// Cancel the scope and drop every transport reference
    ///
    /// Returns the live handle, if any, for the caller to close once the
    /// lock is released.
    fn release(&mut self) -> Option<Box<dyn McpConnection>> {
        if let Some(scope) = self.scope.take() {
            scope.cancel();
        }
        self.client = None;
        self.transport = None;
        self.strategy = None;
        self.session_id.clear();
        self.connection.take()
    }

    /// Terminal failure: no further automatic recovery
    fn fail(&mut self, mut error: ClassifiedError) -> Option<Box<dyn McpConnection>> {
        error.severity = Severity::Critical;
        self.state = SessionState::Failed;
        self.last_error = Some(error);
        self.release()
    }
}

struct Shared {
    session: RwLock<Session>,
    errors: Arc<ErrorHandler>,
}

impl Shared {
    fn classify(
        &self,
        err: &(dyn std::error::Error + 'static),
        operation: &str,
        fields: HashMap<String, Value>,
    ) -> ClassifiedError {
        self.errors.handle(err, operation, fields)
    }
}

/// Manages one MCP session
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<Shared>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::with_error_handler(Arc::new(ErrorHandler::new()))
    }

    /// Manager recording its errors into `errors`
    pub fn with_error_handler(errors: Arc<ErrorHandler>) -> Self {
        Self {
            shared: Arc::new(Shared {
                session: RwLock::new(Session::new()),
                errors,
            }),
        }
    }

    /// Manager using the reconnection and health settings of `section`
    pub fn from_config(section: &SessionSection) -> Self {
        let mut session = Session::new();
        session.policy = section.reconnect_policy();
        session.health_interval = section.health_check_interval;
        Self {
            shared: Arc::new(Shared {
                session: RwLock::new(session),
                errors: Arc::new(ErrorHandler::new()),
            }),
        }
    }

    /// Connect over an already constructed transport
    ///
    /// Refused while the session is connecting or connected. From any other
    /// state the previous connection, if any, is torn down first.
    pub async fn connect(
        &self,
        ctx: &OperationContext,
        client: ClientInfo,
        transport: Arc<dyn McpTransport>,
        strategy: Arc<dyn ContextStrategy>,
        transport_type: TransportType,
    ) -> SessionResult<()> {
        let (scope, attempt, stale) = {
            let mut session = self.shared.session.write().await;
            if session.state.is_active() {
                return Err(SessionError::AlreadyActive {
                    state: session.state,
                });
            }

            let stale = session.release();
            let scope = strategy.connection_context(ctx).child();

            session.attempt += 1;
            session.state = SessionState::Connecting;
            session.last_error = None;
            session.reconnect_count = 0;
            session.connected_at = None;
            session.transport_type = Some(transport_type);
            session.client = Some(client.clone());
            session.transport = Some(Arc::clone(&transport));
            session.strategy = Some(Arc::clone(&strategy));
            session.scope = Some(scope.clone());
            (scope, session.attempt, stale)
        };

        if let Some(stale) = stale {
            close_quietly(stale).await;
        }

        tracing::info!(transport = %transport_type, "Connecting MCP session");

        let result = match scope.run(transport.connect(&client)).await {
            Ok(result) => result,
            Err(e) => Err(TransportError::Context(e)),
        };

        let mut session = self.shared.session.write().await;
        if session.attempt != attempt || session.state != SessionState::Connecting {
            // Disconnected, and possibly reconnected, while the handshake was in flight
            drop(session);
            if let Ok(connection) = result {
                close_quietly(connection).await;
            }
            tracing::debug!(transport = %transport_type, "Discarding connect result after disconnect");
            return Err(SessionError::Cancelled);
        }

        match result {
            Ok(connection) => {
                session.session_id = connection.id();
                session.connection = Some(connection);
                session.connected_at = Some(Utc::now());
                session.state = SessionState::Connected;
                let session_id = session.session_id.clone();
                drop(session);

                tracing::info!(
                    transport = %transport_type,
                    session_id = %session_id,
                    "MCP session connected"
                );

                if strategy.requires_persistent_connection() {
                    health::spawn_monitor(Arc::clone(&self.shared), scope);
                }
                Ok(())
            }
            Err(e) => {
                let fields = HashMap::from([(
                    "transport".to_string(),
                    Value::from(transport_type.as_str()),
                )]);
                let classified = self.shared.classify(&e, OP_SESSION_CONNECT, fields);

                session.state = SessionState::Failed;
                session.last_error = Some(classified.clone());
                session.release();
                drop(session);
                scope.cancel();

                tracing::error!(
                    transport = %transport_type,
                    category = %classified.category,
                    "MCP session connect failed: {}",
                    classified.message
                );

                Err(SessionError::ConnectFailed {
                    message: classified.message.clone(),
                    classified: Box::new(classified),
                })
            }
        }
    }

    /// Build the transport for `config` through `factory`, then connect
    ///
    /// Transport construction failures, including a failed stdio pre-flight,
    /// count as connect failures and leave the session `Failed`.
    pub async fn connect_with_config(
        &self,
        ctx: &OperationContext,
        factory: &TransportFactory,
        config: &TransportConfig,
    ) -> SessionResult<()> {
        {
            let session = self.shared.session.read().await;
            if session.state.is_active() {
                return Err(SessionError::AlreadyActive {
                    state: session.state,
                });
            }
        }

        match factory.create_transport(config).await {
            Ok((transport, strategy)) => {
                self.connect(
                    ctx,
                    ClientInfo::default(),
                    transport,
                    strategy,
                    config.transport_type,
                )
                .await
            }
            Err(e) => {
                let fields = HashMap::from([
                    (
                        "transport".to_string(),
                        Value::from(config.transport_type.as_str()),
                    ),
                    ("target".to_string(), Value::from(config.description())),
                ]);
                let classified = self.shared.classify(&e, OP_SESSION_CONNECT, fields);

                let mut session = self.shared.session.write().await;
                if !session.state.is_active() {
                    let stale = session.release();
                    session.state = SessionState::Failed;
                    session.transport_type = Some(config.transport_type);
                    session.last_error = Some(classified.clone());
                    session.reconnect_count = 0;
                    session.connected_at = None;
                    drop(session);
                    if let Some(stale) = stale {
                        close_quietly(stale).await;
                    }
                }

                tracing::error!(
                    transport = %config.transport_type,
                    category = %classified.category,
                    "Failed to create MCP transport: {}",
                    classified.message
                );

                Err(SessionError::ConnectFailed {
                    message: classified.message.clone(),
                    classified: Box::new(classified),
                })
            }
        }
    }

    /// Close the session
    ///
    /// A no-op when already disconnected or closed. Close errors are
    /// reported but the session is `Closed` regardless.
    pub async fn disconnect(&self) -> SessionResult<()> {
        let connection = {
            let mut session = self.shared.session.write().await;
            if matches!(
                session.state,
                SessionState::Disconnected | SessionState::Closed
            ) {
                return Ok(());
            }

            let connection = session.release();
            session.state = SessionState::Closed;
            session.connected_at = None;
            connection
        };

        tracing::info!("MCP session closed");

        if let Some(connection) = connection {
            if let Err(e) = connection.close().await {
                self.shared.classify(&e, OP_SESSION_DISCONNECT, HashMap::new());
                tracing::warn!("Error while closing MCP connection: {}", e);
                return Err(SessionError::Close(e));
            }
        }
        Ok(())
    }

    pub async fn info(&self) -> SessionInfo {
        self.shared.session.read().await.info()
    }

    pub async fn state(&self) -> SessionState {
        self.shared.session.read().await.state
    }

    /// Connected with a live handle
    pub async fn is_connected(&self) -> bool {
        let session = self.shared.session.read().await;
        session.state == SessionState::Connected && session.connection.is_some()
    }

    /// Protocol peer of the current connection
    pub async fn peer(&self) -> Option<Peer<RoleClient>> {
        let session = self.shared.session.read().await;
        session.connection.as_ref().and_then(|c| c.peer())
    }

    /// Context for a single request, as the transport's strategy sees it
    pub async fn operation_context(&self, caller: &OperationContext) -> OperationContext {
        let session = self.shared.session.read().await;
        match &session.strategy {
            Some(strategy) => strategy.operation_context(caller),
            None => caller.clone(),
        }
    }

    /// Change attempt count and base delay, keeping the backoff mode
    pub async fn set_reconnection_policy(&self, max_attempts: u32, delay: Duration) {
        let mut session = self.shared.session.write().await;
        session.policy.max_attempts = max_attempts;
        session.policy.delay = delay;
    }

    pub async fn set_backoff(&self, backoff: BackoffMode) {
        self.shared.session.write().await.policy.backoff = backoff;
    }

    pub async fn reconnect_policy(&self) -> ReconnectPolicy {
        self.shared.session.read().await.policy
    }

    /// Takes effect for monitors started after the call
    pub async fn set_health_check_interval(&self, interval: Duration) {
        self.shared.session.write().await.health_interval = interval;
    }

    pub fn error_statistics(&self) -> ErrorStatistics {
        self.shared.errors.statistics()
    }

    pub fn error_report(&self) -> Value {
        self.shared.errors.error_report()
    }

    pub fn reset_error_statistics(&self) {
        self.shared.errors.reset_statistics();
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Close a handle that is being thrown away, logging failures
async fn close_quietly(connection: Box<dyn McpConnection>) {
    if let Err(e) = connection.close().await {
        tracing::debug!("Error while closing discarded MCP connection: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Connected.to_string(), "Connected");
        assert_eq!(SessionState::Reconnecting.to_string(), "Reconnecting");
        assert!(SessionState::Connecting.is_active());
        assert!(!SessionState::Failed.is_active());
        assert!(!SessionState::Closed.is_active());
    }

    #[test]
    fn test_fixed_backoff() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), DEFAULT_RECONNECT_DELAY);
        assert_eq!(policy.delay_for(3), DEFAULT_RECONNECT_DELAY);
    }

    #[test]
    fn test_exponential_backoff_capped() {
        let policy = ReconnectPolicy {
            max_attempts: 10,
            delay: Duration::from_secs(1),
            backoff: BackoffMode::Exponential {
                max_delay: Duration::from_secs(5),
            },
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(5));
        assert_eq!(policy.delay_for(40), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_initial_info() {
        let manager = SessionManager::new();
        let info = manager.info().await;
        assert_eq!(info.state, SessionState::Disconnected);
        assert!(info.session_id.is_empty());
        assert!(info.last_error.is_none());
        assert!(info.transport_type.is_none());
        assert!(!manager.is_connected().await);
    }

    #[tokio::test]
    async fn test_disconnect_before_connect_is_noop() {
        let manager = SessionManager::new();
        manager.disconnect().await.unwrap();
        assert_eq!(manager.state().await, SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_policy_setters_keep_backoff() {
        let manager = SessionManager::new();
        let exponential = BackoffMode::Exponential {
            max_delay: Duration::from_secs(30),
        };
        manager.set_backoff(exponential).await;
        manager
            .set_reconnection_policy(5, Duration::from_millis(250))
            .await;

        let policy = manager.reconnect_policy().await;
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay, Duration::from_millis(250));
        assert_eq!(policy.backoff, exponential);
    }
}
