//! Health monitoring and automatic reconnection
//!
//! The monitor only detects failures. Recovery runs in a separate task so a
//! slow handshake never stalls the monitor loop; while that task is
//! outstanding the session is `Reconnecting` and the monitor stays idle.
//!
//! A reconnection attempt that fails with a recoverable error puts the
//! session back to `Connected` and keeps the error: the next monitor tick
//! finds the dead handle again and schedules the next attempt.

use super::{close_quietly, SessionState, Shared};
use crate::classify::{OP_HEALTH_CHECK, OP_SESSION_RECONNECT};
use crate::context::OperationContext;
use crate::error::{SessionError, TransportError};
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Start the monitor for the connection governed by `scope`
pub(super) fn spawn_monitor(shared: Arc<Shared>, scope: OperationContext) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = shared.session.read().await.health_interval;
        tracing::debug!(interval_ms = interval.as_millis() as u64, "Health monitor started");

        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = scope.cancelled() => break,
                _ = ticker.tick() => check(&shared, &scope).await,
            }
        }

        tracing::debug!("Health monitor stopped");
    })
}

/// One liveness check
async fn check(shared: &Arc<Shared>, scope: &OperationContext) {
    let failure = {
        let session = shared.session.read().await;
        if session.state != SessionState::Connected {
            return;
        }
        let Some(connection) = session.connection.as_ref() else {
            return;
        };
        if !connection.id().is_empty() {
            return;
        }
        SessionError::HealthCheck(format!(
            "connection lost: session {} no longer reports an identifier",
            session.session_id
        ))
    };

    tracing::warn!("{}", failure);
    handle_failure(shared, scope, failure).await;
}

/// Decide between giving up and scheduling a reconnection attempt
async fn handle_failure(shared: &Arc<Shared>, scope: &OperationContext, failure: SessionError) {
    let fields = {
        let session = shared.session.read().await;
        HashMap::from([
            ("session_id".to_string(), Value::from(session.session_id.clone())),
            ("reconnect_count".to_string(), Value::from(session.reconnect_count)),
        ])
    };
    let classified = shared.classify(&failure, OP_HEALTH_CHECK, fields);

    let mut session = shared.session.write().await;
    if scope.is_cancelled() || session.state != SessionState::Connected {
        return;
    }

    if session.reconnect_count >= session.policy.max_attempts || !classified.recoverable {
        tracing::error!(
            reconnect_count = session.reconnect_count,
            recoverable = classified.recoverable,
            "Giving up on MCP session: {}",
            classified.message
        );
        let connection = session.fail(classified);
        drop(session);
        if let Some(connection) = connection {
            close_quietly(connection).await;
        }
        return;
    }

    session.state = SessionState::Reconnecting;
    session.last_error = Some(classified);
    session.reconnect_count += 1;
    let attempt = session.reconnect_count;
    let delay = session.policy.delay_for(attempt);
    drop(session);

    tracing::info!(
        attempt,
        delay_ms = delay.as_millis() as u64,
        "Scheduling MCP reconnection"
    );
    tokio::spawn(reconnect(Arc::clone(shared), scope.clone(), attempt, delay));
}

/// One reconnection attempt
///
/// Its result is dropped if the session was closed meanwhile: `Closed`
/// always wins over a late handshake.
async fn reconnect(shared: Arc<Shared>, old_scope: OperationContext, attempt: u32, delay: Duration) {
    if old_scope.sleep(delay).await.is_err() {
        tracing::debug!(attempt, "Reconnection abandoned before it started");
        return;
    }

    let (client, transport, strategy) = {
        let session = shared.session.read().await;
        if old_scope.is_cancelled() || session.state != SessionState::Reconnecting {
            return;
        }
        match (
            session.client.clone(),
            session.transport.clone(),
            session.strategy.clone(),
        ) {
            (Some(client), Some(transport), Some(strategy)) => (client, transport, strategy),
            _ => return,
        }
    };

    let new_scope = strategy
        .connection_context(&OperationContext::background())
        .child();
    let result = match new_scope.run(transport.connect(&client)).await {
        Ok(result) => result,
        Err(e) => Err(TransportError::Context(e)),
    };

    let mut session = shared.session.write().await;
    if old_scope.is_cancelled() || session.state != SessionState::Reconnecting {
        drop(session);
        new_scope.cancel();
        if let Ok(connection) = result {
            close_quietly(connection).await;
        }
        tracing::debug!(attempt, "Discarding reconnection result for a closed session");
        return;
    }

    match result {
        Ok(connection) => {
            old_scope.cancel();
            let session_id = connection.id();
            let previous = session.connection.replace(connection);
            session.session_id = session_id.clone();
            session.connected_at = Some(Utc::now());
            session.state = SessionState::Connected;
            session.last_error = None;
            session.scope = Some(new_scope.clone());
            drop(session);

            if let Some(previous) = previous {
                close_quietly(previous).await;
            }

            tracing::info!(attempt, session_id = %session_id, "MCP session reconnected");

            if strategy.requires_persistent_connection() {
                spawn_monitor(shared, new_scope);
            }
        }
        Err(e) => {
            new_scope.cancel();
            let fields = HashMap::from([("attempt".to_string(), Value::from(attempt))]);
            let classified = shared.classify(&e, OP_SESSION_RECONNECT, fields);

            if session.reconnect_count >= session.policy.max_attempts || !classified.recoverable {
                tracing::error!(
                    attempt,
                    recoverable = classified.recoverable,
                    "MCP reconnection failed permanently: {}",
                    classified.message
                );
                let connection = session.fail(classified);
                drop(session);
                if let Some(connection) = connection {
                    close_quietly(connection).await;
                }
            } else {
                tracing::warn!(
                    attempt,
                    "MCP reconnection failed, retrying on next health check: {}",
                    classified.message
                );
                session.state = SessionState::Connected;
                session.last_error = Some(classified);
            }
        }
    }
}
