//! Context strategies
//!
//! Which context governs connection setup, and whether the transport keeps
//! a long-lived connection that needs health monitoring.

use super::TransportType;
use crate::context::OperationContext;
use std::fmt;
use std::sync::Arc;

pub trait ContextStrategy: Send + Sync + fmt::Debug {
    /// Context the connection's lifetime is derived from
    fn connection_context(&self, caller: &OperationContext) -> OperationContext;

    /// Context for an individual request on an established connection
    fn operation_context(&self, caller: &OperationContext) -> OperationContext {
        caller.clone()
    }

    /// True for streaming transports that hold a connection open
    fn requires_persistent_connection(&self) -> bool;
}

/// Subprocess servers: the caller's context throughout
#[derive(Debug, Clone, Copy, Default)]
pub struct StdioStrategy;

impl ContextStrategy for StdioStrategy {
    fn connection_context(&self, caller: &OperationContext) -> OperationContext {
        caller.clone()
    }

    fn requires_persistent_connection(&self) -> bool {
        false
    }
}

/// Request/response HTTP: the caller's context throughout
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpStrategy;

impl ContextStrategy for HttpStrategy {
    fn connection_context(&self, caller: &OperationContext) -> OperationContext {
        caller.clone()
    }

    fn requires_persistent_connection(&self) -> bool {
        false
    }
}

/// Server-sent events
///
/// The stream outlives the call that opened it, so its context is detached
/// from the caller: a caller timeout must not tear down the stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct SseStrategy;

impl ContextStrategy for SseStrategy {
    fn connection_context(&self, caller: &OperationContext) -> OperationContext {
        caller.detached()
    }

    fn requires_persistent_connection(&self) -> bool {
        true
    }
}

/// Strategy for a transport kind
pub fn strategy_for(transport_type: TransportType) -> Arc<dyn ContextStrategy> {
    match transport_type {
        TransportType::Stdio => Arc::new(StdioStrategy),
        TransportType::Http | TransportType::StreamableHttp => Arc::new(HttpStrategy),
        TransportType::Sse => Arc::new(SseStrategy),
    }
}
