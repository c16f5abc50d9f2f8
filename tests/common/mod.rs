//! Scripted transport, connection and process runner doubles

#![allow(dead_code)]

use async_trait::async_trait;
use mcp_session::error::{TransportError, TransportResult};
use mcp_session::transport::preflight::{ProbeCommand, ProbeOutput, ProcessRunner};
use mcp_session::transport::{McpConnection, McpTransport, TransportType};
use rmcp::model::ClientInfo;
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What the next connect call does
#[derive(Debug, Clone)]
pub enum Step {
    Connect,
    /// Succeed, but the connection fails to close
    ConnectFailingClose,
    /// Fail the handshake with this text
    Fail(&'static str),
    /// Succeed after a delay
    Slow(Duration),
    /// Never complete
    Hang,
}

pub struct FakeTransport {
    transport_type: TransportType,
    steps: Mutex<VecDeque<Step>>,
    connects: AtomicUsize,
    closes: Arc<AtomicUsize>,
    links: Mutex<Vec<Arc<AtomicBool>>>,
}

impl FakeTransport {
    pub fn new(transport_type: TransportType, steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            transport_type,
            steps: Mutex::new(steps.into()),
            connects: AtomicUsize::new(0),
            closes: Arc::new(AtomicUsize::new(0)),
            links: Mutex::new(Vec::new()),
        })
    }

    /// Make the most recent connection report an empty identifier
    pub fn kill_latest(&self) {
        if let Some(link) = self.links.lock().unwrap().last() {
            link.store(false, Ordering::SeqCst);
        }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn open(&self, fail_close: bool) -> Box<dyn McpConnection> {
        let alive = Arc::new(AtomicBool::new(true));
        self.links.lock().unwrap().push(Arc::clone(&alive));
        Box::new(FakeConnection {
            id: format!("fake-{}", self.connect_count()),
            alive,
            fail_close,
            closes: Arc::clone(&self.closes),
        })
    }
}

#[async_trait]
impl McpTransport for FakeTransport {
    fn transport_type(&self) -> TransportType {
        self.transport_type
    }

    async fn connect(&self, _client: &ClientInfo) -> TransportResult<Box<dyn McpConnection>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().unwrap().pop_front().unwrap_or(Step::Connect);

        match step {
            Step::Connect => Ok(self.open(false)),
            Step::ConnectFailingClose => Ok(self.open(true)),
            Step::Fail(message) => Err(TransportError::Handshake(message.to_string())),
            Step::Slow(delay) => {
                tokio::time::sleep(delay).await;
                Ok(self.open(false))
            }
            Step::Hang => {
                std::future::pending::<()>().await;
                Err(TransportError::Handshake("unreachable".to_string()))
            }
        }
    }
}

pub struct FakeConnection {
    id: String,
    alive: Arc<AtomicBool>,
    fail_close: bool,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl McpConnection for FakeConnection {
    fn id(&self) -> String {
        if self.alive.load(Ordering::SeqCst) {
            self.id.clone()
        } else {
            String::new()
        }
    }

    async fn close(self: Box<Self>) -> TransportResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            return Err(TransportError::Close("stdin already closed".to_string()));
        }
        Ok(())
    }
}

/// Process runner replaying a fixed outcome
pub struct FakeRunner {
    outcome: Result<ProbeOutput, io::ErrorKind>,
    calls: AtomicUsize,
}

impl FakeRunner {
    pub fn output(stdout: &str, stderr: &str, exit_code: Option<i32>) -> Arc<Self> {
        Arc::new(Self {
            outcome: Ok(ProbeOutput {
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
                exit_code,
                timed_out: exit_code.is_none(),
            }),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn spawn_error(kind: io::ErrorKind) -> Arc<Self> {
        Arc::new(Self {
            outcome: Err(kind),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessRunner for FakeRunner {
    async fn run(&self, _command: &ProbeCommand, _deadline: Duration) -> io::Result<ProbeOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.outcome {
            Ok(output) => Ok(output.clone()),
            Err(kind) => Err(io::Error::new(*kind, "scripted spawn failure")),
        }
    }
}

/// Poll `condition` until it holds or two seconds pass
pub async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}
