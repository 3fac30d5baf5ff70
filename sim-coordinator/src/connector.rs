//! Coordinator side of the coordinator/agent connections.
//!
//! The coordinator holds one persistent TCP connection per agent. Requests
//! are matched to responses by correlation id; a reader task per connection
//! resolves pending requests and processes operations the agent sends up
//! (phase completions, failures, log lines).

use crate::counters::OperationTypeCounter;
use crate::error::ConnectorError;
use crate::failure::FailureContainer;
use crate::listeners::TestPhaseListeners;
use crate::registry::ComponentRegistry;
use dashmap::DashMap;
use sim_types::{
    read_frame, write_frame, Address, AddressLevel, Envelope, Frame, Operation, Response,
    ResponseType,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(500);

type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

struct AgentConnection {
    writer: SharedWriter,
    reader: JoinHandle<()>,
}

struct PendingRequest {
    agent_index: u32,
    tx: oneshot::Sender<Response>,
}

/// State shared between the connector and its reader tasks.
struct Shared {
    registry: Arc<ComponentRegistry>,
    failures: Arc<FailureContainer>,
    listeners: Arc<TestPhaseListeners>,
    counters: Arc<OperationTypeCounter>,
    pending: DashMap<u64, PendingRequest>,
    shutting_down: AtomicBool,
}

/// Connections from the coordinator to every agent.
pub struct CoordinatorConnector {
    shared: Arc<Shared>,
    agents: DashMap<u32, AgentConnection>,
    next_correlation_id: AtomicU64,
    response_timeout: Duration,
}

impl std::fmt::Debug for CoordinatorConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorConnector")
            .field("agents", &self.agents.len())
            .field("pending", &self.shared.pending.len())
            .field("response_timeout", &self.response_timeout)
            .finish_non_exhaustive()
    }
}

impl CoordinatorConnector {
    /// Create a connector with no agent connections yet.
    pub fn new(
        registry: Arc<ComponentRegistry>,
        failures: Arc<FailureContainer>,
        listeners: Arc<TestPhaseListeners>,
        counters: Arc<OperationTypeCounter>,
        response_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry,
                failures,
                listeners,
                counters,
                pending: DashMap::new(),
                shutting_down: AtomicBool::new(false),
            }),
            agents: DashMap::new(),
            next_correlation_id: AtomicU64::new(1),
            response_timeout,
        }
    }

    /// Connect to an agent, retrying until `connect_timeout` has elapsed.
    pub async fn add_agent(
        &self,
        agent_index: u32,
        host: &str,
        port: u16,
        connect_timeout: Duration,
    ) -> Result<(), ConnectorError> {
        let address = format!("{host}:{port}");
        let deadline = Instant::now() + connect_timeout;
        let stream = loop {
            match TcpStream::connect(&address).await {
                Ok(stream) => break stream,
                Err(e) if Instant::now() + CONNECT_RETRY_INTERVAL < deadline => {
                    tracing::debug!("Agent {} not reachable at {} yet: {}", agent_index, address, e);
                    tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                }
                Err(e) => {
                    return Err(ConnectorError::Connect {
                        agent: agent_index,
                        address,
                        source: e,
                    })
                }
            }
        };
        stream.set_nodelay(true).map_err(|e| ConnectorError::Connect {
            agent: agent_index,
            address: address.clone(),
            source: e,
        })?;

        let (read_half, write_half) = stream.into_split();
        let writer: SharedWriter = Arc::new(Mutex::new(write_half));
        let reader = tokio::spawn(read_loop(
            self.shared.clone(),
            agent_index,
            read_half,
            writer.clone(),
        ));
        self.agents.insert(agent_index, AgentConnection { writer, reader });

        tracing::info!("Connected to agent {} at {}", Address::agent(agent_index), address);
        Ok(())
    }

    /// Indices of connected agents, ascending.
    pub fn agent_indices(&self) -> Vec<u32> {
        let mut indices: Vec<u32> = self.agents.iter().map(|e| *e.key()).collect();
        indices.sort_unstable();
        indices
    }

    /// Operation counters.
    pub fn counters(&self) -> &OperationTypeCounter {
        &self.shared.counters
    }

    /// Send `operation` to a concrete agent, worker or test and await the
    /// response with the default timeout.
    pub async fn send(
        &self,
        target: Address,
        operation: &Operation,
    ) -> Result<Response, ConnectorError> {
        self.send_with_timeout(target, operation, self.response_timeout)
            .await
    }

    /// Like [`send`](Self::send) with an explicit timeout.
    pub async fn send_with_timeout(
        &self,
        target: Address,
        operation: &Operation,
        timeout: Duration,
    ) -> Result<Response, ConnectorError> {
        let agent_index = target.agent_index();
        if target.level() == AddressLevel::Coordinator || agent_index == 0 {
            return Err(ConnectorError::NotConcrete(target));
        }
        let writer = self
            .agents
            .get(&agent_index)
            .map(|c| c.writer.clone())
            .ok_or(ConnectorError::UnknownAgent(agent_index))?;

        let correlation_id = self.next_correlation_id.fetch_add(1, Ordering::Relaxed);
        let envelope = Envelope::new(Address::COORDINATOR, target, correlation_id, operation)?;
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .insert(correlation_id, PendingRequest { agent_index, tx });

        tracing::debug!(
            "Sending {} to {} (correlation_id={})",
            operation.op_type(),
            target,
            correlation_id
        );
        self.shared.counters.record_sent(operation.op_type());
        let written = {
            let mut writer = writer.lock().await;
            write_frame(&mut *writer, &Frame::Request(envelope)).await
        };
        if let Err(e) = written {
            self.shared.pending.remove(&correlation_id);
            return Err(e.into());
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ConnectorError::ConnectionClosed(agent_index)),
            Err(_) => {
                self.shared.pending.remove(&correlation_id);
                Err(ConnectorError::Timeout {
                    target,
                    correlation_id,
                })
            }
        }
    }

    /// Close every connection. Pending requests fail with
    /// [`ConnectorError::ConnectionClosed`].
    pub async fn shutdown(&self) {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        let indices = self.agent_indices();
        for agent_index in indices {
            if let Some((_, connection)) = self.agents.remove(&agent_index) {
                connection.reader.abort();
                if let Err(e) = connection.writer.lock().await.shutdown().await {
                    tracing::debug!("Closing connection to agent {}: {}", agent_index, e);
                }
            }
        }
        self.shared.pending.clear();
        tracing::info!("Coordinator connector shut down");
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    agent_index: u32,
    mut reader: OwnedReadHalf,
    writer: SharedWriter,
) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(Frame::Response(response))) => {
                match shared.pending.remove(&response.correlation_id) {
                    Some((_, pending)) => {
                        let _ = pending.tx.send(response);
                    }
                    None => tracing::debug!(
                        "Dropping late response for request {}",
                        response.correlation_id
                    ),
                }
            }
            Ok(Some(Frame::Request(envelope))) => {
                let response = shared.process(&envelope);
                let mut writer = writer.lock().await;
                if let Err(e) = write_frame(&mut *writer, &Frame::Response(response)).await {
                    tracing::warn!("Could not answer agent {}: {}", agent_index, e);
                }
            }
            Ok(None) => break,
            Err(e) => {
                if !shared.shutting_down.load(Ordering::SeqCst) {
                    tracing::warn!("Connection to agent {} failed: {}", agent_index, e);
                }
                break;
            }
        }
    }

    if !shared.shutting_down.load(Ordering::SeqCst) {
        tracing::warn!("Agent {} closed its connection", Address::agent(agent_index));
    }
    // Dropping the senders fails the requests still waiting on this agent.
    shared.pending.retain(|_, pending| pending.agent_index != agent_index);
}

impl Shared {
    /// Handle an operation sent up by an agent or worker.
    fn process(&self, envelope: &Envelope) -> Response {
        let operation = match envelope.operation() {
            Ok(operation) => operation,
            Err(e) => {
                tracing::warn!("Undecodable operation from {}: {}", envelope.source, e);
                return Response::with_payload(
                    envelope.correlation_id,
                    Address::COORDINATOR,
                    ResponseType::UnsupportedOperationOnThisProcessor,
                    e.to_string(),
                );
            }
        };
        self.counters.record_received(operation.op_type());

        let response_type = match operation {
            Operation::PhaseCompleted { test_index, phase } => {
                self.registry.record_phase_completed(test_index, phase);
                self.listeners.update_phase_completion(test_index, phase);
                ResponseType::Success
            }
            Operation::Failure(record) => {
                if record.failure_type.is_worker_gone() {
                    self.registry.mark_finished(record.address);
                }
                self.failures.add(record);
                ResponseType::Success
            }
            Operation::Log { message } => {
                tracing::info!("[{}] {}", envelope.source, message);
                ResponseType::Success
            }
            Operation::Ping { .. } => ResponseType::Success,
            Operation::CreateWorker { .. }
            | Operation::TerminateWorkers { .. }
            | Operation::CreateTest { .. }
            | Operation::StartTestPhase { .. }
            | Operation::StartTest { .. }
            | Operation::StopTest
            | Operation::IntegrationTest { .. } => {
                tracing::warn!(
                    "Unsupported {} from {} on coordinator",
                    envelope.operation_type().map(|t| t.to_string()).unwrap_or_default(),
                    envelope.source
                );
                ResponseType::UnsupportedOperationOnThisProcessor
            }
        };
        Response::single(envelope.correlation_id, Address::COORDINATOR, response_type)
    }
}
