//! Agent side of the coordinator/agent connection.
//!
//! The agent listens for the coordinator and serves one connection at a
//! time. Each request is handled on its own task so a slow worker never
//! blocks other requests; responses are written back in completion order.
//! Worker notifications (phase completions, failures) and exit reports are
//! forwarded to the coordinator as requests of their own.

use crate::config::AgentConfig;
use crate::error::Result;
use crate::launcher::WorkerLauncher;
use crate::processor::AgentOperationProcessor;
use crate::supervisor::{Notification, WorkerSupervisor};
use futures_util::future::join_all;
use sim_types::{
    read_frame, write_frame, Address, AddressLevel, Envelope, Frame, Operation, Response,
    ResponsePart, ResponseType,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};

type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

struct Shared {
    config: Arc<AgentConfig>,
    supervisor: Arc<WorkerSupervisor>,
    processor: AgentOperationProcessor,
    notifications: Arc<Mutex<mpsc::UnboundedReceiver<Notification>>>,
    next_correlation_id: AtomicU64,
}

/// Accepts the coordinator connection and routes its requests.
pub struct AgentConnector {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for AgentConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConnector")
            .field("address", &self.shared.config.address())
            .field("supervisor", &self.shared.supervisor)
            .finish_non_exhaustive()
    }
}

impl AgentConnector {
    /// Create a connector whose workers are started by `launcher`.
    pub fn new(config: AgentConfig, launcher: Arc<dyn WorkerLauncher>) -> Self {
        let config = Arc::new(config);
        let (supervisor, notifications) = WorkerSupervisor::new(config.address_index, launcher);
        let supervisor = Arc::new(supervisor);
        let processor = AgentOperationProcessor::new(config.clone(), supervisor.clone());
        Self {
            shared: Arc::new(Shared {
                config,
                supervisor,
                processor,
                notifications: Arc::new(Mutex::new(notifications)),
                next_correlation_id: AtomicU64::new(1),
            }),
        }
    }

    /// Routing address of this agent.
    pub fn address(&self) -> Address {
        self.shared.config.address()
    }

    /// The agent's worker supervisor.
    pub fn supervisor(&self) -> &Arc<WorkerSupervisor> {
        &self.shared.supervisor
    }

    /// Accept coordinator connections until the listener fails.
    ///
    /// Connections are served one after another; a coordinator that
    /// reconnects picks up the same workers.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        tracing::info!(
            "Agent {} listening on {}",
            self.address(),
            listener.local_addr()?
        );
        loop {
            let (stream, peer) = listener.accept().await?;
            tracing::info!("Coordinator connected from {}", peer);
            if let Err(e) = self.handle_connection(stream).await {
                tracing::warn!("Coordinator connection failed: {}", e);
            }
            tracing::info!("Coordinator {} disconnected", peer);
        }
    }

    /// Serve one coordinator connection until it closes.
    pub async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        stream.set_nodelay(true)?;
        let (mut reader, writer) = stream.into_split();
        let writer: SharedWriter = Arc::new(Mutex::new(writer));
        let forwarder = tokio::spawn(forward_notifications(self.shared.clone(), writer.clone()));

        let result = loop {
            match read_frame(&mut reader).await {
                Ok(Some(Frame::Request(envelope))) => {
                    let shared = self.shared.clone();
                    let writer = writer.clone();
                    tokio::spawn(async move {
                        let response = shared.handle_request(envelope).await;
                        let mut writer = writer.lock().await;
                        if let Err(e) = write_frame(&mut *writer, &Frame::Response(response)).await
                        {
                            tracing::debug!("Could not send response: {}", e);
                        }
                    });
                }
                Ok(Some(Frame::Response(response))) => {
                    if let Some(part) = response.first_error() {
                        tracing::warn!(
                            "Coordinator rejected notification {}: {}",
                            response.correlation_id,
                            part.response_type
                        );
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e.into()),
            }
        };

        forwarder.abort();
        result
    }

    /// Terminate all workers, giving them `grace` to exit.
    pub async fn shutdown(&self, grace: Duration) {
        self.shared.supervisor.terminate_all(grace).await;
    }
}

async fn forward_notifications(shared: Arc<Shared>, writer: SharedWriter) {
    let mut notifications = shared.notifications.clone().lock_owned().await;
    while let Some((source, operation)) = notifications.recv().await {
        let correlation_id = shared.next_correlation_id.fetch_add(1, Ordering::Relaxed);
        let envelope = match Envelope::new(source, Address::COORDINATOR, correlation_id, &operation)
        {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Dropping notification from {}: {}", source, e);
                continue;
            }
        };
        let mut writer = writer.lock().await;
        if let Err(e) = write_frame(&mut *writer, &Frame::Request(envelope)).await {
            tracing::warn!(
                "Lost {} from {}, coordinator unreachable: {}",
                operation.op_type(),
                source,
                e
            );
            break;
        }
    }
}

impl Shared {
    async fn handle_request(&self, envelope: Envelope) -> Response {
        let correlation_id = envelope.correlation_id;
        let target = envelope.target;
        let own = self.config.address();

        let operation = match envelope.operation() {
            Ok(operation) => operation,
            Err(e) => {
                tracing::warn!("Undecodable request {}: {}", correlation_id, e);
                return Response::with_payload(
                    correlation_id,
                    own,
                    ResponseType::ExceptionDuringOperationExecution,
                    e.to_string(),
                );
            }
        };
        tracing::debug!("{} for {}", operation.op_type(), target);

        if target.level() == AddressLevel::Coordinator {
            return Response::single(
                correlation_id,
                target,
                ResponseType::FailureCoordinatorNotFound,
            );
        }
        if target.agent_index() != 0 && target.agent_index() != own.agent_index() {
            return Response::single(correlation_id, target, ResponseType::FailureAgentNotFound);
        }

        match target.level() {
            AddressLevel::Agent => {
                let (response_type, payload) = self.processor.process(operation).await;
                Response {
                    correlation_id,
                    parts: vec![ResponsePart {
                        address: own,
                        response_type,
                        payload,
                    }],
                }
            }
            _ => self.route_to_workers(correlation_id, target, operation).await,
        }
    }

    async fn route_to_workers(
        &self,
        correlation_id: u64,
        target: Address,
        operation: Operation,
    ) -> Response {
        let pattern = match target.ancestor_at(AddressLevel::Worker) {
            Some(pattern) => pattern,
            None => return Response::single(correlation_id, target, ResponseType::FailureWorkerNotFound),
        };
        let workers: Vec<Address> = self
            .supervisor
            .worker_addresses()
            .into_iter()
            .filter(|worker| pattern.matches(worker))
            .collect();
        if workers.is_empty() {
            return Response::single(correlation_id, target, ResponseType::FailureWorkerNotFound);
        }

        let is_ping = matches!(operation, Operation::Ping { .. });
        let deliveries = workers.into_iter().map(|worker| {
            let concrete = match target.level() {
                AddressLevel::Test => {
                    Address::test(worker.agent_index(), worker.worker_index(), target.test_index())
                }
                _ => worker,
            };
            let operation = operation.clone();
            async move {
                let outcome = self
                    .supervisor
                    .execute(worker, concrete, operation, self.config.command_timeout)
                    .await;
                if is_ping && outcome.response_type.is_success() {
                    self.supervisor.record_ping(worker);
                }
                ResponsePart {
                    address: concrete,
                    response_type: outcome.response_type,
                    payload: outcome.payload,
                }
            }
        });

        Response {
            correlation_id,
            parts: join_all(deliveries).await,
        }
    }
}
