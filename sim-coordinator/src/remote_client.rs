//! Run-scoped dispatch on top of the coordinator connector.
//!
//! Fan-out calls send one request per target concurrently and wait for all
//! of them. A branch that times out, loses its connection or hits a routing
//! miss is reported as a worker-timeout failure; a branch whose handler
//! failed is reported as a worker-exception failure. Neither stops the
//! other branches nor fails the call.

use crate::config::SimulatorProperties;
use crate::connector::CoordinatorConnector;
use crate::error::{ConnectorError, DispatchError, DispatchResult};
use crate::failure::FailureContainer;
use crate::registry::ComponentRegistry;
use async_trait::async_trait;
use futures_util::future::join_all;
use sim_core::ClusterLayout;
use sim_types::{
    Address, AddressLevel, FailureRecord, FailureType, Operation, Response, ResponseType,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;

/// Operations the phase engine needs from the remote side.
#[async_trait]
pub trait RemoteDispatch: Send + Sync {
    /// Send to every worker of the run.
    async fn send_to_all_workers(&self, operation: &Operation) -> DispatchResult<()>;

    /// Send to the given test on every worker.
    async fn send_to_test_on_all_workers(
        &self,
        test_id: &str,
        operation: &Operation,
    ) -> DispatchResult<()>;

    /// Send to the given test on the representative worker only.
    async fn send_to_test_on_first_worker(
        &self,
        test_id: &str,
        operation: &Operation,
    ) -> DispatchResult<()>;

    /// Send to one concrete worker or (worker, test) address. Unlike the
    /// fan-out calls, a failure is returned to the caller.
    async fn send_to_worker(&self, target: Address, operation: &Operation)
        -> DispatchResult<Response>;

    /// Log a line locally and on every agent.
    async fn log_on_all_agents(&self, message: &str);

    /// Terminate every worker. Calls after the first do nothing.
    async fn terminate_workers(&self, member_shutdown_delay: bool);
}

/// Timing settings of the dispatch client.
#[derive(Debug, Clone)]
pub struct RemoteClientSettings {
    /// Interval between liveness pings.
    pub ping_interval: Duration,
    /// Missed intervals before a worker counts as timed out.
    pub ping_missed_intervals: u32,
    /// Grace period given to member workers on termination.
    pub member_shutdown_delay: Duration,
    /// Per-request timeout.
    pub response_timeout: Duration,
}

impl RemoteClientSettings {
    /// Settings taken from the simulator properties.
    pub fn from_properties(properties: &SimulatorProperties) -> Self {
        Self {
            ping_interval: properties.worker_ping_interval(),
            ping_missed_intervals: properties.worker_ping_missed_intervals,
            member_shutdown_delay: properties.member_worker_shutdown_delay(),
            response_timeout: properties.response_timeout(),
        }
    }

    /// Silence after which a worker is reported as timed out.
    pub fn worker_timeout(&self) -> Duration {
        self.ping_interval * self.ping_missed_intervals
    }
}

/// [`RemoteDispatch`] over real agent connections.
pub struct RemoteClient {
    connector: Arc<CoordinatorConnector>,
    registry: Arc<ComponentRegistry>,
    failures: Arc<FailureContainer>,
    settings: RemoteClientSettings,
    ping_task: Mutex<Option<JoinHandle<()>>>,
    terminated: AtomicBool,
}

impl std::fmt::Debug for RemoteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteClient")
            .field("settings", &self.settings)
            .field("terminated", &self.terminated.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl RemoteClient {
    /// Create a client. The ping loop is not started yet.
    pub fn new(
        connector: Arc<CoordinatorConnector>,
        registry: Arc<ComponentRegistry>,
        failures: Arc<FailureContainer>,
        settings: RemoteClientSettings,
    ) -> Self {
        Self {
            connector,
            registry,
            failures,
            settings,
            ping_task: Mutex::new(None),
            terminated: AtomicBool::new(false),
        }
    }

    /// Ask every agent to spawn the workers the layout assigns to it and
    /// register them. Agents are matched to layout positions in index order.
    pub async fn create_workers(
        &self,
        layout: &ClusterLayout,
        startup_delay: Duration,
    ) -> DispatchResult<()> {
        let agents = self.registry.agents();
        let sends = layout
            .agents()
            .iter()
            .zip(agents.iter())
            .filter(|(placement, _)| !placement.workers.is_empty())
            .map(|(placement, agent)| {
                let operation = Operation::CreateWorker {
                    specs: placement.workers.clone(),
                    startup_delay_ms: startup_delay.as_millis() as u64,
                };
                // Spawning is sequential on the agent, so allow for the delays.
                let timeout = self.settings.response_timeout
                    + startup_delay * placement.workers.len() as u32;
                let agent_index = agent.address_index;
                async move {
                    tracing::info!(
                        "Creating {} workers on {} ({})",
                        placement.workers.len(),
                        agent.address(),
                        agent.public_address
                    );
                    let result = self
                        .connector
                        .send_with_timeout(agent.address(), &operation, timeout)
                        .await;
                    (agent_index, placement, result)
                }
            });

        for (agent_index, placement, result) in join_all(sends).await {
            let response = result?;
            if let Some(part) = response.first_error() {
                return Err(DispatchError::Rejected {
                    address: part.address,
                    response_type: part.response_type,
                    message: part.payload.clone().unwrap_or_default(),
                });
            }
            self.registry.add_workers(agent_index, &placement.workers);
        }
        tracing::info!("{} workers started", self.registry.worker_count());
        Ok(())
    }

    /// Start the background liveness-ping loop.
    pub fn start_ping_loop(self: &Arc<Self>) {
        let client = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(client.settings.ping_interval);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                client.ping_workers().await;
            }
        });
        tracing::info!(
            "Worker ping loop started (interval={:?}, timeout={:?})",
            self.settings.ping_interval,
            self.settings.worker_timeout()
        );
        if let Some(previous) = self.ping_slot().replace(handle) {
            previous.abort();
        }
    }

    fn ping_slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.ping_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn stop_ping_loop(&self) {
        if let Some(handle) = self.ping_slot().take() {
            handle.abort();
        }
    }

    /// Ping every live worker once, then report workers that have been
    /// silent for longer than the worker timeout.
    pub async fn ping_workers(&self) {
        let workers: Vec<_> = self
            .registry
            .workers()
            .into_iter()
            .filter(|w| !w.finished)
            .collect();

        let operation = Operation::Ping {
            timestamp: now_millis(),
        };
        let timeout = self.settings.ping_interval;
        let pings = workers.iter().map(|worker| {
            let operation = &operation;
            async move {
                let result = self
                    .connector
                    .send_with_timeout(worker.address, operation, timeout)
                    .await;
                (worker.address, result)
            }
        });
        for (address, result) in join_all(pings).await {
            match result {
                Ok(response) if response.is_success() => {
                    self.registry.record_pong(address, Instant::now());
                }
                Ok(response) => tracing::debug!(
                    "Ping to {} answered {:?}",
                    address,
                    response.first_error().map(|p| p.response_type)
                ),
                Err(e) => tracing::debug!("Ping to {} failed: {}", address, e),
            }
        }

        self.check_worker_timeouts(Instant::now());
    }

    /// Report every live worker silent for longer than the worker timeout.
    /// Each worker is reported at most once.
    pub fn check_worker_timeouts(&self, now: Instant) {
        let timeout = self.settings.worker_timeout();
        for worker in self.registry.workers() {
            if worker.finished || worker.timeout_reported {
                continue;
            }
            let silent = now.saturating_duration_since(worker.last_seen);
            if silent > timeout && self.registry.mark_timeout_reported(worker.address) {
                self.failures.add(FailureRecord::new(
                    FailureType::WorkerTimeout,
                    worker.address,
                    worker.worker_id.clone(),
                    format!(
                        "Worker has not sent a ping response for {} seconds",
                        silent.as_secs()
                    ),
                ));
            }
        }
    }

    fn test_index(&self, test_id: &str) -> DispatchResult<u32> {
        self.registry
            .test_by_id(test_id)
            .map(|t| t.test_index)
            .ok_or_else(|| DispatchError::UnknownTest(test_id.to_string()))
    }

    fn worker_id(&self, address: Address) -> String {
        address
            .ancestor_at(AddressLevel::Worker)
            .and_then(|w| self.registry.worker(w))
            .map(|w| w.worker_id)
            .unwrap_or_else(|| address.to_string())
    }

    /// Send to every target concurrently and absorb branch failures.
    async fn fan_out(&self, targets: Vec<Address>, test_id: Option<&str>, operation: &Operation) {
        let sends = targets.into_iter().map(|target| async move {
            (target, self.connector.send(target, operation).await)
        });
        for (target, result) in join_all(sends).await {
            self.absorb(target, test_id, operation, result);
        }
    }

    fn absorb(
        &self,
        target: Address,
        test_id: Option<&str>,
        operation: &Operation,
        result: Result<Response, ConnectorError>,
    ) {
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.report(
                    FailureType::WorkerTimeout,
                    target,
                    test_id,
                    format!("{} to {} failed: {}", operation.op_type(), target, e),
                );
                return;
            }
        };
        for part in response.parts.iter().filter(|p| !p.response_type.is_success()) {
            let detail = part.payload.as_deref().unwrap_or("no details");
            match part.response_type {
                ResponseType::ExceptionDuringOperationExecution => self.report(
                    FailureType::WorkerException,
                    part.address,
                    test_id,
                    format!("{} failed on {}: {}", operation.op_type(), part.address, detail),
                ),
                ResponseType::UnsupportedOperationOnThisProcessor => tracing::warn!(
                    "{} is not supported by {}",
                    operation.op_type(),
                    part.address
                ),
                other => self.report(
                    FailureType::WorkerTimeout,
                    part.address,
                    test_id,
                    format!("{} to {} answered {}: {}", operation.op_type(), target, other, detail),
                ),
            }
        }
    }

    fn report(&self, failure_type: FailureType, address: Address, test_id: Option<&str>, message: String) {
        let worker = address.ancestor_at(AddressLevel::Worker).unwrap_or(address);
        let mut failure = FailureRecord::new(failure_type, worker, self.worker_id(address), message);
        if let Some(test_id) = test_id {
            failure = failure.with_test_id(test_id);
        }
        self.failures.add(failure);
    }
}

#[async_trait]
impl RemoteDispatch for RemoteClient {
    async fn send_to_all_workers(&self, operation: &Operation) -> DispatchResult<()> {
        let targets = self.registry.worker_addresses();
        if targets.is_empty() {
            return Err(DispatchError::NoWorkers);
        }
        let test_id = match operation {
            Operation::CreateTest { test_case, .. } => Some(test_case.id.as_str()),
            _ => None,
        };
        self.fan_out(targets, test_id, operation).await;
        Ok(())
    }

    async fn send_to_test_on_all_workers(
        &self,
        test_id: &str,
        operation: &Operation,
    ) -> DispatchResult<()> {
        let test_index = self.test_index(test_id)?;
        let targets: Vec<Address> = self
            .registry
            .worker_addresses()
            .into_iter()
            .map(|w| Address::test(w.agent_index(), w.worker_index(), test_index))
            .collect();
        if targets.is_empty() {
            return Err(DispatchError::NoWorkers);
        }
        self.fan_out(targets, Some(test_id), operation).await;
        Ok(())
    }

    async fn send_to_test_on_first_worker(
        &self,
        test_id: &str,
        operation: &Operation,
    ) -> DispatchResult<()> {
        let test_index = self.test_index(test_id)?;
        let first = self.registry.first_worker().ok_or(DispatchError::NoWorkers)?;
        let target = Address::test(first.agent_index(), first.worker_index(), test_index);
        self.fan_out(vec![target], Some(test_id), operation).await;
        Ok(())
    }

    async fn send_to_worker(
        &self,
        target: Address,
        operation: &Operation,
    ) -> DispatchResult<Response> {
        let response = self.connector.send(target, operation).await?;
        if let Some(part) = response.first_error() {
            return Err(DispatchError::Rejected {
                address: part.address,
                response_type: part.response_type,
                message: part.payload.clone().unwrap_or_default(),
            });
        }
        Ok(response)
    }

    async fn log_on_all_agents(&self, message: &str) {
        tracing::info!("{}", message);
        let operation = Operation::Log {
            message: message.to_string(),
        };
        let sends = self.connector.agent_indices().into_iter().map(|agent_index| {
            let operation = &operation;
            async move {
                let target = Address::agent(agent_index);
                if let Err(e) = self.connector.send(target, operation).await {
                    tracing::warn!("Could not log on {}: {}", target, e);
                }
            }
        });
        join_all(sends).await;
    }

    async fn terminate_workers(&self, member_shutdown_delay: bool) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            tracing::debug!("Workers already terminated");
            return;
        }
        self.stop_ping_loop();

        let operation = Operation::TerminateWorkers {
            member_shutdown_delay,
        };
        let mut timeout = self.settings.response_timeout;
        if member_shutdown_delay {
            timeout += self.settings.member_shutdown_delay;
        }
        tracing::info!("Terminating workers...");
        let sends = self.connector.agent_indices().into_iter().map(|agent_index| {
            let operation = &operation;
            async move {
                let target = Address::agent(agent_index);
                match self.connector.send_with_timeout(target, operation, timeout).await {
                    Ok(response) if response.is_success() => {}
                    Ok(response) => tracing::warn!(
                        "Terminating workers on {} answered {:?}",
                        target,
                        response.first_error().map(|p| p.response_type)
                    ),
                    Err(e) => tracing::warn!("Could not terminate workers on {}: {}", target, e),
                }
            }
        });
        join_all(sends).await;

        for worker in self.registry.workers() {
            self.registry.mark_finished(worker.address);
        }
        tracing::info!("Workers terminated");
    }
}
