//! Handles operations addressed to the agent itself.

use crate::config::AgentConfig;
use crate::supervisor::WorkerSupervisor;
use sim_types::{Operation, ResponseType};
use std::sync::Arc;
use std::time::Duration;

/// Executes agent-level operations.
#[derive(Debug)]
pub struct AgentOperationProcessor {
    config: Arc<AgentConfig>,
    supervisor: Arc<WorkerSupervisor>,
}

impl AgentOperationProcessor {
    /// Create a processor.
    pub fn new(config: Arc<AgentConfig>, supervisor: Arc<WorkerSupervisor>) -> Self {
        Self { config, supervisor }
    }

    /// Execute `operation` and return its outcome with an optional payload.
    pub async fn process(&self, operation: Operation) -> (ResponseType, Option<String>) {
        match operation {
            Operation::Log { message } => {
                tracing::info!("[coordinator] {}", message);
                (ResponseType::Success, None)
            }
            Operation::Ping { .. } => (ResponseType::Success, None),
            Operation::CreateWorker {
                specs,
                startup_delay_ms,
            } => {
                let delay = Duration::from_millis(startup_delay_ms);
                for (i, spec) in specs.iter().enumerate() {
                    if i > 0 && !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    if let Err(e) = self.supervisor.create_worker(spec).await {
                        tracing::error!("Failed to create worker: {}", e);
                        return (
                            ResponseType::ExceptionDuringOperationExecution,
                            Some(e.to_string()),
                        );
                    }
                }
                (ResponseType::Success, None)
            }
            Operation::TerminateWorkers {
                member_shutdown_delay,
            } => {
                let grace = if member_shutdown_delay {
                    self.config.member_shutdown_delay
                } else {
                    Duration::ZERO
                };
                self.supervisor.terminate_all(grace).await;
                (ResponseType::Success, None)
            }
            Operation::CreateTest { .. }
            | Operation::StartTestPhase { .. }
            | Operation::StartTest { .. }
            | Operation::StopTest
            | Operation::PhaseCompleted { .. }
            | Operation::Failure(_)
            | Operation::IntegrationTest { .. } => {
                tracing::warn!("Unsupported operation on agent: {}", operation.op_type());
                (ResponseType::UnsupportedOperationOnThisProcessor, None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::tests::{Behavior, FakeLauncher};
    use sim_types::{Address, WorkerProcessSpec, WorkerRole};

    fn processor(launcher: &FakeLauncher) -> (AgentOperationProcessor, Arc<WorkerSupervisor>) {
        let (supervisor, _upstream) = WorkerSupervisor::new(1, Arc::new(launcher.clone()));
        let supervisor = Arc::new(supervisor);
        let mut config = AgentConfig::new(1);
        config.member_shutdown_delay = Duration::from_millis(200);
        (
            AgentOperationProcessor::new(Arc::new(config), supervisor.clone()),
            supervisor,
        )
    }

    fn specs(count: u32) -> Vec<WorkerProcessSpec> {
        (1..=count)
            .map(|i| WorkerProcessSpec::new(i, WorkerRole::Member))
            .collect()
    }

    #[tokio::test]
    async fn unsupported_operation() {
        let launcher = FakeLauncher::new(Behavior::Responsive);
        let (processor, _) = processor(&launcher);
        let (response, _) = processor
            .process(Operation::IntegrationTest {
                data: "ignored".into(),
            })
            .await;
        assert_eq!(response, ResponseType::UnsupportedOperationOnThisProcessor);
    }

    #[tokio::test]
    async fn create_worker_spawns_every_spec() {
        let launcher = FakeLauncher::new(Behavior::Responsive);
        let (processor, supervisor) = processor(&launcher);
        let (response, payload) = processor
            .process(Operation::CreateWorker {
                specs: specs(3),
                startup_delay_ms: 5,
            })
            .await;
        assert_eq!(response, ResponseType::Success);
        assert!(payload.is_none());
        assert_eq!(
            supervisor.worker_addresses(),
            vec![Address::worker(1, 1), Address::worker(1, 2), Address::worker(1, 3)]
        );
    }

    #[tokio::test]
    async fn create_worker_failure_is_an_exception() {
        let launcher = FakeLauncher::failing();
        let (processor, _) = processor(&launcher);
        let (response, payload) = processor
            .process(Operation::CreateWorker {
                specs: specs(1),
                startup_delay_ms: 0,
            })
            .await;
        assert_eq!(response, ResponseType::ExceptionDuringOperationExecution);
        assert!(payload.unwrap().contains("C_A1_W1"));
    }

    #[tokio::test]
    async fn terminate_workers_clears_supervisor() {
        let launcher = FakeLauncher::new(Behavior::Responsive);
        let (processor, supervisor) = processor(&launcher);
        processor
            .process(Operation::CreateWorker {
                specs: specs(2),
                startup_delay_ms: 0,
            })
            .await;

        let (response, _) = processor
            .process(Operation::TerminateWorkers {
                member_shutdown_delay: true,
            })
            .await;
        assert_eq!(response, ResponseType::Success);
        assert_eq!(supervisor.worker_count(), 0);

        // Nothing left to terminate
        let (response, _) = processor
            .process(Operation::TerminateWorkers {
                member_shutdown_delay: false,
            })
            .await;
        assert_eq!(response, ResponseType::Success);
    }

    #[tokio::test]
    async fn log_and_ping_succeed() {
        let launcher = FakeLauncher::new(Behavior::Responsive);
        let (processor, _) = processor(&launcher);
        let (response, _) = processor
            .process(Operation::Log {
                message: "Starting test".into(),
            })
            .await;
        assert_eq!(response, ResponseType::Success);
        let (response, _) = processor.process(Operation::Ping { timestamp: 0 }).await;
        assert_eq!(response, ResponseType::Success);
    }
}
