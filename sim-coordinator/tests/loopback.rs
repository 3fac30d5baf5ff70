//! End-to-end runs over loopback TCP: a real coordinator drives an
//! in-process agent whose workers are simulated on duplex pipes.

use async_trait::async_trait;
use sim_agent::{
    AgentConfig, AgentConnector, LaunchedWorker, SupervisorError, WorkerLauncher, WorkerProcess,
};
use sim_coordinator::{Coordinator, CoordinatorParameters, SimulatorProperties};
use sim_core::{ClusterLayoutParameters, RunConfiguration, TestSuite};
use sim_types::{
    Address, AgentData, FailureType, Operation, ResponseType, TestCase, TestPhase, WorkerCommand,
    WorkerProcessSpec, WorkerReply,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

struct PipeProcess {
    exit: Option<oneshot::Receiver<i32>>,
}

#[async_trait]
impl WorkerProcess for PipeProcess {
    async fn wait(&mut self) -> std::io::Result<Option<i32>> {
        match self.exit.as_mut() {
            Some(exit) => {
                let code = exit.await.ok();
                self.exit = None;
                Ok(code)
            }
            None => std::future::pending().await,
        }
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        self.exit = None;
        Ok(())
    }
}

/// Launches workers that behave like a well-mannered test harness; the
/// worker with index `crash_on_start` exits as soon as its test starts.
struct PipeLauncher {
    crash_on_start: Option<u32>,
}

#[async_trait]
impl WorkerLauncher for PipeLauncher {
    async fn launch(
        &self,
        address: Address,
        _spec: &WorkerProcessSpec,
    ) -> Result<LaunchedWorker, SupervisorError> {
        let (agent_in, worker_in) = duplex(64 * 1024);
        let (worker_out, agent_out) = duplex(64 * 1024);
        let (exit_tx, exit_rx) = oneshot::channel();
        let crash = self.crash_on_start == Some(address.worker_index());
        tokio::spawn(pipe_worker(crash, worker_in, worker_out, exit_tx));
        Ok(LaunchedWorker {
            stdin: Box::new(agent_in),
            stdout: Box::new(agent_out),
            process: Box::new(PipeProcess {
                exit: Some(exit_rx),
            }),
            home: None,
        })
    }
}

async fn reply(stdout: &mut DuplexStream, reply: WorkerReply) {
    let _ = stdout.write_all(reply.to_line().unwrap().as_bytes()).await;
}

async fn pipe_worker(
    crash_on_start: bool,
    stdin: DuplexStream,
    mut stdout: DuplexStream,
    exit: oneshot::Sender<i32>,
) {
    let mut warmup: HashMap<u32, bool> = HashMap::new();
    let mut lines = BufReader::new(stdin).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let command = WorkerCommand::from_line(&line).unwrap();
        let target = command.target;
        if crash_on_start && matches!(command.operation, Operation::StartTest { .. }) {
            let _ = exit.send(1);
            return;
        }

        reply(
            &mut stdout,
            WorkerReply::Response {
                correlation_id: command.correlation_id,
                response_type: ResponseType::Success,
                payload: None,
            },
        )
        .await;

        let completed = match command.operation {
            Operation::StartTestPhase { phase } => Some(phase),
            Operation::StartTest { warmup: w, .. } => {
                warmup.insert(target.test_index(), w);
                None
            }
            Operation::StopTest => match warmup.remove(&target.test_index()) {
                Some(true) => Some(TestPhase::LocalWarmup),
                _ => Some(TestPhase::Run),
            },
            _ => None,
        };
        if let Some(phase) = completed {
            reply(
                &mut stdout,
                WorkerReply::Notify {
                    source: target,
                    operation: Operation::PhaseCompleted {
                        test_index: target.test_index(),
                        phase,
                    },
                },
            )
            .await;
        }
    }
    let _ = exit.send(0);
}

async fn start_agent(crash_on_start: Option<u32>) -> (Arc<AgentConnector>, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let mut config = AgentConfig::new(1);
    config.port = port;
    config.member_shutdown_delay = Duration::from_millis(500);
    let agent = Arc::new(AgentConnector::new(
        config,
        Arc::new(PipeLauncher { crash_on_start }),
    ));
    let serving = agent.clone();
    tokio::spawn(async move { serving.serve(listener).await });
    (agent, port)
}

fn parameters(port: u16, output: &std::path::Path, tests: &[&str]) -> CoordinatorParameters {
    let properties = SimulatorProperties {
        agent_port: port,
        worker_ping_interval_secs: 1,
        worker_ping_missed_intervals: 2,
        response_timeout_secs: 5,
        agent_start_timeout_secs: 5,
        ..SimulatorProperties::default()
    };
    let mut layout = ClusterLayoutParameters::new(1);
    layout.member_worker_count = Some(1);
    layout.client_worker_count = 1;

    let run = RunConfiguration {
        duration: Duration::from_millis(300),
        ..RunConfiguration::default()
    };
    let tests = tests
        .iter()
        .map(|id| {
            let mut test = TestCase::new(*id);
            test.set_property("class", "MapTest");
            test
        })
        .collect();

    CoordinatorParameters {
        properties,
        run,
        layout,
        suite: TestSuite {
            id: "loopback".into(),
            tests,
        },
        agents: vec![AgentData::new(1, "127.0.0.1", "127.0.0.1")],
        output_dir: output.to_path_buf(),
        start_agents: false,
        skip_download: true,
        after_completion: None,
    }
}

#[tokio::test]
async fn suite_runs_through_every_phase() {
    let (agent, port) = start_agent(None).await;
    let output = tempfile::tempdir().unwrap();
    let coordinator = Coordinator::new(parameters(port, output.path(), &["map", "queue"]));

    let outcome = coordinator.run().await.unwrap();
    assert_eq!(outcome.failure_count, 0);
    assert!(!outcome.is_failure());

    let registry = coordinator.registry();
    assert_eq!(registry.worker_count(), 2);
    for test in registry.tests() {
        let phases: Vec<TestPhase> = test.completed_phases.into_iter().collect();
        assert_eq!(phases, TestPhase::ALL.to_vec(), "test {}", test.test_case.id);
    }

    // Workers were terminated at the end of the run.
    assert_eq!(agent.supervisor().worker_count(), 0);
}

#[tokio::test]
async fn crashed_worker_fails_the_run() {
    let (agent, port) = start_agent(Some(2)).await;
    let output = tempfile::tempdir().unwrap();
    let coordinator = Coordinator::new(parameters(port, output.path(), &["map"]));

    let outcome = coordinator.run().await.unwrap();
    assert!(outcome.has_critical_failure);
    assert!(outcome.is_failure());

    let failures = coordinator.failures().failures();
    let exit = failures
        .iter()
        .find(|f| f.failure_type == FailureType::WorkerExit)
        .expect("worker exit reported");
    assert_eq!(exit.address, Address::worker(1, 2));

    let test = coordinator.registry().test(1).unwrap();
    assert!(!test.completed_phases.contains(&TestPhase::GlobalVerify));
    assert!(output.path().join("failures-loopback.txt").exists());
    assert_eq!(agent.supervisor().worker_count(), 0);
}
