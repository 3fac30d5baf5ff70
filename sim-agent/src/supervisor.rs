//! Worker process supervision.
//!
//! The supervisor owns one [`WorkerHandle`] per spawned worker. Each worker
//! gets three tasks:
//!
//! - a writer draining the worker's command queue into its stdin
//! - a reader turning stdout lines into replies and upstream notifications
//! - a monitor waiting for the process to exit
//!
//! A worker that exits while still registered is reported upstream as a
//! failure. Workers removed through [`WorkerSupervisor::terminate`] or
//! [`WorkerSupervisor::terminate_all`] exit silently.

use crate::error::SupervisorError;
use crate::launcher::{LaunchedWorker, WorkerLauncher, WorkerProcess, OOME_MARKER};
use dashmap::DashMap;
use futures_util::future::join_all;
use sim_types::{
    Address, FailureRecord, FailureType, Operation, ResponseType, WorkerCommand, WorkerProcessSpec,
    WorkerReply,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Operations workers (or the supervisor on their behalf) send upstream.
pub type Notification = (Address, Operation);

/// Result of one command as answered by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    /// Outcome reported by the worker.
    pub response_type: ResponseType,
    /// Optional error text.
    pub payload: Option<String>,
}

impl CommandOutcome {
    fn worker_gone(address: Address) -> Self {
        Self {
            response_type: ResponseType::FailureWorkerNotFound,
            payload: Some(format!("worker {address} is gone")),
        }
    }

    fn timed_out(address: Address, timeout: Duration) -> Self {
        Self {
            response_type: ResponseType::FailureWorkerTimeout,
            payload: Some(format!("worker {address} did not answer within {timeout:?}")),
        }
    }
}

/// Bookkeeping for one live worker.
struct WorkerHandle {
    worker_id: String,
    /// Milliseconds since the supervisor epoch.
    last_seen: AtomicU64,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    kill: oneshot::Sender<()>,
    monitor: JoinHandle<()>,
}

struct PendingCommand {
    worker: Address,
    tx: oneshot::Sender<CommandOutcome>,
}

struct Shared {
    workers: DashMap<Address, WorkerHandle>,
    pending: DashMap<u64, PendingCommand>,
    upstream: mpsc::UnboundedSender<Notification>,
    epoch: Instant,
}

impl Shared {
    fn elapsed_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn complete(&self, correlation_id: u64, outcome: CommandOutcome) {
        match self.pending.remove(&correlation_id) {
            Some((_, pending)) => {
                let _ = pending.tx.send(outcome);
            }
            None => tracing::debug!("Reply for unknown command {}", correlation_id),
        }
    }

    fn fail_pending(&self, worker: Address) {
        let ids: Vec<u64> = self
            .pending
            .iter()
            .filter(|entry| entry.worker == worker)
            .map(|entry| *entry.key())
            .collect();
        for id in ids {
            self.complete(id, CommandOutcome::worker_gone(worker));
        }
    }
}

/// Owns the worker processes of one agent.
pub struct WorkerSupervisor {
    agent_index: u32,
    launcher: Arc<dyn WorkerLauncher>,
    shared: Arc<Shared>,
    next_correlation_id: AtomicU64,
}

impl std::fmt::Debug for WorkerSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSupervisor")
            .field("agent_index", &self.agent_index)
            .field("workers", &self.shared.workers.len())
            .field("pending", &self.shared.pending.len())
            .finish_non_exhaustive()
    }
}

impl WorkerSupervisor {
    /// Create a supervisor for agent `agent_index`.
    ///
    /// Returns the supervisor and the receiving end of the upstream channel
    /// carrying worker notifications and exit reports.
    pub fn new(
        agent_index: u32,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (upstream, rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            agent_index,
            launcher,
            shared: Arc::new(Shared {
                workers: DashMap::new(),
                pending: DashMap::new(),
                upstream,
                epoch: Instant::now(),
            }),
            next_correlation_id: AtomicU64::new(1),
        };
        (supervisor, rx)
    }

    /// Launch a worker and register it under its address.
    pub async fn create_worker(&self, spec: &WorkerProcessSpec) -> Result<Address, SupervisorError> {
        let address = Address::worker(self.agent_index, spec.worker_index);
        if self.shared.workers.contains_key(&address) {
            return Err(SupervisorError::AlreadyExists(address));
        }

        let LaunchedWorker {
            stdin,
            stdout,
            process,
            home,
        } = self.launcher.launch(address, spec).await?;
        let worker_id = spec.worker_id(self.agent_index);

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (kill, kill_rx) = oneshot::channel();
        let (registered, registered_rx) = oneshot::channel();
        tokio::spawn(write_commands(address, stdin, command_rx));
        tokio::spawn(read_replies(self.shared.clone(), address, stdout));
        let monitor = tokio::spawn(monitor_exit(
            self.shared.clone(),
            address,
            worker_id.clone(),
            home,
            process,
            registered_rx,
            kill_rx,
        ));

        self.shared.workers.insert(
            address,
            WorkerHandle {
                worker_id,
                last_seen: AtomicU64::new(self.shared.elapsed_millis()),
                commands,
                kill,
                monitor,
            },
        );
        // The monitor only reports exits of registered workers.
        let _ = registered.send(());
        tracing::info!("Created worker {}", address);
        Ok(address)
    }

    /// Run `operation` on the worker at `worker` and wait for its reply.
    ///
    /// `target` is the address the worker sees (the worker itself or one of
    /// its tests). A worker that is unknown or dies first yields a
    /// worker-not-found outcome; one that stays silent for `timeout` yields
    /// a worker-timeout outcome and its command is forgotten.
    pub async fn execute(
        &self,
        worker: Address,
        target: Address,
        operation: Operation,
        timeout: Duration,
    ) -> CommandOutcome {
        let (correlation_id, rx) = match self.deliver_command(worker, target, operation) {
            Ok(delivery) => delivery,
            Err(e) => {
                return CommandOutcome {
                    response_type: ResponseType::FailureWorkerNotFound,
                    payload: Some(e.to_string()),
                }
            }
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => CommandOutcome::worker_gone(worker),
            Err(_) => {
                self.shared.pending.remove(&correlation_id);
                tracing::warn!("Worker {} did not answer command {}", worker, correlation_id);
                CommandOutcome::timed_out(worker, timeout)
            }
        }
    }

    /// Queue `operation` for the worker at `worker`.
    fn deliver_command(
        &self,
        worker: Address,
        target: Address,
        operation: Operation,
    ) -> Result<(u64, oneshot::Receiver<CommandOutcome>), SupervisorError> {
        let handle = self
            .shared
            .workers
            .get(&worker)
            .ok_or(SupervisorError::WorkerNotFound(worker))?;

        let correlation_id = self.next_correlation_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .insert(correlation_id, PendingCommand { worker, tx });

        let command = WorkerCommand {
            correlation_id,
            target,
            operation,
        };
        if handle.commands.send(command).is_err() {
            self.shared.pending.remove(&correlation_id);
            return Err(SupervisorError::WorkerNotFound(worker));
        }
        Ok((correlation_id, rx))
    }

    /// Record that the worker answered a ping.
    pub fn record_ping(&self, worker: Address) {
        if let Some(handle) = self.shared.workers.get(&worker) {
            handle
                .last_seen
                .fetch_max(self.shared.elapsed_millis(), Ordering::Relaxed);
        }
    }

    /// When the worker was last heard from.
    pub fn last_seen(&self, worker: Address) -> Option<Instant> {
        self.shared.workers.get(&worker).map(|handle| {
            self.shared.epoch + Duration::from_millis(handle.last_seen.load(Ordering::Relaxed))
        })
    }

    /// Addresses of all live workers, sorted.
    pub fn worker_addresses(&self) -> Vec<Address> {
        let mut addresses: Vec<Address> =
            self.shared.workers.iter().map(|entry| *entry.key()).collect();
        addresses.sort();
        addresses
    }

    /// Worker id of a live worker.
    pub fn worker_id(&self, worker: Address) -> Option<String> {
        self.shared
            .workers
            .get(&worker)
            .map(|handle| handle.worker_id.clone())
    }

    /// Number of live workers.
    pub fn worker_count(&self) -> usize {
        self.shared.workers.len()
    }

    /// Stop one worker immediately. Unknown addresses are ignored.
    pub async fn terminate(&self, worker: Address) {
        match self.shared.workers.remove(&worker) {
            Some((_, handle)) => stop_worker(worker, handle, Duration::ZERO).await,
            None => tracing::debug!("Terminate of unknown worker {} ignored", worker),
        }
    }

    /// Stop every worker.
    ///
    /// Closes each worker's stdin, gives the processes `grace` to exit on
    /// their own and kills the rest.
    pub async fn terminate_all(&self, grace: Duration) {
        let addresses = self.worker_addresses();
        if addresses.is_empty() {
            return;
        }
        tracing::info!(
            "Terminating {} workers (grace {:?})",
            addresses.len(),
            grace
        );
        let stops = addresses.into_iter().filter_map(|address| {
            self.shared
                .workers
                .remove(&address)
                .map(|(_, handle)| stop_worker(address, handle, grace))
        });
        join_all(stops).await;
    }
}

async fn stop_worker(address: Address, handle: WorkerHandle, grace: Duration) {
    let WorkerHandle {
        commands,
        kill,
        mut monitor,
        ..
    } = handle;
    drop(commands);
    if tokio::time::timeout(grace, &mut monitor).await.is_err() {
        tracing::debug!("Killing worker {}", address);
        let _ = kill.send(());
        let _ = monitor.await;
    }
    tracing::info!("Worker {} stopped", address);
}

async fn write_commands(
    address: Address,
    mut stdin: Box<dyn AsyncWrite + Send + Unpin>,
    mut commands: mpsc::UnboundedReceiver<WorkerCommand>,
) {
    while let Some(command) = commands.recv().await {
        let line = match command.to_line() {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("Dropping unencodable command for {}: {}", address, e);
                continue;
            }
        };
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            tracing::debug!("Command pipe of {} closed: {}", address, e);
            break;
        }
        if let Err(e) = stdin.flush().await {
            tracing::debug!("Command pipe of {} closed: {}", address, e);
            break;
        }
    }
    let _ = stdin.shutdown().await;
}

async fn read_replies(
    shared: Arc<Shared>,
    address: Address,
    stdout: Box<dyn AsyncRead + Send + Unpin>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("Reply pipe of {} failed: {}", address, e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match WorkerReply::from_line(&line) {
            Ok(WorkerReply::Response {
                correlation_id,
                response_type,
                payload,
            }) => shared.complete(
                correlation_id,
                CommandOutcome {
                    response_type,
                    payload,
                },
            ),
            Ok(WorkerReply::Notify { source, operation }) => {
                tracing::debug!("{} from {}", operation.op_type(), source);
                if shared.upstream.send((source, operation)).is_err() {
                    tracing::debug!("Upstream closed, dropping notification from {}", source);
                }
            }
            Err(e) => tracing::warn!("Unparseable output from worker {}: {} ({})", address, line, e),
        }
    }
}

enum Exit {
    Exited(std::io::Result<Option<i32>>),
    Killed,
}

async fn monitor_exit(
    shared: Arc<Shared>,
    address: Address,
    worker_id: String,
    home: Option<PathBuf>,
    mut process: Box<dyn WorkerProcess>,
    registered: oneshot::Receiver<()>,
    kill: oneshot::Receiver<()>,
) {
    let _ = registered.await;
    let exit = tokio::select! {
        status = process.wait() => Exit::Exited(status),
        _ = kill => Exit::Killed,
    };

    let code = match exit {
        Exit::Exited(Ok(code)) => code,
        Exit::Exited(Err(e)) => {
            tracing::warn!("Waiting for worker {} failed: {}", address, e);
            None
        }
        Exit::Killed => {
            if let Err(e) = process.kill().await {
                tracing::warn!("Failed to kill worker {}: {}", address, e);
            }
            shared.fail_pending(address);
            return;
        }
    };

    shared.fail_pending(address);
    if shared.workers.remove(&address).is_none() {
        // Removed by terminate; the exit was requested.
        return;
    }

    let failure_type = match code {
        Some(0) => FailureType::WorkerNormalExit,
        _ if home.as_ref().is_some_and(|h| h.join(OOME_MARKER).exists()) => FailureType::WorkerOom,
        _ => FailureType::WorkerExit,
    };
    let message = match code {
        Some(code) => format!("Worker terminated with exit code {code}"),
        None => "Worker terminated by a signal".to_string(),
    };
    tracing::warn!("Worker {} ({}) exited: {}", address, worker_id, message);

    let record = FailureRecord::new(failure_type, address, worker_id, message);
    if shared
        .upstream
        .send((address, Operation::Failure(record)))
        .is_err()
    {
        tracing::debug!("Upstream closed, exit of {} not reported", address);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use sim_types::{TestPhase, WorkerRole};
    use std::sync::Mutex;
    use tokio::io::{duplex, DuplexStream};

    /// How a fake worker answers commands.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum Behavior {
        /// Reply success; report phase completions.
        Responsive,
        /// Never reply.
        Silent,
        /// Exit with this code on the first command.
        ExitOnCommand(i32),
        /// Exit with this code before the launch returns.
        ExitAtStart(i32),
    }

    struct FakeProcess {
        exit: Option<oneshot::Receiver<Option<i32>>>,
        killed: Arc<Mutex<Vec<Address>>>,
        address: Address,
    }

    #[async_trait]
    impl WorkerProcess for FakeProcess {
        async fn wait(&mut self) -> std::io::Result<Option<i32>> {
            match self.exit.as_mut() {
                Some(exit) => {
                    let code = exit.await.unwrap_or(None);
                    self.exit = None;
                    Ok(code)
                }
                None => std::future::pending().await,
            }
        }

        async fn kill(&mut self) -> std::io::Result<()> {
            self.killed.lock().unwrap().push(self.address);
            self.exit = None;
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeInner {
        launched: Vec<Address>,
        commands: Vec<(Address, Operation)>,
        fail_launch: bool,
    }

    /// Launcher running in-process fake workers over duplex pipes.
    #[derive(Clone)]
    pub(crate) struct FakeLauncher {
        behavior: Behavior,
        inner: Arc<Mutex<FakeInner>>,
        killed: Arc<Mutex<Vec<Address>>>,
    }

    impl FakeLauncher {
        pub(crate) fn new(behavior: Behavior) -> Self {
            Self {
                behavior,
                inner: Arc::new(Mutex::new(FakeInner::default())),
                killed: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub(crate) fn failing() -> Self {
            let launcher = Self::new(Behavior::Responsive);
            launcher.inner.lock().unwrap().fail_launch = true;
            launcher
        }

        pub(crate) fn launched(&self) -> Vec<Address> {
            self.inner.lock().unwrap().launched.clone()
        }

        pub(crate) fn commands(&self) -> Vec<(Address, Operation)> {
            self.inner.lock().unwrap().commands.clone()
        }

        pub(crate) fn killed(&self) -> Vec<Address> {
            self.killed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WorkerLauncher for FakeLauncher {
        async fn launch(
            &self,
            address: Address,
            _spec: &WorkerProcessSpec,
        ) -> Result<LaunchedWorker, SupervisorError> {
            {
                let mut inner = self.inner.lock().unwrap();
                if inner.fail_launch {
                    return Err(SupervisorError::Launch {
                        address,
                        source: std::io::Error::new(std::io::ErrorKind::NotFound, "no script"),
                    });
                }
                inner.launched.push(address);
            }

            let (agent_in, worker_in) = duplex(64 * 1024);
            let (worker_out, agent_out) = duplex(64 * 1024);
            let (exit_tx, exit_rx) = oneshot::channel();
            match self.behavior {
                Behavior::ExitAtStart(code) => {
                    let _ = exit_tx.send(Some(code));
                }
                behavior => {
                    tokio::spawn(fake_worker(
                        behavior,
                        self.inner.clone(),
                        worker_in,
                        worker_out,
                        exit_tx,
                    ));
                }
            }
            Ok(LaunchedWorker {
                stdin: Box::new(agent_in),
                stdout: Box::new(agent_out),
                process: Box::new(FakeProcess {
                    exit: Some(exit_rx),
                    killed: self.killed.clone(),
                    address,
                }),
                home: None,
            })
        }
    }

    async fn fake_worker(
        behavior: Behavior,
        inner: Arc<Mutex<FakeInner>>,
        stdin: DuplexStream,
        mut stdout: DuplexStream,
        exit: oneshot::Sender<Option<i32>>,
    ) {
        let mut lines = BufReader::new(stdin).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let command = WorkerCommand::from_line(&line).unwrap();
            inner
                .lock()
                .unwrap()
                .commands
                .push((command.target, command.operation.clone()));
            match behavior {
                Behavior::Silent => continue,
                Behavior::ExitOnCommand(code) => {
                    let _ = exit.send(Some(code));
                    return;
                }
                Behavior::Responsive | Behavior::ExitAtStart(_) => {}
            }
            let reply = WorkerReply::Response {
                correlation_id: command.correlation_id,
                response_type: ResponseType::Success,
                payload: None,
            };
            stdout
                .write_all(reply.to_line().unwrap().as_bytes())
                .await
                .unwrap();
            if let Operation::StartTestPhase { phase } = command.operation {
                let notify = WorkerReply::Notify {
                    source: command.target,
                    operation: Operation::PhaseCompleted {
                        test_index: command.target.test_index(),
                        phase,
                    },
                };
                stdout
                    .write_all(notify.to_line().unwrap().as_bytes())
                    .await
                    .unwrap();
            }
        }
        // stdin closed: exit normally
        let _ = exit.send(Some(0));
    }

    fn supervisor(launcher: &FakeLauncher) -> (WorkerSupervisor, mpsc::UnboundedReceiver<Notification>) {
        WorkerSupervisor::new(1, Arc::new(launcher.clone()))
    }

    #[tokio::test]
    async fn create_and_deliver() {
        let launcher = FakeLauncher::new(Behavior::Responsive);
        let (supervisor, mut upstream) = supervisor(&launcher);

        let address = supervisor
            .create_worker(&WorkerProcessSpec::new(1, WorkerRole::Member))
            .await
            .unwrap();
        assert_eq!(address, Address::worker(1, 1));
        assert_eq!(supervisor.worker_id(address).unwrap(), "C_A1_W1-member");

        let target = Address::test(1, 1, 2);
        let outcome = supervisor
            .execute(
                address,
                target,
                Operation::StartTestPhase {
                    phase: TestPhase::Setup,
                },
                Duration::from_secs(5),
            )
            .await;
        assert_eq!(outcome.response_type, ResponseType::Success);

        let (source, op) = upstream.recv().await.unwrap();
        assert_eq!(source, target);
        assert_eq!(
            op,
            Operation::PhaseCompleted {
                test_index: 2,
                phase: TestPhase::Setup
            }
        );
        assert_eq!(launcher.commands().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_and_failed_launches_are_errors() {
        let launcher = FakeLauncher::new(Behavior::Responsive);
        let (supervisor, _upstream) = supervisor(&launcher);
        let spec = WorkerProcessSpec::new(1, WorkerRole::Member);
        supervisor.create_worker(&spec).await.unwrap();
        assert!(matches!(
            supervisor.create_worker(&spec).await,
            Err(SupervisorError::AlreadyExists(_))
        ));

        let failing = FakeLauncher::failing();
        let (supervisor, _upstream) = WorkerSupervisor::new(1, Arc::new(failing));
        assert!(matches!(
            supervisor.create_worker(&spec).await,
            Err(SupervisorError::Launch { .. })
        ));
        assert_eq!(supervisor.worker_count(), 0);
    }

    #[tokio::test]
    async fn deliver_to_unknown_worker_fails() {
        let launcher = FakeLauncher::new(Behavior::Responsive);
        let (supervisor, _upstream) = supervisor(&launcher);
        let outcome = supervisor
            .execute(
                Address::worker(1, 9),
                Address::worker(1, 9),
                Operation::StopTest,
                Duration::from_secs(1),
            )
            .await;
        assert_eq!(outcome.response_type, ResponseType::FailureWorkerNotFound);
        assert!(outcome.payload.unwrap().contains("C_A1_W9"));
    }

    #[tokio::test]
    async fn record_ping_moves_last_seen_forward() {
        let launcher = FakeLauncher::new(Behavior::Responsive);
        let (supervisor, _upstream) = supervisor(&launcher);
        let address = supervisor
            .create_worker(&WorkerProcessSpec::new(1, WorkerRole::Member))
            .await
            .unwrap();

        let before = supervisor.last_seen(address).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        supervisor.record_ping(address);
        assert!(supervisor.last_seen(address).unwrap() > before);

        supervisor.record_ping(Address::worker(1, 7));
        assert!(supervisor.last_seen(Address::worker(1, 7)).is_none());
    }

    #[tokio::test]
    async fn unexpected_exit_is_reported_and_fails_pending() {
        let launcher = FakeLauncher::new(Behavior::ExitOnCommand(137));
        let (supervisor, mut upstream) = supervisor(&launcher);
        let address = supervisor
            .create_worker(&WorkerProcessSpec::new(1, WorkerRole::Member))
            .await
            .unwrap();

        let outcome = supervisor
            .execute(address, address, Operation::Ping { timestamp: 1 }, Duration::from_secs(5))
            .await;
        assert_eq!(outcome.response_type, ResponseType::FailureWorkerNotFound);

        let (source, op) = upstream.recv().await.unwrap();
        assert_eq!(source, address);
        match op {
            Operation::Failure(record) => {
                assert_eq!(record.failure_type, FailureType::WorkerExit);
                assert_eq!(record.worker_id, "C_A1_W1-member");
                assert!(record.message.contains("137"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(supervisor.worker_count(), 0);
    }

    #[tokio::test]
    async fn terminate_is_silent_and_idempotent() {
        let launcher = FakeLauncher::new(Behavior::Responsive);
        let (supervisor, mut upstream) = supervisor(&launcher);
        let address = supervisor
            .create_worker(&WorkerProcessSpec::new(1, WorkerRole::Member))
            .await
            .unwrap();

        supervisor.terminate(address).await;
        supervisor.terminate(address).await;
        supervisor.terminate(Address::worker(1, 42)).await;
        assert_eq!(supervisor.worker_count(), 0);
        assert!(upstream.try_recv().is_err());
    }

    #[tokio::test]
    async fn terminate_all_lets_workers_exit_within_grace() {
        let launcher = FakeLauncher::new(Behavior::Silent);
        let (supervisor, mut upstream) = supervisor(&launcher);
        for index in 1..=2 {
            supervisor
                .create_worker(&WorkerProcessSpec::new(index, WorkerRole::Member))
                .await
                .unwrap();
        }
        let (_, pending) = supervisor
            .deliver_command(Address::worker(1, 1), Address::worker(1, 1), Operation::StopTest)
            .unwrap();

        // Silent workers still exit once stdin closes.
        supervisor.terminate_all(Duration::from_secs(1)).await;
        assert_eq!(supervisor.worker_count(), 0);
        assert!(launcher.killed().is_empty());
        assert_eq!(
            pending.await.unwrap().response_type,
            ResponseType::FailureWorkerNotFound
        );
        assert!(upstream.try_recv().is_err());
    }

    #[tokio::test]
    async fn terminate_all_kills_after_grace() {
        let launcher = FakeLauncher::new(Behavior::Responsive);
        let (supervisor, _upstream) = supervisor(&launcher);
        supervisor
            .create_worker(&WorkerProcessSpec::new(1, WorkerRole::Member))
            .await
            .unwrap();

        supervisor.terminate_all(Duration::ZERO).await;
        assert_eq!(launcher.killed(), vec![Address::worker(1, 1)]);
        assert_eq!(launcher.launched(), vec![Address::worker(1, 1)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn exit_right_after_launch_is_reported() {
        for _ in 0..50 {
            let launcher = FakeLauncher::new(Behavior::ExitAtStart(127));
            let (supervisor, mut upstream) = supervisor(&launcher);
            let address = supervisor
                .create_worker(&WorkerProcessSpec::new(1, WorkerRole::Member))
                .await
                .unwrap();

            let (source, op) = tokio::time::timeout(Duration::from_secs(5), upstream.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(source, address);
            match op {
                Operation::Failure(record) => {
                    assert_eq!(record.failure_type, FailureType::WorkerExit);
                    assert!(record.message.contains("127"));
                }
                other => panic!("unexpected: {other:?}"),
            }
            assert_eq!(supervisor.worker_count(), 0);
        }
    }

    #[tokio::test]
    async fn silent_worker_times_out_and_command_is_dropped() {
        let launcher = FakeLauncher::new(Behavior::Silent);
        let (supervisor, _upstream) = supervisor(&launcher);
        let address = supervisor
            .create_worker(&WorkerProcessSpec::new(1, WorkerRole::Member))
            .await
            .unwrap();

        for _ in 0..3 {
            let outcome = supervisor
                .execute(address, address, Operation::Ping { timestamp: 1 }, Duration::from_millis(30))
                .await;
            assert_eq!(outcome.response_type, ResponseType::FailureWorkerTimeout);
        }
        assert!(supervisor.shared.pending.is_empty());
        assert_eq!(supervisor.worker_count(), 1);
        assert_eq!(launcher.commands().len(), 3);
    }
}
