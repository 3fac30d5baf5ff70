//! Worker process launching.
//!
//! The [`WorkerLauncher`] trait is the seam between the supervisor and the
//! operating system: [`ProcessLauncher`] spawns the configured worker script,
//! tests plug in launchers that run fake workers in-process.

use crate::config::AgentConfig;
use crate::error::SupervisorError;
use async_trait::async_trait;
use serde::Serialize;
use sim_types::{Address, WorkerProcessSpec};
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

/// File name of the descriptor written into every worker home.
pub const WORKER_DESCRIPTOR: &str = "worker.json";

/// File a worker creates when it ran out of memory.
pub const OOME_MARKER: &str = "worker.oome";

/// A running worker process.
#[async_trait]
pub trait WorkerProcess: Send {
    /// Wait for the process to exit. Returns the exit code, `None` if it was
    /// ended by a signal.
    async fn wait(&mut self) -> io::Result<Option<i32>>;

    /// Kill the process and reap it.
    async fn kill(&mut self) -> io::Result<()>;
}

#[async_trait]
impl WorkerProcess for Child {
    async fn wait(&mut self) -> io::Result<Option<i32>> {
        Child::wait(self).await.map(|status| status.code())
    }

    async fn kill(&mut self) -> io::Result<()> {
        Child::kill(self).await
    }
}

/// Pipes and process handle of a freshly launched worker.
pub struct LaunchedWorker {
    /// Command pipe into the worker.
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    /// Reply pipe out of the worker.
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    /// Process handle.
    pub process: Box<dyn WorkerProcess>,
    /// Home directory of the worker, if it has one.
    pub home: Option<PathBuf>,
}

impl std::fmt::Debug for LaunchedWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchedWorker")
            .field("home", &self.home)
            .finish_non_exhaustive()
    }
}

/// Starts worker processes.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Start the worker described by `spec` at `address`.
    async fn launch(
        &self,
        address: Address,
        spec: &WorkerProcessSpec,
    ) -> Result<LaunchedWorker, SupervisorError>;
}

/// Contents of `worker.json` in the worker home.
#[derive(Debug, Serialize)]
struct WorkerDescriptor<'a> {
    address: String,
    worker_id: &'a str,
    role: &'a str,
    agent_public_address: &'a str,
    jvm_options: &'a str,
    config_overrides: &'a BTreeMap<String, String>,
}

/// Spawns the configured worker script, one process per worker.
///
/// Each worker gets `<workers_home>/<suite_id>/<worker_id>` as its working
/// directory, a `worker.json` descriptor in it, and stderr redirected to
/// `worker.err`. The process is killed if its handle is dropped.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    config: Arc<AgentConfig>,
}

impl ProcessLauncher {
    /// Create a launcher for the given agent.
    pub fn new(config: Arc<AgentConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(
        &self,
        address: Address,
        spec: &WorkerProcessSpec,
    ) -> Result<LaunchedWorker, SupervisorError> {
        let launch_error = |source: io::Error| SupervisorError::Launch { address, source };

        let worker_id = spec.worker_id(address.agent_index());
        let home = self.config.worker_home(&worker_id);
        tokio::fs::create_dir_all(&home).await.map_err(launch_error)?;

        let descriptor = WorkerDescriptor {
            address: address.to_string(),
            worker_id: &worker_id,
            role: spec.role.as_str(),
            agent_public_address: &self.config.public_address,
            jvm_options: &spec.jvm_options,
            config_overrides: &spec.config_overrides,
        };
        let json = serde_json::to_vec_pretty(&descriptor).map_err(sim_types::SimError::from)?;
        tokio::fs::write(home.join(WORKER_DESCRIPTOR), json)
            .await
            .map_err(launch_error)?;

        let stderr = std::fs::File::create(home.join("worker.err")).map_err(launch_error)?;
        let mut child = Command::new(self.config.worker_script())
            .current_dir(&home)
            .env("WORKER_ADDRESS", address.to_string())
            .env("WORKER_ID", &worker_id)
            .env("WORKER_ROLE", spec.role.as_str())
            .env("WORKER_JVM_OPTIONS", &spec.jvm_options)
            .env("WORKER_HOME", &home)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(launch_error)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| launch_error(io::Error::other("worker stdin not captured")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| launch_error(io::Error::other("worker stdout not captured")))?;

        tracing::info!(
            "Launched worker {} ({}) pid={:?}",
            worker_id,
            address,
            child.id()
        );
        Ok(LaunchedWorker {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            process: Box::new(child),
            home: Some(home),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sim_types::WorkerRole;
    use std::os::unix::fs::PermissionsExt;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn config_with_script(dir: &std::path::Path, body: &str) -> Arc<AgentConfig> {
        let script = dir.join("worker.sh");
        std::fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = AgentConfig::new(1);
        config.workers_home = dir.join("workers");
        config.suite_id = "suite".into();
        config.worker_script = script;
        Arc::new(config)
    }

    #[tokio::test]
    async fn process_launcher_prepares_home_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with_script(dir.path(), "read line; echo \"$WORKER_ID $line\"");
        let launcher = ProcessLauncher::new(config.clone());

        let mut spec = WorkerProcessSpec::new(2, WorkerRole::Client);
        spec.jvm_options = "-Xmx1g".into();
        let mut worker = launcher.launch(Address::worker(1, 2), &spec).await.unwrap();

        worker.stdin.write_all(b"hello\n").await.unwrap();
        let mut lines = BufReader::new(worker.stdout).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        assert_eq!(line, "C_A1_W2-client hello");
        assert_eq!(worker.process.wait().await.unwrap(), Some(0));

        let home = config.worker_home("C_A1_W2-client");
        assert_eq!(worker.home.as_deref(), Some(home.as_path()));
        let descriptor = std::fs::read_to_string(home.join(WORKER_DESCRIPTOR)).unwrap();
        assert!(descriptor.contains("\"role\": \"client\""));
        assert!(descriptor.contains("-Xmx1g"));
    }

    #[tokio::test]
    async fn exit_code_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ProcessLauncher::new(config_with_script(dir.path(), "exit 3"));
        let spec = WorkerProcessSpec::new(1, WorkerRole::Member);
        let mut worker = launcher.launch(Address::worker(1, 1), &spec).await.unwrap();
        assert_eq!(worker.process.wait().await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn missing_script_is_a_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::new(1);
        config.workers_home = dir.path().to_path_buf();
        config.worker_script = dir.path().join("does-not-exist.sh");
        let launcher = ProcessLauncher::new(Arc::new(config));

        let spec = WorkerProcessSpec::new(1, WorkerRole::Member);
        let err = launcher
            .launch(Address::worker(1, 1), &spec)
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Launch { .. }));
    }
}
