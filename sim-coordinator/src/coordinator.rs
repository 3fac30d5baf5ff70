//! Top-level coordinator run.
//!
//! Computes the layout, brings up agents and workers, runs the suite and
//! always tears everything down again. Teardown problems are logged and never
//! replace the error that ended the run.

use crate::config::SimulatorProperties;
use crate::connector::CoordinatorConnector;
use crate::counters::OperationTypeCounter;
use crate::engine::RunSuiteTask;
use crate::error::{CoordinatorError, Result};
use crate::failure::FailureContainer;
use crate::listeners::TestPhaseListeners;
use crate::registry::ComponentRegistry;
use crate::remote_client::{RemoteClient, RemoteClientSettings, RemoteDispatch};
use crate::tasks;
use futures_util::future::join_all;
use sim_core::{ClusterLayout, ClusterLayoutParameters, RunConfiguration, TestSuite};
use sim_types::AgentData;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const LATE_FAILURE_POLLS: u32 = 10;
const LATE_FAILURE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Everything a coordinator run needs, assembled before the run starts.
#[derive(Debug, Clone)]
pub struct CoordinatorParameters {
    /// Simulator properties.
    pub properties: SimulatorProperties,
    /// Immutable run settings.
    pub run: RunConfiguration,
    /// Worker placement inputs; the agent count is taken from `agents`.
    pub layout: ClusterLayoutParameters,
    /// Tests to run.
    pub suite: TestSuite,
    /// Agent machines.
    pub agents: Vec<AgentData>,
    /// Directory for failure files and downloaded artifacts.
    pub output_dir: PathBuf,
    /// Start and stop the agent processes; off when agents are already up.
    pub start_agents: bool,
    /// Skip downloading worker directories at the end.
    pub skip_download: bool,
    /// Script run with the output directory once everything is done.
    pub after_completion: Option<PathBuf>,
}

/// Result of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    /// Failures recorded, informational ones excluded.
    pub failure_count: usize,
    /// True if a critical failure was recorded.
    pub has_critical_failure: bool,
    /// Whether fail-fast was requested.
    pub fail_fast: bool,
}

impl RunOutcome {
    /// True if the process should exit non-zero.
    pub fn is_failure(&self) -> bool {
        self.has_critical_failure && self.fail_fast
    }
}

/// Drives one run of a test suite.
#[derive(Debug)]
pub struct Coordinator {
    params: CoordinatorParameters,
    registry: Arc<ComponentRegistry>,
    failures: Arc<FailureContainer>,
    listeners: Arc<TestPhaseListeners>,
    counters: Arc<OperationTypeCounter>,
}

impl Coordinator {
    /// Create a coordinator.
    pub fn new(params: CoordinatorParameters) -> Self {
        let failures = Arc::new(FailureContainer::new(
            params.suite.id.clone(),
            Some(params.output_dir.clone()),
            params.run.tolerable_failures.clone(),
        ));
        Self {
            params,
            registry: Arc::new(ComponentRegistry::new()),
            failures,
            listeners: Arc::new(TestPhaseListeners::new()),
            counters: Arc::new(OperationTypeCounter::new()),
        }
    }

    /// Failures of this run.
    pub fn failures(&self) -> &Arc<FailureContainer> {
        &self.failures
    }

    /// Registry of this run.
    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    /// Execute the run.
    ///
    /// # Errors
    ///
    /// Returns an error if the layout is invalid, agents or workers cannot
    /// be started, or a test could not be created.
    pub async fn run(&self) -> Result<RunOutcome> {
        let mut layout_params = self.params.layout.clone();
        layout_params.agent_count = self.params.agents.len();
        let layout = ClusterLayout::compute(&layout_params)?;
        tracing::info!("Cluster layout:\n{}", layout);

        self.registry.add_agents(self.params.agents.iter().cloned());
        self.registry.add_tests(&self.params.suite.tests);
        tokio::fs::create_dir_all(&self.params.output_dir).await?;

        let agents = self.registry.agents();
        if self.params.start_agents {
            tasks::start_agents(&agents, &self.params.suite.id, &self.params.properties).await?;
        }

        let result = self.run_with_agents(&layout).await;

        if self.params.start_agents {
            tasks::stop_agents(&agents, &self.params.properties).await;
        }
        if !self.params.skip_download {
            if let Err(e) = tasks::download(
                &agents,
                &self.params.suite.id,
                &self.params.output_dir,
                &self.params.properties,
            )
            .await
            {
                tracing::warn!("Artifact download failed: {}", e);
            }
        }
        if let Some(script) = &self.params.after_completion {
            if let Err(e) = tasks::run_after_completion(script, &self.params.output_dir).await {
                tracing::warn!("After-completion script failed: {}", e);
            }
        }
        self.counters.log_statistics();

        result?;
        Ok(RunOutcome {
            failure_count: self.failures.failure_count(),
            has_critical_failure: self.failures.has_critical_failure(),
            fail_fast: self.params.run.fail_fast,
        })
    }

    async fn run_with_agents(&self, layout: &ClusterLayout) -> Result<()> {
        let properties = &self.params.properties;
        let connector = Arc::new(CoordinatorConnector::new(
            self.registry.clone(),
            self.failures.clone(),
            self.listeners.clone(),
            self.counters.clone(),
            properties.response_timeout(),
        ));
        let client = Arc::new(RemoteClient::new(
            connector.clone(),
            self.registry.clone(),
            self.failures.clone(),
            RemoteClientSettings::from_properties(properties),
        ));

        let result = self.run_suite(&connector, &client, layout).await;
        if matches!(result, Err(ref e) if !matches!(e, CoordinatorError::Setup(_))) {
            self.wait_for_late_failures().await;
        }

        self.failures.log_failure_info();
        client.terminate_workers(true).await;
        connector.shutdown().await;
        result
    }

    async fn run_suite(
        &self,
        connector: &Arc<CoordinatorConnector>,
        client: &Arc<RemoteClient>,
        layout: &ClusterLayout,
    ) -> Result<()> {
        let properties = &self.params.properties;
        let agents = self.registry.agents();
        let connects = agents.iter().map(|agent| {
            connector.add_agent(
                agent.address_index,
                &agent.public_address,
                properties.agent_port,
                properties.agent_start_timeout(),
            )
        });
        for result in join_all(connects).await {
            result.map_err(|e| CoordinatorError::Setup(e.to_string()))?;
        }

        client
            .create_workers(layout, self.params.run.worker_startup_delay)
            .await
            .map_err(|e| CoordinatorError::Setup(e.to_string()))?;
        client.start_ping_loop();

        let dispatch: Arc<dyn RemoteDispatch> = client.clone();
        RunSuiteTask::new(
            Arc::new(self.params.run.clone()),
            self.registry.clone(),
            self.failures.clone(),
            self.listeners.clone(),
            dispatch,
        )
        .with_teardown_timeout(properties.worker_timeout())
        .run()
        .await?;
        Ok(())
    }

    /// Give a failure report explaining an error time to arrive.
    async fn wait_for_late_failures(&self) {
        for _ in 0..LATE_FAILURE_POLLS {
            if self.failures.failure_count() > 0 {
                return;
            }
            tokio::time::sleep(LATE_FAILURE_POLL_INTERVAL).await;
        }
    }
}
