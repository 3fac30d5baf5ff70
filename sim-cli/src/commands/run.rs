//! `simulator run`: execute a test suite on the agent machines.

use anyhow::{Context, Result};
use clap::{ArgAction, Args};
use sim_coordinator::{Coordinator, CoordinatorParameters, RunOutcome, SimulatorProperties};
use sim_core::{
    parse_agents_file, parse_duration, parse_overrides, ClusterLayoutParameters,
    RunConfiguration, TargetSelection, TargetType, TestSuite,
};
use sim_types::{FailureType, TestPhase};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Arguments of the `run` command.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Test suite file with `testId.property=value` lines
    #[arg(default_value = "test.properties")]
    pub suite_file: PathBuf,

    /// Agents file with one `publicAddress[,privateAddress]` per line
    #[arg(long, default_value = "agents.txt")]
    pub agents_file: PathBuf,

    /// Run duration (`30s`, `5m`, `1h`, `1d` or seconds; 0 runs until the test stops)
    #[arg(long, default_value = "60s")]
    pub duration: String,

    /// Timed warmup before the run, same format as --duration
    #[arg(long, default_value = "0s")]
    pub warmup: String,

    /// Wait for the test to finish on its own; --duration becomes an upper bound
    #[arg(long)]
    pub wait_for_test_case: bool,

    /// Run all tests of the suite at the same time
    #[arg(long)]
    pub parallel: bool,

    /// Stop the suite on the first critical failure
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub fail_fast: bool,

    /// Run the verify phases
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub verify_enabled: bool,

    /// Last phase parallel tests wait for each other on
    #[arg(long, default_value_t = TestPhase::last())]
    pub sync_to_phase: TestPhase,

    /// Workers that generate load: all, member, client or prefer_client
    #[arg(long, default_value_t = TargetType::PreferClient)]
    pub target_type: TargetType,

    /// Number of load generating workers (0 = all of --target-type)
    #[arg(long, default_value_t = 0)]
    pub target_count: usize,

    /// Member workers to start (default: one per member machine)
    #[arg(long)]
    pub members: Option<u32>,

    /// Lite member workers to start
    #[arg(long, default_value_t = 0)]
    pub lite_members: u32,

    /// Client workers to start
    #[arg(long, default_value_t = 0)]
    pub clients: u32,

    /// Agents reserved for member workers
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub dedicated_member_machines: i32,

    /// Options passed to member workers
    #[arg(long, default_value = "")]
    pub member_args: String,

    /// Options passed to client workers
    #[arg(long, default_value = "")]
    pub client_args: String,

    /// Failure types that do not fail the run
    #[arg(long, default_value = "workerTimeout")]
    pub tolerable_failures: String,

    /// Comma-separated `key=value` properties applied to every test
    #[arg(long, default_value = "")]
    pub overrides: String,

    /// Suite id (default: start time, `yyyy-MM-dd__HH_mm_ss`)
    #[arg(long)]
    pub suite_id: Option<String>,

    /// Milliseconds between spawning workers on one agent
    #[arg(long, default_value_t = 0)]
    pub worker_startup_delay_ms: u64,

    /// Output directory (default: ./<suite id>)
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Agents are already running; do not start or stop them
    #[arg(long)]
    pub no_agent_start: bool,

    /// Do not download worker directories after the run
    #[arg(long)]
    pub skip_download: bool,

    /// Script executed with the output directory once the run is done
    #[arg(long)]
    pub after_completion: Option<PathBuf>,
}

/// Default suite id: the local start time.
pub fn default_suite_id() -> String {
    chrono::Local::now().format("%Y-%m-%d__%H_%M_%S").to_string()
}

/// Read and validate everything a run needs. Nothing remote happens here.
pub fn prepare(properties_path: &Path, args: &RunArgs) -> Result<CoordinatorParameters> {
    let properties = SimulatorProperties::load_or_default(properties_path)
        .context("Failed to load simulator properties")?;

    let agents_text = std::fs::read_to_string(&args.agents_file)
        .with_context(|| format!("Failed to read agents file {}", args.agents_file.display()))?;
    let agents = parse_agents_file(&agents_text)
        .with_context(|| format!("Invalid agents file {}", args.agents_file.display()))?;

    let suite_id = args.suite_id.clone().unwrap_or_else(default_suite_id);
    let suite_text = std::fs::read_to_string(&args.suite_file)
        .with_context(|| format!("Failed to read test suite {}", args.suite_file.display()))?;
    let mut suite = TestSuite::parse(suite_id.clone(), &suite_text)
        .with_context(|| format!("Invalid test suite {}", args.suite_file.display()))?;
    let overrides = parse_overrides(&args.overrides).context("Invalid --overrides")?;
    suite.apply_overrides(&overrides);

    let duration = parse_duration(&args.duration).context("Invalid --duration")?;
    let warmup = parse_duration(&args.warmup).context("Invalid --warmup")?;
    let tolerable_failures =
        FailureType::parse_set(&args.tolerable_failures).context("Invalid --tolerable-failures")?;

    let run = RunConfiguration {
        duration: Duration::from_secs(duration),
        warmup: Duration::from_secs(warmup),
        wait_for_test_case: args.wait_for_test_case,
        parallel: args.parallel,
        fail_fast: args.fail_fast,
        verify_enabled: args.verify_enabled,
        last_phase_to_sync: args.sync_to_phase,
        target: TargetSelection {
            target_type: args.target_type,
            count: args.target_count,
        },
        tolerable_failures,
        worker_startup_delay: Duration::from_millis(args.worker_startup_delay_ms),
    };

    let mut layout = ClusterLayoutParameters::new(agents.len());
    layout.member_worker_count = args.members;
    layout.lite_member_worker_count = args.lite_members;
    layout.client_worker_count = args.clients;
    layout.dedicated_member_machines = args.dedicated_member_machines;
    layout.member_jvm_options = args.member_args.clone();
    layout.client_jvm_options = args.client_args.clone();

    let output_dir = args
        .output_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(&suite_id));

    Ok(CoordinatorParameters {
        properties,
        run,
        layout,
        suite,
        agents,
        output_dir,
        start_agents: !args.no_agent_start,
        skip_download: args.skip_download,
        after_completion: args.after_completion.clone(),
    })
}

/// Execute a prepared run.
pub async fn run(params: CoordinatorParameters) -> Result<RunOutcome> {
    tracing::info!(
        "Running suite {} ({} tests) on {} agents",
        params.suite.id,
        params.suite.len(),
        params.agents.len()
    );
    let coordinator = Coordinator::new(params);
    let outcome = coordinator.run().await.context("Run failed")?;
    if outcome.failure_count > 0 {
        tracing::warn!("Run finished with {} failures", outcome.failure_count);
    } else {
        tracing::info!("Run finished without failures");
    }
    Ok(outcome)
}
