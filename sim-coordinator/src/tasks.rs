//! Agent lifecycle and artifact tasks run over SSH.

use crate::config::SimulatorProperties;
use crate::error::{CoordinatorError, Result};
use crate::ssh::{SshError, SshTarget};
use futures_util::future::join_all;
use sim_types::AgentData;
use std::path::{Path, PathBuf};

fn target(agent: &AgentData, properties: &SimulatorProperties) -> SshTarget {
    SshTarget::new(agent.public_address.clone(), properties)
}

fn pid_file(agent: &AgentData, properties: &SimulatorProperties) -> PathBuf {
    Path::new(&properties.simulator_home).join(format!("agent-{}.pid", agent.address_index))
}

/// Shell command that starts the agent in the background and records its
/// pid.
pub fn agent_start_command(
    agent: &AgentData,
    suite_id: &str,
    properties: &SimulatorProperties,
) -> String {
    let home = Path::new(&properties.simulator_home);
    format!(
        "mkdir -p {home}; nohup {agent_path} --address-index {index} --port {port} \
         --public-address {public} --workers-home {workers} --suite-id {suite} \
         --worker-script {script} --member-shutdown-delay-secs {delay} \
         --command-timeout-secs {command_timeout} > {log} 2>&1 & echo $! > {pid}",
        home = home.display(),
        agent_path = properties.agent_path().display(),
        index = agent.address_index,
        port = properties.agent_port,
        public = agent.public_address,
        workers = home.join("workers").display(),
        suite = suite_id,
        script = home.join(&properties.worker_script).display(),
        delay = properties.member_worker_shutdown_delay_secs,
        command_timeout = properties.response_timeout_secs,
        log = home.join(format!("agent-{}.out", agent.address_index)).display(),
        pid = pid_file(agent, properties).display(),
    )
}

/// Start an agent process on every agent machine.
pub async fn start_agents(
    agents: &[AgentData],
    suite_id: &str,
    properties: &SimulatorProperties,
) -> Result<()> {
    let starts = agents.iter().map(|agent| async move {
        tracing::info!("Starting agent on {}", agent.public_address);
        target(agent, properties)
            .exec_ok(&agent_start_command(agent, suite_id, properties))
            .await
    });
    for result in join_all(starts).await {
        result?;
    }
    tracing::info!("Started {} agents", agents.len());
    Ok(())
}

/// Stop every agent process. Failures are logged.
pub async fn stop_agents(agents: &[AgentData], properties: &SimulatorProperties) {
    let stops = agents.iter().map(|agent| async move {
        let pid = pid_file(agent, properties);
        let cmd = format!(
            "if [ -f {pid} ]; then kill $(cat {pid}) 2>/dev/null; rm -f {pid}; fi",
            pid = pid.display()
        );
        if let Err(e) = target(agent, properties).exec_ok(&cmd).await {
            tracing::warn!("Could not stop agent on {}: {}", agent.public_address, e);
        }
    });
    join_all(stops).await;
    tracing::info!("Stopped {} agents", agents.len());
}

/// Copy the worker directories of the run from every agent into
/// `output_dir/<agent public address>`.
pub async fn download(
    agents: &[AgentData],
    suite_id: &str,
    output_dir: &Path,
    properties: &SimulatorProperties,
) -> Result<()> {
    let remote = properties.workers_dir(suite_id).to_string_lossy().to_string();
    let downloads = agents.iter().map(|agent| {
        let remote = remote.as_str();
        async move {
            let dest = output_dir.join(&agent.public_address);
            tokio::fs::create_dir_all(&dest).await?;
            tracing::info!("Downloading {} from {}", remote, agent.public_address);
            target(agent, properties).scp_dir_from(remote, &dest).await?;
            Ok::<_, CoordinatorError>(())
        }
    });

    let mut first_error = None;
    for (agent, result) in agents.iter().zip(join_all(downloads).await) {
        if let Err(e) = result {
            tracing::warn!("Download from {} failed: {}", agent.public_address, e);
            if first_error.is_none() {
                first_error = Some(e);
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Remove the worker directories of all runs on every agent.
pub async fn clean(agents: &[AgentData], properties: &SimulatorProperties) -> Result<()> {
    let workers = Path::new(&properties.simulator_home).join("workers");
    let cmd = format!("rm -rf {}/*", workers.display());
    let cleans = agents.iter().map(|agent| {
        let cmd = cmd.as_str();
        async move {
            tracing::info!("Cleaning worker homes on {}", agent.public_address);
            target(agent, properties).exec_ok(cmd).await
        }
    });
    for result in join_all(cleans).await {
        result?;
    }
    Ok(())
}

/// Run the after-completion script with the output directory as its only
/// argument.
pub async fn run_after_completion(script: &Path, output_dir: &Path) -> Result<()> {
    tracing::info!("Executing after-completion script {}", script.display());
    let output = tokio::process::Command::new(script)
        .arg(output_dir)
        .output()
        .await?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    if !stdout.trim().is_empty() {
        tracing::info!("{}", stdout.trim_end());
    }
    if !output.status.success() {
        return Err(SshError::CommandFailed {
            host: "localhost".to_string(),
            exit_code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
        .into());
    }
    Ok(())
}
