//! `simulator clean`: remove worker homes from every agent machine.

use anyhow::{Context, Result};
use sim_coordinator::{tasks, SimulatorProperties};
use sim_core::parse_agents_file;
use std::path::Path;

/// Remove the worker directories of all previous runs.
pub async fn run(properties_path: &Path, agents_file: &Path) -> Result<()> {
    let properties = SimulatorProperties::load_or_default(properties_path)
        .context("Failed to load simulator properties")?;
    let text = std::fs::read_to_string(agents_file)
        .with_context(|| format!("Failed to read agents file {}", agents_file.display()))?;
    let agents = parse_agents_file(&text)
        .with_context(|| format!("Invalid agents file {}", agents_file.display()))?;

    tasks::clean(&agents, &properties)
        .await
        .context("Failed to clean worker homes")?;
    println!("Cleaned worker homes on {} agents", agents.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clean_local_worker_homes() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("home");
        let old_run = home.join("workers/2026-10-15__09_00_00/C_A1_W1-member");
        std::fs::create_dir_all(&old_run).unwrap();

        let properties = dir.path().join("simulator.toml");
        std::fs::write(
            &properties,
            format!(
                "cloud_provider = \"local\"\nsimulator_home = \"{}\"\n",
                home.display()
            ),
        )
        .unwrap();
        let agents = dir.path().join("agents.txt");
        std::fs::write(&agents, "localhost\n").unwrap();

        run(&properties, &agents).await.unwrap();
        assert!(!old_run.exists());
        assert!(home.join("workers").exists());
    }

    #[tokio::test]
    async fn missing_agents_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = run(&dir.path().join("simulator.toml"), &dir.path().join("agents.txt"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("agents file"));
    }
}
