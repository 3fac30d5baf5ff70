//! Configuration loading for the coordinator.
//!
//! Properties are loaded from a TOML file (default: `simulator.toml`). The
//! file is optional; every field has a default.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Cloud provider value that runs everything on localhost without SSH.
pub const PROVIDER_LOCAL: &str = "local";

/// Simulator properties shared by the coordinator and the tasks it runs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SimulatorProperties {
    /// Port the coordinator listens on (default: 9000).
    #[serde(default = "default_port")]
    pub coordinator_port: u16,
    /// Port every agent listens on (default: 9000).
    #[serde(default = "default_port")]
    pub agent_port: u16,
    /// Interval between liveness pings in seconds (default: 60).
    #[serde(default = "default_worker_ping_interval_secs")]
    pub worker_ping_interval_secs: u64,
    /// Ping intervals a worker may miss before it is reported (default: 3).
    #[serde(default = "default_worker_ping_missed_intervals")]
    pub worker_ping_missed_intervals: u32,
    /// Grace period for member workers to shut down in seconds (default: 5).
    #[serde(default = "default_member_worker_shutdown_delay_secs")]
    pub member_worker_shutdown_delay_secs: u64,
    /// Time to wait for a response to a single request in seconds (default: 60).
    #[serde(default = "default_response_timeout_secs")]
    pub response_timeout_secs: u64,
    /// Time to wait for a started agent to accept connections (default: 30).
    #[serde(default = "default_agent_start_timeout_secs")]
    pub agent_start_timeout_secs: u64,
    /// Remote user for SSH (default: `$USER`).
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    /// Extra options passed to `ssh` and `scp`.
    #[serde(default = "default_ssh_options")]
    pub ssh_options: Vec<String>,
    /// Installation directory on the agent machines (default: `simulator`,
    /// relative to the remote home directory).
    #[serde(default = "default_simulator_home")]
    pub simulator_home: String,
    /// Agent executable, relative to `simulator_home` (default: `bin/sim-agent`).
    #[serde(default = "default_agent_binary")]
    pub agent_binary: String,
    /// Script agents run to start a worker (default: `worker.sh`).
    #[serde(default = "default_worker_script")]
    pub worker_script: String,
    /// Cloud provider (default: `static`; `local` disables SSH).
    #[serde(default = "default_cloud_provider")]
    pub cloud_provider: String,
}

// Default value functions
fn default_port() -> u16 {
    9000
}

fn default_worker_ping_interval_secs() -> u64 {
    60
}

fn default_worker_ping_missed_intervals() -> u32 {
    3
}

fn default_member_worker_shutdown_delay_secs() -> u64 {
    5
}

fn default_response_timeout_secs() -> u64 {
    60
}

fn default_agent_start_timeout_secs() -> u64 {
    30
}

fn default_ssh_user() -> String {
    std::env::var("USER").unwrap_or_else(|_| "simulator".to_string())
}

fn default_ssh_options() -> Vec<String> {
    vec![
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "ConnectTimeout=30".to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
    ]
}

fn default_simulator_home() -> String {
    "simulator".to_string()
}

fn default_agent_binary() -> String {
    "bin/sim-agent".to_string()
}

fn default_worker_script() -> String {
    "worker.sh".to_string()
}

fn default_cloud_provider() -> String {
    "static".to_string()
}

impl Default for SimulatorProperties {
    fn default() -> Self {
        Self {
            coordinator_port: default_port(),
            agent_port: default_port(),
            worker_ping_interval_secs: default_worker_ping_interval_secs(),
            worker_ping_missed_intervals: default_worker_ping_missed_intervals(),
            member_worker_shutdown_delay_secs: default_member_worker_shutdown_delay_secs(),
            response_timeout_secs: default_response_timeout_secs(),
            agent_start_timeout_secs: default_agent_start_timeout_secs(),
            ssh_user: default_ssh_user(),
            ssh_options: default_ssh_options(),
            simulator_home: default_simulator_home(),
            agent_binary: default_agent_binary(),
            worker_script: default_worker_script(),
            cloud_provider: default_cloud_provider(),
        }
    }
}

impl SimulatorProperties {
    /// Load properties from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if a value
    /// is out of range.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let properties: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        properties.validate()?;
        Ok(properties)
    }

    /// Load from `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            tracing::debug!("No properties file at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_ping_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "worker_ping_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.worker_ping_missed_intervals == 0 {
            return Err(ConfigError::Invalid(
                "worker_ping_missed_intervals must be greater than 0".to_string(),
            ));
        }
        if self.response_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "response_timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// True if the run stays on localhost.
    pub fn is_local(&self) -> bool {
        self.cloud_provider == PROVIDER_LOCAL
    }

    /// Ping interval as a [`Duration`].
    pub fn worker_ping_interval(&self) -> Duration {
        Duration::from_secs(self.worker_ping_interval_secs)
    }

    /// Silence after which a worker is reported as timed out.
    pub fn worker_timeout(&self) -> Duration {
        self.worker_ping_interval() * self.worker_ping_missed_intervals
    }

    /// Member shutdown grace period as a [`Duration`].
    pub fn member_worker_shutdown_delay(&self) -> Duration {
        Duration::from_secs(self.member_worker_shutdown_delay_secs)
    }

    /// Per-request response timeout as a [`Duration`].
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    /// Agent startup wait as a [`Duration`].
    pub fn agent_start_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_start_timeout_secs)
    }

    /// Path of the agent executable on an agent machine.
    pub fn agent_path(&self) -> PathBuf {
        Path::new(&self.simulator_home).join(&self.agent_binary)
    }

    /// Directory on an agent machine holding the worker homes of a run.
    pub fn workers_dir(&self, suite_id: &str) -> PathBuf {
        Path::new(&self.simulator_home).join("workers").join(suite_id)
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_properties() {
        let properties = SimulatorProperties::default();
        assert_eq!(properties.coordinator_port, 9000);
        assert_eq!(properties.agent_port, 9000);
        assert_eq!(properties.worker_ping_interval_secs, 60);
        assert_eq!(properties.worker_timeout(), Duration::from_secs(180));
        assert_eq!(properties.member_worker_shutdown_delay_secs, 5);
        assert!(!properties.is_local());
        assert!(properties.validate().is_ok());
    }

    #[test]
    fn properties_from_toml_string() {
        let toml = r#"
agent_port = 9100
worker_ping_interval_secs = 10
worker_ping_missed_intervals = 2
cloud_provider = "local"
ssh_options = ["-p", "2222"]
"#;

        let properties: SimulatorProperties = toml::from_str(toml).unwrap();
        assert_eq!(properties.agent_port, 9100);
        assert_eq!(properties.coordinator_port, 9000);
        assert_eq!(properties.worker_timeout(), Duration::from_secs(20));
        assert!(properties.is_local());
        assert_eq!(properties.ssh_options, vec!["-p", "2222"]);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let properties =
            SimulatorProperties::load_or_default(&dir.path().join("simulator.toml")).unwrap();
        assert_eq!(properties, SimulatorProperties::default());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "worker_ping_interval_secs = 0").unwrap();
        assert!(matches!(
            SimulatorProperties::from_file(file.path()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn unparsable_file_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "agent_port = \"not a number\"").unwrap();
        assert!(matches!(
            SimulatorProperties::from_file(file.path()),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn remote_paths() {
        let properties = SimulatorProperties::default();
        assert_eq!(properties.agent_path(), PathBuf::from("simulator/bin/sim-agent"));
        assert_eq!(
            properties.workers_dir("2026-10-16"),
            PathBuf::from("simulator/workers/2026-10-16")
        );
    }
}
